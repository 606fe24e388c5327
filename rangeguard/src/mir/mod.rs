//! Middle Intermediate Representation (MIR)
//!
//! MIR is a CFG-based intermediate representation: a function is a list of
//! basic blocks, each an ordered sequence of SSA instructions closed by a
//! terminator. Values are named by [`Place`]s and typed through the
//! function's parameter and local tables.
//!
//! Integer values are bit patterns of their type's width. Arithmetic wraps;
//! signedness only matters for comparisons, division, right shifts and
//! widening casts.
//!
//! # Passes
//!
//! The `pass` module provides the pass interface and pipeline; `eval` is a
//! reference interpreter used to observe runtime behavior.

pub mod eval;
pub mod pass;

pub use eval::{EvalError, Interpreter, Outcome};
pub use pass::{
    AnalysisId, Analyses, ExtensionPoint, FunctionPass, PassInfo, PassRegistry, Pipeline,
    PipelineStats,
};

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{InstrumentError, Result};

/// A MIR program containing all functions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirProgram {
    pub functions: Vec<MirFunction>,
    /// External function declarations
    #[serde(default)]
    pub extern_fns: Vec<MirExternFn>,
}

impl MirProgram {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read a program from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| InstrumentError::io_error(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn function(&self, name: &str) -> Option<&MirFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn extern_fn(&self, name: &str) -> Option<&MirExternFn> {
        self.extern_fns.iter().find(|f| f.name == name)
    }

    /// Add `decl` unless a declaration with the same name exists
    pub fn declare_extern(&mut self, decl: MirExternFn) {
        if self.extern_fn(&decl.name).is_none() {
            self.extern_fns.push(decl);
        }
    }
}

/// External function declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirExternFn {
    /// External module name (e.g., "intrinsics")
    pub module: String,
    pub name: String,
    pub params: Vec<MirType>,
    pub ret_ty: MirType,
    /// Control never comes back from a call
    #[serde(default)]
    pub no_return: bool,
    /// The call never unwinds
    #[serde(default)]
    pub no_unwind: bool,
}

/// A MIR function with explicit control flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirFunction {
    pub name: String,
    /// Function parameters with their types
    pub params: Vec<(String, MirType)>,
    pub ret_ty: MirType,
    /// Types of every instruction result
    #[serde(default)]
    pub locals: Vec<(String, MirType)>,
    /// Basic blocks (first block is entry)
    pub blocks: Vec<BasicBlock>,
}

impl MirFunction {
    pub fn new(name: impl Into<String>, params: Vec<(String, MirType)>, ret_ty: MirType) -> Self {
        Self {
            name: name.into(),
            params,
            ret_ty,
            locals: Vec::new(),
            blocks: Vec::new(),
        }
    }

    /// Type of a parameter or local
    pub fn value_type(&self, name: &str) -> Option<&MirType> {
        self.params
            .iter()
            .chain(self.locals.iter())
            .find(|(n, _)| n == name)
            .map(|(_, ty)| ty)
    }

    /// Name -> type table for every parameter and local
    pub fn value_types(&self) -> HashMap<&str, &MirType> {
        self.params
            .iter()
            .chain(self.locals.iter())
            .map(|(n, ty)| (n.as_str(), ty))
            .collect()
    }

    pub fn block(&self, label: &str) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.label == label)
    }

    /// Declare a new local of type `ty` with an unused name
    pub fn fresh_temp(&mut self, prefix: &str, ty: MirType) -> Place {
        let mut n = self.locals.len();
        let name = loop {
            let candidate = format!("{prefix}{n}");
            if self.value_type(&candidate).is_none() {
                break candidate;
            }
            n += 1;
        };
        self.locals.push((name.clone(), ty));
        Place::new(name)
    }
}

/// A basic block containing instructions and a terminator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlock {
    /// Block label (unique within function)
    pub label: String,
    pub instructions: Vec<MirInst>,
    pub terminator: Terminator,
}

impl BasicBlock {
    pub fn new(label: impl Into<String>, instructions: Vec<MirInst>, terminator: Terminator) -> Self {
        Self {
            label: label.into(),
            instructions,
            terminator,
        }
    }
}

/// MIR instruction (non-terminating)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirInst {
    /// Assign a constant to a place: %dest = const value
    Const { dest: Place, value: Constant },
    /// Copy from one place to another: %dest = %src
    Copy { dest: Place, src: Place },
    /// Binary operation: %dest = %lhs op %rhs
    BinOp {
        dest: Place,
        op: MirBinOp,
        lhs: Operand,
        rhs: Operand,
    },
    /// Unary operation: %dest = op %src
    UnaryOp {
        dest: Place,
        op: MirUnaryOp,
        src: Operand,
    },
    /// Function call: %dest = call func(args...)
    Call {
        dest: Option<Place>,
        func: String,
        args: Vec<Operand>,
        #[serde(default)]
        is_tail: bool,
    },
    /// PHI node: %dest = phi [(value1, label1), (value2, label2), ...]
    Phi {
        dest: Place,
        values: Vec<(Operand, String)>, // (value, source_block_label)
    },
    /// Type cast: %dest = cast %src from_ty to to_ty
    /// Widening follows the source signedness (sext for signed, zext otherwise)
    Cast {
        dest: Place,
        src: Operand,
        from_ty: MirType,
        to_ty: MirType,
    },
    /// %dest = (cond_lhs cond_op cond_rhs) ? true_val : false_val
    Select {
        dest: Place,
        cond_op: MirBinOp,
        cond_lhs: Operand,
        cond_rhs: Operand,
        true_val: Operand,
        false_val: Operand,
    },
}

impl MirInst {
    /// The value this instruction defines, if any
    pub fn dest(&self) -> Option<&Place> {
        match self {
            MirInst::Const { dest, .. }
            | MirInst::Copy { dest, .. }
            | MirInst::BinOp { dest, .. }
            | MirInst::UnaryOp { dest, .. }
            | MirInst::Phi { dest, .. }
            | MirInst::Cast { dest, .. }
            | MirInst::Select { dest, .. } => Some(dest),
            MirInst::Call { dest, .. } => dest.as_ref(),
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, MirInst::Phi { .. })
    }
}

impl fmt::Display for MirInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_mir_inst(self))
    }
}

/// Block terminator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminator {
    Return(Option<Operand>),
    Goto(String),
    Branch {
        cond: Operand,
        then_label: String,
        else_label: String,
    },
    Unreachable,
    Switch {
        discriminant: Operand,
        cases: Vec<(i64, String)>, // (value, target_label)
        default: String,
    },
}

impl Terminator {
    /// Successor labels in edge order (duplicates kept)
    pub fn successors(&self) -> Vec<String> {
        match self {
            Terminator::Return(_) | Terminator::Unreachable => vec![],
            Terminator::Goto(target) => vec![target.clone()],
            Terminator::Branch { then_label, else_label, .. } => {
                vec![then_label.clone(), else_label.clone()]
            }
            Terminator::Switch { cases, default, .. } => cases
                .iter()
                .map(|(_, label)| label.clone())
                .chain(std::iter::once(default.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Place(Place),
    Constant(Constant),
}

impl Operand {
    pub fn place(name: impl Into<String>) -> Self {
        Operand::Place(Place::new(name))
    }

    pub fn int(value: i64) -> Self {
        Operand::Constant(Constant::Int(value))
    }

    /// An integer constant given as an unsigned bit pattern
    pub fn bits(value: u64) -> Self {
        Operand::Constant(Constant::Int(value as i64))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Place {
    pub name: String,
}

impl Place {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Constant operand. Integer constants are bit patterns truncated to the
/// width of the type they are used at.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constant {
    Int(i64),
    Float(f64),
    Bool(bool),
    Unit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirBinOp {
    // Integer arithmetic (wrapping)
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    // Floating-point arithmetic
    FAdd,
    FSub,
    FMul,
    FDiv,
    // Integer comparison, signedness taken from the operand type
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    // Unsigned comparison regardless of operand type
    ULt,
    UGt,
    ULe,
    UGe,
    // Logical
    And,
    Or,
    // Shifts; `Shr` is arithmetic for signed operands
    Shl,
    Shr,
    // Bitwise
    Band,
    Bor,
    Bxor,
}

impl MirBinOp {
    pub fn result_type(&self, operand_ty: &MirType) -> MirType {
        match self {
            MirBinOp::Add | MirBinOp::Sub | MirBinOp::Mul | MirBinOp::Div | MirBinOp::Mod => {
                operand_ty.clone()
            }
            MirBinOp::FAdd | MirBinOp::FSub | MirBinOp::FMul | MirBinOp::FDiv => MirType::F64,
            MirBinOp::Eq | MirBinOp::Ne | MirBinOp::Lt | MirBinOp::Gt | MirBinOp::Le | MirBinOp::Ge |
            MirBinOp::ULt | MirBinOp::UGt | MirBinOp::ULe | MirBinOp::UGe => {
                MirType::Bool
            }
            MirBinOp::And | MirBinOp::Or => MirType::Bool,
            MirBinOp::Shl | MirBinOp::Shr => operand_ty.clone(),
            MirBinOp::Band | MirBinOp::Bor | MirBinOp::Bxor => operand_ty.clone(),
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            MirBinOp::Eq | MirBinOp::Ne | MirBinOp::Lt | MirBinOp::Gt | MirBinOp::Le | MirBinOp::Ge
                | MirBinOp::ULt | MirBinOp::UGt | MirBinOp::ULe | MirBinOp::UGe
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirUnaryOp {
    Neg,
    FNeg,
    Not,
    Bnot,
}

impl MirUnaryOp {
    pub fn result_type(&self, operand_ty: &MirType) -> MirType {
        match self {
            MirUnaryOp::Neg => operand_ty.clone(),
            MirUnaryOp::FNeg => MirType::F64,
            MirUnaryOp::Not => MirType::Bool,
            MirUnaryOp::Bnot => operand_ty.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Bool,
    F64,
    Unit,
}

impl MirType {
    /// Bit width of an integral type; `bool` is a 1-bit integer
    pub fn int_width(&self) -> Option<u32> {
        match self {
            MirType::Bool => Some(1),
            MirType::I8 | MirType::U8 => Some(8),
            MirType::I16 | MirType::U16 => Some(16),
            MirType::I32 | MirType::U32 => Some(32),
            MirType::I64 | MirType::U64 => Some(64),
            MirType::F64 | MirType::Unit => None,
        }
    }

    pub fn is_integer(&self) -> bool {
        self.int_width().is_some()
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, MirType::I8 | MirType::I16 | MirType::I32 | MirType::I64)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, MirType::F64)
    }
}

// ============================================================================
// MIR Text Formatting
// ============================================================================

pub fn format_mir(program: &MirProgram) -> String {
    let mut output = String::new();

    for decl in &program.extern_fns {
        output.push_str(&format_extern_fn(decl));
        output.push('\n');
    }
    if !program.extern_fns.is_empty() && !program.functions.is_empty() {
        output.push('\n');
    }

    for (i, func) in program.functions.iter().enumerate() {
        if i > 0 {
            output.push_str("\n\n");
        }
        output.push_str(&format_mir_function(func));
    }

    output
}

fn format_extern_fn(decl: &MirExternFn) -> String {
    let params: Vec<_> = decl.params.iter().map(format_mir_type).collect();
    let mut out = format!(
        "declare {}::{}({}) -> {}",
        decl.module,
        decl.name,
        params.join(", "),
        format_mir_type(&decl.ret_ty)
    );
    if decl.no_return {
        out.push_str(" noreturn");
    }
    if decl.no_unwind {
        out.push_str(" nounwind");
    }
    out
}

pub fn format_mir_function(func: &MirFunction) -> String {
    let mut out = String::new();

    let params_str: Vec<_> = func.params.iter()
        .map(|(name, ty)| format!("{}: {}", name, format_mir_type(ty)))
        .collect();

    out.push_str(&format!("fn {}({}) -> {} {{\n",
        func.name,
        params_str.join(", "),
        format_mir_type(&func.ret_ty)));

    for block in &func.blocks {
        out.push_str(&format!("{}:\n", block.label));

        for inst in &block.instructions {
            out.push_str(&format!("  {}\n", format_mir_inst(inst)));
        }

        out.push_str(&format!("  {}\n", format_terminator(&block.terminator)));
    }

    out.push_str("}\n");
    out
}

pub fn format_mir_inst(inst: &MirInst) -> String {
    match inst {
        MirInst::Const { dest, value } => {
            format!("%{} = const {}", dest.name, format_constant(value))
        }
        MirInst::Copy { dest, src } => {
            format!("%{} = copy %{}", dest.name, src.name)
        }
        MirInst::BinOp { dest, op, lhs, rhs } => {
            format!("%{} = {} {}, {}",
                dest.name,
                format_binop(*op),
                format_operand(lhs),
                format_operand(rhs))
        }
        MirInst::UnaryOp { dest, op, src } => {
            format!("%{} = {} {}", dest.name, format_unaryop(*op), format_operand(src))
        }
        MirInst::Call { dest, func, args, is_tail } => {
            let args_str: Vec<_> = args.iter().map(format_operand).collect();
            let tail_prefix = if *is_tail { "tail " } else { "" };
            if let Some(d) = dest {
                format!("%{} = {}call {}({})", d.name, tail_prefix, func, args_str.join(", "))
            } else {
                format!("{}call {}({})", tail_prefix, func, args_str.join(", "))
            }
        }
        MirInst::Phi { dest, values } => {
            let vals: Vec<_> = values.iter()
                .map(|(v, lbl)| format!("[{}, {}]", format_operand(v), lbl))
                .collect();
            format!("%{} = phi {}", dest.name, vals.join(", "))
        }
        MirInst::Cast { dest, src, from_ty, to_ty } => {
            format!("%{} = cast {} {} to {}", dest.name, format_operand(src), format_mir_type(from_ty), format_mir_type(to_ty))
        }
        MirInst::Select { dest, cond_op, cond_lhs, cond_rhs, true_val, false_val } => {
            format!("%{} = select {} {} {} ? {} : {}",
                dest.name,
                format_operand(cond_lhs),
                format_binop(*cond_op),
                format_operand(cond_rhs),
                format_operand(true_val),
                format_operand(false_val))
        }
    }
}

pub fn format_terminator(term: &Terminator) -> String {
    match term {
        Terminator::Return(None) => "return".to_string(),
        Terminator::Return(Some(op)) => format!("return {}", format_operand(op)),
        Terminator::Goto(label) => format!("goto {}", label),
        Terminator::Branch { cond, then_label, else_label } => {
            format!("branch {}, {}, {}", format_operand(cond), then_label, else_label)
        }
        Terminator::Unreachable => "unreachable".to_string(),
        Terminator::Switch { discriminant, cases, default } => {
            let cases_str: Vec<_> = cases.iter()
                .map(|(val, lbl)| format!("{} -> {}", val, lbl))
                .collect();
            format!("switch {}, [{}], {}", format_operand(discriminant), cases_str.join(", "), default)
        }
    }
}

fn format_operand(op: &Operand) -> String {
    match op {
        Operand::Place(p) => format!("%{}", p.name),
        Operand::Constant(c) => format_constant(c),
    }
}

fn format_constant(c: &Constant) -> String {
    match c {
        Constant::Int(n) => format!("I:{}", n),
        Constant::Float(f) => format!("F:{}", f),
        Constant::Bool(b) => format!("B:{}", if *b { 1 } else { 0 }),
        Constant::Unit => "U".to_string(),
    }
}

fn format_binop(op: MirBinOp) -> String {
    match op {
        MirBinOp::Add => "+",
        MirBinOp::Sub => "-",
        MirBinOp::Mul => "*",
        MirBinOp::Div => "/",
        MirBinOp::Mod => "%",
        MirBinOp::FAdd => "+.",
        MirBinOp::FSub => "-.",
        MirBinOp::FMul => "*.",
        MirBinOp::FDiv => "/.",
        MirBinOp::Eq => "==",
        MirBinOp::Ne => "!=",
        MirBinOp::Lt => "<",
        MirBinOp::Gt => ">",
        MirBinOp::Le => "<=",
        MirBinOp::Ge => ">=",
        MirBinOp::ULt => "<u",
        MirBinOp::UGt => ">u",
        MirBinOp::ULe => "<=u",
        MirBinOp::UGe => ">=u",
        MirBinOp::And => "and",
        MirBinOp::Or => "or",
        MirBinOp::Shl => "<<",
        MirBinOp::Shr => ">>",
        MirBinOp::Band => "band",
        MirBinOp::Bor => "bor",
        MirBinOp::Bxor => "bxor",
    }.to_string()
}

fn format_unaryop(op: MirUnaryOp) -> String {
    match op {
        MirUnaryOp::Neg => "neg",
        MirUnaryOp::FNeg => "fneg",
        MirUnaryOp::Not => "not",
        MirUnaryOp::Bnot => "bnot",
    }.to_string()
}

pub fn format_mir_type(ty: &MirType) -> String {
    match ty {
        MirType::I8 => "i8",
        MirType::I16 => "i16",
        MirType::I32 => "i32",
        MirType::I64 => "i64",
        MirType::U8 => "u8",
        MirType::U16 => "u16",
        MirType::U32 => "u32",
        MirType::U64 => "u64",
        MirType::Bool => "bool",
        MirType::F64 => "f64",
        MirType::Unit => "()",
    }.to_string()
}
