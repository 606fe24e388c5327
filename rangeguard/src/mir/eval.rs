//! MIR reference interpreter
//!
//! Executes one function on integer arguments. Every value is a `u64` bit
//! pattern truncated to its type's width (`f64` values are stored as their
//! IEEE bits). A call to an extern declared `no_return` ends execution with
//! [`Outcome::Trapped`], which is how instrumented programs report a
//! violated fact.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use super::{
    BasicBlock, Constant, MirBinOp, MirFunction, MirInst, MirProgram, MirType, MirUnaryOp,
    Operand, Terminator,
};
use crate::range::width_mask;

/// Default bound on executed instructions and terminators
pub const DEFAULT_STEP_LIMIT: usize = 1_000_000;

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Normal return, with the returned bit pattern if any
    Returned(Option<u64>),
    /// A no-return intrinsic was called in `block`, entered from `from`
    Trapped { block: String, from: Option<String> },
}

/// Interpreter failure (malformed IR or unsupported operation)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("function `{0}` has no blocks")]
    EmptyFunction(String),

    #[error("expected {expected} arguments, got {found}")]
    ArityMismatch { expected: usize, found: usize },

    #[error("jump to unknown block `{0}`")]
    UnknownBlock(String),

    #[error("use of undefined value %{0}")]
    UndefinedValue(String),

    #[error("value %{0} has no declared type")]
    UntypedValue(String),

    #[error("phi %{value} has no incoming value from `{pred}`")]
    MissingPhiEdge { value: String, pred: String },

    #[error("division by zero defining %{0}")]
    DivisionByZero(String),

    #[error("call to unsupported function `{0}`")]
    UnsupportedCall(String),

    #[error("reached `unreachable` in block `{0}`")]
    UnreachableExecuted(String),

    #[error("step limit of {0} exceeded")]
    StepLimit(usize),
}

/// MIR interpreter
#[derive(Debug, Clone)]
pub struct Interpreter {
    trap_fns: HashSet<String>,
    step_limit: usize,
}

impl Interpreter {
    /// Interpreter with no trapping callees
    pub fn new() -> Self {
        Self {
            trap_fns: HashSet::new(),
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    /// Interpreter that treats every `no_return` extern of `program` as a trap
    pub fn for_program(program: &MirProgram) -> Self {
        let mut interp = Self::new();
        for decl in program.extern_fns.iter().filter(|d| d.no_return) {
            interp.trap_fns.insert(decl.name.clone());
        }
        interp
    }

    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = limit;
        self
    }

    /// Run `func` with `args` (bit patterns, truncated to parameter widths)
    pub fn run(&self, func: &MirFunction, args: &[u64]) -> Result<Outcome, EvalError> {
        if func.params.len() != args.len() {
            return Err(EvalError::ArityMismatch {
                expected: func.params.len(),
                found: args.len(),
            });
        }
        let entry = func
            .blocks
            .first()
            .ok_or_else(|| EvalError::EmptyFunction(func.name.clone()))?;

        let mut frame = Frame {
            func,
            types: func.value_types(),
            values: HashMap::new(),
        };
        for ((name, ty), arg) in func.params.iter().zip(args) {
            frame.values.insert(name.clone(), truncate(*arg, ty));
        }

        let blocks: HashMap<&str, &BasicBlock> =
            func.blocks.iter().map(|b| (b.label.as_str(), b)).collect();

        let mut steps = 0usize;
        let mut pred: Option<&str> = None;
        let mut block = entry;

        loop {
            // Phis read their inputs simultaneously on block entry
            let mut incoming = Vec::new();
            for inst in block.instructions.iter().take_while(|i| i.is_phi()) {
                if let MirInst::Phi { dest, values } = inst {
                    let pred_label = pred.unwrap_or("");
                    let (op, _) = values
                        .iter()
                        .find(|(_, label)| label == pred_label)
                        .ok_or_else(|| EvalError::MissingPhiEdge {
                            value: dest.name.clone(),
                            pred: pred_label.to_string(),
                        })?;
                    let ty = frame.type_of(&dest.name)?;
                    incoming.push((dest.name.clone(), frame.operand(op, &ty)?));
                }
            }
            frame.values.extend(incoming);

            for inst in block.instructions.iter().skip_while(|i| i.is_phi()) {
                steps += 1;
                if steps > self.step_limit {
                    return Err(EvalError::StepLimit(self.step_limit));
                }
                if let Some(outcome) = self.step(&mut frame, inst, &block.label)? {
                    return Ok(match outcome {
                        Outcome::Trapped { block, .. } => Outcome::Trapped {
                            block,
                            from: pred.map(str::to_string),
                        },
                        other => other,
                    });
                }
            }

            steps += 1;
            if steps > self.step_limit {
                return Err(EvalError::StepLimit(self.step_limit));
            }
            let next = match &block.terminator {
                Terminator::Return(None) => return Ok(Outcome::Returned(None)),
                Terminator::Return(Some(op)) => {
                    let value = frame.operand(op, &func.ret_ty)?;
                    return Ok(Outcome::Returned(Some(value)));
                }
                Terminator::Unreachable => {
                    return Err(EvalError::UnreachableExecuted(block.label.clone()));
                }
                Terminator::Goto(target) => target.as_str(),
                Terminator::Branch { cond, then_label, else_label } => {
                    if frame.operand(cond, &MirType::Bool)? != 0 {
                        then_label.as_str()
                    } else {
                        else_label.as_str()
                    }
                }
                Terminator::Switch { discriminant, cases, default } => {
                    let ty = frame.operand_type(discriminant, &MirType::I64)?;
                    let value = frame.operand(discriminant, &ty)?;
                    cases
                        .iter()
                        .find(|(case, _)| truncate(*case as u64, &ty) == value)
                        .map(|(_, label)| label.as_str())
                        .unwrap_or(default.as_str())
                }
            };

            pred = Some(block.label.as_str());
            block = blocks
                .get(next)
                .copied()
                .ok_or_else(|| EvalError::UnknownBlock(next.to_string()))?;
        }
    }

    fn step(
        &self,
        frame: &mut Frame<'_>,
        inst: &MirInst,
        block: &str,
    ) -> Result<Option<Outcome>, EvalError> {
        match inst {
            MirInst::Const { dest, value } => {
                let ty = frame.type_of(&dest.name)?;
                let bits = constant_bits(value, &ty);
                frame.values.insert(dest.name.clone(), bits);
            }
            MirInst::Copy { dest, src } => {
                let value = frame.lookup(&src.name)?;
                frame.values.insert(dest.name.clone(), value);
            }
            MirInst::BinOp { dest, op, lhs, rhs } => {
                let value = frame.binop(&dest.name, *op, lhs, rhs)?;
                frame.values.insert(dest.name.clone(), value);
            }
            MirInst::UnaryOp { dest, op, src } => {
                let ty = frame.type_of(&dest.name)?;
                let src_ty = frame.operand_type(src, &ty)?;
                let a = frame.operand(src, &src_ty)?;
                let value = match op {
                    MirUnaryOp::Neg => truncate(a.wrapping_neg(), &ty),
                    MirUnaryOp::FNeg => (-f64::from_bits(a)).to_bits(),
                    MirUnaryOp::Not => u64::from(a == 0),
                    MirUnaryOp::Bnot => truncate(!a, &ty),
                };
                frame.values.insert(dest.name.clone(), value);
            }
            MirInst::Call { func, .. } => {
                if self.trap_fns.contains(func) {
                    tracing::debug!(function = %frame.func.name, block, "trap reached");
                    return Ok(Some(Outcome::Trapped {
                        block: block.to_string(),
                        from: None,
                    }));
                }
                return Err(EvalError::UnsupportedCall(func.clone()));
            }
            MirInst::Phi { dest, .. } => {
                // Phis after the block's leading run are malformed
                return Err(EvalError::MissingPhiEdge {
                    value: dest.name.clone(),
                    pred: block.to_string(),
                });
            }
            MirInst::Cast { dest, src, from_ty, to_ty } => {
                let a = frame.operand(src, from_ty)?;
                frame.values.insert(dest.name.clone(), cast(a, from_ty, to_ty));
            }
            MirInst::Select { dest, cond_op, cond_lhs, cond_rhs, true_val, false_val } => {
                let cond = frame.binop(&dest.name, *cond_op, cond_lhs, cond_rhs)?;
                let ty = frame.type_of(&dest.name)?;
                let chosen = if cond != 0 { true_val } else { false_val };
                let value = frame.operand(chosen, &ty)?;
                frame.values.insert(dest.name.clone(), value);
            }
        }
        Ok(None)
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

struct Frame<'a> {
    func: &'a MirFunction,
    types: HashMap<&'a str, &'a MirType>,
    values: HashMap<String, u64>,
}

impl Frame<'_> {
    fn type_of(&self, name: &str) -> Result<MirType, EvalError> {
        self.types
            .get(name)
            .map(|ty| (*ty).clone())
            .ok_or_else(|| EvalError::UntypedValue(name.to_string()))
    }

    fn lookup(&self, name: &str) -> Result<u64, EvalError> {
        self.values
            .get(name)
            .copied()
            .ok_or_else(|| EvalError::UndefinedValue(name.to_string()))
    }

    /// Type of a place operand, or `fallback` for a constant
    fn operand_type(&self, op: &Operand, fallback: &MirType) -> Result<MirType, EvalError> {
        match op {
            Operand::Place(p) => self.type_of(&p.name),
            Operand::Constant(_) => Ok(fallback.clone()),
        }
    }

    fn operand(&self, op: &Operand, ty: &MirType) -> Result<u64, EvalError> {
        match op {
            Operand::Place(p) => self.lookup(&p.name),
            Operand::Constant(c) => Ok(constant_bits(c, ty)),
        }
    }

    fn binop(&self, dest: &str, op: MirBinOp, lhs: &Operand, rhs: &Operand) -> Result<u64, EvalError> {
        // Operand type comes from whichever side is a place
        let ty = match (lhs, rhs) {
            (Operand::Place(p), _) | (_, Operand::Place(p)) => self.type_of(&p.name)?,
            _ if op.is_comparison() => MirType::I64,
            _ => self.type_of(dest)?,
        };
        let a = self.operand(lhs, &ty)?;
        let b = self.operand(rhs, &ty)?;
        let width = ty.int_width().unwrap_or(64);
        let signed = ty.is_signed();
        let (sa, sb) = (sign_extend(a, width), sign_extend(b, width));

        let value = match op {
            MirBinOp::Add => truncate(a.wrapping_add(b), &ty),
            MirBinOp::Sub => truncate(a.wrapping_sub(b), &ty),
            MirBinOp::Mul => truncate(a.wrapping_mul(b), &ty),
            MirBinOp::Div | MirBinOp::Mod => {
                if b == 0 {
                    return Err(EvalError::DivisionByZero(dest.to_string()));
                }
                let raw = match (op, signed) {
                    (MirBinOp::Div, true) => sa.wrapping_div(sb) as u64,
                    (MirBinOp::Div, false) => a / b,
                    (_, true) => sa.wrapping_rem(sb) as u64,
                    (_, false) => a % b,
                };
                truncate(raw, &ty)
            }
            MirBinOp::FAdd => (f64::from_bits(a) + f64::from_bits(b)).to_bits(),
            MirBinOp::FSub => (f64::from_bits(a) - f64::from_bits(b)).to_bits(),
            MirBinOp::FMul => (f64::from_bits(a) * f64::from_bits(b)).to_bits(),
            MirBinOp::FDiv => (f64::from_bits(a) / f64::from_bits(b)).to_bits(),
            MirBinOp::Eq => u64::from(a == b),
            MirBinOp::Ne => u64::from(a != b),
            MirBinOp::Lt => u64::from(if signed { sa < sb } else { a < b }),
            MirBinOp::Gt => u64::from(if signed { sa > sb } else { a > b }),
            MirBinOp::Le => u64::from(if signed { sa <= sb } else { a <= b }),
            MirBinOp::Ge => u64::from(if signed { sa >= sb } else { a >= b }),
            MirBinOp::ULt => u64::from(a < b),
            MirBinOp::UGt => u64::from(a > b),
            MirBinOp::ULe => u64::from(a <= b),
            MirBinOp::UGe => u64::from(a >= b),
            MirBinOp::And => u64::from(a != 0 && b != 0),
            MirBinOp::Or => u64::from(a != 0 || b != 0),
            MirBinOp::Shl => {
                if b >= u64::from(width) {
                    0
                } else {
                    truncate(a << b, &ty)
                }
            }
            MirBinOp::Shr => {
                if signed {
                    let amount = b.min(u64::from(width) - 1);
                    truncate((sa >> amount) as u64, &ty)
                } else if b >= u64::from(width) {
                    0
                } else {
                    a >> b
                }
            }
            MirBinOp::Band => a & b,
            MirBinOp::Bor => a | b,
            MirBinOp::Bxor => a ^ b,
        };
        Ok(value)
    }
}

/// Truncate `bits` to the width of `ty` (floats and unit are left alone)
fn truncate(bits: u64, ty: &MirType) -> u64 {
    match ty.int_width() {
        Some(width) => bits & width_mask(width),
        None => bits,
    }
}

/// Interpret the low `width` bits of `bits` as a signed integer
pub(crate) fn sign_extend(bits: u64, width: u32) -> i64 {
    if width >= 64 {
        bits as i64
    } else {
        let shift = 64 - width;
        ((bits << shift) as i64) >> shift
    }
}

fn constant_bits(c: &Constant, ty: &MirType) -> u64 {
    match c {
        Constant::Int(n) if ty.is_float() => (*n as f64).to_bits(),
        Constant::Int(n) => truncate(*n as u64, ty),
        Constant::Float(f) if ty.is_integer() => truncate(*f as i64 as u64, ty),
        Constant::Float(f) => f.to_bits(),
        Constant::Bool(b) => u64::from(*b),
        Constant::Unit => 0,
    }
}

fn cast(bits: u64, from: &MirType, to: &MirType) -> u64 {
    match (from.int_width(), to.int_width()) {
        (Some(from_width), Some(_)) => {
            let widened = if from.is_signed() {
                sign_extend(bits, from_width) as u64
            } else {
                bits & width_mask(from_width)
            };
            truncate(widened, to)
        }
        (Some(from_width), None) if to.is_float() => {
            let value = if from.is_signed() {
                sign_extend(bits, from_width) as f64
            } else {
                bits as f64
            };
            value.to_bits()
        }
        (None, Some(_)) if from.is_float() => {
            let value = f64::from_bits(bits);
            let raw = if to.is_signed() { value as i64 as u64 } else { value as u64 };
            truncate(raw, to)
        }
        _ => bits,
    }
}
