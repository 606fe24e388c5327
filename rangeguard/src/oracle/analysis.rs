//! Forward range and known-bits analysis over MIR
//!
//! Facts are flow-insensitive: each SSA value gets one range and one
//! known-bits pair that hold wherever the value is used. Blocks are visited
//! in reverse postorder so that an operand is analyzed before its users.
//! Operands reaching a phi over a back edge have not been analyzed yet and
//! count as unknown, so loops converge in a single sweep.

use std::collections::HashMap;

use super::{OracleProvider, ValueOracle};
use crate::error::Result;
use crate::mir::{Constant, MirBinOp, MirFunction, MirInst, MirType, MirUnaryOp, Operand, Place};
use crate::range::{BitMask, ConstantRange, KnownBits, MAX_WIDTH, width_mask};

/// The built-in oracle
#[derive(Debug, Default, Clone, Copy)]
pub struct ValueAnalysis;

impl ValueAnalysis {
    pub fn new() -> Self {
        Self
    }
}

impl OracleProvider for ValueAnalysis {
    fn oracle_for<'p>(&'p self, func: &MirFunction) -> Result<Box<dyn ValueOracle + 'p>> {
        Ok(Box::new(FunctionFacts::compute(func)))
    }
}

/// What is known about one value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueFact {
    pub range: ConstantRange,
    pub known: KnownBits,
}

impl ValueFact {
    pub fn unknown(width: u32) -> Self {
        Self {
            range: ConstantRange::full(width),
            known: KnownBits::unknown(width),
        }
    }

    pub fn constant(width: u32, value: u64) -> Self {
        Self {
            range: ConstantRange::single(width, value),
            known: KnownBits::constant(width, value),
        }
    }

    fn from_known(known: KnownBits) -> Self {
        Self {
            range: ConstantRange::from_known_bits(&known),
            known,
        }
    }

    pub fn width(&self) -> u32 {
        self.known.width()
    }

    /// Facts covering the values of either side
    pub fn join(&self, other: &ValueFact) -> ValueFact {
        ValueFact {
            range: self.range.hull(&other.range),
            known: self.known.common(&other.known),
        }
        .refined()
    }

    /// Let each half of the fact tighten the other
    fn refined(self) -> ValueFact {
        let width = self.width();
        let mut fact = self;
        if fact.range.is_full_set() {
            fact.range = ConstantRange::from_known_bits(&fact.known);
        }
        if !fact.range.is_wrapped() {
            if let Some(max) = fact.range.unsigned_max() {
                let high_zero = width_mask(width) & !fill_below(max);
                let zero = fact.known.zero().bits | high_zero;
                let one = fact.known.one().bits;
                // Contradicting halves mean the value is never produced
                if let Ok(known) = KnownBits::new(BitMask::new(width, zero), BitMask::new(width, one)) {
                    fact.known = known;
                }
            }
        }
        fact
    }
}

/// All ones at and below the highest set bit of `value`
fn fill_below(value: u64) -> u64 {
    if value == 0 {
        0
    } else {
        u64::MAX >> value.leading_zeros()
    }
}

/// Facts for every integer value of one function
#[derive(Debug, Clone, Default)]
pub struct FunctionFacts {
    types: HashMap<String, MirType>,
    facts: HashMap<String, ValueFact>,
}

impl FunctionFacts {
    pub fn compute(func: &MirFunction) -> Self {
        let mut facts = Self {
            types: func
                .value_types()
                .into_iter()
                .map(|(name, ty)| (name.to_string(), ty.clone()))
                .collect(),
            facts: HashMap::new(),
        };

        for index in reverse_postorder(func) {
            for inst in &func.blocks[index].instructions {
                let Some(dest) = inst.dest() else { continue };
                let Some(width) = facts.width(&dest.name) else { continue };
                let fact = facts.transfer(inst, width);
                facts.facts.insert(dest.name.clone(), fact);
            }
        }
        facts
    }

    pub fn get(&self, name: &str) -> Option<&ValueFact> {
        self.facts.get(name)
    }

    fn width(&self, name: &str) -> Option<u32> {
        self.types.get(name).and_then(MirType::int_width)
    }

    fn lookup(&self, value: &Place) -> ValueFact {
        match self.facts.get(&value.name) {
            Some(fact) => *fact,
            None => ValueFact::unknown(self.width(&value.name).unwrap_or(MAX_WIDTH)),
        }
    }

    /// Facts for `op` used at `width` bits
    fn operand(&self, op: &Operand, width: u32) -> ValueFact {
        match op {
            Operand::Place(p) => self
                .facts
                .get(&p.name)
                .copied()
                .filter(|fact| fact.width() == width)
                .unwrap_or_else(|| ValueFact::unknown(width)),
            Operand::Constant(Constant::Int(n)) => ValueFact::constant(width, *n as u64),
            Operand::Constant(Constant::Bool(b)) => ValueFact::constant(width, u64::from(*b)),
            Operand::Constant(_) => ValueFact::unknown(width),
        }
    }

    /// The value of `op` if it is known exactly
    fn constant_operand(&self, op: &Operand, width: u32) -> Option<u64> {
        self.operand(op, width).range.single_element()
    }

    fn transfer(&self, inst: &MirInst, width: u32) -> ValueFact {
        match inst {
            MirInst::Const { value, .. } => match value {
                Constant::Int(n) => ValueFact::constant(width, *n as u64),
                Constant::Bool(b) => ValueFact::constant(width, u64::from(*b)),
                Constant::Float(_) | Constant::Unit => ValueFact::unknown(width),
            },
            MirInst::Copy { src, .. } => self.operand(&Operand::Place(src.clone()), width),
            MirInst::BinOp { dest, op, lhs, rhs } => self.binop(dest, *op, lhs, rhs, width),
            MirInst::UnaryOp { op, src, .. } => self.unary(*op, src, width),
            MirInst::Cast { src, from_ty, to_ty, .. } => self.cast(src, from_ty, to_ty, width),
            MirInst::Select { true_val, false_val, .. } => self
                .operand(true_val, width)
                .join(&self.operand(false_val, width)),
            MirInst::Phi { values, .. } => values
                .iter()
                .map(|(value, _)| self.operand(value, width))
                .reduce(|a, b| a.join(&b))
                .unwrap_or_else(|| ValueFact::unknown(width)),
            MirInst::Call { .. } => ValueFact::unknown(width),
        }
    }

    fn binop(&self, dest: &Place, op: MirBinOp, lhs: &Operand, rhs: &Operand, width: u32) -> ValueFact {
        if op.is_comparison() {
            return ValueFact::unknown(width);
        }
        // Operands are evaluated at the type of whichever side is a place,
        // or at the result type when both are constants
        let operand_ty = match (lhs, rhs) {
            (Operand::Place(p), _) | (_, Operand::Place(p)) => self.types.get(&p.name),
            _ => self.types.get(&dest.name),
        };
        let operand_width = operand_ty.and_then(MirType::int_width).unwrap_or(width);
        if operand_width != width {
            return ValueFact::unknown(width);
        }
        let signed = operand_ty.is_some_and(MirType::is_signed);
        let a = self.operand(lhs, width);
        let b = self.operand(rhs, width);

        match op {
            MirBinOp::Add => ValueFact {
                range: a.range.add(&b.range),
                known: a.known.add(&b.known),
            }
            .refined(),
            MirBinOp::Sub => ValueFact {
                range: a.range.sub(&b.range),
                known: a.known.sub(&b.known),
            }
            .refined(),
            MirBinOp::Band | MirBinOp::And => {
                let fact = ValueFact::from_known(a.known.and(&b.known));
                let bound = a.range.unsigned_max().min(b.range.unsigned_max());
                match bound {
                    Some(max) if max < fact.known.max_value() => ValueFact {
                        range: ConstantRange::from_unsigned_bounds(width, fact.known.min_value(), max),
                        known: fact.known,
                    }
                    .refined(),
                    _ => fact,
                }
            }
            MirBinOp::Bor | MirBinOp::Or => ValueFact::from_known(a.known.or(&b.known)),
            MirBinOp::Bxor => ValueFact::from_known(a.known.xor(&b.known)),
            MirBinOp::Shl | MirBinOp::Shr => match self.constant_operand(rhs, width) {
                Some(amount) => {
                    let amount = u32::try_from(amount).unwrap_or(u32::MAX);
                    let known = match (op, signed) {
                        (MirBinOp::Shl, _) => a.known.shl(amount),
                        (_, true) => a.known.ashr(amount),
                        (_, false) => a.known.lshr(amount),
                    };
                    ValueFact::from_known(known).refined()
                }
                None => ValueFact::unknown(width),
            },
            MirBinOp::Mod if !signed => match self.constant_operand(rhs, width) {
                Some(divisor) if divisor > 0 => {
                    let known = if divisor.is_power_of_two() {
                        a.known.and(&KnownBits::constant(width, divisor - 1))
                    } else {
                        KnownBits::unknown(width)
                    };
                    ValueFact {
                        range: a.range.urem_by_constant(divisor),
                        known,
                    }
                    .refined()
                }
                _ => ValueFact::unknown(width),
            },
            MirBinOp::Div if !signed => match self.constant_operand(rhs, width) {
                Some(divisor) if divisor > 0 => match (a.range.unsigned_min(), a.range.unsigned_max()) {
                    (Some(min), Some(max)) => ValueFact {
                        range: ConstantRange::from_unsigned_bounds(width, min / divisor, max / divisor),
                        known: KnownBits::unknown(width),
                    }
                    .refined(),
                    _ => ValueFact::unknown(width),
                },
                _ => ValueFact::unknown(width),
            },
            _ => ValueFact::unknown(width),
        }
    }

    fn unary(&self, op: MirUnaryOp, src: &Operand, width: u32) -> ValueFact {
        let src_width = match src {
            Operand::Place(p) => self.width(&p.name).unwrap_or(width),
            Operand::Constant(_) => width,
        };
        match op {
            MirUnaryOp::Neg if src_width == width => {
                let a = self.operand(src, width);
                let zero = ValueFact::constant(width, 0);
                ValueFact {
                    range: zero.range.sub(&a.range),
                    known: zero.known.sub(&a.known),
                }
                .refined()
            }
            MirUnaryOp::Bnot if src_width == width => {
                ValueFact::from_known(self.operand(src, width).known.not())
            }
            MirUnaryOp::Not if src_width == 1 && width == 1 => {
                ValueFact::from_known(self.operand(src, 1).known.not())
            }
            _ => ValueFact::unknown(width),
        }
    }

    fn cast(&self, src: &Operand, from_ty: &MirType, to_ty: &MirType, width: u32) -> ValueFact {
        let Some(from_width) = from_ty.int_width() else {
            return ValueFact::unknown(width);
        };
        if to_ty.int_width() != Some(width) {
            return ValueFact::unknown(width);
        }
        let a = self.operand(src, from_width);
        let fact = if width > from_width && from_ty.is_signed() {
            ValueFact {
                range: a.range.sign_extend(width),
                known: a.known.sign_extend(width),
            }
        } else if width > from_width {
            ValueFact {
                range: a.range.zero_extend(width),
                known: a.known.zero_extend(width),
            }
        } else {
            ValueFact {
                range: a.range.truncate(width),
                known: a.known.truncate(width),
            }
        };
        fact.refined()
    }
}

impl ValueOracle for FunctionFacts {
    fn constant_range(&self, value: &Place, _at_block: &str) -> ConstantRange {
        self.lookup(value).range
    }

    fn known_bits(&self, value: &Place) -> (BitMask, BitMask) {
        let known = self.lookup(value).known;
        (known.zero(), known.one())
    }
}

/// Block indices in reverse postorder from the entry, followed by blocks the
/// entry cannot reach in their original order
fn reverse_postorder(func: &MirFunction) -> Vec<usize> {
    let count = func.blocks.len();
    if count == 0 {
        return Vec::new();
    }
    let index: HashMap<&str, usize> = func
        .blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.label.as_str(), i))
        .collect();
    let successors: Vec<Vec<usize>> = func
        .blocks
        .iter()
        .map(|b| {
            b.terminator
                .successors()
                .iter()
                .filter_map(|label| index.get(label.as_str()).copied())
                .collect()
        })
        .collect();

    let mut visited = vec![false; count];
    let mut postorder = Vec::with_capacity(count);
    let mut stack = vec![(0usize, 0usize)];
    visited[0] = true;
    while let Some(top) = stack.last_mut() {
        let (block, next) = *top;
        match successors[block].get(next) {
            Some(&succ) => {
                top.1 += 1;
                if !visited[succ] {
                    visited[succ] = true;
                    stack.push((succ, 0));
                }
            }
            None => {
                postorder.push(block);
                stack.pop();
            }
        }
    }

    postorder.reverse();
    postorder.extend((0..count).filter(|&i| !visited[i]));
    postorder
}
