//! Trap conditions
//!
//! A fact is violated when the runtime value lies outside the claimed range
//! or disagrees with a known bit. The violation predicate is a disjunction
//! of [`ViolationTerm`]s; it is built here, evaluated directly in tests, and
//! lowered to MIR for the instrumented function.

use crate::config::InstrumentConfig;
use crate::mir::{Constant, MirBinOp, MirFunction, MirInst, MirType, Operand, Place};
use crate::range::{ConstantRange, KnownBits, width_mask};

/// One way a value can contradict its fact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationTerm {
    /// Outside a non-wrapping range: `v <u lower OR v >=u upper`
    OutsideRange { lower: u64, upper: u64 },
    /// Inside the gap of a wrapping range: `v <u lower AND v >=u upper`
    InsideGap { lower: u64, upper: u64 },
    /// A forced-zero bit is set: `(v & mask) != 0`
    ForcedZeroSet { mask: u64 },
    /// A forced-one bit is clear: `(v & mask) != mask`
    ForcedOneClear { mask: u64 },
}

impl ViolationTerm {
    pub fn is_violated(&self, v: u64) -> bool {
        match *self {
            ViolationTerm::OutsideRange { lower, upper } => v < lower || v >= upper,
            ViolationTerm::InsideGap { lower, upper } => v < lower && v >= upper,
            ViolationTerm::ForcedZeroSet { mask } => v & mask != 0,
            ViolationTerm::ForcedOneClear { mask } => v & mask != mask,
        }
    }
}

/// Disjunction of violation terms over a `width`-bit value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    width: u32,
    terms: Vec<ViolationTerm>,
}

impl Guard {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn terms(&self) -> &[ViolationTerm] {
        &self.terms
    }

    /// No term survived; the guard can never fire
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn is_violated(&self, v: u64) -> bool {
        let v = v & width_mask(self.width);
        self.terms.iter().any(|term| term.is_violated(v))
    }

    /// Emit instructions computing the guard on `value` of type `ty`
    ///
    /// Returns the instructions and the boolean operand that is true when the
    /// value violates its fact. Temporaries are declared on `func`. The guard
    /// must not be empty.
    pub fn lower(&self, value: &Place, ty: &MirType, func: &mut MirFunction) -> (Vec<MirInst>, Operand) {
        let mut lowering = Lowering {
            func,
            value,
            ty,
            insts: Vec::new(),
        };
        let mut result: Option<Place> = None;
        for term in &self.terms {
            let cond = lowering.term(term);
            result = Some(match result {
                Some(acc) => lowering.binop(MirType::Bool, MirBinOp::Or, Operand::Place(acc), Operand::Place(cond)),
                None => cond,
            });
        }
        let cond = match result {
            Some(place) => Operand::Place(place),
            None => Operand::Constant(Constant::Bool(false)),
        };
        (lowering.insts, cond)
    }
}

struct Lowering<'a> {
    func: &'a mut MirFunction,
    value: &'a Place,
    ty: &'a MirType,
    insts: Vec<MirInst>,
}

impl Lowering<'_> {
    fn binop(&mut self, ty: MirType, op: MirBinOp, lhs: Operand, rhs: Operand) -> Place {
        let dest = self.func.fresh_temp("rg", ty);
        self.insts.push(MirInst::BinOp {
            dest: dest.clone(),
            op,
            lhs,
            rhs,
        });
        dest
    }

    /// `value op constant`
    fn compare(&mut self, op: MirBinOp, constant: u64) -> Place {
        let value = Operand::Place(self.value.clone());
        self.binop(MirType::Bool, op, value, Operand::bits(constant))
    }

    /// `(value & mask) != expected`
    fn masked_ne(&mut self, mask: u64, expected: u64) -> Place {
        let value = Operand::Place(self.value.clone());
        let masked = self.binop(self.ty.clone(), MirBinOp::Band, value, Operand::bits(mask));
        self.binop(MirType::Bool, MirBinOp::Ne, Operand::Place(masked), Operand::bits(expected))
    }

    fn term(&mut self, term: &ViolationTerm) -> Place {
        match *term {
            ViolationTerm::OutsideRange { lower, upper } => {
                if lower == 0 {
                    // `v <u 0` never holds
                    return self.compare(MirBinOp::UGe, upper);
                }
                let below = self.compare(MirBinOp::ULt, lower);
                let above = self.compare(MirBinOp::UGe, upper);
                self.binop(MirType::Bool, MirBinOp::Or, Operand::Place(below), Operand::Place(above))
            }
            ViolationTerm::InsideGap { lower, upper } => {
                let below = self.compare(MirBinOp::ULt, lower);
                if upper == 0 {
                    // `v >=u 0` always holds
                    return below;
                }
                let above = self.compare(MirBinOp::UGe, upper);
                self.binop(MirType::Bool, MirBinOp::And, Operand::Place(below), Operand::Place(above))
            }
            ViolationTerm::ForcedZeroSet { mask } => self.masked_ne(mask, 0),
            ViolationTerm::ForcedOneClear { mask } => self.masked_ne(mask, mask),
        }
    }
}

/// What to insert for one fact
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrapCondition {
    /// The claimed range is empty: reaching the instruction is a violation
    Unconditional,
    /// Trap when the guard fires
    Conditional(Guard),
}

impl TrapCondition {
    pub fn is_violated(&self, v: u64) -> bool {
        match self {
            TrapCondition::Unconditional => true,
            TrapCondition::Conditional(guard) => guard.is_violated(v),
        }
    }
}

/// Builds the trap condition for a fact
#[derive(Debug, Clone, Copy)]
pub struct ConditionSynthesizer {
    check_ranges: bool,
    check_known_bits: bool,
}

impl Default for ConditionSynthesizer {
    fn default() -> Self {
        Self {
            check_ranges: true,
            check_known_bits: true,
        }
    }
}

impl ConditionSynthesizer {
    pub fn new(config: &InstrumentConfig) -> Self {
        Self {
            check_ranges: config.check_ranges,
            check_known_bits: config.check_known_bits,
        }
    }

    pub fn synthesize(&self, range: &ConstantRange, known: &KnownBits) -> TrapCondition {
        debug_assert_eq!(range.width(), known.width());
        let mut terms = Vec::new();

        if self.check_ranges {
            if range.is_empty_set() {
                return TrapCondition::Unconditional;
            }
            if !range.is_full_set() {
                let (lower, upper) = (range.lower(), range.upper());
                terms.push(if range.is_wrapped() {
                    ViolationTerm::InsideGap { lower, upper }
                } else {
                    ViolationTerm::OutsideRange { lower, upper }
                });
            }
        }

        if self.check_known_bits {
            let zero = known.zero().bits;
            if zero != 0 {
                terms.push(ViolationTerm::ForcedZeroSet { mask: zero });
            }
            let one = known.one().bits;
            if one != 0 {
                terms.push(ViolationTerm::ForcedOneClear { mask: one });
            }
        }

        TrapCondition::Conditional(Guard {
            width: range.width(),
            terms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{BasicBlock, Interpreter, Outcome, Terminator};
    use crate::range::BitMask;
    use proptest::prelude::*;

    fn known(width: u32, zero: u64, one: u64) -> KnownBits {
        KnownBits::new(BitMask::new(width, zero), BitMask::new(width, one)).unwrap()
    }

    fn expect_guard(condition: &TrapCondition) -> &Guard {
        match condition {
            TrapCondition::Conditional(guard) => guard,
            TrapCondition::Unconditional => panic!("expected a conditional trap"),
        }
    }

    /// Evaluate the lowered guard in the interpreter
    fn run_lowered(guard: &Guard, ty: MirType, v: u64) -> bool {
        let mut func = MirFunction::new("g", vec![("v".to_string(), ty.clone())], MirType::Bool);
        let (insts, cond) = guard.lower(&Place::new("v"), &ty, &mut func);
        func.blocks.push(BasicBlock::new("entry", insts, Terminator::Return(Some(cond))));
        match Interpreter::new().run(&func, &[v]).unwrap() {
            Outcome::Returned(Some(bit)) => bit != 0,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_empty_range_is_unconditional() {
        let synth = ConditionSynthesizer::default();
        let cond = synth.synthesize(&ConstantRange::empty(8), &KnownBits::unknown(8));
        assert_eq!(cond, TrapCondition::Unconditional);
        assert!((0..256).all(|v| cond.is_violated(v)));
    }

    #[test]
    fn test_all_ranges_width_8() {
        let synth = ConditionSynthesizer::default();
        let unknown = KnownBits::unknown(8);
        for lower in 0..256u64 {
            for upper in 0..256u64 {
                let Ok(range) = ConstantRange::new(8, lower, upper) else { continue };
                let cond = synth.synthesize(&range, &unknown);
                for v in 0..256u64 {
                    assert_eq!(
                        cond.is_violated(v),
                        !range.contains(v),
                        "range {range}, value {v}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_all_known_bits_width_8() {
        let synth = ConditionSynthesizer::default();
        let full = ConstantRange::full(8);
        for zero in 0..256u64 {
            // Every `one` disjoint from `zero`
            let free = !zero & 0xff;
            let mut one = free;
            loop {
                let bits = known(8, zero, one);
                let cond = synth.synthesize(&full, &bits);
                for v in 0..256u64 {
                    assert_eq!(cond.is_violated(v), !bits.contains(v), "{bits}, value {v}");
                }
                if one == 0 {
                    break;
                }
                one = (one - 1) & free;
            }
        }
    }

    #[test]
    fn test_forced_zero_example() {
        let synth = ConditionSynthesizer::default();
        let cond = synth.synthesize(&ConstantRange::full(8), &known(8, 0b1111_0000, 0));
        assert_eq!(expect_guard(&cond).terms(), &[ViolationTerm::ForcedZeroSet { mask: 0xf0 }]);
        assert!(!cond.is_violated(0b0000_1010));
        assert!(cond.is_violated(0b0001_0000));
    }

    #[test]
    fn test_disabled_categories() {
        let range = ConstantRange::new(8, 0, 10).unwrap();
        let bits = known(8, 0xf0, 0);

        let ranges_only = ConditionSynthesizer::new(&InstrumentConfig::new().check_known_bits(false));
        let cond = ranges_only.synthesize(&range, &bits);
        assert_eq!(expect_guard(&cond).terms(), &[ViolationTerm::OutsideRange { lower: 0, upper: 10 }]);

        let bits_only = ConditionSynthesizer::new(&InstrumentConfig::new().check_ranges(false));
        let cond = bits_only.synthesize(&ConstantRange::empty(8), &KnownBits::unknown(8));
        assert!(expect_guard(&cond).is_empty());
        assert!(!cond.is_violated(42));
    }

    #[test]
    fn test_lowering_elides_constant_comparisons() {
        let synth = ConditionSynthesizer::new(&InstrumentConfig::new().check_known_bits(false));
        let mut func = MirFunction::new("g", vec![("v".to_string(), MirType::U8)], MirType::Bool);

        // [0, 10): only `v >=u 10`
        let cond = synth.synthesize(&ConstantRange::new(8, 0, 10).unwrap(), &KnownBits::unknown(8));
        let (insts, _) = expect_guard(&cond).lower(&Place::new("v"), &MirType::U8, &mut func);
        assert_eq!(insts.len(), 1);
        assert_eq!(insts[0].to_string(), format!("%{} = >=u %v, I:10", insts[0].dest().unwrap().name));

        // [250, 0) wraps: only `v <u 250`
        let cond = synth.synthesize(&ConstantRange::new(8, 250, 0).unwrap(), &KnownBits::unknown(8));
        let (insts, _) = expect_guard(&cond).lower(&Place::new("v"), &MirType::U8, &mut func);
        assert_eq!(insts.len(), 1);

        // [3, 10): both comparisons and an `or`
        let cond = synth.synthesize(&ConstantRange::new(8, 3, 10).unwrap(), &KnownBits::unknown(8));
        let (insts, _) = expect_guard(&cond).lower(&Place::new("v"), &MirType::U8, &mut func);
        assert_eq!(insts.len(), 3);
    }

    #[test]
    fn test_lowered_guards_match_evaluation() {
        let synth = ConditionSynthesizer::default();
        let cases = [
            (ConstantRange::new(8, 0, 10).unwrap(), known(8, 0xf0, 0)),
            (ConstantRange::new(8, 3, 10).unwrap(), KnownBits::unknown(8)),
            (ConstantRange::new(8, 250, 5).unwrap(), known(8, 0, 0b1)),
            (ConstantRange::new(8, 200, 0).unwrap(), known(8, 0b10, 0)),
            (ConstantRange::full(8), known(8, 0b1000_0001, 0b0100_0000)),
        ];
        for ty in [MirType::U8, MirType::I8] {
            for (range, bits) in &cases {
                let cond = synth.synthesize(range, bits);
                let guard = expect_guard(&cond);
                for v in 0..256u64 {
                    assert_eq!(
                        run_lowered(guard, ty.clone(), v),
                        guard.is_violated(v),
                        "{range} {bits} at {v} as {ty:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_bool_guard() {
        let synth = ConditionSynthesizer::default();
        let cond = synth.synthesize(&ConstantRange::single(1, 1), &KnownBits::constant(1, 1));
        let guard = expect_guard(&cond);
        assert!(run_lowered(guard, MirType::Bool, 0));
        assert!(!run_lowered(guard, MirType::Bool, 1));
    }

    fn arb_range_64() -> impl Strategy<Value = ConstantRange> {
        prop_oneof![
            Just(ConstantRange::full(64)),
            Just(ConstantRange::empty(64)),
            (any::<u64>(), any::<u64>())
                .prop_filter("equal bounds", |(lo, hi)| lo != hi)
                .prop_map(|(lo, hi)| ConstantRange::new(64, lo, hi).unwrap()),
        ]
    }

    fn arb_known_64() -> impl Strategy<Value = KnownBits> {
        (any::<u64>(), any::<u64>()).prop_map(|(zero, one)| known(64, zero & !one, one))
    }

    proptest! {
        #[test]
        fn prop_guard_matches_membership_64(
            range in arb_range_64(),
            bits in arb_known_64(),
            probe in any::<u64>(),
            near in any::<bool>(),
        ) {
            // Probe the boundaries as well as random points
            let v = if near { range.lower().wrapping_add(probe % 3).wrapping_sub(1) } else { probe };
            let cond = ConditionSynthesizer::default().synthesize(&range, &bits);
            let member = range.contains(v) && bits.contains(v);
            prop_assert_eq!(cond.is_violated(v), !member);
        }
    }
}
