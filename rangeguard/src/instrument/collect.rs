//! Fact collection
//!
//! Walks a function in program order and asks the oracle about every
//! integer-valued, non-phi instruction. Everything is validated before the
//! function is touched: a malformed oracle answer aborts collection and
//! leaves the function unchanged.

use std::fmt;

use tracing::warn;

use super::stats::InstrumentStats;
use crate::error::{InstrumentError, Result};
use crate::mir::{MirFunction, MirType, Place, format_mir_inst};
use crate::oracle::ValueOracle;
use crate::range::{ConstantRange, KnownBits, KnownBitsError};

/// Position of an instruction in the function as collected
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstLocation {
    pub block: String,
    pub index: usize,
}

impl fmt::Display for InstLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.block, self.index)
    }
}

/// What the oracle claims about one instruction's result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fact {
    pub value: Place,
    pub location: InstLocation,
    pub ty: MirType,
    pub range: ConstantRange,
    pub known: KnownBits,
    /// Printed instruction, for diagnostics
    pub text: String,
}

impl Fact {
    pub fn width(&self) -> u32 {
        self.range.width()
    }

    /// Claims nothing, so there is nothing to check
    pub fn is_trivial(&self) -> bool {
        self.range.is_full_set() && self.known.is_unknown()
    }
}

/// Queries the oracle and records how informative its answers were
pub struct FactCollector<'s> {
    stats: &'s InstrumentStats,
}

impl<'s> FactCollector<'s> {
    pub fn new(stats: &'s InstrumentStats) -> Self {
        Self { stats }
    }

    /// Non-trivial facts of `func` in program order
    ///
    /// Stats are only updated when every answer was valid.
    pub fn collect(&self, func: &MirFunction, oracle: &dyn ValueOracle) -> Result<Vec<Fact>> {
        let mut facts = Vec::new();
        let (mut total_bits, mut known_bits, mut interval_bits) = (0u64, 0u64, 0u64);
        for block in &func.blocks {
            for (index, inst) in block.instructions.iter().enumerate() {
                if inst.is_phi() {
                    continue;
                }
                let Some(value) = inst.dest() else { continue };
                let Some(ty) = func.value_type(&value.name) else {
                    warn!(function = %func.name, value = %value.name, "result has no declared type");
                    continue;
                };
                let Some(width) = ty.int_width() else { continue };

                let range = oracle.constant_range(value, &block.label);
                if range.width() != width {
                    return Err(InstrumentError::RangeWidthMismatch {
                        value: value.name.clone(),
                        range_width: range.width(),
                        value_width: width,
                    });
                }
                let (zero, one) = oracle.known_bits(value);
                let known = KnownBits::new(zero, one).map_err(|e| match e {
                    KnownBitsError::WidthMismatch { zero_width, one_width } => {
                        InstrumentError::KnownBitsWidthMismatch {
                            value: value.name.clone(),
                            zero_width,
                            one_width,
                        }
                    }
                    KnownBitsError::Conflict { overlap } => InstrumentError::ConflictingKnownBits {
                        value: value.name.clone(),
                        overlap,
                    },
                })?;
                if known.width() != width {
                    return Err(InstrumentError::KnownBitsWidthMismatch {
                        value: value.name.clone(),
                        zero_width: known.width(),
                        one_width: width,
                    });
                }

                total_bits += u64::from(width);
                known_bits += u64::from(known.known_count());
                interval_bits += u64::from(range.information_bits());

                let fact = Fact {
                    value: value.clone(),
                    location: InstLocation {
                        block: block.label.clone(),
                        index,
                    },
                    ty: ty.clone(),
                    range,
                    known,
                    text: format_mir_inst(inst),
                };
                if !fact.is_trivial() {
                    facts.push(fact);
                }
            }
        }
        self.stats.record(total_bits, known_bits, interval_bits);
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{BasicBlock, MirBinOp, MirInst, Operand, Terminator};
    use crate::oracle::{ClaimedFact, FactTable, OracleProvider, ValueAnalysis};
    use crate::range::BitMask;

    /// Answers the same thing for every value
    struct FixedOracle {
        range: ConstantRange,
        zero: BitMask,
        one: BitMask,
    }

    impl ValueOracle for FixedOracle {
        fn constant_range(&self, _value: &Place, _at_block: &str) -> ConstantRange {
            self.range
        }

        fn known_bits(&self, _value: &Place) -> (BitMask, BitMask) {
            (self.zero, self.one)
        }
    }

    fn fixed(range: ConstantRange, zero: u64, one: u64) -> FixedOracle {
        FixedOracle {
            range,
            zero: BitMask::new(range.width(), zero),
            one: BitMask::new(range.width(), one),
        }
    }

    fn make_function() -> MirFunction {
        let mut func = MirFunction::new("f", vec![("x".to_string(), MirType::U8)], MirType::U8);
        func.locals = vec![
            ("a".to_string(), MirType::U8),
            ("b".to_string(), MirType::U8),
            ("p".to_string(), MirType::U8),
            ("fl".to_string(), MirType::F64),
        ];
        func.blocks = vec![
            BasicBlock::new(
                "entry",
                vec![
                    MirInst::BinOp {
                        dest: Place::new("a"),
                        op: MirBinOp::Mod,
                        lhs: Operand::place("x"),
                        rhs: Operand::int(10),
                    },
                    MirInst::Cast {
                        dest: Place::new("fl"),
                        src: Operand::place("a"),
                        from_ty: MirType::U8,
                        to_ty: MirType::F64,
                    },
                    MirInst::Call {
                        dest: None,
                        func: "log".to_string(),
                        args: vec![],
                        is_tail: false,
                    },
                    MirInst::BinOp {
                        dest: Place::new("b"),
                        op: MirBinOp::Mul,
                        lhs: Operand::place("x"),
                        rhs: Operand::place("x"),
                    },
                ],
                Terminator::Goto("exit".to_string()),
            ),
            BasicBlock::new(
                "exit",
                vec![MirInst::Phi {
                    dest: Place::new("p"),
                    values: vec![(Operand::place("a"), "entry".to_string())],
                }],
                Terminator::Return(Some(Operand::place("p"))),
            ),
        ];
        func
    }

    #[test]
    fn test_collects_non_trivial_integer_facts() {
        let func = make_function();
        let stats = InstrumentStats::new();
        let analysis = ValueAnalysis::new();
        let oracle = analysis.oracle_for(&func).unwrap();
        let facts = FactCollector::new(&stats).collect(&func, oracle.as_ref()).unwrap();

        // %b is trivial, %fl is not integral, %p is a phi
        assert_eq!(facts.len(), 1);
        let fact = &facts[0];
        assert_eq!(fact.value, Place::new("a"));
        assert_eq!(fact.location, InstLocation { block: "entry".to_string(), index: 0 });
        assert_eq!(fact.range, ConstantRange::new(8, 0, 10).unwrap());
        assert_eq!(fact.text, "%a = % %x, I:10");

        // Both %a and %b were inspected
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_bits, 16);
        assert_eq!(snapshot.known_bits, 4);
        // [0,10) has 10 members: 8 - ceil(log2 10) = 4
        assert_eq!(snapshot.interval_bits, 4);
    }

    #[test]
    fn test_conflicting_bits_rejected() {
        let func = make_function();
        let stats = InstrumentStats::new();
        let oracle = fixed(ConstantRange::full(8), 0b0001, 0b0011);
        let err = FactCollector::new(&stats).collect(&func, &oracle).unwrap_err();
        assert!(matches!(
            err,
            InstrumentError::ConflictingKnownBits { ref value, overlap: 0b0001 } if value == "a"
        ));
        assert_eq!(stats.snapshot(), Default::default());
    }

    #[test]
    fn test_late_error_leaves_stats_untouched() {
        let func = make_function();
        let stats = InstrumentStats::new();
        // %a is fine, %b claims bit 0 is both zero and one
        let mut table = FactTable::new();
        table.insert("f", "b", ClaimedFact::known_bits(1, 1));
        let provider = table.with_fallback(ValueAnalysis::new());
        let oracle = provider.oracle_for(&func).unwrap();
        let err = FactCollector::new(&stats).collect(&func, oracle.as_ref()).unwrap_err();
        assert!(matches!(err, InstrumentError::ConflictingKnownBits { ref value, .. } if value == "b"));
        assert_eq!(stats.snapshot(), Default::default());
    }

    #[test]
    fn test_width_mismatches_rejected() {
        let func = make_function();
        let stats = InstrumentStats::new();

        let wide = fixed(ConstantRange::full(16), 0, 0);
        let err = FactCollector::new(&stats).collect(&func, &wide).unwrap_err();
        assert!(matches!(err, InstrumentError::RangeWidthMismatch { range_width: 16, value_width: 8, .. }));

        let skewed = FixedOracle {
            range: ConstantRange::full(8),
            zero: BitMask::zeros(8),
            one: BitMask::zeros(16),
        };
        let err = FactCollector::new(&stats).collect(&func, &skewed).unwrap_err();
        assert!(matches!(err, InstrumentError::KnownBitsWidthMismatch { zero_width: 8, one_width: 16, .. }));

        let both_wide = FixedOracle {
            range: ConstantRange::full(8),
            zero: BitMask::zeros(16),
            one: BitMask::zeros(16),
        };
        let err = FactCollector::new(&stats).collect(&func, &both_wide).unwrap_err();
        assert!(matches!(err, InstrumentError::KnownBitsWidthMismatch { .. }));
    }

    #[test]
    fn test_empty_range_is_a_fact() {
        let func = make_function();
        let stats = InstrumentStats::new();
        let oracle = fixed(ConstantRange::empty(8), 0, 0);
        let facts = FactCollector::new(&stats).collect(&func, &oracle).unwrap();
        assert_eq!(facts.len(), 2);
        assert!(facts.iter().all(|f| f.range.is_empty_set()));
        // Empty ranges pin every bit
        assert_eq!(stats.snapshot().interval_bits, 16);
    }
}
