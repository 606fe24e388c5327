//! Runtime checking of value-range facts
//!
//! For every integer instruction the oracle claims something about, a guard
//! is inserted right after the instruction that traps the moment the actual
//! value falls outside the claimed range or disagrees with a known bit.
//!
//! A function goes through three stages:
//! 1. [`FactCollector`] queries the oracle for every instruction and keeps
//!    the non-trivial answers. Nothing is modified yet.
//! 2. [`ConditionSynthesizer`] turns each fact into a [`TrapCondition`].
//! 3. [`CfgInstrumenter`] splits blocks and branches to a shared trap block.
//!
//! [`InstrumentStats`] accumulates how much the oracle knew across runs.

mod collect;
mod condition;
mod splice;
mod stats;

pub use collect::{Fact, FactCollector, InstLocation};
pub use condition::{ConditionSynthesizer, Guard, TrapCondition, ViolationTerm};
pub use splice::{CfgInstrumenter, SiteKind, TRAP_INTRINSIC, TRAP_LABEL, TRAP_MODULE, trap_intrinsic};
pub use stats::{InstrumentReport, InstrumentStats, StatsSnapshot};

use std::cell::Cell;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::InstrumentConfig;
use crate::error::{InstrumentError, Result};
use crate::mir::{
    AnalysisId, Analyses, ExtensionPoint, FunctionPass, MirFunction, MirProgram, PassInfo,
    PassRegistry,
};
use crate::oracle::OracleProvider;

/// Registration name of the pass
pub const PASS_NAME: &str = "range-check";

/// Registration description of the pass
pub const PASS_DESCRIPTION: &str = "Check value-range facts at runtime";

/// Instrument one function
///
/// Every fact is collected and validated before `func` is modified. Then
/// the trap block is added, even if no guard ends up using it. An error
/// after that point leaves `func` partially instrumented; callers must
/// discard it.
pub fn instrument_function(
    func: &mut MirFunction,
    provider: &dyn OracleProvider,
    config: &InstrumentConfig,
    stats: &InstrumentStats,
) -> Result<InstrumentReport> {
    let mut report = InstrumentReport::default();
    if config.is_skipped(&func.name) {
        debug!(function = %func.name, "skipped by configuration");
        return Ok(report);
    }

    let facts = {
        let oracle = provider.oracle_for(func)?;
        FactCollector::new(stats).collect(func, oracle.as_ref())?
    };
    report.functions = 1;
    report.facts = facts.len();

    let name = func.name.clone();
    let synthesizer = ConditionSynthesizer::new(config);
    let mut instrumenter = CfgInstrumenter::new(func);
    for fact in &facts {
        let condition = synthesizer.synthesize(&fact.range, &fact.known);
        match instrumenter.instrument(fact, &condition)? {
            SiteKind::Conditional => report.sites += 1,
            SiteKind::Unconditional => {
                report.sites += 1;
                report.unconditional_sites += 1;
            }
            SiteKind::Skipped => report.skipped += 1,
        }
    }

    info!(
        function = %name,
        facts = report.facts,
        sites = report.sites,
        unconditional = report.unconditional_sites,
        "instrumented"
    );
    Ok(report)
}

/// Instrument every function of `program`
///
/// The trap intrinsic is declared on the program once.
pub fn instrument_program(
    program: &mut MirProgram,
    provider: &dyn OracleProvider,
    config: &InstrumentConfig,
    stats: &InstrumentStats,
) -> Result<InstrumentReport> {
    program.declare_extern(trap_intrinsic());
    let mut total = InstrumentReport::default();
    for func in &mut program.functions {
        total += instrument_function(func, provider, config, stats)?;
    }
    Ok(total)
}

/// The range-check pass
pub struct RangeCheckPass {
    config: InstrumentConfig,
    stats: Arc<InstrumentStats>,
    report: Cell<InstrumentReport>,
}

impl RangeCheckPass {
    pub fn new(config: InstrumentConfig, stats: Arc<InstrumentStats>) -> Self {
        Self {
            config,
            stats,
            report: Cell::new(InstrumentReport::default()),
        }
    }

    /// Totals over every function this pass has run on
    pub fn report(&self) -> InstrumentReport {
        self.report.get()
    }

    pub fn stats(&self) -> &InstrumentStats {
        &self.stats
    }
}

impl FunctionPass for RangeCheckPass {
    fn name(&self) -> &'static str {
        PASS_NAME
    }

    fn description(&self) -> &'static str {
        PASS_DESCRIPTION
    }

    fn required_analyses(&self) -> &'static [AnalysisId] {
        &[AnalysisId::ValueRanges]
    }

    fn prepare_program(&self, program: &mut MirProgram) {
        program.declare_extern(trap_intrinsic());
    }

    fn run_on_function(&self, func: &mut MirFunction, analyses: &Analyses<'_>) -> Result<bool> {
        let provider = analyses
            .value_ranges()
            .ok_or_else(|| InstrumentError::MissingAnalysis {
                pass: PASS_NAME.to_string(),
                analysis: AnalysisId::ValueRanges.name().to_string(),
            })?;
        let report = instrument_function(func, provider, &self.config, &self.stats)?;
        let mut total = self.report.get();
        total += report;
        self.report.set(total);
        // Every instrumented function gains a trap block
        Ok(report.functions > 0)
    }
}

/// Register the range-check pass at the end of the optimizer
pub fn register_passes(registry: &mut PassRegistry, config: &InstrumentConfig, stats: &Arc<InstrumentStats>) {
    let config = config.clone();
    let stats = Arc::clone(stats);
    registry.register(PassInfo::new(
        PASS_NAME,
        PASS_DESCRIPTION,
        ExtensionPoint::OptimizerLast,
        move || -> Box<dyn FunctionPass> { Box::new(RangeCheckPass::new(config.clone(), Arc::clone(&stats))) },
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{BasicBlock, Interpreter, MirBinOp, MirInst, MirType, Operand, Outcome, Pipeline, Place, Terminator};
    use crate::oracle::{ClaimedFact, ClaimedRange, FactTable, ValueAnalysis, ValueOracle};
    use crate::range::{BitMask, ConstantRange};

    /// fn digit(x: u8) -> u8 { let r = x % 10; r + 48 }
    fn digit_program() -> MirProgram {
        let mut func = MirFunction::new("digit", vec![("x".to_string(), MirType::U8)], MirType::U8);
        func.locals = vec![("r".to_string(), MirType::U8), ("c".to_string(), MirType::U8)];
        func.blocks.push(BasicBlock::new(
            "entry",
            vec![
                MirInst::BinOp {
                    dest: Place::new("r"),
                    op: MirBinOp::Mod,
                    lhs: Operand::place("x"),
                    rhs: Operand::int(10),
                },
                MirInst::BinOp {
                    dest: Place::new("c"),
                    op: MirBinOp::Add,
                    lhs: Operand::place("r"),
                    rhs: Operand::int(48),
                },
            ],
            Terminator::Return(Some(Operand::place("c"))),
        ));
        MirProgram {
            functions: vec![func],
            extern_fns: vec![],
        }
    }

    #[test]
    fn test_sound_oracle_never_traps() {
        let mut program = digit_program();
        let stats = InstrumentStats::new();
        let report =
            instrument_program(&mut program, &ValueAnalysis::new(), &InstrumentConfig::new(), &stats).unwrap();
        assert_eq!(report.functions, 1);
        assert_eq!(report.facts, 2);
        assert_eq!(report.sites, 2);
        assert_eq!(program.extern_fns, vec![trap_intrinsic()]);

        let func = program.function("digit").unwrap();
        let traps = func.blocks.iter().filter(|b| b.label.starts_with("trap")).count();
        assert_eq!(traps, 1);

        let interp = Interpreter::for_program(&program);
        for x in 0..256u64 {
            assert_eq!(interp.run(func, &[x]).unwrap(), Outcome::Returned(Some(x % 10 + 48)));
        }
    }

    #[test]
    fn test_wrong_claim_traps() {
        let mut program = digit_program();
        let mut table = FactTable::new();
        // Claims `r` is below 5
        table.insert("digit", "r", ClaimedFact::range(ClaimedRange::Bounds { lower: 0, upper: 5 }));
        let oracle = table.with_fallback(ValueAnalysis::new());
        instrument_program(&mut program, &oracle, &InstrumentConfig::new(), &InstrumentStats::new()).unwrap();

        let func = program.function("digit").unwrap();
        let interp = Interpreter::for_program(&program);
        for x in 0..256u64 {
            let outcome = interp.run(func, &[x]).unwrap();
            if x % 10 < 5 {
                assert_eq!(outcome, Outcome::Returned(Some(x % 10 + 48)));
            } else {
                assert_eq!(
                    outcome,
                    Outcome::Trapped {
                        block: "trap".to_string(),
                        from: Some("entry".to_string()),
                    }
                );
            }
        }
    }

    /// Claims nothing about any value
    struct NoFacts;

    struct Widths(std::collections::HashMap<String, u32>);

    impl ValueOracle for Widths {
        fn constant_range(&self, value: &Place, _at_block: &str) -> ConstantRange {
            ConstantRange::full(self.0[&value.name])
        }

        fn known_bits(&self, value: &Place) -> (BitMask, BitMask) {
            let width = self.0[&value.name];
            (BitMask::zeros(width), BitMask::zeros(width))
        }
    }

    impl OracleProvider for NoFacts {
        fn oracle_for<'p>(&'p self, func: &MirFunction) -> Result<Box<dyn ValueOracle + 'p>> {
            let widths = func
                .value_types()
                .into_iter()
                .filter_map(|(name, ty)| Some((name.to_string(), ty.int_width()?)))
                .collect();
            Ok(Box::new(Widths(widths)))
        }
    }

    fn trap_blocks(func: &MirFunction) -> usize {
        func.blocks
            .iter()
            .filter(|b| {
                b.instructions
                    .iter()
                    .any(|inst| matches!(inst, MirInst::Call { func, .. } if func == TRAP_INTRINSIC))
            })
            .count()
    }

    #[test]
    fn test_no_facts_still_gets_trap_block() {
        let mut func = MirFunction::new("id", vec![("x".to_string(), MirType::U32)], MirType::U32);
        func.blocks.push(BasicBlock::new("entry", vec![], Terminator::Return(Some(Operand::place("x")))));
        let report =
            instrument_function(&mut func, &ValueAnalysis::new(), &InstrumentConfig::new(), &InstrumentStats::new())
                .unwrap();
        assert_eq!(report.functions, 1);
        assert_eq!(report.sites, 0);
        assert_eq!(func.blocks.len(), 2);
        assert_eq!(trap_blocks(&func), 1);
        // The entry block is untouched
        assert!(matches!(&func.blocks[0].terminator, Terminator::Return(_)));
        let interp = Interpreter::new();
        assert_eq!(interp.run(&func, &[7]).unwrap(), Outcome::Returned(Some(7)));
    }

    #[test]
    fn test_one_trap_block_per_function() {
        // Claims nothing, one value, then both values
        let claims: [&[&str]; 3] = [&[], &["r"], &["r", "c"]];
        for (count, values) in claims.into_iter().enumerate() {
            let mut program = digit_program();
            let mut table = FactTable::new();
            for value in values {
                table.insert("digit", *value, ClaimedFact::range(ClaimedRange::Bounds { lower: 0, upper: 200 }));
            }
            let oracle = table.with_fallback(NoFacts);
            let report =
                instrument_program(&mut program, &oracle, &InstrumentConfig::new(), &InstrumentStats::new()).unwrap();
            assert_eq!(report.sites, count);
            assert_eq!(trap_blocks(&program.functions[0]), 1, "{count} sites");
        }
    }

    #[test]
    fn test_skipped_function() {
        let mut program = digit_program();
        let config = InstrumentConfig::new().skip_function("digit");
        let stats = InstrumentStats::new();
        let report = instrument_program(&mut program, &ValueAnalysis::new(), &config, &stats).unwrap();
        assert_eq!(report, InstrumentReport::default());
        assert_eq!(program.functions[0].blocks.len(), 1);
        assert_eq!(stats.snapshot().total_bits, 0);
    }

    #[test]
    fn test_invalid_oracle_leaves_function_unchanged() {
        let mut program = digit_program();
        let mut table = FactTable::new();
        table.insert("digit", "c", ClaimedFact::known_bits(0b11, 0b10));
        let oracle = table.with_fallback(ValueAnalysis::new());
        let func = &mut program.functions[0];
        let before = crate::mir::format_mir_function(func);
        let err = instrument_function(func, &oracle, &InstrumentConfig::new(), &InstrumentStats::new()).unwrap_err();
        assert!(err.is_invariant_violation());
        assert_eq!(crate::mir::format_mir_function(func), before);
    }

    #[test]
    fn test_pass_through_standard_pipeline() {
        let stats = Arc::new(InstrumentStats::new());
        let pipeline = Pipeline::standard(&InstrumentConfig::new(), &stats);
        assert_eq!(pipeline.pass_names(), vec![PASS_NAME]);

        let mut program = digit_program();
        let oracle = ValueAnalysis::new();
        let result = pipeline.run(&mut program, &Analyses::new().with_value_ranges(&oracle)).unwrap();
        assert_eq!(result.pass_counts.get(PASS_NAME), Some(&1));
        assert!(program.extern_fn(TRAP_INTRINSIC).is_some_and(|d| d.no_return && d.no_unwind));
        assert_eq!(stats.snapshot().total_bits, 16);
    }

    #[test]
    fn test_pass_report_accumulates() {
        let pass = RangeCheckPass::new(InstrumentConfig::new(), Arc::new(InstrumentStats::new()));
        let oracle = ValueAnalysis::new();
        let analyses = Analyses::new().with_value_ranges(&oracle);
        for _ in 0..2 {
            let mut program = digit_program();
            pass.prepare_program(&mut program);
            assert!(pass.run_on_function(&mut program.functions[0], &analyses).unwrap());
        }
        assert_eq!(pass.report().functions, 2);
        assert_eq!(pass.report().sites, 4);
        assert_eq!(pass.stats().snapshot().total_bits, 32);
    }
}
