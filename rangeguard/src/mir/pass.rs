//! Pass infrastructure
//!
//! A [`FunctionPass`] transforms one function at a time and declares the
//! analyses it needs up front. Analyses are injected explicitly through
//! [`Analyses`]; the [`Pipeline`] refuses to run a pass whose requirements
//! are not provided.
//!
//! Passes are registered by name in a [`PassRegistry`] together with the
//! [`ExtensionPoint`] of the standard pipeline they belong to.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use super::{MirFunction, MirProgram};
use crate::config::InstrumentConfig;
use crate::error::{InstrumentError, Result};
use crate::instrument::{self, InstrumentStats};
use crate::oracle::OracleProvider;

/// Analyses a pass can depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalysisId {
    /// Value ranges and known bits for integer values
    ValueRanges,
}

impl AnalysisId {
    pub fn name(&self) -> &'static str {
        match self {
            AnalysisId::ValueRanges => "value-ranges",
        }
    }
}

impl fmt::Display for AnalysisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Analysis results made available to passes
#[derive(Default, Clone, Copy)]
pub struct Analyses<'a> {
    value_ranges: Option<&'a dyn OracleProvider>,
}

impl<'a> Analyses<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value_ranges(mut self, provider: &'a dyn OracleProvider) -> Self {
        self.value_ranges = Some(provider);
        self
    }

    pub fn value_ranges(&self) -> Option<&'a dyn OracleProvider> {
        self.value_ranges
    }

    pub fn provides(&self, id: AnalysisId) -> bool {
        match id {
            AnalysisId::ValueRanges => self.value_ranges.is_some(),
        }
    }
}

/// Function pass trait
pub trait FunctionPass {
    /// Registration name of the pass
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Analyses that must be provided before the pass can run
    fn required_analyses(&self) -> &'static [AnalysisId] {
        &[]
    }

    /// Program-level setup, run once before any function
    fn prepare_program(&self, _program: &mut MirProgram) {}

    /// Run the pass on a function
    /// Returns true if any changes were made
    fn run_on_function(&self, func: &mut MirFunction, analyses: &Analyses<'_>) -> Result<bool>;
}

/// Fixed insertion points of the standard pipeline, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExtensionPoint {
    /// Before any other pass
    EarlyAsPossible,
    /// After every analysis and optimization
    OptimizerLast,
}

type PassFactory = Box<dyn Fn() -> Box<dyn FunctionPass>>;

/// A registered pass
pub struct PassInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub extension_point: ExtensionPoint,
    factory: PassFactory,
}

impl PassInfo {
    pub fn new(
        name: &'static str,
        description: &'static str,
        extension_point: ExtensionPoint,
        factory: impl Fn() -> Box<dyn FunctionPass> + 'static,
    ) -> Self {
        Self {
            name,
            description,
            extension_point,
            factory: Box::new(factory),
        }
    }

    pub fn create(&self) -> Box<dyn FunctionPass> {
        (self.factory)()
    }
}

impl fmt::Debug for PassInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassInfo")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("extension_point", &self.extension_point)
            .finish_non_exhaustive()
    }
}

/// Passes known by name
#[derive(Debug, Default)]
pub struct PassRegistry {
    passes: Vec<PassInfo>,
}

impl PassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in pass
    pub fn standard(config: &InstrumentConfig, stats: &Arc<InstrumentStats>) -> Self {
        let mut registry = Self::new();
        instrument::register_passes(&mut registry, config, stats);
        registry
    }

    /// Register a pass, replacing any earlier pass with the same name
    pub fn register(&mut self, info: PassInfo) {
        self.passes.retain(|p| p.name != info.name);
        self.passes.push(info);
    }

    pub fn lookup(&self, name: &str) -> Option<&PassInfo> {
        self.passes.iter().find(|p| p.name == name)
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn FunctionPass>> {
        self.lookup(name).map(PassInfo::create)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PassInfo> {
        self.passes.iter()
    }
}

/// Function pass pipeline
pub struct Pipeline {
    slots: BTreeMap<ExtensionPoint, Vec<Box<dyn FunctionPass>>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
        }
    }

    /// The standard pipeline: every built-in pass at its extension point
    pub fn standard(config: &InstrumentConfig, stats: &Arc<InstrumentStats>) -> Self {
        Self::from_registry(&PassRegistry::standard(config, stats))
    }

    /// Instantiate every registered pass at its extension point
    pub fn from_registry(registry: &PassRegistry) -> Self {
        let mut pipeline = Self::new();
        for info in registry.iter() {
            pipeline.add_pass(info.extension_point, info.create());
        }
        pipeline
    }

    pub fn add_pass(&mut self, point: ExtensionPoint, pass: Box<dyn FunctionPass>) {
        self.slots.entry(point).or_default().push(pass);
    }

    /// Pass names in execution order
    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes().map(|p| p.name()).collect()
    }

    fn passes(&self) -> impl Iterator<Item = &Box<dyn FunctionPass>> {
        self.slots.values().flatten()
    }

    /// Run all passes on every function of `program`
    ///
    /// Each function is taken through the whole pipeline before the next one
    /// starts. Passes run exactly once; there is no fixed-point iteration.
    pub fn run(&self, program: &mut MirProgram, analyses: &Analyses<'_>) -> Result<PipelineStats> {
        for pass in self.passes() {
            if let Some(missing) = pass
                .required_analyses()
                .iter()
                .find(|id| !analyses.provides(**id))
            {
                return Err(InstrumentError::MissingAnalysis {
                    pass: pass.name().to_string(),
                    analysis: missing.name().to_string(),
                });
            }
        }

        for pass in self.passes() {
            pass.prepare_program(program);
        }

        let mut stats = PipelineStats::new();
        for func in &mut program.functions {
            for pass in self.passes() {
                if pass.run_on_function(func, analyses)? {
                    stats.record_pass(pass.name());
                }
            }
            stats.functions += 1;
        }
        Ok(stats)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics from a pipeline run
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Number of functions processed
    pub functions: usize,
    /// Number of functions each pass changed
    pub pass_counts: HashMap<String, usize>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pass(&mut self, name: &str) {
        *self.pass_counts.entry(name.to_string()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{BasicBlock, MirType, Terminator};
    use crate::oracle::ValueAnalysis;

    /// Appends an empty block to every function
    struct AddBlock;

    impl FunctionPass for AddBlock {
        fn name(&self) -> &'static str {
            "add-block"
        }

        fn description(&self) -> &'static str {
            "Append an unreachable block"
        }

        fn run_on_function(&self, func: &mut MirFunction, _analyses: &Analyses<'_>) -> Result<bool> {
            func.blocks.push(BasicBlock::new("extra", vec![], Terminator::Unreachable));
            Ok(true)
        }
    }

    struct NeedsRanges;

    impl FunctionPass for NeedsRanges {
        fn name(&self) -> &'static str {
            "needs-ranges"
        }

        fn description(&self) -> &'static str {
            "Requires value ranges"
        }

        fn required_analyses(&self) -> &'static [AnalysisId] {
            &[AnalysisId::ValueRanges]
        }

        fn run_on_function(&self, _func: &mut MirFunction, analyses: &Analyses<'_>) -> Result<bool> {
            assert!(analyses.value_ranges().is_some());
            Ok(false)
        }
    }

    fn make_program() -> MirProgram {
        let mut func = MirFunction::new("f", vec![], MirType::Unit);
        func.blocks.push(BasicBlock::new("entry", vec![], Terminator::Return(None)));
        MirProgram {
            functions: vec![func],
            extern_fns: vec![],
        }
    }

    #[test]
    fn test_pipeline_runs_in_extension_point_order() {
        let mut pipeline = Pipeline::new();
        pipeline.add_pass(ExtensionPoint::OptimizerLast, Box::new(NeedsRanges));
        pipeline.add_pass(ExtensionPoint::EarlyAsPossible, Box::new(AddBlock));
        assert_eq!(pipeline.pass_names(), vec!["add-block", "needs-ranges"]);

        let mut program = make_program();
        let oracle = ValueAnalysis::new();
        let analyses = Analyses::new().with_value_ranges(&oracle);
        let stats = pipeline.run(&mut program, &analyses).unwrap();
        assert_eq!(stats.functions, 1);
        assert_eq!(stats.pass_counts.get("add-block"), Some(&1));
        assert_eq!(stats.pass_counts.get("needs-ranges"), None);
        assert_eq!(program.functions[0].blocks.len(), 2);
    }

    #[test]
    fn test_missing_analysis_is_rejected_before_mutation() {
        let mut pipeline = Pipeline::new();
        pipeline.add_pass(ExtensionPoint::EarlyAsPossible, Box::new(AddBlock));
        pipeline.add_pass(ExtensionPoint::OptimizerLast, Box::new(NeedsRanges));

        let mut program = make_program();
        let err = pipeline.run(&mut program, &Analyses::new()).unwrap_err();
        assert!(matches!(
            err,
            InstrumentError::MissingAnalysis { ref pass, ref analysis }
                if pass == "needs-ranges" && analysis == "value-ranges"
        ));
        assert_eq!(program.functions[0].blocks.len(), 1);
    }

    #[test]
    fn test_registry_replaces_by_name() {
        let mut registry = PassRegistry::new();
        registry.register(PassInfo::new("add-block", "first", ExtensionPoint::EarlyAsPossible, || {
            Box::new(AddBlock) as Box<dyn FunctionPass>
        }));
        registry.register(PassInfo::new("add-block", "second", ExtensionPoint::OptimizerLast, || {
            Box::new(AddBlock) as Box<dyn FunctionPass>
        }));
        assert_eq!(registry.iter().count(), 1);
        let info = registry.lookup("add-block").unwrap();
        assert_eq!(info.description, "second");
        assert_eq!(info.extension_point, ExtensionPoint::OptimizerLast);
        assert!(registry.create("missing").is_none());
        assert_eq!(Pipeline::from_registry(&registry).pass_names(), vec!["add-block"]);
    }

    #[test]
    fn test_standard_registry() {
        let stats = Arc::new(InstrumentStats::new());
        let registry = PassRegistry::standard(&InstrumentConfig::new(), &stats);
        let info = registry.lookup("range-check").unwrap();
        assert_eq!(info.description, "Check value-range facts at runtime");
        assert_eq!(info.extension_point, ExtensionPoint::OptimizerLast);
        assert_eq!(info.create().required_analyses(), &[AnalysisId::ValueRanges]);
    }
}
