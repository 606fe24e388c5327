//! Fact tables: externally claimed facts loaded from JSON
//!
//! ```json
//! {
//!   "clamp": {
//!     "r": { "range": { "lower": 0, "upper": 10 } },
//!     "m": { "known_zero": 240 },
//!     "t": { "range": "empty" }
//!   }
//! }
//! ```
//!
//! Widths come from the value's declared type. Values the table does not
//! mention, and fact kinds an entry leaves out, are answered by the fallback
//! provider.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{OracleProvider, ValueOracle};
use crate::error::{InstrumentError, Result};
use crate::mir::{MirFunction, MirType, Place};
use crate::range::{BitMask, ConstantRange, width_mask};

/// Claimed facts for every listed value, keyed by function then value name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactTable {
    functions: BTreeMap<String, BTreeMap<String, ClaimedFact>>,
}

/// Facts claimed for one value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaimedFact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<ClaimedRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_zero: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_one: Option<u64>,
}

/// A claimed range, either a special set or `[lower, upper)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaimedRange {
    Set(RangeSet),
    Bounds { lower: u64, upper: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeSet {
    Full,
    Empty,
}

impl ClaimedRange {
    pub fn resolve(&self, width: u32) -> Result<ConstantRange> {
        match self {
            ClaimedRange::Set(RangeSet::Full) => Ok(ConstantRange::full(width)),
            ClaimedRange::Set(RangeSet::Empty) => Ok(ConstantRange::empty(width)),
            ClaimedRange::Bounds { lower, upper } => ConstantRange::new(width, *lower, *upper),
        }
    }
}

/// A claim resolved against the value's width
#[derive(Debug, Clone, Copy)]
struct ResolvedClaim {
    range: Option<ConstantRange>,
    known: Option<(BitMask, BitMask)>,
}

impl ClaimedFact {
    pub fn range(range: ClaimedRange) -> Self {
        Self {
            range: Some(range),
            ..Self::default()
        }
    }

    pub fn known_bits(zero: u64, one: u64) -> Self {
        Self {
            known_zero: Some(zero),
            known_one: Some(one),
            ..Self::default()
        }
    }

    fn resolve(&self, width: u32) -> std::result::Result<ResolvedClaim, String> {
        let range = match &self.range {
            Some(claim) => Some(claim.resolve(width).map_err(|e| e.to_string())?),
            None => None,
        };
        let known = if self.known_zero.is_some() || self.known_one.is_some() {
            let zero = self.known_zero.unwrap_or(0);
            let one = self.known_one.unwrap_or(0);
            let mask = width_mask(width);
            if (zero | one) & !mask != 0 {
                return Err(format!("known bits {:#x} exceed {width} bits", (zero | one) & !mask));
            }
            // Overlapping masks are passed through; consumers reject them
            Some((BitMask::new(width, zero), BitMask::new(width, one)))
        } else {
            None
        };
        Ok(ResolvedClaim { range, known })
    }
}

impl FactTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| InstrumentError::io_error(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn insert(&mut self, function: impl Into<String>, value: impl Into<String>, fact: ClaimedFact) {
        self.functions
            .entry(function.into())
            .or_default()
            .insert(value.into(), fact);
    }

    pub fn get(&self, function: &str, value: &str) -> Option<&ClaimedFact> {
        self.functions.get(function).and_then(|values| values.get(value))
    }

    pub fn is_empty(&self) -> bool {
        self.functions.values().all(BTreeMap::is_empty)
    }

    /// Answer from this table first and from `fallback` otherwise
    pub fn with_fallback<P: OracleProvider>(self, fallback: P) -> OverrideOracle<P> {
        OverrideOracle {
            table: self,
            fallback,
        }
    }
}

/// A [`FactTable`] layered over another provider
#[derive(Debug, Clone)]
pub struct OverrideOracle<P> {
    table: FactTable,
    fallback: P,
}

impl<P: OracleProvider> OracleProvider for OverrideOracle<P> {
    fn oracle_for<'p>(&'p self, func: &MirFunction) -> Result<Box<dyn ValueOracle + 'p>> {
        let fallback = self.fallback.oracle_for(func)?;
        let mut claims = HashMap::new();

        if let Some(values) = self.table.functions.get(&func.name) {
            for (value, claim) in values {
                let invalid = |message: String| InstrumentError::InvalidFact {
                    function: func.name.clone(),
                    value: value.clone(),
                    message,
                };
                let width = func
                    .value_type(value)
                    .and_then(MirType::int_width)
                    .ok_or_else(|| invalid("not an integer value of this function".to_string()))?;
                let resolved = claim.resolve(width).map_err(invalid)?;
                claims.insert(value.clone(), resolved);
            }
        }

        Ok(Box::new(TableFacts { claims, fallback }))
    }
}

struct TableFacts<'p> {
    claims: HashMap<String, ResolvedClaim>,
    fallback: Box<dyn ValueOracle + 'p>,
}

impl ValueOracle for TableFacts<'_> {
    fn constant_range(&self, value: &Place, at_block: &str) -> ConstantRange {
        match self.claims.get(&value.name).and_then(|c| c.range) {
            Some(range) => range,
            None => self.fallback.constant_range(value, at_block),
        }
    }

    fn known_bits(&self, value: &Place) -> (BitMask, BitMask) {
        match self.claims.get(&value.name).and_then(|c| c.known) {
            Some(known) => known,
            None => self.fallback.known_bits(value),
        }
    }
}
