//! Value-range oracles
//!
//! An oracle answers two questions about an integer SSA value: which range it
//! lies in and which of its bits are fixed. Answers are computed against one
//! version of a function; a [`ValueOracle`] is produced per function by an
//! [`OracleProvider`] before that function is changed, and must not be used
//! on the function after it has been rewritten.
//!
//! Two providers ship with the crate:
//! - [`ValueAnalysis`], a forward analysis over MIR
//! - [`OverrideOracle`], which answers from a JSON [`FactTable`] and falls
//!   back to another provider for values the table does not mention

mod analysis;
mod table;

pub use analysis::{FunctionFacts, ValueAnalysis, ValueFact};
pub use table::{ClaimedFact, ClaimedRange, FactTable, OverrideOracle, RangeSet};

use crate::error::Result;
use crate::mir::{MirFunction, Place};
use crate::range::{BitMask, ConstantRange};

/// Facts about the values of one function
pub trait ValueOracle {
    /// Range of `value` when control reaches `at_block`
    fn constant_range(&self, value: &Place, at_block: &str) -> ConstantRange;

    /// Forced-zero and forced-one masks of `value`
    ///
    /// The masks are returned as claimed. Callers validate that they agree
    /// in width and do not overlap.
    fn known_bits(&self, value: &Place) -> (BitMask, BitMask);
}

/// Produces a [`ValueOracle`] for a function
pub trait OracleProvider {
    fn oracle_for<'p>(&'p self, func: &MirFunction) -> Result<Box<dyn ValueOracle + 'p>>;
}

impl<P: OracleProvider + ?Sized> OracleProvider for Box<P> {
    fn oracle_for<'p>(&'p self, func: &MirFunction) -> Result<Box<dyn ValueOracle + 'p>> {
        (**self).oracle_for(func)
    }
}
