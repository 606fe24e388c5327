//! rangeguard Library
//!
//! Runtime checking of value-range and known-bits facts over MIR.

pub mod config;
pub mod error;
pub mod instrument;
pub mod mir;
pub mod oracle;
pub mod range;

pub use config::InstrumentConfig;
pub use error::{InstrumentError, Result};
pub use instrument::{InstrumentReport, InstrumentStats, RangeCheckPass, instrument_function, instrument_program};
