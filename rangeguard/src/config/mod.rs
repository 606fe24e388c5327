//! Instrumentation configuration
//!
//! Loaded from TOML or built in code:
//!
//! ```toml
//! check_ranges = true
//! check_known_bits = false
//! skip_functions = ["hot_loop"]
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{InstrumentError, Result};

/// Controls which guards the range-check pass emits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstrumentConfig {
    /// Emit range terms (and unconditional traps for empty ranges)
    pub check_ranges: bool,
    /// Emit forced-zero and forced-one terms
    pub check_known_bits: bool,
    /// Functions left untouched
    pub skip_functions: Vec<String>,
    /// Step budget for `rangeguard run`
    pub step_limit: usize,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentConfig {
    /// Create a configuration with every check enabled
    pub fn new() -> Self {
        Self {
            check_ranges: true,
            check_known_bits: true,
            skip_functions: Vec::new(),
            step_limit: crate::mir::eval::DEFAULT_STEP_LIMIT,
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| InstrumentError::config_error(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Set range checking
    pub fn check_ranges(mut self, enable: bool) -> Self {
        self.check_ranges = enable;
        self
    }

    /// Set known-bits checking
    pub fn check_known_bits(mut self, enable: bool) -> Self {
        self.check_known_bits = enable;
        self
    }

    /// Leave `name` uninstrumented
    pub fn skip_function(mut self, name: impl Into<String>) -> Self {
        self.skip_functions.push(name.into());
        self
    }

    /// Set interpreter step budget
    pub fn step_limit(mut self, limit: usize) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn is_skipped(&self, function: &str) -> bool {
        self.skip_functions.iter().any(|f| f == function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = InstrumentConfig::default();
        assert!(config.check_ranges);
        assert!(config.check_known_bits);
        assert!(config.skip_functions.is_empty());
        assert_eq!(config.step_limit, crate::mir::eval::DEFAULT_STEP_LIMIT);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = InstrumentConfig::from_toml_str(
            r#"
            check_known_bits = false
            skip_functions = ["hot"]
            "#,
        )
        .unwrap();
        assert!(config.check_ranges);
        assert!(!config.check_known_bits);
        assert!(config.is_skipped("hot"));
        assert!(!config.is_skipped("cold"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = InstrumentConfig::from_toml_str("check_rangez = true").unwrap_err();
        assert!(matches!(err, InstrumentError::Config { .. }));
    }

    #[test]
    fn test_builder() {
        let config = InstrumentConfig::new()
            .check_ranges(false)
            .skip_function("main")
            .step_limit(10);
        assert!(!config.check_ranges);
        assert!(config.is_skipped("main"));
        assert_eq!(config.step_limit, 10);
    }
}
