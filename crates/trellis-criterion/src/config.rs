//! Criterion configuration loaded from TOML.
//!
//! ```toml
//! [criterion]
//! nan_check = true
//! l2_epsilon = 1e-30
//! nce_eval_mode = "softmax"
//! ```
//!
//! Every key is optional; missing keys take the defaults below.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use trellis_core::{Error, Result};

use crate::nce::NceEvalMode;

/// `1e-30`, added to the L2 norm before dividing by it.
pub const DEFAULT_L2_EPSILON: f64 = 1e-30;

/// Settings shared by every criterion built through the factory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriterionConfig {
    /// Fail an evaluation whose output is NaN or infinite.
    pub nan_check: bool,
    /// Guard added to the norm in the L2 regularizer gradient.
    pub l2_epsilon: f64,
    /// Evaluation mode for noise-contrastive estimation nodes.
    pub nce_eval_mode: NceEvalMode,
}

impl Default for CriterionConfig {
    fn default() -> Self {
        CriterionConfig {
            nan_check: false,
            l2_epsilon: DEFAULT_L2_EPSILON,
            nce_eval_mode: NceEvalMode::None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    criterion: CriterionConfig,
}

impl CriterionConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(&path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse the `[criterion]` table of a TOML document.
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(toml_str).map_err(|e| Error::Config(e.to_string()))?;
        file.criterion.validated()
    }

    fn validated(self) -> Result<Self> {
        if !(self.l2_epsilon.is_finite() && self.l2_epsilon >= 0.0) {
            return Err(Error::Config(format!(
                "l2_epsilon must be a finite non-negative number, got {}",
                self.l2_epsilon
            )));
        }
        Ok(self)
    }

    pub fn with_nan_check(mut self, enabled: bool) -> Self {
        self.nan_check = enabled;
        self
    }

    pub fn with_l2_epsilon(mut self, epsilon: f64) -> Self {
        self.l2_epsilon = epsilon;
        self
    }

    pub fn with_nce_eval_mode(mut self, mode: NceEvalMode) -> Self {
        self.nce_eval_mode = mode;
        self
    }
}
