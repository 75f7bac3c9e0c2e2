use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::OmicError;

/// Encoder/decoder topology handed to the model layer at construction.
/// Passed explicitly everywhere; never a module-level mutable default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub latent_dim: usize,
    pub dropout: f32,
    pub batch_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 128,
            n_layers: 2,
            latent_dim: 32,
            dropout: 0.3,
            batch_size: 64,
        }
    }
}

/// Latent-variable distribution family of the model layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatentDistribution {
    Normal,
    Diag,
    Mixed,
    Diri,
}

impl LatentDistribution {
    pub fn as_str(&self) -> &'static str {
        match self {
            LatentDistribution::Normal => "normal",
            LatentDistribution::Diag => "diag",
            LatentDistribution::Mixed => "mixed",
            LatentDistribution::Diri => "diri",
        }
    }
}

impl fmt::Display for LatentDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LatentDistribution {
    type Err = OmicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "normal" => Ok(LatentDistribution::Normal),
            "diag" => Ok(LatentDistribution::Diag),
            "mixed" => Ok(LatentDistribution::Mixed),
            "diri" => Ok(LatentDistribution::Diri),
            _ => Err(OmicError::InvalidAlgo(value.to_string())),
        }
    }
}
