use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::OmicError;

/// A measurement modality stored as one matrix on the shared cell axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OmicKind {
    Transcriptomic,
    Proteomic,
}

impl OmicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OmicKind::Transcriptomic => "transcriptomic",
            OmicKind::Proteomic => "proteomic",
        }
    }
}

impl fmt::Display for OmicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OmicKind {
    type Err = OmicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "transcriptomic" | "tran" | "rna" => Ok(OmicKind::Transcriptomic),
            "proteomic" | "prot" | "adt" => Ok(OmicKind::Proteomic),
            _ => Err(OmicError::InvalidOmic(value.to_string())),
        }
    }
}

/// How synthetic dropout picks the entries it zeroes or thins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    /// Independent Bernoulli(rate) zeroing of each entry.
    Uniform,
    /// Binomial thinning: each count is resampled with keep probability 1 - rate.
    Binomial,
}

impl FromStr for CorruptionKind {
    type Err = OmicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "uniform" => Ok(CorruptionKind::Uniform),
            "binomial" => Ok(CorruptionKind::Binomial),
            _ => Err(OmicError::InvalidAlgo(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceAlgo {
    Pca,
    Tsne,
}

impl ReduceAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReduceAlgo::Pca => "pca",
            ReduceAlgo::Tsne => "tsne",
        }
    }
}

impl fmt::Display for ReduceAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReduceAlgo {
    type Err = OmicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "pca" => Ok(ReduceAlgo::Pca),
            "tsne" => Ok(ReduceAlgo::Tsne),
            _ => Err(OmicError::InvalidAlgo(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterAlgo {
    KMeans,
    Knn,
    Louvain,
}

impl ClusterAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterAlgo::KMeans => "kmeans",
            ClusterAlgo::Knn => "knn",
            ClusterAlgo::Louvain => "louvain",
        }
    }
}

impl fmt::Display for ClusterAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ClusterAlgo {
    type Err = OmicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "kmeans" => Ok(ClusterAlgo::KMeans),
            "knn" => Ok(ClusterAlgo::Knn),
            "louvain" => Ok(ClusterAlgo::Louvain),
            _ => Err(OmicError::InvalidAlgo(value.to_string())),
        }
    }
}

/// One encrypted remote archive: where it lives, what its plaintext must
/// hash to, and the file name it is cached under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveDescriptor {
    pub name: String,
    pub url: String,
    /// SHA-256 hex digest of the decrypted plaintext.
    pub checksum: String,
}

impl ArchiveDescriptor {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            checksum: checksum.into(),
        }
    }
}
