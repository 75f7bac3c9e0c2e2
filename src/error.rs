use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum OmicError {
    #[error("download failed for {url}: {message}")]
    Http { url: String, message: String },

    #[error("server returned status {status} for {url}: {message}")]
    HttpStatus {
        url: String,
        status: u16,
        message: String,
    },

    #[error("failed to decrypt archive {name}: {reason}")]
    Decryption { name: String, reason: String },

    #[error("checksum mismatch at {stage} for {name}: expected {expected}, got {actual}")]
    Integrity {
        stage: &'static str,
        name: String,
        expected: String,
        actual: String,
    },

    #[error("inconsistent sample counts across archives: observed row widths {counts:?}")]
    InconsistentSampleCount { counts: Vec<usize> },

    #[error(
        "cell order mismatch between {left} and {right}: first divergence at row {position} ({left_id} vs {right_id})"
    )]
    SampleAlignment {
        left: String,
        right: String,
        position: usize,
        left_id: String,
        right_id: String,
    },

    #[error("shape mismatch for layer {layer}: matrix has {rows} rows but store holds {cells} cells")]
    ShapeMismatch {
        layer: String,
        rows: usize,
        cells: usize,
    },

    #[error("operation would desynchronize layers: {0}")]
    AlignmentViolation(String),

    #[error("failed to persist dataset: {0}")]
    CacheWrite(String),

    #[error("malformed table in {member}: {reason}")]
    Parse { member: String, reason: String },

    #[error("unknown omic layer: {0}")]
    UnknownLayer(String),

    #[error("unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("invalid omic name: {0}")]
    InvalidOmic(String),

    #[error("invalid algorithm name: {0}")]
    InvalidAlgo(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("missing config file omicbank.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
