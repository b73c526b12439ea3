//! # Centralized Error Handling
//!
//! Unified error types for the entire crate using `thiserror`.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for remac operations
#[derive(Error, Debug)]
pub enum RemacError {
    /// I/O errors (file missing, permission denied, read/write failures)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Input file cannot be opened or lacks required metadata
    #[error("cannot open input {}: {message}", .path.display())]
    InputMissing { path: PathBuf, message: String },

    /// Malformed input records (bad m3vcf header, wrong column count, ...)
    #[error("malformed input at line {line}: {message}")]
    InputMalformed { line: usize, message: String },

    /// Multi-chromosome reference with no --region
    #[error("reference panel contains multiple chromosomes; imputation requires --region")]
    RegionAmbiguous,

    /// A sample's ploidy changed between variants in the target file
    #[error("ploidy of sample {sample} is inconsistent across variants")]
    PloidyInconsistent { sample: String },

    /// --sample-ids yields no overlap with the reference panel
    #[error("sample subset does not overlap reference panel samples")]
    SampleSubsetEmpty,

    /// Typed-to-reference ratio under min_ratio with fail behavior
    #[error("typed to reference site ratio {ratio} is below minimum {min_ratio}; the --min-ratio, --chunk, or --region options may need to be altered")]
    RatioBelowMinimum { ratio: f32, min_ratio: f32 },

    /// Temp spill file creation or write failure
    #[error("temporary file error: {0}")]
    TempIo(std::io::Error),

    /// Final writer or merge failure
    #[error("output error: {0}")]
    OutputIo(std::io::Error),

    /// Probabilities outside [0,1] post-rescale (indicates a bug)
    #[error("HMM invariant violated: {message}")]
    HmmInvariant { message: String },

    /// Configuration errors (invalid CLI arguments)
    #[error("configuration error: {message}")]
    Config { message: String },
}

/// Type alias for Results using RemacError
pub type Result<T> = std::result::Result<T, RemacError>;

impl RemacError {
    /// Create an input-missing error
    pub fn input_missing(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InputMissing {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a malformed-input error with no meaningful line number
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::InputMalformed {
            line: 0,
            message: message.into(),
        }
    }

    /// Create a malformed-input error at a line
    pub fn malformed_at(line: usize, message: impl Into<String>) -> Self {
        Self::InputMalformed {
            line,
            message: message.into(),
        }
    }

    /// Create an HMM invariant error
    pub fn hmm(message: impl Into<String>) -> Self {
        Self::HmmInvariant {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
