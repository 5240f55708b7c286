// All core functionality is in specsieve-core
// This CLI acts as a thin wrapper around the core library

use specsieve_core::error::{CacheError, CorrectionError, ExtractionError, RetrievalError};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Re-export core types for convenience
pub use specsieve_core::*;

pub const EXIT_OK: i32 = 0;
pub const EXIT_OTHER: i32 = 1;
pub const EXIT_EXTRACTION: i32 = 2;
pub const EXIT_MISSING_DEVICE: i32 = 3;
pub const EXIT_VALIDATION: i32 = 4;
pub const EXIT_CACHE_UNAVAILABLE: i32 = 5;
pub const EXIT_RATE_LIMITED: i32 = 6;

/// Exit status for a failed command, from the first typed error in the chain
pub fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<ExtractionError>().is_some() {
            return EXIT_EXTRACTION;
        }
        if let Some(e) = cause.downcast_ref::<CorrectionError>() {
            return match e {
                CorrectionError::MissingDevice(_) => EXIT_MISSING_DEVICE,
                e if e.is_validation() => EXIT_VALIDATION,
                _ => EXIT_OTHER,
            };
        }
        if let Some(e) = cause.downcast_ref::<CacheError>() {
            return match e {
                CacheError::StoreUnavailable(_) => EXIT_CACHE_UNAVAILABLE,
                e if e.is_retryable() => EXIT_RATE_LIMITED,
                CacheError::AlreadyVerified(_) | CacheError::NotFound(_) => EXIT_VALIDATION,
                _ => EXIT_OTHER,
            };
        }
        if let Some(RetrievalError::DimensionMismatch { .. }) = cause.downcast_ref::<RetrievalError>() {
            return EXIT_VALIDATION;
        }
    }
    EXIT_OTHER
}

/// stderr logging; `RUST_LOG` wins over the verbosity flag
pub fn init_logging(verbose: bool) {
    let default = if verbose { "specsieve=info,specsieve_core=info" } else { "specsieve=warn,specsieve_core=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A second init (tests) is harmless
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
