//! Error types for fp-core
//!
//! Re-exports the unified error type from fp-error.

pub use fp_error::{FpError, Result};
