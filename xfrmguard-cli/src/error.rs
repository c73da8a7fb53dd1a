//! CLI-specific error types and exit code mapping

use xfrmguard_core::error::{FatalReconciliationError, XfrmGuardError};

/// CLI-specific error type.
///
/// The `exit_code()` method maps errors to process exit codes.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Configuration loading or validation failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// A subcommand-specific operation failed.
    #[error("{0}")]
    Command(String),

    /// The reconciliation engine gave up.
    #[error("fatal: {0}")]
    Fatal(#[from] FatalReconciliationError),

    /// JSON serialisation failed during output rendering.
    #[error("json output error: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    /// IO error (file read, stdout write, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped domain error from xfrmguard-core.
    #[error("{0}")]
    Core(#[from] XfrmGuardError),
}

impl CliError {
    /// Map the error to a process exit code.
    ///
    /// | Code | Meaning                          |
    /// |------|----------------------------------|
    /// | 0    | Success                          |
    /// | 1    | General / command error          |
    /// | 2    | Configuration error              |
    /// | 5    | Fatal reconciliation error       |
    /// | 10   | IO error                         |
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Fatal(_) => 5,
            Self::Io(_) => 10,
            Self::Core(core) => match core {
                XfrmGuardError::Config(_) => 2,
                XfrmGuardError::Fatal(_) => 5,
                XfrmGuardError::Io(_) => 10,
                _ => 1,
            },
            Self::JsonSerialize(_) | Self::Command(_) => 1,
        }
    }
}
