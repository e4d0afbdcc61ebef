use miette::Diagnostic;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(fallback_kv::config::error),
        help("Configure a state file, a standalone target and at least one fallback target before start()")
    )]
    Config(String),

    #[error("Database is already started")]
    #[diagnostic(code(fallback_kv::lifecycle::already_started))]
    AlreadyStarted,

    #[error("Database is not started")]
    #[diagnostic(
        code(fallback_kv::lifecycle::not_started),
        help("Call start() before creating transactions")
    )]
    NotStarted,

    #[error("Invalid state file {}: {reason}", .path.display())]
    #[diagnostic(
        code(fallback_kv::statefile::invalid),
        help("The persistent state file is corrupt. Remove it to start from defaults")
    )]
    StateFile { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Transaction must be retried: {0}")]
    #[diagnostic(
        code(fallback_kv::transaction::retry),
        help("Transient condition; open a new transaction and retry the whole operation")
    )]
    TransactionRetry(String),

    #[error("Transaction error: {0}")]
    #[diagnostic(code(fallback_kv::transaction::error))]
    Transaction(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error signals a transient condition where retrying the
    /// whole transaction is expected to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransactionRetry(_))
    }
}
