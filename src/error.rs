//! Centralized error handling types for the library.
//!
//! This module leverages the `thiserror` crate to provide a unified [`Error`]
//! enum that aggregates low-level OS failures (Win32), resolution and
//! attachment failures, and remote execution errors. Each top-level failure
//! category maps to a distinct process exit code so that scripted callers can
//! branch on the outcome; the mapping is part of the external contract and
//! must stay stable.

/// A convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The exhaustive list of failure modes for the injection lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller-supplied identifier is zero or otherwise unusable.
    ///
    /// Rejected before any OS call is made.
    #[error("invalid id: must be a nonzero process or thread id")]
    InvalidInput,

    /// The identifier matches neither a live process nor a live thread.
    #[error("id matches no live process or thread")]
    NotFound,

    /// The upgrade protocol could not even enumerate candidate threads.
    #[error("thread discovery failed during upgrade")]
    UpgradeFailed,

    /// Neither direct attach nor the upgrade protocol produced a suspendable
    /// thread.
    #[error("no thread of the target could be opened and suspended")]
    AttachFailed,

    /// Local staging buffer or remote reservation could not be allocated.
    #[error("memory allocation failed")]
    AllocationFailed,

    /// Committing staged bytes into the target's address space failed.
    #[error("remote commit failed")]
    CommitFailed,

    /// The named system module is not loaded in this process.
    #[error("module '{0}' not found")]
    ModuleNotFound(String),

    /// The named symbol is not exported by the module.
    #[error("export '{0}' not found")]
    ExportNotFound(String),

    /// The hijacked thread never reached the halt point within the configured
    /// ceiling. Fatal: the session must be torn down.
    #[error("remote call timed out before reaching the halt point")]
    Timeout,

    /// The target thread or process vanished mid-call. Fatal.
    #[error("target thread or process disappeared during the call")]
    TargetGone,

    /// The captured or restored thread context failed validation. Fatal.
    #[error("thread context failed validation")]
    ContextCorrupt,

    /// A raw Operating System API failure.
    ///
    /// Contains the name of the failed function and the raw error code (decimal).
    #[error("Win32 API '{0}' failed with error code: {1}")]
    Win32(&'static str, u32),

    /// A generic runtime failure not covered by specific variants.
    #[error("execution failed: {0}")]
    Execution(String),
}

impl Error {
    /// Maps this error to the process exit code observed by scripted callers.
    ///
    /// The codes mirror the historical command-line contract: `0x06` attach,
    /// `0x07` upgrade, `0x08` resolution, `0x11` invalid id, `0x20`/`0x21`
    /// loader export resolution, `0x92`/`0x93` remote memory stack
    /// creation/commit. Everything else reports a generic `0x01`.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::AttachFailed => 0x06,
            Error::UpgradeFailed => 0x07,
            Error::NotFound => 0x08,
            Error::InvalidInput => 0x11,
            Error::ModuleNotFound(_) => 0x20,
            Error::ExportNotFound(_) => 0x21,
            Error::AllocationFailed => 0x92,
            Error::CommitFailed => 0x93,
            _ => 0x01,
        }
    }

    /// Returns `true` if this error ends the whole run rather than a single
    /// payload.
    ///
    /// Once a universal call has mutated the target thread's context, a
    /// timeout or a vanished target leaves no safe way to keep using the
    /// session; the only remaining move is teardown.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::TargetGone | Error::ContextCorrupt
        )
    }
}

// Helper: Enables usage of `?` on String to convert automatically to Error::Execution.
impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Execution(s)
    }
}

// Helper: Enables usage of `?` on &str to convert automatically to Error::Execution.
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Execution(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_external_contract() {
        assert_eq!(Error::AttachFailed.exit_code(), 0x06);
        assert_eq!(Error::UpgradeFailed.exit_code(), 0x07);
        assert_eq!(Error::NotFound.exit_code(), 0x08);
        assert_eq!(Error::InvalidInput.exit_code(), 0x11);
        assert_eq!(Error::ModuleNotFound("kernel32".into()).exit_code(), 0x20);
        assert_eq!(
            Error::ExportNotFound("LoadLibraryA".into()).exit_code(),
            0x21
        );
        assert_eq!(Error::AllocationFailed.exit_code(), 0x92);
        assert_eq!(Error::CommitFailed.exit_code(), 0x93);
    }

    #[test]
    fn call_execution_errors_are_fatal() {
        assert!(Error::Timeout.is_fatal());
        assert!(Error::TargetGone.is_fatal());
        assert!(Error::ContextCorrupt.is_fatal());
        assert!(!Error::CommitFailed.is_fatal());
        assert!(!Error::AttachFailed.is_fatal());
    }

    #[test]
    fn string_conversions_produce_execution_errors() {
        let err: Error = "boom".into();
        assert!(matches!(err, Error::Execution(_)));
    }
}
