//! Common types shared between the wharf server crates
//!
//! Holds the flat error taxonomy every subsystem reports through, plus the
//! small vocabulary types (protocols, permissions, login methods) that the
//! provider, policy engine and HTTP layer all agree on.

pub mod perms;

pub use perms::{LoginMethod, Permission, Protocol};

/// Result alias used across the workspace
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the control core.
///
/// The variants are stable: log lines and tests match on [`Error::kind`],
/// never on the human-readable message.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate object: {0}")]
    Conflict(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("two-factor authentication required for protocol {0}")]
    TwoFactorRequired(String),

    #[error("a passcode is required")]
    PasscodeRequired,

    #[error("invalid passcode")]
    PasscodeInvalid,

    #[error("this passcode was already used")]
    PasscodeAlreadyUsed,

    #[error("this recovery code was already used")]
    RecoveryCodeAlreadyUsed,

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("transfer quota exceeded: {0}")]
    TransferQuotaExceeded(String),

    #[error("too many open sessions: {0}")]
    TooManySessions(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("address is banned")]
    Banned,

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("operation unsupported: {0}")]
    OperationUnsupported(String),

    #[error("object was modified concurrently: {0}")]
    Stale(String),

    #[error("data provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("crypto integrity check failed: {0}")]
    CryptoIntegrityError(String),

    #[error("object is referenced: {0}")]
    Referenced(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable kind, used in structured logs and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Validation(_) => "validation",
            Error::PermissionDenied(_) => "permission_denied",
            Error::Unauthorized(_) => "unauthorized",
            Error::TwoFactorRequired(_) => "two_factor_required",
            Error::PasscodeRequired => "passcode_required",
            Error::PasscodeInvalid => "passcode_invalid",
            Error::PasscodeAlreadyUsed => "passcode_already_used",
            Error::RecoveryCodeAlreadyUsed => "recovery_code_already_used",
            Error::QuotaExceeded(_) => "quota_exceeded",
            Error::TransferQuotaExceeded(_) => "transfer_quota_exceeded",
            Error::TooManySessions(_) => "too_many_sessions",
            Error::RateLimited { .. } => "rate_limited",
            Error::Banned => "banned",
            Error::Cancelled => "cancelled",
            Error::Timeout(_) => "timeout",
            Error::OperationUnsupported(_) => "operation_unsupported",
            Error::Stale(_) => "stale",
            Error::ProviderUnavailable(_) => "provider_unavailable",
            Error::CryptoIntegrityError(_) => "crypto_integrity",
            Error::Referenced(_) => "referenced",
            Error::Internal(_) => "internal",
        }
    }

    /// True for failures callers may retry without changes.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ProviderUnavailable(_) | Error::Timeout(_) | Error::RateLimited { .. }
        )
    }
}

/// The opaque placeholder emitted instead of secret material.
///
/// Clients send it back unchanged to mean "keep the stored value"; the
/// literal is part of the wire contract and must not change.
pub const REDACTED_SECRET: &str = "[**redacted**]";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(Error::NotFound("x".into()).kind(), "not_found");
        assert_eq!(Error::Banned.kind(), "banned");
        assert_eq!(Error::PasscodeAlreadyUsed.kind(), "passcode_already_used");
        assert_eq!(
            Error::RateLimited { retry_after_secs: 3 }.kind(),
            "rate_limited"
        );
    }

    #[test]
    fn transient_errors() {
        assert!(Error::ProviderUnavailable("down".into()).is_transient());
        assert!(!Error::Validation("bad".into()).is_transient());
    }
}
