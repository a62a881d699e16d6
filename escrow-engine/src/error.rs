//! Error types for the escrow system
//!
//! Every escrow operation reports one of four outcomes to its caller:
//! malformed input, a transaction that is not in the required state,
//! an upstream payment processor failure, or a caller without the
//! required relationship to the transaction.

use thiserror::Error;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Malformed input (bad action, self-purchase, listing already sold)
    #[error("Validation error: {0}")]
    Validation(String),

    /// No transaction matched the id together with the required state
    #[error("Not found: {0}")]
    NotFound(String),

    /// Upstream payment processor failed or timed out
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Caller is not the buyer, seller or admin the action requires
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Fee schedule or other engine settings are unusable
    #[error("Configuration error: {0}")]
    Config(String),

    /// A persisted row violated the allowed state combinations
    #[error("Invalid state: status={status}, payment_status={payment_status}")]
    InvalidState {
        status: String,
        payment_status: String,
    },

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found (precondition) error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an authorization error
    pub fn authorization<S: Into<String>>(msg: S) -> Self {
        Self::Authorization(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(status: S, payment_status: S) -> Self {
        Self::InvalidState {
            status: status.into(),
            payment_status: payment_status.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// True when the transaction already moved past the requested
    /// transition. Callers treat this as "already handled", not a retry.
    pub fn is_already_handled(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Stable machine-readable code for boundary responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Gateway(GatewayError::SessionNotReady(_)) => "PAYMENT_NOT_COMPLETED",
            Self::Gateway(GatewayError::Timeout) => "GATEWAY_TIMEOUT",
            Self::Gateway(_) => "GATEWAY_ERROR",
            Self::Authorization(_) => "FORBIDDEN",
            Self::Config(_) => "NOT_CONFIGURED",
            Self::InvalidState { .. } | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Failure reported by the payment gateway adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The processor rejected the request
    #[error("declined ({code}): {message}")]
    Declined { code: String, message: String },

    /// The call did not complete within the configured bound
    #[error("gateway call timed out")]
    Timeout,

    /// Network or HTTP level failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// The processor answered with something we could not interpret
    #[error("invalid gateway response: {0}")]
    InvalidResponse(String),

    /// Checkout session has not reached the required payment state
    #[error("payment not completed for session {0}")]
    SessionNotReady(String),

    /// No gateway credentials configured
    #[error("payment service not configured")]
    NotConfigured,
}

impl GatewayError {
    /// Create a declined error
    pub fn declined<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self::Declined {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an invalid response error
    pub fn invalid_response<S: Into<String>>(msg: S) -> Self {
        Self::InvalidResponse(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_already_handled() {
        assert!(EscrowError::not_found("txn 1").is_already_handled());
        assert!(!EscrowError::validation("bad").is_already_handled());
        assert!(!EscrowError::from(GatewayError::Timeout).is_already_handled());
    }

    #[test]
    fn test_gateway_error_codes() {
        let err: EscrowError = GatewayError::SessionNotReady("cs_1".into()).into();
        assert_eq!(err.code(), "PAYMENT_NOT_COMPLETED");
        let err: EscrowError = GatewayError::declined("card_declined", "no funds").into();
        assert_eq!(err.code(), "GATEWAY_ERROR");
        assert!(err.to_string().contains("card_declined"));
    }
}
