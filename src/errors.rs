//! Error taxonomy for the session engine.
//!
//! Mirrors the propagation policy of the domain: transport failures are
//! recovered by reconnect/backoff, protocol and validation failures stay
//! local to a session, and only `Cancelled` is terminal.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum SimError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("state error: {0}")]
    State(String),

    #[error("call timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type SimResult<T> = Result<T, SimError>;

/// OCPP-J `CALLERROR` error codes, bit-exact the OCPP 1.6 vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcppErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl OcppErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotImplemented => "NotImplemented",
            Self::NotSupported => "NotSupported",
            Self::InternalError => "InternalError",
            Self::ProtocolError => "ProtocolError",
            Self::SecurityError => "SecurityError",
            Self::FormationViolation => "FormationViolation",
            Self::PropertyConstraintViolation => "PropertyConstraintViolation",
            Self::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            Self::TypeConstraintViolation => "TypeConstraintViolation",
            Self::GenericError => "GenericError",
        }
    }
}
