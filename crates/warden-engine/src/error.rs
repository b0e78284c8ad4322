use thiserror::Error;

/// Hard failures: the request is aborted, nothing is cached or delivered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("session removed")]
    SessionRemoved,
    #[error("invalid request time")]
    InvalidRequestTime,
    #[error("request already awaiting approval")]
    RequestPending,
    #[error("request does not need a response")]
    ResponseNotNeeded,
    #[error("requested key does not exist")]
    KeyDoesNotExist,
    #[error("request is not awaiting approval")]
    NotPending,
    #[error("response serialization failed: {0}")]
    Serialization(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::SessionRemoved => "session_removed",
            EngineError::InvalidRequestTime => "invalid_request_time",
            EngineError::RequestPending => "request_pending",
            EngineError::ResponseNotNeeded => "response_not_needed",
            EngineError::KeyDoesNotExist => "key_does_not_exist",
            EngineError::NotPending => "not_pending",
            EngineError::Serialization(_) => "serialization_error",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SigningError {
    #[error("no signing identity")]
    NoIdentity,
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("signing failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("no route for session {0}")]
    NoRoute(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostAuthError {
    #[error("host public key mismatch for {host}")]
    Mismatch { host: String },
    #[error("host auth names no host")]
    MissingHostName,
}
