mod audit;
mod cache;
mod collab;
mod engine;
mod error;

pub use audit::{
    verify_audit_chain, AuditRecord, GitCommitLog, GitTagLog, JsonlAuditLog, LogEntry, LogStatus,
    SshSignatureLog,
};
pub use collab::{
    AuditLog, Clock, Collaborators, KnownHosts, Policy, SecretStore, SessionRegistry,
    SigningBackend, SigningIdentity, SystemClock, Telemetry, Transport,
};
pub use engine::{Completion, Engine, EngineSettings};
pub use error::{EngineError, HostAuthError, SigningError, TransportError};
