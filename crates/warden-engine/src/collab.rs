use std::sync::Arc;

use async_trait::async_trait;
use warden_contracts::{
    CommitInfo, Request, Response, Session, TagInfo, UserAndHost, VerifiedHostAuth,
};
use warden_kernel::DigestKind;

use crate::audit::LogEntry;
use crate::error::{HostAuthError, SigningError, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningIdentity {
    pub email: String,
    pub public_key_wire: Vec<u8>,
    pub fingerprint: String,
}

pub trait SessionRegistry: Send + Sync {
    fn get(&self, session_id: &str) -> Option<Session>;
    fn remove(&self, session: &Session);
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, response: &Response, session: &Session) -> Result<(), TransportError>;
    async fn remove(&self, session: &Session, send_unpair_response: bool);
}

/// Approval rules and the human-facing prompt. None of these calls may wait for
/// the human; a decision comes back later through `Engine::resolve_approval`.
#[async_trait]
pub trait Policy: Send + Sync {
    async fn is_allowed(&self, session: &Session, request: &Request) -> bool;
    async fn add_pending_authorization(&self, session: &Session, request: &Request);
    async fn request_user_authorization(&self, session: &Session, request: &Request);
    async fn notify_user(&self, session: &Session, request: &Request, response: &Response);
}

pub trait SigningBackend: Send + Sync {
    fn identity(&self) -> Result<SigningIdentity, SigningError>;
    fn sign(&self, payload: &[u8], digest: DigestKind) -> Result<Vec<u8>, SigningError>;
    fn pgp_key_id(&self) -> Result<String, SigningError>;
    fn sign_commit(&self, commit: &CommitInfo, key_id: &str) -> Result<String, SigningError>;
    fn sign_tag(&self, tag: &TagInfo, key_id: &str) -> Result<String, SigningError>;
    /// Records `user_id` as a Git author identity for later commits and host listings.
    fn remember_pgp_user_id(&self, user_id: &str) -> Result<(), SigningError>;
    fn pgp_user_ids(&self) -> Vec<String>;
    fn export_pgp_public_key(&self, user_id: &str) -> Result<String, SigningError>;
}

pub trait KnownHosts: Send + Sync {
    fn check_and_pin(&self, host_auth: &VerifiedHostAuth) -> Result<(), HostAuthError>;
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn save(&self, entry: LogEntry, device_name: &str);
    /// (user, host) pairs of past signatures in log order. Repeats are allowed.
    async fn fetch_all_ssh_unique_hosts(&self) -> Vec<UserAndHost>;
}

pub trait Telemetry: Send + Sync {
    fn post_event(&self, category: &str, action: &str, label: Option<&str>);

    fn tracking_id(&self) -> Option<String> {
        None
    }
}

pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub sessions: Arc<dyn SessionRegistry>,
    pub transport: Arc<dyn Transport>,
    pub policy: Arc<dyn Policy>,
    pub signer: Arc<dyn SigningBackend>,
    pub known_hosts: Arc<dyn KnownHosts>,
    pub audit: Arc<dyn AuditLog>,
    pub telemetry: Arc<dyn Telemetry>,
    pub secrets: Arc<dyn SecretStore>,
    pub clock: Arc<dyn Clock>,
}
