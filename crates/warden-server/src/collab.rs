use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ed25519_dalek::{Signer, SigningKey};
use reqwest::Client;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use warden_config::{AutoApprove, Identity, SessionConfig};
use warden_contracts::{
    CommitInfo, Pairing, Request, RequestBody, Response, Session, TagInfo, VerifiedHostAuth,
};
use warden_engine::{
    HostAuthError, KnownHosts, Policy, SecretStore, SessionRegistry, SigningBackend,
    SigningError, SigningIdentity, Telemetry, Transport, TransportError,
};
use warden_kernel::{
    cache_key, commit_payload, ssh_fingerprint, ssh_string, tag_payload, DigestKind,
};

const SSH_ED25519: &[u8] = b"ssh-ed25519";
const SIGNATURE_LABEL: &str = "WARDEN SIGNATURE";
const PUBLIC_KEY_LABEL: &str = "WARDEN PUBLIC KEY";
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MemorySessionRegistry {
    sessions: DashMap<String, Session>,
}

impl MemorySessionRegistry {
    pub fn from_config(sessions: &[SessionConfig]) -> Self {
        let map = DashMap::new();
        for s in sessions {
            map.insert(
                s.id.clone(),
                Session {
                    id: s.id.clone(),
                    pairing: Pairing {
                        name: s.name.clone(),
                    },
                },
            );
        }
        Self { sessions: map }
    }
}

impl SessionRegistry for MemorySessionRegistry {
    fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|v| v.value().clone())
    }

    fn remove(&self, session: &Session) {
        if self.sessions.remove(&session.id).is_some() {
            info!(session_id = %session.id, "session removed");
        }
    }
}

/// Delivers responses by POSTing them to the callback URL paired with each session.
pub struct HttpTransport {
    client: Client,
    routes: DashMap<String, String>,
}

impl HttpTransport {
    pub fn new(sessions: &[SessionConfig]) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(CALLBACK_TIMEOUT)
            .build()
            .map_err(|e| e.to_string())?;
        let routes = DashMap::new();
        for s in sessions {
            if let Some(url) = &s.callback_url {
                routes.insert(s.id.clone(), url.clone());
            }
        }
        Ok(Self { client, routes })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, response: &Response, session: &Session) -> Result<(), TransportError> {
        let url = self
            .routes
            .get(&session.id)
            .map(|v| v.value().clone())
            .ok_or_else(|| TransportError::NoRoute(session.id.clone()))?;

        let reply = self
            .client
            .post(&url)
            .json(response)
            .send()
            .await
            .map_err(|e| TransportError::Delivery(e.to_string()))?;
        if !reply.status().is_success() {
            return Err(TransportError::Delivery(format!(
                "callback returned {}",
                reply.status()
            )));
        }
        debug!(session_id = %session.id, request_id = %response.request_id, "response posted");
        Ok(())
    }

    async fn remove(&self, session: &Session, send_unpair_response: bool) {
        if send_unpair_response {
            debug!(session_id = %session.id, "callback routes carry no unpair notice");
        }
        self.routes.remove(&session.id);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingAuthorization {
    pub session: Session,
    pub request: Request,
}

/// Auto-approval switches per request category. Everything else waits for a
/// decision posted to the approvals API.
pub struct ConfigPolicy {
    auto_approve: AutoApprove,
    pending: DashMap<String, PendingAuthorization>,
}

impl ConfigPolicy {
    pub fn new(auto_approve: AutoApprove) -> Self {
        Self {
            auto_approve,
            pending: DashMap::new(),
        }
    }

    pub fn pending(&self) -> Vec<PendingAuthorization> {
        let mut out: Vec<_> = self.pending.iter().map(|v| v.value().clone()).collect();
        out.sort_by(|a, b| {
            (a.request.unix_seconds, &a.request.id).cmp(&(b.request.unix_seconds, &b.request.id))
        });
        out
    }

    pub fn pending_request(
        &self,
        session_id: &str,
        request_id: &str,
    ) -> Option<PendingAuthorization> {
        self.pending
            .get(&cache_key(session_id, request_id))
            .map(|v| v.value().clone())
    }

    /// Drops prompts the engine no longer holds, e.g. after the pending entry
    /// expired. Returns how many were dropped.
    pub fn retain_live(&self, is_live: impl Fn(&str, &str) -> bool) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, v| is_live(&v.session.id, &v.request.id));
        let dropped = before.saturating_sub(self.pending.len());
        if dropped > 0 {
            debug!(dropped, "expired approval prompts dropped");
        }
        dropped
    }

    pub fn forget(&self, session_id: &str, request_id: &str) -> bool {
        self.pending
            .remove(&cache_key(session_id, request_id))
            .is_some()
    }
}

#[async_trait]
impl Policy for ConfigPolicy {
    async fn is_allowed(&self, _session: &Session, request: &Request) -> bool {
        match &request.body {
            RequestBody::SshSign(_) => self.auto_approve.ssh,
            RequestBody::GitSign(_) => self.auto_approve.git,
            RequestBody::Hosts => self.auto_approve.hosts,
            RequestBody::Me(_) => self.auto_approve.me,
            RequestBody::NoOp | RequestBody::Unpair => true,
        }
    }

    async fn add_pending_authorization(&self, session: &Session, request: &Request) {
        self.pending.insert(
            cache_key(&session.id, &request.id),
            PendingAuthorization {
                session: session.clone(),
                request: request.clone(),
            },
        );
    }

    async fn request_user_authorization(&self, session: &Session, request: &Request) {
        let shown = match &request.body {
            RequestBody::SshSign(sign) => sign.display.clone(),
            RequestBody::GitSign(git) => Some(git.user_id.clone()),
            _ => None,
        };
        info!(
            session_id = %session.id,
            device = %session.pairing.name,
            request_id = %request.id,
            category = request.category(),
            display = shown.as_deref().unwrap_or(""),
            "approval required"
        );
    }

    async fn notify_user(&self, session: &Session, request: &Request, response: &Response) {
        match response.body.error() {
            Some(error) => warn!(
                device = %session.pairing.name,
                request_id = %request.id,
                category = request.category(),
                error,
                "request answered with error"
            ),
            None => info!(
                device = %session.pairing.name,
                request_id = %request.id,
                category = request.category(),
                "request approved automatically"
            ),
        }
    }
}

/// Ed25519 identity held in process memory, derived from the configured seed.
pub struct SoftwareSigner {
    email: String,
    key: SigningKey,
    user_ids: Mutex<Vec<String>>,
}

impl SoftwareSigner {
    pub fn from_config(identity: &Identity) -> Result<Self, String> {
        let seed = hex::decode(&identity.seed_hex)
            .map_err(|e| format!("invalid identity.seed_hex: {e}"))?;
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| "identity.seed_hex must encode 32 bytes".to_string())?;
        Ok(Self {
            email: identity.email.clone(),
            key: SigningKey::from_bytes(&seed),
            user_ids: Mutex::new(Vec::new()),
        })
    }

    pub fn public_key_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        ssh_string(&mut out, SSH_ED25519);
        ssh_string(&mut out, self.key.verifying_key().as_bytes());
        out
    }

    fn detached(&self, payload: &[u8], key_id: &str) -> String {
        let signature = self.key.sign(payload);
        armor(SIGNATURE_LABEL, &[("Key-Id", key_id)], &signature.to_bytes())
    }
}

impl SigningBackend for SoftwareSigner {
    fn identity(&self) -> Result<SigningIdentity, SigningError> {
        let public_key_wire = self.public_key_wire();
        Ok(SigningIdentity {
            email: self.email.clone(),
            fingerprint: ssh_fingerprint(&public_key_wire),
            public_key_wire,
        })
    }

    fn sign(&self, payload: &[u8], digest: DigestKind) -> Result<Vec<u8>, SigningError> {
        // Ed25519 hashes internally; the negotiated digest only matters for RSA keys.
        debug!(?digest, "signing ssh payload");
        let signature = self.key.sign(payload);
        let mut out = Vec::new();
        ssh_string(&mut out, SSH_ED25519);
        ssh_string(&mut out, &signature.to_bytes());
        Ok(out)
    }

    fn pgp_key_id(&self) -> Result<String, SigningError> {
        let digest = Sha256::digest(self.key.verifying_key().as_bytes());
        Ok(hex::encode_upper(&digest[..8]))
    }

    fn sign_commit(&self, commit: &CommitInfo, key_id: &str) -> Result<String, SigningError> {
        Ok(self.detached(&commit_payload(commit), key_id))
    }

    fn sign_tag(&self, tag: &TagInfo, key_id: &str) -> Result<String, SigningError> {
        Ok(self.detached(&tag_payload(tag), key_id))
    }

    fn remember_pgp_user_id(&self, user_id: &str) -> Result<(), SigningError> {
        if user_id.trim().is_empty() {
            return Err(SigningError::Failed("empty user id".to_string()));
        }
        let mut ids = self
            .user_ids
            .lock()
            .map_err(|_| SigningError::Failed("user id store poisoned".to_string()))?;
        if !ids.iter().any(|v| v == user_id) {
            ids.push(user_id.to_string());
        }
        Ok(())
    }

    fn pgp_user_ids(&self) -> Vec<String> {
        self.user_ids
            .lock()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    fn export_pgp_public_key(&self, user_id: &str) -> Result<String, SigningError> {
        if !self.pgp_user_ids().iter().any(|v| v == user_id) {
            return Err(SigningError::UnknownIdentity(user_id.to_string()));
        }
        let key_id = self.pgp_key_id()?;
        Ok(armor(
            PUBLIC_KEY_LABEL,
            &[("Key-Id", key_id.as_str()), ("User-Id", user_id)],
            self.key.verifying_key().as_bytes(),
        ))
    }
}

fn armor(label: &str, headers: &[(&str, &str)], body: &[u8]) -> String {
    let encoded = STANDARD.encode(body);
    let mut out = format!("-----BEGIN {label}-----\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\n"));
    }
    out.push('\n');
    let mut rest = encoded.as_str();
    while !rest.is_empty() {
        let (line, tail) = rest.split_at(rest.len().min(64));
        out.push_str(line);
        out.push('\n');
        rest = tail;
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

/// Trust on first use: the first key seen for a host name is pinned.
#[derive(Default)]
pub struct MemoryKnownHosts {
    pinned: DashMap<String, Vec<u8>>,
}

impl KnownHosts for MemoryKnownHosts {
    fn check_and_pin(&self, host_auth: &VerifiedHostAuth) -> Result<(), HostAuthError> {
        let host = host_auth
            .primary_host()
            .ok_or(HostAuthError::MissingHostName)?;
        match self.pinned.entry(host.to_string()) {
            Entry::Occupied(pinned) => {
                if pinned.get() != &host_auth.host_key {
                    return Err(HostAuthError::Mismatch {
                        host: host.to_string(),
                    });
                }
            }
            Entry::Vacant(slot) => {
                info!(host, "pinned new host key");
                slot.insert(host_auth.host_key.clone());
            }
        }
        Ok(())
    }
}

pub struct TracingTelemetry {
    tracking_id: String,
}

impl TracingTelemetry {
    pub fn new() -> Self {
        Self {
            tracking_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl Default for TracingTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry for TracingTelemetry {
    fn post_event(&self, category: &str, action: &str, label: Option<&str>) {
        info!(
            target: "telemetry",
            category,
            action,
            label = label.unwrap_or(""),
            "event"
        );
    }

    fn tracking_id(&self) -> Option<String> {
        Some(self.tracking_id.clone())
    }
}

pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}
