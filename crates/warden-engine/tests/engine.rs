use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use warden_contracts::{
    CommitInfo, DigestType, GitInfo, GitSignRequest, MeRequest, Medium, Outcome, Pairing,
    Request, RequestBody, Response, ResponseBody, Session, SshSignRequest, TagInfo, UserAndHost,
    VerifiedHostAuth, HOST_MISMATCH, REJECTED,
};
use warden_engine::{
    AuditLog, Clock, Collaborators, Engine, EngineError, EngineSettings, HostAuthError,
    KnownHosts, LogEntry, LogStatus, Policy, SecretStore, SessionRegistry, SigningBackend,
    SigningError, SigningIdentity, Telemetry, Transport, TransportError,
};
use warden_kernel::{ssh_fingerprint, ssh_string, DigestKind};

const T0: i64 = 1_700_000_000;
const TOLERANCE: u64 = 120;
const WIRE_KEY: &[u8] = b"ssh-ed25519 test key";

struct TestClock {
    now: AtomicI64,
    step: AtomicI64,
}

impl Clock for TestClock {
    fn now_unix(&self) -> i64 {
        self.now
            .fetch_add(self.step.load(Ordering::SeqCst), Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeSigner {
    sign_calls: AtomicUsize,
    git_calls: AtomicUsize,
    last_digest: Mutex<Option<DigestKind>>,
    user_ids: Mutex<Vec<String>>,
}

impl SigningBackend for FakeSigner {
    fn identity(&self) -> Result<SigningIdentity, SigningError> {
        Ok(SigningIdentity {
            email: "me@example.com".to_string(),
            public_key_wire: WIRE_KEY.to_vec(),
            fingerprint: ssh_fingerprint(WIRE_KEY),
        })
    }

    fn sign(&self, payload: &[u8], digest: DigestKind) -> Result<Vec<u8>, SigningError> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_digest.lock().unwrap() = Some(digest);
        Ok(payload.iter().rev().take(8).copied().collect())
    }

    fn pgp_key_id(&self) -> Result<String, SigningError> {
        Ok("KEY1".to_string())
    }

    fn sign_commit(&self, commit: &CommitInfo, key_id: &str) -> Result<String, SigningError> {
        self.git_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("commit-sig:{key_id}:{}", commit.tree))
    }

    fn sign_tag(&self, tag: &TagInfo, key_id: &str) -> Result<String, SigningError> {
        self.git_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("tag-sig:{key_id}:{}", tag.tag))
    }

    fn remember_pgp_user_id(&self, user_id: &str) -> Result<(), SigningError> {
        self.user_ids.lock().unwrap().push(user_id.to_string());
        Ok(())
    }

    fn pgp_user_ids(&self) -> Vec<String> {
        self.user_ids.lock().unwrap().clone()
    }

    fn export_pgp_public_key(&self, user_id: &str) -> Result<String, SigningError> {
        if self.user_ids.lock().unwrap().iter().any(|v| v == user_id) {
            Ok(format!("PUB {user_id}"))
        } else {
            Err(SigningError::UnknownIdentity(user_id.to_string()))
        }
    }
}

#[derive(Default)]
struct FakePolicy {
    allowed: AtomicBool,
    is_allowed_calls: AtomicUsize,
    pending_added: AtomicUsize,
    prompts: AtomicUsize,
    notifications: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl Policy for FakePolicy {
    async fn is_allowed(&self, _session: &Session, _request: &Request) -> bool {
        self.is_allowed_calls.fetch_add(1, Ordering::SeqCst);
        self.allowed.load(Ordering::SeqCst)
    }

    async fn add_pending_authorization(&self, _session: &Session, _request: &Request) {
        self.pending_added.fetch_add(1, Ordering::SeqCst);
    }

    async fn request_user_authorization(&self, _session: &Session, _request: &Request) {
        self.prompts.fetch_add(1, Ordering::SeqCst);
    }

    async fn notify_user(&self, _session: &Session, _request: &Request, response: &Response) {
        self.notifications
            .lock()
            .unwrap()
            .push(response.body.error().map(|v| v.to_string()));
    }
}

#[derive(Default)]
struct RecordingTransport {
    fail_acks: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
    removed: Mutex<Vec<(String, bool)>>,
}

impl RecordingTransport {
    fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    fn decoded(&self) -> Vec<Response> {
        self.sent()
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).unwrap())
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, response: &Response, _session: &Session) -> Result<(), TransportError> {
        if response.body == ResponseBody::Ack && self.fail_acks.load(Ordering::SeqCst) {
            return Err(TransportError::Delivery("queue unavailable".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push(serde_json::to_vec(response).unwrap());
        Ok(())
    }

    async fn remove(&self, session: &Session, send_unpair_response: bool) {
        self.removed
            .lock()
            .unwrap()
            .push((session.id.clone(), send_unpair_response));
    }
}

#[derive(Default)]
struct FakeSessions {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry for FakeSessions {
    fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    fn remove(&self, session: &Session) {
        self.sessions.lock().unwrap().remove(&session.id);
    }
}

#[derive(Default)]
struct MemoryAudit {
    entries: Mutex<Vec<LogEntry>>,
    hosts: Mutex<Vec<UserAndHost>>,
}

#[async_trait]
impl AuditLog for MemoryAudit {
    async fn save(&self, entry: LogEntry, _device_name: &str) {
        self.entries.lock().unwrap().push(entry);
    }

    async fn fetch_all_ssh_unique_hosts(&self) -> Vec<UserAndHost> {
        self.hosts.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct RecordingTelemetry {
    events: Mutex<Vec<(String, String, Option<String>)>>,
}

impl RecordingTelemetry {
    fn has(&self, category: &str, action: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|(c, a, _)| c == category && a == action)
    }
}

impl Telemetry for RecordingTelemetry {
    fn post_event(&self, category: &str, action: &str, label: Option<&str>) {
        self.events.lock().unwrap().push((
            category.to_string(),
            action.to_string(),
            label.map(|v| v.to_string()),
        ));
    }
}

struct PinnedHosts;

impl KnownHosts for PinnedHosts {
    fn check_and_pin(&self, host_auth: &VerifiedHostAuth) -> Result<(), HostAuthError> {
        match host_auth.primary_host() {
            Some("evil.example") => Err(HostAuthError::Mismatch {
                host: "evil.example".to_string(),
            }),
            Some(_) => Ok(()),
            None => Err(HostAuthError::MissingHostName),
        }
    }
}

struct FixedSecrets;

impl SecretStore for FixedSecrets {
    fn get(&self, key: &str) -> Option<String> {
        (key == "WARDEN_ENDPOINT").then(|| "arn:test-endpoint".to_string())
    }
}

struct Harness {
    engine: Arc<Engine>,
    clock: Arc<TestClock>,
    signer: Arc<FakeSigner>,
    policy: Arc<FakePolicy>,
    transport: Arc<RecordingTransport>,
    sessions: Arc<FakeSessions>,
    audit: Arc<MemoryAudit>,
    telemetry: Arc<RecordingTelemetry>,
}

fn harness(allowed: bool) -> Harness {
    let clock = Arc::new(TestClock {
        now: AtomicI64::new(T0),
        step: AtomicI64::new(0),
    });
    let signer = Arc::new(FakeSigner::default());
    let policy = Arc::new(FakePolicy::default());
    policy.allowed.store(allowed, Ordering::SeqCst);
    let transport = Arc::new(RecordingTransport::default());
    let sessions = Arc::new(FakeSessions::default());
    sessions
        .sessions
        .lock()
        .unwrap()
        .insert("s1".to_string(), session());
    let audit = Arc::new(MemoryAudit::default());
    let telemetry = Arc::new(RecordingTelemetry::default());

    let collab = Collaborators {
        sessions: sessions.clone(),
        transport: transport.clone(),
        policy: policy.clone(),
        signer: signer.clone(),
        known_hosts: Arc::new(PinnedHosts),
        audit: audit.clone(),
        telemetry: telemetry.clone(),
        secrets: Arc::new(FixedSecrets),
        clock: clock.clone(),
    };
    let engine = Engine::new(
        collab,
        EngineSettings {
            request_time_tolerance_secs: TOLERANCE,
            endpoint_secret_key: "WARDEN_ENDPOINT".to_string(),
        },
    );
    Harness {
        engine: Arc::new(engine),
        clock,
        signer,
        policy,
        transport,
        sessions,
        audit,
        telemetry,
    }
}

fn session() -> Session {
    Session {
        id: "s1".to_string(),
        pairing: Pairing {
            name: "laptop".to_string(),
        },
    }
}

fn userauth(user: &str) -> Vec<u8> {
    let mut data = Vec::new();
    ssh_string(&mut data, b"sid");
    data.push(50);
    ssh_string(&mut data, user.as_bytes());
    ssh_string(&mut data, b"ssh-connection");
    data
}

fn request(id: &str, unix_seconds: i64, body: RequestBody) -> Request {
    Request {
        id: id.to_string(),
        unix_seconds,
        v: "2.4.0".to_string(),
        send_ack: false,
        body,
    }
}

fn ssh_body(fingerprint: &str, host: Option<&str>) -> RequestBody {
    RequestBody::SshSign(SshSignRequest {
        public_key_fingerprint: fingerprint.to_string(),
        data: userauth("git"),
        digest_type: Some(DigestType::Sha512),
        host_auth: host.map(|h| VerifiedHostAuth {
            host_key: vec![4, 2],
            host_names: vec![h.to_string()],
        }),
        display: Some("git push".to_string()),
    })
}

fn ssh_request(id: &str) -> Request {
    request(id, T0, ssh_body(&ssh_fingerprint(WIRE_KEY), Some("github.com")))
}

fn commit_request(id: &str) -> Request {
    request(
        id,
        T0,
        RequestBody::GitSign(GitSignRequest {
            user_id: "Alice <alice@example.com>".to_string(),
            git: GitInfo::Commit(CommitInfo {
                tree: "tree1".to_string(),
                parents: vec![],
                author: "Alice <alice@example.com> 1 +0000".to_string(),
                committer: "Alice <alice@example.com> 1 +0000".to_string(),
                message: "init\n".to_string(),
            }),
        }),
    )
}

#[tokio::test]
async fn auto_approved_ssh_signs_once_and_replays_cached_bytes() {
    let h = harness(true);
    let req = ssh_request("r1");

    h.engine
        .handle(&req, &session(), Medium::Http, None)
        .await
        .unwrap();
    h.engine
        .handle(&req, &session(), Medium::Http, None)
        .await
        .unwrap();

    assert_eq!(h.signer.sign_calls.load(Ordering::SeqCst), 1);
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);
    assert_eq!(h.audit.entries.lock().unwrap().len(), 1);
    assert_eq!(h.policy.is_allowed_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.policy.notifications.lock().unwrap().as_slice(), &[None]);
    assert!(h.telemetry.has("ssh", "automatic approval"));
    assert!(!h.telemetry.has("host", "unknown"));

    let response = &h.transport.decoded()[0];
    assert_eq!(response.endpoint, "arn:test-endpoint");
    assert!(matches!(&response.body, ResponseBody::SshSign(Outcome::Ok(_))));
    assert_eq!(
        h.engine.cached_response("s1", &req.id).as_ref(),
        Some(response)
    );
    assert_eq!(*h.signer.last_digest.lock().unwrap(), Some(DigestKind::Sha512));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_sign_exactly_once() {
    let h = harness(true);
    let req = ssh_request("r-concurrent");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = h.engine.clone();
        let req = req.clone();
        tasks.push(tokio::spawn(async move {
            engine.handle(&req, &session(), Medium::Queue, None).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(h.signer.sign_calls.load(Ordering::SeqCst), 1);
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 8);
    assert!(sent.iter().all(|bytes| bytes == &sent[0]));
}

#[tokio::test]
async fn legacy_peer_gets_sha1_and_unknown_host_is_reported() {
    let h = harness(true);
    let mut req = request("r-legacy", T0, ssh_body(&ssh_fingerprint(WIRE_KEY), None));
    req.v = "2.3.0".to_string();

    h.engine
        .handle(&req, &session(), Medium::Bluetooth, None)
        .await
        .unwrap();

    assert_eq!(*h.signer.last_digest.lock().unwrap(), Some(DigestKind::Sha1));
    assert!(h.telemetry.has("host", "unknown"));
}

#[tokio::test]
async fn stale_and_future_requests_are_rejected() {
    let h = harness(true);
    let fp = ssh_fingerprint(WIRE_KEY);
    let stale = request("old", T0 - 121, ssh_body(&fp, None));
    let future = request("new", T0 + 121, ssh_body(&fp, None));

    for req in [&stale, &future] {
        let err = h
            .engine
            .handle(req, &session(), Medium::Http, None)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::InvalidRequestTime);
        assert!(h.engine.cached_response("s1", &req.id).is_none());
    }
    assert_eq!(h.signer.sign_calls.load(Ordering::SeqCst), 0);
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn freshness_is_rechecked_after_cache_lookup() {
    let h = harness(true);
    // Each clock read advances 100s: sweep, first check, cache lookup, second check.
    h.clock.now.store(T0 - 100, Ordering::SeqCst);
    h.clock.step.store(100, Ordering::SeqCst);

    let err = h
        .engine
        .handle(&ssh_request("slow"), &session(), Medium::Http, None)
        .await
        .unwrap_err();

    assert_eq!(err, EngineError::InvalidRequestTime);
    assert_eq!(h.policy.is_allowed_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.signer.sign_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn approval_requests_are_deduplicated_until_resolved() {
    let h = harness(false);
    let req = ssh_request("r-approve");

    h.engine
        .handle(&req, &session(), Medium::Queue, None)
        .await
        .unwrap();
    assert!(h.engine.is_pending("s1", &req.id));
    assert_eq!(h.policy.prompts.load(Ordering::SeqCst), 1);
    assert_eq!(h.policy.pending_added.load(Ordering::SeqCst), 1);
    assert!(h.telemetry.has("ssh", "requires approval"));
    assert!(h.transport.sent().is_empty());

    let err = h
        .engine
        .handle(&req, &session(), Medium::Queue, None)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::RequestPending);
    assert_eq!(h.policy.prompts.load(Ordering::SeqCst), 1);

    h.engine
        .resolve_approval(&req, &session(), true, Medium::Queue)
        .await
        .unwrap();
    assert!(!h.engine.is_pending("s1", &req.id));
    assert_eq!(h.signer.sign_calls.load(Ordering::SeqCst), 1);
    assert!(h.telemetry.has("ssh", "manual approval"));

    h.engine
        .handle(&req, &session(), Medium::Queue, None)
        .await
        .unwrap();
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);
    assert_eq!(h.policy.prompts.load(Ordering::SeqCst), 1);
    assert_eq!(h.signer.sign_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_pending_entry_accepts_retry() {
    let h = harness(false);
    h.engine
        .handle(&ssh_request("r-retry"), &session(), Medium::Queue, None)
        .await
        .unwrap();

    let later = T0 + 2 * TOLERANCE as i64 + 1;
    h.clock.now.store(later, Ordering::SeqCst);
    let mut retry = ssh_request("r-retry");
    retry.unix_seconds = later;
    h.engine
        .handle(&retry, &session(), Medium::Queue, None)
        .await
        .unwrap();

    assert_eq!(h.policy.prompts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn remove_pending_allows_a_new_prompt() {
    let h = harness(false);
    let req = ssh_request("r-cancel");
    h.engine
        .handle(&req, &session(), Medium::Queue, None)
        .await
        .unwrap();
    h.engine.remove_pending("s1", &req.id).await;
    assert!(!h.engine.is_pending("s1", &req.id));

    h.engine
        .handle(&req, &session(), Medium::Queue, None)
        .await
        .unwrap();
    assert_eq!(h.policy.prompts.load(Ordering::SeqCst), 2);

    let err = h
        .engine
        .resolve_approval(&ssh_request("never-asked"), &session(), true, Medium::Queue)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::NotPending);
}

#[tokio::test]
async fn rejection_is_cached_and_terminal() {
    let h = harness(false);
    let req = ssh_request("r-reject");
    h.engine
        .handle(&req, &session(), Medium::Queue, None)
        .await
        .unwrap();
    h.engine
        .resolve_approval(&req, &session(), false, Medium::Queue)
        .await
        .unwrap();

    let delivered = h.transport.decoded();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].body.error(), Some(REJECTED));
    assert!(h.telemetry.has("ssh", "manual rejection"));
    match &h.audit.entries.lock().unwrap()[0] {
        LogEntry::SshSignature(entry) => {
            assert_eq!(entry.status, LogStatus::Rejected);
            assert!(entry.signature.is_empty());
            assert_eq!(entry.user.as_deref(), Some("git"));
        }
        other => panic!("unexpected entry {other:?}"),
    }

    let policy_calls = h.policy.is_allowed_calls.load(Ordering::SeqCst);
    h.engine
        .handle(&req, &session(), Medium::Queue, None)
        .await
        .unwrap();
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);
    assert_eq!(h.policy.is_allowed_calls.load(Ordering::SeqCst), policy_calls);
    assert_eq!(h.signer.sign_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn fingerprint_mismatch_fails_hard_regardless_of_decision() {
    let allowed = harness(true);
    let req = request("r-fp", T0, ssh_body("not-my-key", Some("github.com")));
    let err = allowed
        .engine
        .handle(&req, &session(), Medium::Http, None)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::KeyDoesNotExist);
    assert!(allowed.transport.sent().is_empty());
    assert!(allowed.audit.entries.lock().unwrap().is_empty());
    assert!(allowed.engine.cached_response("s1", &req.id).is_none());

    let denied = harness(false);
    denied
        .engine
        .handle(&req, &session(), Medium::Http, None)
        .await
        .unwrap();
    let err = denied
        .engine
        .resolve_approval(&req, &session(), false, Medium::Http)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::KeyDoesNotExist);
    assert!(!denied.engine.is_pending("s1", &req.id));
    assert!(denied.engine.cached_response("s1", &req.id).is_none());
}

#[tokio::test]
async fn unpair_removes_session_without_response() {
    let h = harness(true);
    let req = request("r-unpair", T0, RequestBody::Unpair);

    let err = h
        .engine
        .handle(&req, &session(), Medium::Queue, None)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::SessionRemoved);
    assert!(h.transport.sent().is_empty());
    assert_eq!(
        h.transport.removed.lock().unwrap().as_slice(),
        &[("s1".to_string(), false)]
    );
    assert!(h.engine.cached_response("s1", &req.id).is_none());
    assert!(h.sessions.get("s1").is_none());
    assert!(h.telemetry.has("device", "unpair"));

    let err = h
        .engine
        .handle(&ssh_request("after"), &session(), Medium::Queue, None)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::SessionRemoved);
}

#[tokio::test]
async fn noop_has_no_side_effects() {
    let h = harness(true);
    let req = request("r-noop", T0, RequestBody::NoOp);
    h.engine
        .handle(&req, &session(), Medium::Http, None)
        .await
        .unwrap();

    assert!(h.transport.sent().is_empty());
    assert!(h.telemetry.events.lock().unwrap().is_empty());
    assert!(h.engine.cached_response("s1", &req.id).is_none());
    assert_eq!(h.policy.is_allowed_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn hosts_response_deduplicates_audit_history() {
    let h = harness(true);
    let pair = |user: &str, host: &str| UserAndHost {
        user: user.to_string(),
        host: host.to_string(),
    };
    *h.audit.hosts.lock().unwrap() = vec![
        pair("userA", "hostX"),
        pair("userA", "hostX"),
        pair("userB", "hostX"),
    ];

    h.engine
        .handle(
            &request("r-hosts", T0, RequestBody::Hosts),
            &session(),
            Medium::Http,
            None,
        )
        .await
        .unwrap();

    match &h.transport.decoded()[0].body {
        ResponseBody::Hosts(Outcome::Ok(list)) => {
            assert_eq!(list.hosts, vec![pair("userA", "hostX"), pair("userB", "hostX")]);
        }
        other => panic!("unexpected body {other:?}"),
    }
    assert!(h.telemetry.has("hosts", "automatic approval"));
}

#[tokio::test]
async fn ack_is_sent_but_never_cached() {
    let h = harness(false);
    let mut req = ssh_request("r-ack");
    req.send_ack = true;

    h.engine
        .handle(&req, &session(), Medium::Queue, None)
        .await
        .unwrap();

    let sent = h.transport.decoded();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body, ResponseBody::Ack);
    assert_eq!(sent[0].request_id, "r-ack");
    assert!(h.engine.cached_response("s1", &req.id).is_none());
}

#[tokio::test]
async fn ack_failure_does_not_abort_approval() {
    let h = harness(false);
    h.transport.fail_acks.store(true, Ordering::SeqCst);
    let mut req = ssh_request("r-ack-fail");
    req.send_ack = true;

    let completed = Arc::new(AtomicBool::new(false));
    let flag = completed.clone();
    h.engine
        .handle(
            &req,
            &session(),
            Medium::Queue,
            Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
        )
        .await
        .unwrap();

    assert!(completed.load(Ordering::SeqCst));
    assert!(h.engine.is_pending("s1", &req.id));
    assert_eq!(h.policy.prompts.load(Ordering::SeqCst), 1);
    assert!(h.telemetry.has("ssh", "requires approval"));
}

#[tokio::test]
async fn host_mismatch_is_an_embedded_error() {
    let h = harness(true);
    let req = request(
        "r-mitm",
        T0,
        ssh_body(&ssh_fingerprint(WIRE_KEY), Some("evil.example")),
    );

    h.engine
        .handle(&req, &session(), Medium::Http, None)
        .await
        .unwrap();

    assert_eq!(h.transport.decoded()[0].body.error(), Some(HOST_MISMATCH));
    assert_eq!(h.signer.sign_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.audit.entries.lock().unwrap()[0].status(),
        LogStatus::Failed
    );
    assert_eq!(
        h.policy.notifications.lock().unwrap().as_slice(),
        &[Some(HOST_MISMATCH.to_string())]
    );
    assert!(h.engine.cached_response("s1", &req.id).is_some());
}

#[tokio::test]
async fn git_commit_is_signed_and_author_remembered() {
    let h = harness(true);
    h.engine
        .handle(&commit_request("r-git"), &session(), Medium::Http, None)
        .await
        .unwrap();

    match &h.transport.decoded()[0].body {
        ResponseBody::GitSign(Outcome::Ok(sig)) => {
            assert_eq!(sig.signature, "commit-sig:KEY1:tree1");
        }
        other => panic!("unexpected body {other:?}"),
    }
    assert_eq!(
        h.signer.pgp_user_ids(),
        vec!["Alice <alice@example.com>".to_string()]
    );
    assert!(matches!(
        &h.audit.entries.lock().unwrap()[0],
        LogEntry::GitCommitSignature(entry) if entry.status == LogStatus::Signed
    ));
    assert!(h.telemetry.has("git", "automatic approval"));
}

#[tokio::test]
async fn git_rejection_is_still_audited() {
    let h = harness(false);
    let req = commit_request("r-git-reject");
    h.engine
        .handle(&req, &session(), Medium::Http, None)
        .await
        .unwrap();
    h.engine
        .resolve_approval(&req, &session(), false, Medium::Http)
        .await
        .unwrap();

    assert_eq!(h.signer.git_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.transport.decoded()[0].body.error(), Some(REJECTED));
    match &h.audit.entries.lock().unwrap()[0] {
        LogEntry::GitCommitSignature(entry) => {
            assert_eq!(entry.status, LogStatus::Rejected);
            assert!(entry.signature.is_empty());
        }
        other => panic!("unexpected entry {other:?}"),
    };
}

#[tokio::test]
async fn me_omits_companion_key_when_export_fails() {
    let h = harness(true);
    let req = request(
        "r-me",
        T0,
        RequestBody::Me(MeRequest {
            pgp_user_id: Some("Nobody <nobody@example.com>".to_string()),
        }),
    );
    h.engine
        .handle(&req, &session(), Medium::Http, None)
        .await
        .unwrap();

    match &h.transport.decoded()[0].body {
        ResponseBody::Me(Outcome::Ok(profile)) => {
            assert_eq!(profile.email, "me@example.com");
            assert_eq!(profile.public_key_wire, WIRE_KEY.to_vec());
            assert!(profile.pgp_public_key.is_none());
        }
        other => panic!("unexpected body {other:?}"),
    }
    assert!(h.telemetry.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn removed_session_is_rejected_before_anything_else() {
    let h = harness(true);
    h.sessions.remove(&session());
    let err = h
        .engine
        .handle(&ssh_request("r-gone"), &session(), Medium::Http, None)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::SessionRemoved);
    assert_eq!(h.policy.is_allowed_calls.load(Ordering::SeqCst), 0);
}
