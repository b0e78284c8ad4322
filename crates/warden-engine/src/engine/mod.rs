mod builder;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use warden_contracts::{
    Medium, Request, RequestBody, Response, ResponseBody, Session, CONTRACT_VERSION,
};
use warden_kernel::{
    approval_event, auto_approval_events, cache_key, entry_expiry, is_fresh, TelemetryEvent,
    MANUAL_APPROVAL, MANUAL_REJECTION, REQUIRES_APPROVAL,
};

use crate::cache::TtlCache;
use crate::collab::Collaborators;
use crate::error::EngineError;

pub type Completion = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub request_time_tolerance_secs: u64,
    /// Secret-store key holding the routing endpoint stamped on every response.
    pub endpoint_secret_key: String,
}

/// Serializes every decision behind one lock so signing and cache writes never
/// interleave, across all sessions.
pub struct Engine {
    collab: Collaborators,
    settings: EngineSettings,
    responses: TtlCache<Vec<u8>>,
    pending: TtlCache<()>,
    lock: Mutex<()>,
}

impl Engine {
    pub fn new(collab: Collaborators, settings: EngineSettings) -> Self {
        Self {
            collab,
            settings,
            responses: TtlCache::new(),
            pending: TtlCache::new(),
            lock: Mutex::new(()),
        }
    }

    pub async fn handle(
        &self,
        request: &Request,
        session: &Session,
        medium: Medium,
        completion: Option<Completion>,
    ) -> Result<(), EngineError> {
        let guard = self.lock.lock().await;
        self.responses.sweep_expired(self.now());

        if self.collab.sessions.get(&session.id).is_none() {
            warn!(
                session_id = %session.id,
                request_id = %request.id,
                "request for removed session"
            );
            return Err(EngineError::SessionRemoved);
        }
        self.check_freshness(request)?;

        let key = cache_key(&session.id, &request.id);
        if let Some(cached) = self.cached_at(&key)? {
            debug!(key = %key, "replaying cached response");
            self.deliver(&cached, session).await;
            return Ok(());
        }

        // The lookup may have taken long enough to push the request out of the window.
        self.check_freshness(request)?;

        match &request.body {
            RequestBody::Unpair => {
                info!(session_id = %session.id, "unpair requested");
                self.collab.telemetry.post_event("device", "unpair", None);
                self.collab.sessions.remove(session);
                self.collab.transport.remove(session, false).await;
                return Err(EngineError::SessionRemoved);
            }
            RequestBody::NoOp => return Ok(()),
            _ => {}
        }

        if !self.collab.policy.is_allowed(session, request).await {
            return self
                .handle_requires_approval(&guard, request, session, medium, completion)
                .await;
        }

        let response = self.response_for(&guard, request, session, true).await?;
        for event in auto_approval_events(&request.body, medium) {
            self.post(&event);
        }
        self.collab
            .policy
            .notify_user(session, request, &response)
            .await;
        self.deliver(&response, session).await;
        info!(
            session_id = %session.id,
            request_id = %request.id,
            category = request.category(),
            error = response.body.error().unwrap_or(""),
            "request answered automatically"
        );
        Ok(())
    }

    async fn handle_requires_approval(
        &self,
        _guard: &MutexGuard<'_, ()>,
        request: &Request,
        session: &Session,
        medium: Medium,
        completion: Option<Completion>,
    ) -> Result<(), EngineError> {
        let now = self.now();
        self.pending.sweep_expired(now);

        let key = cache_key(&session.id, &request.id);
        if self.pending.contains(&key, now) {
            debug!(key = %key, "duplicate approval request suppressed");
            return Err(EngineError::RequestPending);
        }
        self.pending.insert_if_absent(
            key,
            (),
            entry_expiry(now, self.settings.request_time_tolerance_secs),
            now,
        );

        self.collab
            .policy
            .add_pending_authorization(session, request)
            .await;
        self.collab
            .policy
            .request_user_authorization(session, request)
            .await;

        if request.send_ack {
            let ack = self.envelope(request, ResponseBody::Ack);
            if let Err(err) = self.collab.transport.send(&ack, session).await {
                warn!(
                    session_id = %session.id,
                    request_id = %request.id,
                    error = %err,
                    "ack send failed"
                );
            }
        }

        self.post(&approval_event(&request.body, REQUIRES_APPROVAL, medium));
        if let Some(done) = completion {
            done();
        }
        info!(
            session_id = %session.id,
            request_id = %request.id,
            category = request.category(),
            "request awaiting approval"
        );
        Ok(())
    }

    /// Applies a human decision to a request previously parked by `handle`.
    pub async fn resolve_approval(
        &self,
        request: &Request,
        session: &Session,
        allowed: bool,
        medium: Medium,
    ) -> Result<(), EngineError> {
        let guard = self.lock.lock().await;
        let now = self.now();
        self.responses.sweep_expired(now);
        self.pending.sweep_expired(now);

        if self.collab.sessions.get(&session.id).is_none() {
            return Err(EngineError::SessionRemoved);
        }

        let key = cache_key(&session.id, &request.id);
        if let Some(cached) = self.cached_at(&key)? {
            self.pending.remove(&key);
            self.deliver(&cached, session).await;
            return Ok(());
        }
        if !self.pending.contains(&key, now) {
            return Err(EngineError::NotPending);
        }

        let built = self.response_for(&guard, request, session, allowed).await;
        self.pending.remove(&key);
        let response = built?;

        let action = if allowed {
            MANUAL_APPROVAL
        } else {
            MANUAL_REJECTION
        };
        self.post(&approval_event(&request.body, action, medium));
        self.deliver(&response, session).await;
        info!(
            session_id = %session.id,
            request_id = %request.id,
            allowed,
            "approval resolved"
        );
        Ok(())
    }

    pub async fn remove_pending(&self, session_id: &str, request_id: &str) {
        let _guard = self.lock.lock().await;
        self.pending.remove(&cache_key(session_id, request_id));
    }

    /// Last answer for the request, without waiting for in-flight processing.
    pub fn cached_response(&self, session_id: &str, request_id: &str) -> Option<Response> {
        let key = cache_key(session_id, request_id);
        match self.cached_at(&key) {
            Ok(v) => v,
            Err(err) => {
                warn!(key = %key, error = %err, "cached response unreadable");
                None
            }
        }
    }

    pub fn is_pending(&self, session_id: &str, request_id: &str) -> bool {
        self.pending
            .contains(&cache_key(session_id, request_id), self.now())
    }

    fn cached_at(&self, key: &str) -> Result<Option<Response>, EngineError> {
        match self.responses.get(key, self.now()) {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| EngineError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn check_freshness(&self, request: &Request) -> Result<(), EngineError> {
        let now = self.now();
        if !is_fresh(
            now,
            request.unix_seconds,
            self.settings.request_time_tolerance_secs,
        ) {
            warn!(
                request_id = %request.id,
                request_time = request.unix_seconds,
                now,
                "request outside freshness window"
            );
            return Err(EngineError::InvalidRequestTime);
        }
        Ok(())
    }

    fn envelope(&self, request: &Request, body: ResponseBody) -> Response {
        Response {
            request_id: request.id.clone(),
            endpoint: self
                .collab
                .secrets
                .get(&self.settings.endpoint_secret_key)
                .unwrap_or_default(),
            v: CONTRACT_VERSION.to_string(),
            body,
            tracking_id: self.collab.telemetry.tracking_id(),
        }
    }

    async fn deliver(&self, response: &Response, session: &Session) {
        if let Err(err) = self.collab.transport.send(response, session).await {
            warn!(
                session_id = %session.id,
                request_id = %response.request_id,
                error = %err,
                "response delivery failed"
            );
        }
    }

    fn post(&self, event: &TelemetryEvent) {
        self.collab
            .telemetry
            .post_event(event.category, event.action, Some(&event.label));
    }

    fn now(&self) -> i64 {
        self.collab.clock.now_unix()
    }
}
