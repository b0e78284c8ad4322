use tokio::sync::MutexGuard;
use tracing::{debug, warn};
use warden_contracts::{
    GitInfo, GitSignRequest, GitSignature, HostList, MeRequest, Outcome, Profile, Request,
    RequestBody, Response, ResponseBody, Session, SshSignRequest, SshSignature, HOST_MISMATCH,
    REJECTED,
};
use warden_kernel::{
    cache_key, entry_expiry, parse_userauth_user, select_digest, signed_payload,
    unique_user_hosts,
};

use super::Engine;
use crate::audit::{GitCommitLog, GitTagLog, LogEntry, LogStatus, SshSignatureLog};
use crate::collab::SigningIdentity;
use crate::error::{EngineError, HostAuthError, SigningError};

type Attempt<T> = Result<T, (LogStatus, String)>;

impl Engine {
    /// Builds the one response for `request` and makes it durable in the
    /// idempotency cache. The guard proves the engine lock is held.
    pub(super) async fn response_for(
        &self,
        _guard: &MutexGuard<'_, ()>,
        request: &Request,
        session: &Session,
        allowed: bool,
    ) -> Result<Response, EngineError> {
        let body = match &request.body {
            RequestBody::SshSign(sign) => {
                ResponseBody::SshSign(self.ssh_sign(request, sign, session, allowed).await?)
            }
            RequestBody::GitSign(git) => {
                ResponseBody::GitSign(self.git_sign(git, session, allowed).await)
            }
            RequestBody::Me(me) => ResponseBody::Me(self.me(me)),
            RequestBody::Hosts => ResponseBody::Hosts(self.hosts(allowed).await),
            RequestBody::NoOp | RequestBody::Unpair => {
                return Err(EngineError::ResponseNotNeeded)
            }
        };

        let response = self.envelope(request, body);
        let bytes =
            serde_json::to_vec(&response).map_err(|e| EngineError::Serialization(e.to_string()))?;
        let now = self.now();
        let stored = self.responses.insert_if_absent(
            cache_key(&session.id, &request.id),
            bytes,
            entry_expiry(now, self.settings.request_time_tolerance_secs),
            now,
        );
        if !stored {
            warn!(request_id = %request.id, "response already cached; first answer kept");
        }
        Ok(response)
    }

    async fn ssh_sign(
        &self,
        request: &Request,
        sign: &SshSignRequest,
        session: &Session,
        allowed: bool,
    ) -> Result<Outcome<SshSignature>, EngineError> {
        let identity = self.collab.signer.identity().map_err(|err| {
            warn!(error = %err, "no active signing identity");
            EngineError::KeyDoesNotExist
        })?;
        if identity.fingerprint != sign.public_key_fingerprint {
            return Err(EngineError::KeyDoesNotExist);
        }

        let attempt = self.try_ssh_sign(request, sign, &identity, allowed);
        let (status, error) = audit_status(&attempt);
        let entry = LogEntry::SshSignature(SshSignatureLog {
            session_id: session.id.clone(),
            user: parse_userauth_user(&sign.data),
            host_auth: sign.host_auth.clone(),
            signature: attempt.as_ref().cloned().unwrap_or_default(),
            display: sign.display.clone().unwrap_or_default(),
            status,
            error,
        });
        self.collab.audit.save(entry, &session.pairing.name).await;

        Ok(attempt
            .map(|signature| SshSignature { signature })
            .map_err(|(_, message)| message)
            .into())
    }

    fn try_ssh_sign(
        &self,
        request: &Request,
        sign: &SshSignRequest,
        identity: &SigningIdentity,
        allowed: bool,
    ) -> Attempt<Vec<u8>> {
        if !allowed {
            return Err((LogStatus::Rejected, REJECTED.to_string()));
        }
        if let Some(host_auth) = &sign.host_auth {
            self.collab
                .known_hosts
                .check_and_pin(host_auth)
                .map_err(|err| {
                    let message = match err {
                        HostAuthError::Mismatch { .. } => HOST_MISMATCH.to_string(),
                        other => other.to_string(),
                    };
                    (LogStatus::Failed, message)
                })?;
        }
        let digest = select_digest(&request.v, sign.digest_type);
        let payload = signed_payload(&sign.data, &identity.public_key_wire);
        self.collab
            .signer
            .sign(&payload, digest)
            .map_err(|err| (LogStatus::Failed, err.to_string()))
    }

    async fn git_sign(
        &self,
        git: &GitSignRequest,
        session: &Session,
        allowed: bool,
    ) -> Outcome<GitSignature> {
        let attempt = if allowed {
            self.try_git_sign(git)
                .map_err(|err| (LogStatus::Failed, err.to_string()))
        } else {
            Err((LogStatus::Rejected, REJECTED.to_string()))
        };

        let (status, error) = audit_status(&attempt);
        let signature = attempt.as_ref().cloned().unwrap_or_default();
        let entry = match &git.git {
            GitInfo::Commit(commit) => LogEntry::GitCommitSignature(GitCommitLog {
                session_id: session.id.clone(),
                user_id: git.user_id.clone(),
                commit: commit.clone(),
                signature,
                status,
                error,
            }),
            GitInfo::Tag(tag) => LogEntry::GitTagSignature(GitTagLog {
                session_id: session.id.clone(),
                user_id: git.user_id.clone(),
                tag: tag.clone(),
                signature,
                status,
                error,
            }),
        };
        self.collab.audit.save(entry, &session.pairing.name).await;

        attempt
            .map(|signature| GitSignature { signature })
            .map_err(|(_, message)| message)
            .into()
    }

    fn try_git_sign(&self, git: &GitSignRequest) -> Result<String, SigningError> {
        let signer = &self.collab.signer;
        let key_id = signer.pgp_key_id()?;
        if let Err(err) = signer.remember_pgp_user_id(&git.user_id) {
            debug!(user_id = %git.user_id, error = %err, "author identity not remembered");
        }
        match &git.git {
            GitInfo::Commit(commit) => signer.sign_commit(commit, &key_id),
            GitInfo::Tag(tag) => signer.sign_tag(tag, &key_id),
        }
    }

    fn me(&self, me: &MeRequest) -> Outcome<Profile> {
        let signer = &self.collab.signer;
        let identity = match signer.identity() {
            Ok(v) => v,
            Err(err) => return Outcome::Error(err.to_string()),
        };
        let pgp_public_key =
            me.pgp_user_id
                .as_deref()
                .and_then(|user_id| match signer.export_pgp_public_key(user_id) {
                    Ok(key) => Some(key),
                    Err(err) => {
                        debug!(user_id, error = %err, "companion key export skipped");
                        None
                    }
                });
        Outcome::Ok(Profile {
            email: identity.email,
            public_key_wire: identity.public_key_wire,
            pgp_public_key,
        })
    }

    async fn hosts(&self, allowed: bool) -> Outcome<HostList> {
        if !allowed {
            return Outcome::Error(REJECTED.to_string());
        }
        let hosts = unique_user_hosts(self.collab.audit.fetch_all_ssh_unique_hosts().await);
        Outcome::Ok(HostList {
            pgp_user_ids: self.collab.signer.pgp_user_ids(),
            hosts,
        })
    }
}

fn audit_status<T>(attempt: &Attempt<T>) -> (LogStatus, Option<String>) {
    match attempt {
        Ok(_) => (LogStatus::Signed, None),
        Err((status, message)) => (*status, Some(message.clone())),
    }
}
