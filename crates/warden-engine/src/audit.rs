use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use warden_contracts::{CommitInfo, TagInfo, UserAndHost, VerifiedHostAuth};
use warden_kernel::jcs_sha256_hex;

use crate::collab::AuditLog;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Signed,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    SshSignature(SshSignatureLog),
    GitCommitSignature(GitCommitLog),
    GitTagSignature(GitTagLog),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshSignatureLog {
    pub session_id: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub host_auth: Option<VerifiedHostAuth>,
    #[serde(with = "warden_contracts::base64_bytes")]
    pub signature: Vec<u8>,
    pub display: String,
    pub status: LogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitCommitLog {
    pub session_id: String,
    pub user_id: String,
    pub commit: CommitInfo,
    pub signature: String,
    pub status: LogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitTagLog {
    pub session_id: String,
    pub user_id: String,
    pub tag: TagInfo,
    pub signature: String,
    pub status: LogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LogEntry {
    pub fn status(&self) -> LogStatus {
        match self {
            LogEntry::SshSignature(v) => v.status,
            LogEntry::GitCommitSignature(v) => v.status,
            LogEntry::GitTagSignature(v) => v.status,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            LogEntry::SshSignature(_) => "ssh_signature",
            LogEntry::GitCommitSignature(_) => "git_commit_signature",
            LogEntry::GitTagSignature(_) => "git_tag_signature",
        }
    }

    /// Only completed SSH signatures with a known user and host count as visited hosts.
    pub fn user_and_host(&self) -> Option<UserAndHost> {
        match self {
            LogEntry::SshSignature(v) if v.status == LogStatus::Signed => Some(UserAndHost {
                user: v.user.clone()?,
                host: v.host_auth.as_ref()?.primary_host()?.to_string(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: String,
    pub ts: String,
    pub device_name: String,
    pub entry: LogEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl AuditRecord {
    fn new(device_name: &str, entry: LogEntry) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            ts: Utc::now().to_rfc3339(),
            device_name: device_name.to_string(),
            entry,
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    fn compute_hash(&self) -> Result<String, String> {
        let mut seeded = self.clone();
        seeded.record_hash.clear();
        let value = serde_json::to_value(&seeded).map_err(|e| e.to_string())?;
        jcs_sha256_hex(&value)
    }
}

struct Chain {
    file: tokio::fs::File,
    last_hash: Option<String>,
}

/// Distinct (user, host) pairs in first-seen order.
#[derive(Default)]
struct HostIndex {
    order: Vec<UserAndHost>,
    seen: HashSet<UserAndHost>,
}

impl HostIndex {
    fn insert(&mut self, pair: UserAndHost) {
        if self.seen.insert(pair.clone()) {
            self.order.push(pair);
        }
    }
}

/// Append-only JSONL signature log; every record carries the hash of its predecessor.
pub struct JsonlAuditLog {
    chain: Mutex<Chain>,
    sqlite: Option<Mutex<Connection>>,
    ssh_hosts: Mutex<HostIndex>,
}

impl JsonlAuditLog {
    pub async fn open(path: &str, sqlite_path: Option<&str>) -> Result<Self, String> {
        let mut last_hash = None;
        let mut ssh_hosts = HostIndex::default();
        if let Ok(text) = tokio::fs::read_to_string(path).await {
            for (idx, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let rec: AuditRecord = serde_json::from_str(line)
                    .map_err(|e| format!("{path} line {} parse failed: {e}", idx + 1))?;
                if let Some(pair) = rec.entry.user_and_host() {
                    ssh_hosts.insert(pair);
                }
                last_hash = Some(rec.record_hash);
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| e.to_string())?;

        let sqlite = match sqlite_path {
            Some(path) => {
                let conn = Connection::open(path).map_err(|e| e.to_string())?;
                conn.execute_batch(
                    "
                    CREATE TABLE IF NOT EXISTS audit_records (
                        audit_id TEXT PRIMARY KEY,
                        device_name TEXT NOT NULL,
                        kind TEXT NOT NULL,
                        status TEXT NOT NULL,
                        ts TEXT NOT NULL,
                        record_json TEXT NOT NULL
                    );
                    ",
                )
                .map_err(|e| e.to_string())?;
                Some(Mutex::new(conn))
            }
            None => None,
        };

        info!(path, restored_hosts = ssh_hosts.order.len(), "audit log opened");
        Ok(Self {
            chain: Mutex::new(Chain { file, last_hash }),
            sqlite,
            ssh_hosts: Mutex::new(ssh_hosts),
        })
    }
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn save(&self, entry: LogEntry, device_name: &str) {
        let mut chain = self.chain.lock().await;
        let mut rec = AuditRecord::new(device_name, entry);
        rec.prev_hash = chain.last_hash.clone();
        rec.record_hash = match rec.compute_hash() {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "audit record hash failed; entry dropped");
                return;
            }
        };
        let line = match serde_json::to_string(&rec) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "audit record serialize failed; entry dropped");
                return;
            }
        };

        let written = async {
            chain.file.write_all(line.as_bytes()).await?;
            chain.file.write_all(b"\n").await?;
            chain.file.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(error = %e, audit_id = %rec.audit_id, "audit append failed");
            return;
        }
        chain.last_hash = Some(rec.record_hash.clone());
        drop(chain);

        if let Some(pair) = rec.entry.user_and_host() {
            self.ssh_hosts.lock().await.insert(pair);
        }

        if let Some(sqlite) = &self.sqlite {
            let status = serde_json::to_value(rec.entry.status())
                .ok()
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_default();
            let conn = sqlite.lock().await;
            if let Err(e) = conn.execute(
                "
                INSERT OR REPLACE INTO audit_records
                (audit_id, device_name, kind, status, ts, record_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    rec.audit_id,
                    rec.device_name,
                    rec.entry.kind(),
                    status,
                    rec.ts,
                    line
                ],
            ) {
                warn!(error = %e, audit_id = %rec.audit_id, "audit sqlite mirror failed");
            }
        }
    }

    async fn fetch_all_ssh_unique_hosts(&self) -> Vec<UserAndHost> {
        self.ssh_hosts.lock().await.order.clone()
    }
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let expected_hash = rec
            .compute_hash()
            .map_err(|e| format!("line {} hash seed failed: {e}", idx + 1))?;
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}
