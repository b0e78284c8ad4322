use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use sha2::{Digest, Sha256};
use warden_contracts::{CommitInfo, DigestType, Medium, RequestBody, TagInfo, UserAndHost};

pub const AUTOMATIC_APPROVAL: &str = "automatic approval";
pub const REQUIRES_APPROVAL: &str = "requires approval";
pub const MANUAL_APPROVAL: &str = "manual approval";
pub const MANUAL_REJECTION: &str = "manual rejection";

/// Peers older than this always get SHA-1 (`ssh-rsa`) signatures.
pub const DIGEST_NEGOTIATION_VERSION: (u64, u64, u64) = (2, 4, 0);

const SSH_MSG_USERAUTH_REQUEST: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestKind {
    Sha1,
    Sha256,
    Sha512,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryEvent {
    pub category: &'static str,
    pub action: &'static str,
    pub label: String,
}

pub fn cache_key(session_id: &str, request_id: &str) -> String {
    format!("{session_id}_{request_id}")
}

pub fn is_fresh(now: i64, unix_seconds: i64, tolerance_secs: u64) -> bool {
    now.abs_diff(unix_seconds) <= tolerance_secs
}

/// Cache and pending entries outlive the freshness window on both sides.
pub fn entry_expiry(now: i64, tolerance_secs: u64) -> i64 {
    let ttl = i64::try_from(tolerance_secs.saturating_mul(2)).unwrap_or(i64::MAX);
    now.saturating_add(ttl)
}

pub fn parse_version(v: &str) -> Option<(u64, u64, u64)> {
    let mut parts = v.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    let patch = parts.next().unwrap_or("0").parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

pub fn select_digest(version: &str, requested: Option<DigestType>) -> DigestKind {
    match parse_version(version) {
        Some(v) if v >= DIGEST_NEGOTIATION_VERSION => match requested {
            Some(DigestType::Sha256) => DigestKind::Sha256,
            Some(DigestType::Sha512) => DigestKind::Sha512,
            Some(DigestType::Sha1) | None => DigestKind::Sha1,
        },
        _ => DigestKind::Sha1,
    }
}

pub fn ssh_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// The peer sends the userauth request without the key blob; it is appended here.
pub fn signed_payload(data: &[u8], public_key_wire: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(data.len() + public_key_wire.len() + 4);
    payload.extend_from_slice(data);
    ssh_string(&mut payload, public_key_wire);
    payload
}

pub fn ssh_fingerprint(public_key_wire: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(public_key_wire))
}

pub fn parse_userauth_user(data: &[u8]) -> Option<String> {
    let mut pos = 0;
    read_ssh_string(data, &mut pos)?;
    if *data.get(pos)? != SSH_MSG_USERAUTH_REQUEST {
        return None;
    }
    pos += 1;
    let user = read_ssh_string(data, &mut pos)?;
    String::from_utf8(user.to_vec()).ok()
}

fn read_ssh_string<'a>(buf: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let len_bytes: [u8; 4] = buf.get(*pos..*pos + 4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let start = *pos + 4;
    let value = buf.get(start..start.checked_add(len)?)?;
    *pos = start + len;
    Some(value)
}

pub fn commit_payload(commit: &CommitInfo) -> Vec<u8> {
    let mut out = format!("tree {}\n", commit.tree);
    for parent in &commit.parents {
        out.push_str(&format!("parent {parent}\n"));
    }
    out.push_str(&format!("author {}\n", commit.author));
    out.push_str(&format!("committer {}\n", commit.committer));
    out.push('\n');
    out.push_str(&commit.message);
    out.into_bytes()
}

pub fn tag_payload(tag: &TagInfo) -> Vec<u8> {
    format!(
        "object {}\ntype {}\ntag {}\ntagger {}\n\n{}",
        tag.object, tag.kind, tag.tag, tag.tagger, tag.message
    )
    .into_bytes()
}

/// Keeps the first occurrence of each pair, in input order.
pub fn unique_user_hosts(entries: impl IntoIterator<Item = UserAndHost>) -> Vec<UserAndHost> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|entry| seen.insert(entry.clone()))
        .collect()
}

pub fn auto_approval_events(body: &RequestBody, medium: Medium) -> Vec<TelemetryEvent> {
    let mut events = Vec::new();
    match body {
        RequestBody::SshSign(sign) => {
            events.push(approval_event(body, AUTOMATIC_APPROVAL, medium));
            if sign.host_auth.is_none() {
                events.push(TelemetryEvent {
                    category: "host",
                    action: "unknown",
                    label: medium.as_str().to_string(),
                });
            }
        }
        RequestBody::GitSign(_) | RequestBody::Hosts => {
            events.push(approval_event(body, AUTOMATIC_APPROVAL, medium));
        }
        RequestBody::Me(_) | RequestBody::NoOp | RequestBody::Unpair => {}
    }
    events
}

pub fn approval_event(body: &RequestBody, action: &'static str, medium: Medium) -> TelemetryEvent {
    TelemetryEvent {
        category: body.category(),
        action,
        label: medium.as_str().to_string(),
    }
}

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
