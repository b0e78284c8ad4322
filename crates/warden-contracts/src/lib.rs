use serde::{Deserialize, Serialize};

pub const CONTRACT_VERSION: &str = "2.4.0";

/// Embedded error carried by a response the human (or policy) declined.
pub const REJECTED: &str = "rejected";
pub const HOST_MISMATCH: &str = "host public key mismatch";

pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Pairing {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Session {
    pub id: String,
    pub pairing: Pairing,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Medium {
    Bluetooth,
    Queue,
    Http,
}

impl Medium {
    pub fn as_str(self) -> &'static str {
        match self {
            Medium::Bluetooth => "bluetooth",
            Medium::Queue => "queue",
            Medium::Http => "http",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DigestType {
    Sha1,
    Sha256,
    Sha512,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub id: String,
    pub unix_seconds: i64,
    #[serde(default = "default_version")]
    pub v: String,
    #[serde(default)]
    pub send_ack: bool,
    pub body: RequestBody,
}

impl Request {
    pub fn category(&self) -> &'static str {
        self.body.category()
    }
}

fn default_version() -> String {
    CONTRACT_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestBody {
    SshSign(SshSignRequest),
    GitSign(GitSignRequest),
    Me(MeRequest),
    Hosts,
    NoOp,
    Unpair,
}

impl RequestBody {
    pub fn category(&self) -> &'static str {
        match self {
            RequestBody::SshSign(_) => "ssh",
            RequestBody::GitSign(_) => "git",
            RequestBody::Me(_) => "me",
            RequestBody::Hosts => "hosts",
            RequestBody::NoOp => "noop",
            RequestBody::Unpair => "unpair",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SshSignRequest {
    pub public_key_fingerprint: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_type: Option<DigestType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_auth: Option<VerifiedHostAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

/// Host key assertion already verified by the peer against the SSH session id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VerifiedHostAuth {
    #[serde(with = "base64_bytes")]
    pub host_key: Vec<u8>,
    #[serde(default)]
    pub host_names: Vec<String>,
}

impl VerifiedHostAuth {
    pub fn primary_host(&self) -> Option<&str> {
        self.host_names.first().map(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GitSignRequest {
    pub user_id: String,
    pub git: GitInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GitInfo {
    Commit(CommitInfo),
    Tag(TagInfo),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CommitInfo {
    pub tree: String,
    #[serde(default)]
    pub parents: Vec<String>,
    pub author: String,
    pub committer: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TagInfo {
    pub object: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub tag: String,
    pub tagger: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgp_user_id: Option<String>,
}

/// Per-variant result. An `Error` is a final answer, cached and delivered like `Ok`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome<T> {
    Ok(T),
    Error(String),
}

impl<T> Outcome<T> {
    pub fn error(&self) -> Option<&str> {
        match self {
            Outcome::Ok(_) => None,
            Outcome::Error(e) => Some(e.as_str()),
        }
    }
}

impl<T, E: ToString> From<Result<T, E>> for Outcome<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(v) => Outcome::Ok(v),
            Err(e) => Outcome::Error(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Response {
    pub request_id: String,
    pub endpoint: String,
    pub v: String,
    pub body: ResponseBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseBody {
    SshSign(Outcome<SshSignature>),
    GitSign(Outcome<GitSignature>),
    Me(Outcome<Profile>),
    Hosts(Outcome<HostList>),
    Ack,
}

impl ResponseBody {
    pub fn error(&self) -> Option<&str> {
        match self {
            ResponseBody::SshSign(v) => v.error(),
            ResponseBody::GitSign(v) => v.error(),
            ResponseBody::Me(v) => v.error(),
            ResponseBody::Hosts(v) => v.error(),
            ResponseBody::Ack => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SshSignature {
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GitSignature {
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    pub email: String,
    #[serde(with = "base64_bytes")]
    pub public_key_wire: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgp_public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HostList {
    pub pgp_user_ids: Vec<String>,
    pub hosts: Vec<UserAndHost>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(deny_unknown_fields)]
pub struct UserAndHost {
    pub user: String,
    pub host: String,
}
