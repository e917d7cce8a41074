//! RPC envelope and verb table (§4.6).
//!
//! REDESIGN FLAGS: the original design formatted verb names into strings at
//! call sites; here `Verb` is a closed enum so an unrecognized verb is a
//! compile-time impossibility on the server side and a decode error (not a
//! silent no-op) on the wire.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::record::CommandContent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
    Ping,
    GetSalt,
    CreateKey,
    AutoRetrieveKey,
    ManualRetrieveKey,
    ReportAlive,
    EraseKey,
    PollCommand,
    SaveCommandResult,
    ReloadRecord,
    Shutdown,
}

/// The length-prefixed wire envelope (§4.6.1): a `u32` big-endian byte
/// count followed by a bincode-encoded `Request` or `Response`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub verb: Verb,
    pub body: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RpcError {
    BadPassword,
    NotInitialized,
    UnknownUuid { uuid: String },
    Internal { message: String },
}

impl From<&crate::error::Error> for RpcError {
    fn from(e: &crate::error::Error) -> Self {
        match e {
            crate::error::Error::BadPassword => RpcError::BadPassword,
            crate::error::Error::NotInitialized => RpcError::NotInitialized,
            crate::error::Error::UnknownUuid { uuid } => RpcError::UnknownUuid { uuid: uuid.clone() },
            other => RpcError::Internal { message: other.to_string() },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub result: Result<Vec<u8>, RpcError>,
}

// Per-verb request/response payloads. These are bincode-encoded into
// `Request::body` / the `Ok` side of `Response::result`.

#[derive(Debug, Serialize, Deserialize)]
pub struct PingRequest {
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PingResponse;

#[derive(Debug, Serialize, Deserialize)]
pub struct GetSaltRequest;

#[derive(Debug, Serialize, Deserialize)]
pub struct GetSaltResponse {
    pub salt: [u8; 64],
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateKeyRequest {
    pub password: String,
    pub id: String,
    pub mount_point: String,
    pub mount_options: String,
    pub max_active: u32,
    pub alive_interval_sec: i64,
    pub alive_count: u32,
    /// `Some` escrows the key with the configured KMIP server instead of
    /// storing `key_material` locally.
    pub use_kmip: bool,
    pub key_len_bits: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateKeyResponse {
    pub uuid: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AutoRetrieveKeyRequest {
    pub uuids: Vec<String>,
    pub hostname: String,
    /// Caps how many of `uuids` are attempted in this call; `0` means
    /// unlimited. Uuids beyond the cap are not processed and come back in
    /// `rejected_uuids` alongside capacity/liveness rejections (§4.5/§4.6).
    pub max_per_request: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AutoRetrieveKeyResponse {
    /// Granted uuids mapped to their key bytes. A uuid absent from both
    /// this map and `rejected_uuids` cannot occur — every requested uuid
    /// lands in exactly one of the two (capacity denial and unknown uuids
    /// are normal outcomes here, not RPC errors).
    pub granted: HashMap<String, Vec<u8>>,
    pub rejected_uuids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ManualRetrieveKeyRequest {
    pub password: String,
    pub uuid: String,
    pub hostname: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ManualRetrieveKeyResponse {
    pub key_material: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportAliveRequest {
    pub uuids: Vec<String>,
    pub hostname: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportAliveResponse {
    pub rejected_uuids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EraseKeyRequest {
    pub password: String,
    pub uuid: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EraseKeyResponse;

#[derive(Debug, Serialize, Deserialize)]
pub struct PollCommandRequest {
    pub uuid: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollCommandResponse {
    pub command: Option<CommandContent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SaveCommandResultRequest {
    pub uuid: String,
    pub result: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SaveCommandResultResponse {
    pub accepted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReloadRecordRequest {
    pub password: String,
    pub uuid: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReloadRecordResponse;

#[derive(Debug, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub admin_challenge: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShutdownResponse;

/// The caller's address, attached server-side to RPCs that carry
/// IP-scoped semantics (capacity, liveness, pending commands). Never
/// appears on the wire — populated from the transport layer's observed
/// peer address.
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    pub ip: IpAddr,
}

/// Frames `bytes` with a `u32` big-endian length prefix.
pub fn frame(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}
