//! Client stub (§4.8): a facade over a single fresh connection per call —
//! no pooling, no keepalive. Shape follows `Chiicake/kernel-kv`'s `KVClient`
//! (a thin wrapper exposing one method per server verb), minus its
//! connection pool: throughput here never justifies reuse across calls.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig as TlsClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};
use crate::record::CommandContent;
use crate::rpc::{self, *};

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_MESSAGE_BYTES: u32 = 16 * 1024 * 1024;

/// Where to dial. A `Client` opens exactly one connection of this kind per
/// call and closes it when the call returns (§4.8: "no pooling or
/// keepalive").
#[derive(Debug, Clone)]
pub enum Transport {
    Unix { path: PathBuf },
    Tls { addr: SocketAddr, server_name: String, ca: Option<PathBuf> },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: Transport,
    pub dial_timeout: Duration,
}

impl ClientConfig {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        ClientConfig { transport: Transport::Unix { path: path.into() }, dial_timeout: DEFAULT_DIAL_TIMEOUT }
    }

    pub fn tls(addr: SocketAddr, server_name: impl Into<String>, ca: Option<PathBuf>) -> Self {
        ClientConfig {
            transport: Transport::Tls { addr, server_name: server_name.into(), ca },
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// Thin caller exposing one method per RPC verb (§4.6). Every method opens
/// a fresh connection, sends one request, reads one response, and closes.
pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Client { config }
    }

    async fn call(&self, verb: Verb, body: Vec<u8>) -> Result<Vec<u8>> {
        match &self.config.transport {
            Transport::Unix { path } => {
                let stream = dial_unix(path, self.config.dial_timeout).await?;
                call_on(stream, verb, body).await
            }
            Transport::Tls { addr, server_name, ca } => {
                let stream = dial_tls(*addr, server_name, ca.as_deref(), self.config.dial_timeout).await?;
                call_on(stream, verb, body).await
            }
        }
    }

    pub async fn ping(&self, req: PingRequest) -> Result<PingResponse> {
        decode(self.call(Verb::Ping, encode(&req)?).await?)
    }

    pub async fn get_salt(&self) -> Result<GetSaltResponse> {
        decode(self.call(Verb::GetSalt, encode(&GetSaltRequest)?).await?)
    }

    pub async fn create_key(&self, req: CreateKeyRequest) -> Result<CreateKeyResponse> {
        decode(self.call(Verb::CreateKey, encode(&req)?).await?)
    }

    pub async fn auto_retrieve_key(&self, req: AutoRetrieveKeyRequest) -> Result<AutoRetrieveKeyResponse> {
        decode(self.call(Verb::AutoRetrieveKey, encode(&req)?).await?)
    }

    pub async fn manual_retrieve_key(&self, req: ManualRetrieveKeyRequest) -> Result<ManualRetrieveKeyResponse> {
        decode(self.call(Verb::ManualRetrieveKey, encode(&req)?).await?)
    }

    pub async fn report_alive(&self, req: ReportAliveRequest) -> Result<ReportAliveResponse> {
        decode(self.call(Verb::ReportAlive, encode(&req)?).await?)
    }

    pub async fn erase_key(&self, req: EraseKeyRequest) -> Result<EraseKeyResponse> {
        decode(self.call(Verb::EraseKey, encode(&req)?).await?)
    }

    pub async fn poll_command(&self, req: PollCommandRequest) -> Result<PollCommandResponse> {
        decode(self.call(Verb::PollCommand, encode(&req)?).await?)
    }

    pub async fn save_command_result(&self, req: SaveCommandResultRequest) -> Result<SaveCommandResultResponse> {
        decode(self.call(Verb::SaveCommandResult, encode(&req)?).await?)
    }

    pub async fn reload_record(&self, req: ReloadRecordRequest) -> Result<ReloadRecordResponse> {
        decode(self.call(Verb::ReloadRecord, encode(&req)?).await?)
    }

    pub async fn shutdown(&self, req: ShutdownRequest) -> Result<ShutdownResponse> {
        decode(self.call(Verb::Shutdown, encode(&req)?).await?)
    }
}

fn encode<T: serde::Serialize>(v: &T) -> Result<Vec<u8>> {
    bincode::serialize(v).map_err(|e| Error::ProtocolMismatch { reason: format!("failed to encode request: {e}") })
}

fn decode<T: serde::de::DeserializeOwned>(body: Vec<u8>) -> Result<T> {
    bincode::deserialize(&body).map_err(|e| Error::ProtocolMismatch { reason: format!("failed to decode response: {e}") })
}

async fn dial_unix(path: &Path, timeout: Duration) -> Result<UnixStream> {
    tokio::time::timeout(timeout, UnixStream::connect(path))
        .await
        .map_err(|_| Error::network(path.display(), std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")))?
        .map_err(|e| Error::network(path.display(), e))
}

async fn dial_tls(
    addr: SocketAddr,
    server_name: &str,
    ca: Option<&Path>,
    timeout: Duration,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::network(addr, std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")))?
        .map_err(|e| Error::network(addr, e))?;

    let mut roots = RootCertStore::empty();
    match ca {
        Some(ca_path) => {
            let bytes = tokio::fs::read(ca_path).await.map_err(|e| Error::io(ca_path.display().to_string(), e))?;
            for cert in rustls_pemfile::certs(&mut &bytes[..]) {
                let cert = cert.map_err(|e| Error::tls(ca_path.display(), e.to_string()))?;
                roots.add(cert).map_err(|e| Error::tls(ca_path.display(), e.to_string()))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    let tls_config = Arc::new(TlsClientConfig::builder().with_root_certificates(roots).with_no_client_auth());
    let connector = TlsConnector::from(tls_config);
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| Error::tls(addr, format!("invalid server name {server_name}")))?;
    connector.connect(name, tcp).await.map_err(|e| Error::tls(addr, e.to_string()))
}

async fn call_on<S>(mut stream: S, verb: Verb, body: Vec<u8>) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req = Request { verb, body };
    let encoded = bincode::serialize(&req).map_err(|e| Error::ProtocolMismatch { reason: format!("failed to encode envelope: {e}") })?;
    let framed = rpc::frame(&encoded);
    stream.write_all(&framed).await.map_err(|e| Error::network("server", e))?;
    stream.flush().await.map_err(|e| Error::network("server", e))?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(|e| Error::network("server", e))?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_BYTES {
        return Err(Error::ProtocolMismatch { reason: format!("response of {len} bytes exceeds maximum") });
    }
    let mut resp_buf = vec![0u8; len as usize];
    stream.read_exact(&mut resp_buf).await.map_err(|e| Error::network("server", e))?;
    let resp: Response = bincode::deserialize(&resp_buf)
        .map_err(|e| Error::ProtocolMismatch { reason: format!("malformed response envelope: {e}") })?;

    match resp.result {
        Ok(body) => Ok(body),
        Err(RpcError::BadPassword) => Err(Error::BadPassword),
        Err(RpcError::NotInitialized) => Err(Error::NotInitialized),
        Err(RpcError::UnknownUuid { uuid }) => Err(Error::unknown_uuid(uuid)),
        Err(RpcError::Internal { message }) => Err(Error::ProtocolMismatch { reason: message }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::{MailerHandle, NullMailer};
    use crate::service::{Origin, Service};
    use crate::store::RecordStore;
    use crate::transport;
    use tokio::net::UnixListener;

    const TEST_PASSWORD: &str = "hunter2";

    async fn spawn_unix_server(dir: &Path) -> PathBuf {
        let store = RecordStore::open_all(dir).await.unwrap();
        let salt = crate::auth::generate_salt();
        let hash = crate::auth::hash_password(&salt, TEST_PASSWORD);
        let config = crate::config::ServerConfig::parse(&format!(
            "KEYDB_DIR={}\nLISTEN_PORT=3737\nTLS_CERT=cert.pem\nTLS_KEY=key.pem\nPASS_SALT={}\nPASS_HASH={}\n",
            dir.display(),
            hex::encode(salt),
            hex::encode(hash),
        ))
        .unwrap();
        let mailer = MailerHandle::spawn(NullMailer);
        let service = Arc::new(Service::new(store, config, mailer, crate::auth::generate_admin_challenge()));

        let sock_path = dir.join("keyctld.sock");
        let listener = UnixListener::bind(&sock_path).unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let service = service.clone();
                let peer = std::net::IpAddr::from([127, 0, 0, 1]);
                tokio::spawn(transport::serve_connection(stream, service, Origin::UnixSocket, peer));
            }
        });
        sock_path
    }

    #[tokio::test]
    async fn ping_round_trips_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = spawn_unix_server(dir.path()).await;

        let client = Client::new(ClientConfig::unix(sock_path.clone()));
        client.ping(PingRequest { password: String::new() }).await.unwrap();
    }

    #[tokio::test]
    async fn create_and_auto_retrieve_round_trip_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = spawn_unix_server(dir.path()).await;
        let client = Client::new(ClientConfig::unix(sock_path.clone()));

        let created = client
            .create_key(CreateKeyRequest {
                password: TEST_PASSWORD.into(),
                id: "disk0".into(),
                mount_point: "/mnt".into(),
                mount_options: "".into(),
                max_active: 1,
                alive_interval_sec: 30,
                alive_count: 3,
                use_kmip: false,
                key_len_bits: 256,
            })
            .await
            .unwrap();

        let retrieved = client
            .auto_retrieve_key(AutoRetrieveKeyRequest { uuids: vec![created.uuid.clone()], hostname: "h1".into(), max_per_request: 0 })
            .await
            .unwrap();
        assert!(retrieved.rejected_uuids.is_empty());
        assert_eq!(retrieved.granted.get(&created.uuid).unwrap().len(), 32);
    }
}
