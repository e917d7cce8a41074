//! Dual transport (§4.7): a TLS listener for remote hosts and a Unix
//! domain socket for local administration, sharing one `Service`. Accept
//! loop shape grounded in `statime-linux`'s `ke-server.rs`; `load_certs`/
//! `load_private_key` follow its `ke-mod.rs` helpers.

use std::net::{IpAddr, SocketAddr};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::config;
use crate::error::{Error, Result};
use crate::rpc::{self, Request, Response, RpcError, Verb};
use crate::service::{Origin, Service};

const MAX_MESSAGE_BYTES: u32 = 16 * 1024 * 1024;

async fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let bytes = tokio::fs::read(path).await.map_err(|e| Error::io(path.display().to_string(), e))?;
    rustls_pemfile::certs(&mut &bytes[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(path.display(), e.to_string()))
}

async fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let bytes = tokio::fs::read(path).await.map_err(|e| Error::io(path.display().to_string(), e))?;
    rustls_pemfile::private_key(&mut &bytes[..])
        .map_err(|e| Error::tls(path.display(), e.to_string()))?
        .ok_or_else(|| Error::tls(path.display(), "no private key found in file"))
}

async fn build_server_config(cfg: &config::ServerConfig) -> Result<ServerConfig> {
    let cert_chain = load_certs(&cfg.tls_cert).await?;
    let key = load_private_key(&cfg.tls_key).await?;

    let builder = if cfg.tls_validate_client {
        let ca_path = cfg
            .tls_ca
            .as_ref()
            .ok_or_else(|| Error::config_invalid("TLS_VALIDATE_CLIENT is set but TLS_CA is not configured"))?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path).await? {
            roots.add(cert).map_err(|e| Error::tls(ca_path.display(), e.to_string()))?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| Error::tls("client verifier", e.to_string()))?;
        ServerConfig::builder().with_client_cert_verifier(verifier)
    } else {
        ServerConfig::builder().with_no_client_auth()
    };

    builder
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::tls("server certificate", e.to_string()))
}

/// Reads one length-prefixed `Request` from `stream`, returning `Ok(None)`
/// on a clean EOF (the peer closed the connection between requests).
async fn read_request<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Result<Option<Request>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::network("peer", e)),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_BYTES {
        return Err(Error::ProtocolMismatch { reason: format!("request of {len} bytes exceeds maximum") });
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await.map_err(|e| Error::network("peer", e))?;
    let req: Request = bincode::deserialize(&body)
        .map_err(|e| Error::ProtocolMismatch { reason: format!("malformed request envelope: {e}") })?;
    Ok(Some(req))
}

async fn write_response<S: tokio::io::AsyncWrite + Unpin>(stream: &mut S, resp: &Response) -> Result<()> {
    let body = bincode::serialize(resp).expect("Response serialization is infallible");
    let framed = rpc::frame(&body);
    stream.write_all(&framed).await.map_err(|e| Error::network("peer", e))?;
    stream.flush().await.map_err(|e| Error::network("peer", e))
}

/// Dispatches one decoded `Request` to the matching `Service` method,
/// serializing its typed response/error into the wire envelope.
async fn dispatch(service: &Service, origin: Origin, peer: IpAddr, req: Request) -> Response {
    let result = dispatch_inner(service, origin, peer, req).await;
    match result {
        Ok(body) => Response { result: Ok(body) },
        Err(e) => {
            tracing::warn!(error = %e, ?origin, %peer, "rpc call failed");
            Response { result: Err(RpcError::from(&e)) }
        }
    }
}

async fn dispatch_inner(service: &Service, origin: Origin, peer: IpAddr, req: Request) -> Result<Vec<u8>> {
    fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
        bincode::deserialize(body).map_err(|e| Error::ProtocolMismatch { reason: format!("malformed request body: {e}") })
    }
    fn encode<T: serde::Serialize>(v: &T) -> Vec<u8> {
        bincode::serialize(v).expect("response serialization is infallible")
    }

    use rpc::*;
    Ok(match req.verb {
        Verb::Ping => encode(&service.ping(origin, decode(&req.body)?)?),
        Verb::GetSalt => encode(&service.get_salt()?),
        Verb::CreateKey => encode(&service.create_key(origin, decode(&req.body)?).await?),
        Verb::AutoRetrieveKey => encode(&service.auto_retrieve_key(peer, decode(&req.body)?).await?),
        Verb::ManualRetrieveKey => {
            encode(&service.manual_retrieve_key(origin, peer, decode(&req.body)?).await?)
        }
        Verb::ReportAlive => encode(&service.report_alive(peer, decode(&req.body)?).await?),
        Verb::EraseKey => encode(&service.erase_key(origin, decode(&req.body)?).await?),
        Verb::PollCommand => encode(&service.poll_command(peer, decode(&req.body)?).await?),
        Verb::SaveCommandResult => encode(&service.save_command_result(peer, decode(&req.body)?).await?),
        Verb::ReloadRecord => encode(&service.reload_record(origin, decode(&req.body)?).await?),
        Verb::Shutdown => encode(&service.shutdown(origin, decode(&req.body)?).await?),
    })
}

pub(crate) async fn serve_connection<S>(mut stream: S, service: Arc<Service>, origin: Origin, peer: IpAddr)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let req = match read_request(&mut stream).await {
            Ok(Some(req)) => req,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, %peer, "failed to read request, closing connection");
                return;
            }
        };
        let resp = dispatch(&service, origin, peer, req).await;
        if let Err(e) = write_response(&mut stream, &resp).await {
            tracing::warn!(error = %e, %peer, "failed to write response, closing connection");
            return;
        }
    }
}

async fn run_tls_listener(addr: SocketAddr, acceptor: TlsAcceptor, service: Arc<Service>, shutdown: Arc<tokio::sync::Notify>) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| Error::network(addr, e))?;
    tracing::info!(%addr, "TLS listener bound");

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                tracing::info!("TLS listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (tcp, peer_addr) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed on TLS listener");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let service = service.clone();
                tokio::spawn(async move {
                    match acceptor.accept(tcp).await {
                        Ok(tls) => serve_connection(tls, service, Origin::Tls, peer_addr.ip()).await,
                        Err(e) => tracing::warn!(error = %e, peer = %peer_addr, "TLS handshake failed"),
                    }
                });
            }
        }
    }
}

async fn run_unix_listener(path: PathBuf, service: Arc<Service>, shutdown: Arc<tokio::sync::Notify>) -> Result<()> {
    if path.exists() {
        tokio::fs::remove_file(&path).await.map_err(|e| Error::io(path.display().to_string(), e))?;
    }
    let listener = UnixListener::bind(&path).map_err(|e| Error::io(path.display().to_string(), e))?;
    // Mode 0600: the Unix socket is the unauthenticated-but-trusted admin
    // surface, trusted purely by filesystem permissions (§4.7/§9).
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| Error::io(path.display().to_string(), e))?;
    tracing::info!(path = %path.display(), "Unix socket listener bound");

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                tracing::info!("Unix socket listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (unix, _addr) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed on Unix socket listener");
                        continue;
                    }
                };
                let service = service.clone();
                tokio::spawn(async move {
                    serve_connection(unix, service, Origin::UnixSocket, IpAddr::from([127, 0, 0, 1])).await;
                });
            }
        }
    }
}

/// Runs both listeners to completion (i.e. until a `Shutdown` RPC fires the
/// shared `Notify`), returning once both have stopped accepting.
pub async fn serve(cfg: &config::ServerConfig, service: Arc<Service>) -> Result<()> {
    let server_config = build_server_config(cfg).await?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let addr = SocketAddr::new(cfg.listen_addr, cfg.listen_port);
    let shutdown = service.shutdown_signal();

    let tls = run_tls_listener(addr, acceptor, service.clone(), shutdown.clone());
    let unix = run_unix_listener(cfg.unix_socket_path.clone(), service.clone(), shutdown.clone());

    let (tls_res, unix_res) = tokio::join!(tls, unix);
    tls_res?;
    unix_res?;
    Ok(())
}
