//! KMIP client (§4.2): Create and Get operations against an external key
//! management server, carried over TLS and framed with the TTLV codec from
//! `ttlv.rs`. Request/response shape and CLI configuration surface are
//! grounded in `NLnetLabs/cascade`'s `cli/commands/kmip.rs`; the TLS dial
//! itself follows `statime-linux`'s `ke-mod.rs` client-side connector.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::config::KmipConfig;
use crate::error::{Error, Result};
use crate::ttlv::{Item, Tag};

// A sampling of the real KMIP 1.x tag space — enough to build Create/Get
// request and response payloads.
mod tag {
    use crate::ttlv::Tag;
    pub const ATTRIBUTE: Tag = Tag::new(0x42, 0x00, 0x08);
    pub const ATTRIBUTE_NAME: Tag = Tag::new(0x42, 0x00, 0x0A);
    pub const ATTRIBUTE_VALUE: Tag = Tag::new(0x42, 0x00, 0x0B);
    pub const BATCH_COUNT: Tag = Tag::new(0x42, 0x00, 0x0D);
    pub const BATCH_ITEM: Tag = Tag::new(0x42, 0x00, 0x0F);
    pub const CREDENTIAL: Tag = Tag::new(0x42, 0x00, 0x23);
    pub const CREDENTIAL_TYPE: Tag = Tag::new(0x42, 0x00, 0x24);
    pub const CREDENTIAL_VALUE: Tag = Tag::new(0x42, 0x00, 0x25);
    pub const CRYPTOGRAPHIC_ALGORITHM: Tag = Tag::new(0x42, 0x00, 0x28);
    pub const CRYPTOGRAPHIC_LENGTH: Tag = Tag::new(0x42, 0x00, 0x2A);
    pub const CRYPTOGRAPHIC_USAGE_MASK: Tag = Tag::new(0x42, 0x00, 0x2C);
    pub const KEY_BLOCK: Tag = Tag::new(0x42, 0x00, 0x40);
    pub const KEY_FORMAT_TYPE: Tag = Tag::new(0x42, 0x00, 0x42);
    pub const KEY_MATERIAL: Tag = Tag::new(0x42, 0x00, 0x43);
    pub const KEY_VALUE: Tag = Tag::new(0x42, 0x00, 0x45);
    pub const OBJECT_TYPE: Tag = Tag::new(0x42, 0x00, 0x57);
    pub const OPERATION: Tag = Tag::new(0x42, 0x00, 0x5C);
    pub const PASSWORD: Tag = Tag::new(0x42, 0x00, 0xA1);
    pub const PROTOCOL_VERSION: Tag = Tag::new(0x42, 0x00, 0x69);
    pub const PROTOCOL_VERSION_MAJOR: Tag = Tag::new(0x42, 0x00, 0x6A);
    pub const PROTOCOL_VERSION_MINOR: Tag = Tag::new(0x42, 0x00, 0x6B);
    pub const REQUEST_HEADER: Tag = Tag::new(0x42, 0x00, 0x77);
    pub const REQUEST_MESSAGE: Tag = Tag::new(0x42, 0x00, 0x78);
    pub const REQUEST_PAYLOAD: Tag = Tag::new(0x42, 0x00, 0x79);
    pub const RESPONSE_HEADER: Tag = Tag::new(0x42, 0x00, 0x7A);
    pub const RESPONSE_MESSAGE: Tag = Tag::new(0x42, 0x00, 0x7B);
    pub const RESPONSE_PAYLOAD: Tag = Tag::new(0x42, 0x00, 0x7C);
    pub const RESULT_MESSAGE: Tag = Tag::new(0x42, 0x00, 0x7D);
    pub const RESULT_STATUS: Tag = Tag::new(0x42, 0x00, 0x7F);
    pub const TEMPLATE_ATTRIBUTE: Tag = Tag::new(0x42, 0x00, 0x91);
    pub const UNIQUE_IDENTIFIER: Tag = Tag::new(0x42, 0x00, 0x94);
    pub const USERNAME: Tag = Tag::new(0x42, 0x00, 0x99);
    pub const AUTHENTICATION: Tag = Tag::new(0x42, 0x00, 0x0C);
    pub const TIME_STAMP: Tag = Tag::new(0x42, 0x00, 0x92);
}

const OPERATION_CREATE: u32 = 0x01;
const OPERATION_GET: u32 = 0x0A;
const OBJECT_TYPE_SYMMETRIC_KEY: u32 = 0x02;
const CREDENTIAL_TYPE_USERNAME_AND_PASSWORD: u32 = 0x01;
const RESULT_STATUS_SUCCESS: u32 = 0x00;
const CRYPTOGRAPHIC_ALGORITHM_AES: u32 = 0x03;
const KEY_FORMAT_TYPE_RAW: u32 = 0x01;
/// Encrypt (0x01) | Decrypt (0x08) — the only two usages §4.2 keys need.
const CRYPTOGRAPHIC_USAGE_MASK_ENCRYPT_DECRYPT: i32 = 0x0C;

/// A created or retrieved symmetric key.
pub struct SymmetricKey {
    pub unique_identifier: String,
    pub material: Vec<u8>,
}

fn build_authentication(username: Option<&str>, password: Option<&str>) -> Option<Item> {
    let username = username?;
    Some(Item::structure(
        tag::AUTHENTICATION,
        vec![Item::structure(
            tag::CREDENTIAL,
            vec![
                Item::enumeration(tag::CREDENTIAL_TYPE, CREDENTIAL_TYPE_USERNAME_AND_PASSWORD),
                Item::structure(
                    tag::CREDENTIAL_VALUE,
                    {
                        let mut v = vec![Item::text_string(tag::USERNAME, username)];
                        if let Some(p) = password {
                            v.push(Item::text_string(tag::PASSWORD, p));
                        }
                        v
                    },
                ),
            ],
        )],
    ))
}

fn build_request_header(auth: Option<Item>) -> Item {
    let mut children = vec![Item::structure(
        tag::PROTOCOL_VERSION,
        vec![
            Item::integer(tag::PROTOCOL_VERSION_MAJOR, 1),
            Item::integer(tag::PROTOCOL_VERSION_MINOR, 4),
        ],
    )];
    if let Some(a) = auth {
        children.push(a);
    }
    children.push(Item::integer(tag::BATCH_COUNT, 1));
    Item::structure(tag::REQUEST_HEADER, children)
}

fn build_create_request(username: Option<&str>, password: Option<&str>, key_len_bits: u32) -> Vec<u8> {
    let template_attribute = Item::structure(
        tag::TEMPLATE_ATTRIBUTE,
        vec![
            Item::structure(
                tag::ATTRIBUTE,
                vec![
                    Item::text_string(tag::ATTRIBUTE_NAME, "Cryptographic Algorithm"),
                    Item::enumeration(tag::ATTRIBUTE_VALUE, CRYPTOGRAPHIC_ALGORITHM_AES),
                ],
            ),
            Item::structure(
                tag::ATTRIBUTE,
                vec![
                    Item::text_string(tag::ATTRIBUTE_NAME, "Cryptographic Length"),
                    Item::integer(tag::ATTRIBUTE_VALUE, key_len_bits as i32),
                ],
            ),
            Item::structure(
                tag::ATTRIBUTE,
                vec![
                    Item::text_string(tag::ATTRIBUTE_NAME, "Cryptographic Usage Mask"),
                    Item::integer(tag::ATTRIBUTE_VALUE, CRYPTOGRAPHIC_USAGE_MASK_ENCRYPT_DECRYPT),
                ],
            ),
        ],
    );

    let payload = Item::structure(
        tag::REQUEST_PAYLOAD,
        vec![Item::enumeration(tag::OBJECT_TYPE, OBJECT_TYPE_SYMMETRIC_KEY), template_attribute],
    );

    let batch_item = Item::structure(
        tag::BATCH_ITEM,
        vec![Item::enumeration(tag::OPERATION, OPERATION_CREATE), payload],
    );

    let message = Item::structure(
        tag::REQUEST_MESSAGE,
        vec![build_request_header(build_authentication(username, password)), batch_item],
    );

    let mut buf = Vec::new();
    message.encode(&mut buf);
    buf
}

fn build_get_request(username: Option<&str>, password: Option<&str>, unique_identifier: &str) -> Vec<u8> {
    let payload = Item::structure(
        tag::REQUEST_PAYLOAD,
        vec![Item::text_string(tag::UNIQUE_IDENTIFIER, unique_identifier)],
    );
    let batch_item = Item::structure(
        tag::BATCH_ITEM,
        vec![Item::enumeration(tag::OPERATION, OPERATION_GET), payload],
    );
    let message = Item::structure(
        tag::REQUEST_MESSAGE,
        vec![build_request_header(build_authentication(username, password)), batch_item],
    );
    let mut buf = Vec::new();
    message.encode(&mut buf);
    buf
}

fn parse_batch_item(message: &Item) -> Result<&Item> {
    message.require_child(tag::BATCH_ITEM)
}

fn check_result_status(batch_item: &Item) -> Result<()> {
    let status = batch_item.require_child(tag::RESULT_STATUS)?.as_enumeration()?;
    if status != RESULT_STATUS_SUCCESS {
        let text = batch_item
            .child(tag::RESULT_MESSAGE)
            .and_then(|i| i.as_text_string().ok())
            .unwrap_or("")
            .to_string();
        return Err(Error::KmipFailure { status: status as i32, text });
    }
    Ok(())
}

fn parse_create_response(buf: &[u8]) -> Result<String> {
    let (message, _) = Item::decode(buf)?;
    let batch_item = parse_batch_item(&message)?;
    check_result_status(batch_item)?;
    let payload = batch_item.require_child(tag::RESPONSE_PAYLOAD)?;
    let uid = payload.require_child(tag::UNIQUE_IDENTIFIER)?.as_text_string()?;
    Ok(uid.to_string())
}

fn parse_get_response(buf: &[u8]) -> Result<SymmetricKey> {
    let (message, _) = Item::decode(buf)?;
    let batch_item = parse_batch_item(&message)?;
    check_result_status(batch_item)?;
    let payload = batch_item.require_child(tag::RESPONSE_PAYLOAD)?;
    let uid = payload.require_child(tag::UNIQUE_IDENTIFIER)?.as_text_string()?.to_string();
    let key_block = payload.require_child(tag::KEY_BLOCK)?;
    let key_value = key_block.require_child(tag::KEY_VALUE)?;
    let key_material = key_value.require_child(tag::KEY_MATERIAL)?.as_byte_string()?.to_vec();
    Ok(SymmetricKey { unique_identifier: uid, material: key_material })
}

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

async fn build_client_config(cfg: &KmipConfig) -> Result<ClientConfig> {
    let builder = ClientConfig::builder();

    let builder = if let Some(ca_path) = &cfg.tls_ca {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path).await? {
            roots.add(cert).map_err(|e| Error::tls(ca_path.display(), e.to_string()))?;
        }
        builder.with_root_certificates(roots)
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots)
    };

    let config = match (&cfg.tls_cert, &cfg.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path).await?;
            let key = load_private_key(key_path).await?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::tls("kmip server", e.to_string()))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(config)
}

/// Dials `cfg.addrs` in order, using the first address that accepts a TCP
/// connection, then performs the TLS handshake against it (§4.2: "try
/// configured addresses in order; the first reachable one wins").
async fn dial(cfg: &KmipConfig) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tls_config = Arc::new(build_client_config(cfg).await?);
    let connector = TlsConnector::from(tls_config);

    let mut last_err = None;
    for addr in &cfg.addrs {
        let tcp = match tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(addr)).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => {
                last_err = Some(Error::network(addr, e));
                continue;
            }
            Err(_) => {
                last_err = Some(Error::network(addr, std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")));
                continue;
            }
        };
        let server_name = ServerName::IpAddress(addr.ip().into());
        match connector.connect(server_name, tcp).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                last_err = Some(Error::tls(addr, e.to_string()));
                continue;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::config_invalid("KMIP_SERVER_ADDRS is empty")))
}

async fn roundtrip(cfg: &KmipConfig, request: Vec<u8>) -> Result<Vec<u8>> {
    let mut stream = dial(cfg).await?;
    stream
        .write_all(&request)
        .await
        .map_err(|e| Error::network("kmip server", e))?;
    stream.flush().await.map_err(|e| Error::network("kmip server", e))?;

    // A KMIP response is itself a self-describing TTLV item: read the
    // 8-byte header first to learn the (padded) total length, then read
    // the rest.
    let mut header = [0u8; 8];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| Error::network("kmip server", e))?;
    let declared_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let pad = (8 - declared_len % 8) % 8;
    let mut rest = vec![0u8; declared_len + pad];
    stream
        .read_exact(&mut rest)
        .await
        .map_err(|e| Error::network("kmip server", e))?;

    let mut buf = Vec::with_capacity(8 + rest.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&rest);
    Ok(buf)
}

/// Creates a new symmetric key of `key_len_bits` on the KMIP server and
/// returns its unique identifier. §4.2: key material is not returned by
/// Create — a subsequent Get fetches it.
pub async fn create_key(cfg: &KmipConfig, key_len_bits: u32) -> Result<String> {
    let request = build_create_request(cfg.username.as_deref(), cfg.password.as_deref(), key_len_bits);
    let response = roundtrip(cfg, request).await?;
    parse_create_response(&response)
}

/// Fetches the key material for a previously created key.
pub async fn get_key(cfg: &KmipConfig, unique_identifier: &str) -> Result<SymmetricKey> {
    let request = build_get_request(cfg.username.as_deref(), cfg.password.as_deref(), unique_identifier);
    let response = roundtrip(cfg, request).await?;
    parse_get_response(&response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ttlv::Value;

    #[test]
    fn create_request_contains_algorithm_and_length_attributes() {
        let buf = build_create_request(Some("alice"), Some("hunter2"), 256);
        let (item, used) = Item::decode(&buf).unwrap();
        assert_eq!(used, buf.len());

        let batch_item = item.child(tag::BATCH_ITEM).unwrap();
        assert_eq!(batch_item.child(tag::OPERATION).unwrap().as_enumeration().unwrap(), OPERATION_CREATE);

        let header = item.child(tag::REQUEST_HEADER).unwrap();
        let auth = header.child(tag::AUTHENTICATION).unwrap();
        let cred = auth.child(tag::CREDENTIAL).unwrap();
        let cred_value = cred.child(tag::CREDENTIAL_VALUE).unwrap();
        assert_eq!(cred_value.child(tag::USERNAME).unwrap().as_text_string().unwrap(), "alice");
    }

    #[test]
    fn create_request_grants_encrypt_decrypt_usage_mask() {
        let buf = build_create_request(None, None, 256);
        let (item, _) = Item::decode(&buf).unwrap();
        let batch_item = item.child(tag::BATCH_ITEM).unwrap();
        let payload = batch_item.child(tag::REQUEST_PAYLOAD).unwrap();
        let template_attribute = payload.child(tag::TEMPLATE_ATTRIBUTE).unwrap();
        let Value::Structure(attributes) = &template_attribute.value else {
            panic!("TemplateAttribute is not a structure");
        };
        let usage_mask = attributes
            .iter()
            .find(|a| a.child(tag::ATTRIBUTE_NAME).unwrap().as_text_string().unwrap() == "Cryptographic Usage Mask")
            .expect("Cryptographic Usage Mask attribute missing");
        assert_eq!(
            usage_mask.child(tag::ATTRIBUTE_VALUE).unwrap().as_integer().unwrap(),
            CRYPTOGRAPHIC_USAGE_MASK_ENCRYPT_DECRYPT
        );
    }

    #[test]
    fn get_request_carries_unique_identifier() {
        let buf = build_get_request(None, None, "uid-123");
        let (item, _) = Item::decode(&buf).unwrap();
        let batch_item = item.child(tag::BATCH_ITEM).unwrap();
        let payload = batch_item.child(tag::REQUEST_PAYLOAD).unwrap();
        assert_eq!(payload.child(tag::UNIQUE_IDENTIFIER).unwrap().as_text_string().unwrap(), "uid-123");
    }

    fn fake_success_response(payload_children: Vec<Item>) -> Vec<u8> {
        let batch_item = Item::structure(
            tag::BATCH_ITEM,
            vec![
                Item::enumeration(tag::RESULT_STATUS, RESULT_STATUS_SUCCESS),
                Item::structure(tag::RESPONSE_PAYLOAD, payload_children),
            ],
        );
        let message = Item::structure(tag::RESPONSE_MESSAGE, vec![batch_item]);
        let mut buf = Vec::new();
        message.encode(&mut buf);
        buf
    }

    #[test]
    fn parse_create_response_extracts_unique_identifier() {
        let buf = fake_success_response(vec![Item::text_string(tag::UNIQUE_IDENTIFIER, "uid-999")]);
        let uid = parse_create_response(&buf).unwrap();
        assert_eq!(uid, "uid-999");
    }

    #[test]
    fn parse_get_response_extracts_key_material() {
        let key_block = Item::structure(
            tag::KEY_BLOCK,
            vec![Item::structure(
                tag::KEY_VALUE,
                vec![Item::byte_string(tag::KEY_MATERIAL, vec![0xAA; 32])],
            )],
        );
        let buf = fake_success_response(vec![
            Item::text_string(tag::UNIQUE_IDENTIFIER, "uid-999"),
            key_block,
        ]);
        let key = parse_get_response(&buf).unwrap();
        assert_eq!(key.unique_identifier, "uid-999");
        assert_eq!(key.material, vec![0xAA; 32]);
    }

    #[test]
    fn failure_status_surfaces_as_kmip_failure() {
        let batch_item = Item::structure(
            tag::BATCH_ITEM,
            vec![
                Item::enumeration(tag::RESULT_STATUS, 0x01),
                Item::text_string(tag::RESULT_MESSAGE, "item not found"),
            ],
        );
        let message = Item::structure(tag::RESPONSE_MESSAGE, vec![batch_item]);
        let mut buf = Vec::new();
        message.encode(&mut buf);

        let err = parse_create_response(&buf).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::KmipFailure);
    }
}
