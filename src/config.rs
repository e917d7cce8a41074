//! Server configuration (§3.1, §6): a small ini-style `KEY=value` file,
//! one key per line, `#` comments, blank lines ignored. Sized to the small
//! external format §6 defines, not borrowed from a crate.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct KmipConfig {
    pub addrs: Vec<SocketAddr>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_ca: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

/// §3.1: `MAIL_AGENT` names the mailer (an SMTP host, or an external
/// agent command in the original system); this implementation treats it
/// as an SMTP host since actual delivery is out of scope (§1 Non-goals).
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub agent: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub from: String,
    pub recipients: Vec<String>,
    pub subject_template: String,
    pub text_template: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub keydb_dir: PathBuf,
    pub listen_addr: IpAddr,
    pub listen_port: u16,
    pub unix_socket_path: PathBuf,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub tls_ca: Option<PathBuf>,
    pub tls_validate_client: bool,
    pub pass_salt: Option<[u8; 64]>,
    pub pass_hash: Option<[u8; 64]>,
    pub kmip: Option<KmipConfig>,
    pub mail: Option<MailConfig>,
}

impl ServerConfig {
    /// Loads and validates a config file at `path` (§3.1). Mandatory fields
    /// missing, or malformed values, fail with `ErrorKind::ConfigInvalid` —
    /// the server refuses to start rather than run with a guessed default.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::io(path.display().to_string(), e))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let fields = parse_fields(text)?;
        let get = |key: &str| fields.get(key).cloned();
        let require = |key: &str| -> Result<String> {
            get(key).ok_or_else(|| Error::config_invalid(format!("missing mandatory key {key}")))
        };

        let keydb_dir = PathBuf::from(require("KEYDB_DIR")?);

        let listen_addr = match get("LISTEN_ADDR") {
            Some(s) => s.parse().map_err(|_| Error::config_invalid("LISTEN_ADDR is not a valid IP address"))?,
            None => IpAddr::from([0, 0, 0, 0]),
        };
        let listen_port: u16 = require("LISTEN_PORT")?
            .parse()
            .map_err(|_| Error::config_invalid("LISTEN_PORT is not a valid port number"))?;

        let unix_socket_path = get("UNIX_SOCKET_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/run/keyctld.sock"));

        let tls_cert = PathBuf::from(require("TLS_CERT")?);
        let tls_key = PathBuf::from(require("TLS_KEY")?);
        let tls_ca = get("TLS_CA").map(PathBuf::from);
        let tls_validate_client = parse_bool(get("TLS_VALIDATE_CLIENT").as_deref())?;

        let pass_salt = match get("PASS_SALT") {
            Some(s) => Some(parse_hex_64(&s, "PASS_SALT")?),
            None => None,
        };
        let pass_hash = match get("PASS_HASH") {
            Some(s) => Some(parse_hex_64(&s, "PASS_HASH")?),
            None => None,
        };
        if pass_salt.is_some() != pass_hash.is_some() {
            return Err(Error::config_invalid("PASS_SALT and PASS_HASH must be set together"));
        }

        let kmip = match get("KMIP_SERVER_ADDRS") {
            None => None,
            Some(addrs_str) => {
                let mut addrs = Vec::new();
                for a in addrs_str.split_whitespace() {
                    let a = a.trim();
                    if a.is_empty() {
                        continue;
                    }
                    addrs.push(
                        a.parse::<SocketAddr>()
                            .map_err(|_| Error::config_invalid(format!("KMIP_SERVER_ADDRS entry {a} is not host:port")))?,
                    );
                }
                if addrs.is_empty() {
                    return Err(Error::config_invalid("KMIP_SERVER_ADDRS present but empty"));
                }
                Some(KmipConfig {
                    addrs,
                    username: get("KMIP_SERVER_USER"),
                    password: get("KMIP_SERVER_PASS"),
                    tls_ca: get("KMIP_SERVER_TLS_CA").map(PathBuf::from),
                    tls_cert: get("KMIP_SERVER_TLS_CERT").map(PathBuf::from),
                    tls_key: get("KMIP_SERVER_TLS_KEY").map(PathBuf::from),
                })
            }
        };

        let mail = match get("MAIL_AGENT") {
            None => None,
            Some(agent) => {
                let recipients: Vec<String> = require("MAIL_RECIPIENTS")?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if recipients.is_empty() {
                    return Err(Error::config_invalid("MAIL_RECIPIENTS present but empty"));
                }
                Some(MailConfig {
                    agent,
                    user: get("MAIL_USER"),
                    pass: get("MAIL_PASS"),
                    from: require("MAIL_FROM")?,
                    recipients,
                    subject_template: get("MAIL_SUBJECT").unwrap_or_else(|| "keyctld notification".to_string()),
                    text_template: get("MAIL_TEXT").unwrap_or_else(|| "{event}".to_string()),
                })
            }
        };

        Ok(ServerConfig {
            keydb_dir,
            listen_addr,
            listen_port,
            unix_socket_path,
            tls_cert,
            tls_key,
            tls_ca,
            tls_validate_client,
            pass_salt,
            pass_hash,
            kmip,
            mail,
        })
    }
}

fn parse_fields(text: &str) -> Result<HashMap<String, String>> {
    let mut fields = HashMap::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| Error::config_invalid(format!("line {}: expected KEY=value", lineno + 1)))?;
        fields.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(fields)
}

fn parse_bool(s: Option<&str>) -> Result<bool> {
    match s {
        None => Ok(false),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some("false") | Some("0") | Some("no") => Ok(false),
        Some(other) => Err(Error::config_invalid(format!("expected boolean, got {other}"))),
    }
}

fn parse_hex_64(s: &str, field: &str) -> Result<[u8; 64]> {
    let bytes = hex::decode(s).map_err(|_| Error::config_invalid(format!("{field} is not valid hex")))?;
    bytes
        .try_into()
        .map_err(|_| Error::config_invalid(format!("{field} must decode to exactly 64 bytes")))
}
