//! RPC handlers (§4.5/§4.6): one method per `Verb`, each a small linear
//! pipeline of validate → authenticate → mutate-under-lock → notify, with
//! `tracing` at each step.

use std::net::IpAddr;
use std::sync::Arc;

use rand::RngCore;
use tokio::sync::Notify;

use crate::auth;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::kmip;
use crate::mailer::{Event, MailerHandle};
use crate::record::KeyRecord;
use crate::rpc::*;
use crate::store::RecordStore;

pub struct Service {
    store: RecordStore,
    config: ServerConfig,
    mailer: MailerHandle,
    shutdown: Arc<Notify>,
    admin_challenge: String,
}

/// Where an RPC call originated. TLS connections always go through
/// `check_password`. The Unix socket is local-root-only and bypasses
/// password checks that only guard against a *remote* attacker — but not
/// uniformly: §4.7 calls out CreateKey/EraseKey/ReloadRecord as continuing
/// to require the password even over the socket ("the socket is not a
/// bypass of key authorization, only of remote-attack authorization").
/// §9 Open Question: preserve that asymmetry verbatim, not a cleaner
/// blanket policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    UnixSocket,
    Tls,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Service {
    pub fn new(store: RecordStore, config: ServerConfig, mailer: MailerHandle, admin_challenge: String) -> Self {
        Service { store, config, mailer, shutdown: Arc::new(Notify::new()), admin_challenge }
    }

    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// §4.4/§4.7: TLS callers always supply the configured password unless
    /// the server has none configured, in which case every password-gated
    /// verb fails `NotInitialized`. The Unix socket skips this check
    /// *unless* `enforce_on_unix_socket` is set — CreateKey, EraseKey, and
    /// ReloadRecord pass `true` here; every other password-gated verb
    /// (Ping, ManualRetrieveKey) passes `false` and trusts root outright.
    fn check_password(&self, origin: Origin, enforce_on_unix_socket: bool, password: &str) -> Result<()> {
        if origin == Origin::UnixSocket && !enforce_on_unix_socket {
            return Ok(());
        }
        let (salt, hash) = match (&self.config.pass_salt, &self.config.pass_hash) {
            (Some(s), Some(h)) => (s, h),
            _ => return Err(Error::NotInitialized),
        };
        if auth::check_password(salt, hash, password) {
            Ok(())
        } else {
            Err(Error::BadPassword)
        }
    }

    /// Ping (§4.6): password-gated, the way the table specifies, not just a
    /// bare liveness probe — it returns ok iff the server is initialized
    /// *and* the password matches. Not in §4.7's "still require the
    /// password over Unix socket" list, so root bypasses it like
    /// ManualRetrieveKey.
    pub fn ping(&self, origin: Origin, req: PingRequest) -> Result<PingResponse> {
        self.check_password(origin, false, &req.password)?;
        Ok(PingResponse)
    }

    /// Requires no password itself, but returns `NotInitialized` when the
    /// server has no salt/hash configured — there is nothing to compute a
    /// hash against.
    pub fn get_salt(&self) -> Result<GetSaltResponse> {
        match self.config.pass_salt {
            Some(salt) => Ok(GetSaltResponse { salt }),
            None => Err(Error::NotInitialized),
        }
    }

    pub async fn create_key(&self, origin: Origin, req: CreateKeyRequest) -> Result<CreateKeyResponse> {
        self.check_password(origin, true, &req.password)?;

        let (key_material, external_id) = if req.use_kmip {
            let kmip_cfg = self
                .config
                .kmip
                .as_ref()
                .ok_or_else(|| Error::config_invalid("CreateKey requested KMIP escrow but no KMIP server is configured"))?;
            let uid = kmip::create_key(kmip_cfg, req.key_len_bits).await?;
            (None, Some(uid))
        } else {
            let mut material = vec![0u8; (req.key_len_bits / 8) as usize];
            rand::thread_rng().fill_bytes(&mut material);
            (Some(material), None)
        };

        let rec = KeyRecord {
            uuid: KeyRecord::new_uuid(),
            id: req.id.clone(),
            creation_time: now(),
            key_material,
            external_id,
            mount_point: req.mount_point,
            mount_options: req.mount_options,
            max_active: req.max_active,
            alive_interval_sec: req.alive_interval_sec,
            alive_count: req.alive_count,
            alive_messages: Default::default(),
            last_retrieval: None,
            pending_commands: Default::default(),
        };

        let uuid = rec.uuid.clone();
        self.store.upsert(rec).await?;
        self.mailer.notify(Event::KeyCreated { uuid: uuid.clone(), id: req.id });
        Ok(CreateKeyResponse { uuid })
    }

    /// Resolves a record's key material, fetching it from the KMIP server
    /// on demand when it was escrowed externally (`external_id` set).
    async fn resolve_key_material(&self, rec: &KeyRecord) -> Result<Vec<u8>> {
        if let Some(material) = &rec.key_material {
            return Ok(material.clone());
        }
        let external_id = rec
            .external_id
            .as_ref()
            .ok_or_else(|| Error::corruption(&rec.uuid, "record has neither key_material nor external_id"))?;
        let kmip_cfg = self
            .config
            .kmip
            .as_ref()
            .ok_or_else(|| Error::config_invalid("record requires KMIP escrow but no KMIP server is configured"))?;
        let key = kmip::get_key(kmip_cfg, external_id).await?;
        Ok(key.material)
    }

    /// §4.5/§4.6: a batch of uuids requested in one call, each decided
    /// independently — `max_per_request` bounds how many are attempted at
    /// all, and every uuid lands in either `granted` or `rejected_uuids`.
    pub async fn auto_retrieve_key(&self, peer: IpAddr, req: AutoRetrieveKeyRequest) -> Result<AutoRetrieveKeyResponse> {
        let now = now();
        let limit = if req.max_per_request == 0 { req.uuids.len() } else { req.max_per_request as usize };

        let mut granted = std::collections::HashMap::new();
        let mut rejected = Vec::new();

        for (i, uuid) in req.uuids.into_iter().enumerate() {
            if i >= limit {
                rejected.push(uuid);
                continue;
            }

            let hostname = req.hostname.clone();
            let grant = self.store.with_record(&uuid, |rec| rec.try_auto_grant(peer, hostname, now)).await?;
            match grant {
                Some(true) => {
                    let rec = self.store.get_by_uuid(&uuid).await.ok_or_else(|| Error::unknown_uuid(&uuid))?;
                    let material = self.resolve_key_material(&rec).await?;
                    self.mailer.notify(Event::KeyRetrieved { uuid: uuid.clone(), hostname: req.hostname.clone() });
                    granted.insert(uuid, material);
                }
                Some(false) | None => rejected.push(uuid),
            }
        }

        Ok(AutoRetrieveKeyResponse { granted, rejected_uuids: rejected })
    }

    pub async fn manual_retrieve_key(
        &self,
        origin: Origin,
        peer: IpAddr,
        req: ManualRetrieveKeyRequest,
    ) -> Result<ManualRetrieveKeyResponse> {
        // Not in §4.7's "still require password over Unix socket" list.
        self.check_password(origin, false, &req.password)?;
        let now = now();
        let hostname = req.hostname.clone();
        self.store
            .with_record(&req.uuid, |rec| rec.manual_grant(peer, hostname, now))
            .await?
            .ok_or_else(|| Error::unknown_uuid(&req.uuid))?;

        let rec = self.store.get_by_uuid(&req.uuid).await.ok_or_else(|| Error::unknown_uuid(&req.uuid))?;
        let material = self.resolve_key_material(&rec).await?;
        self.mailer.notify(Event::KeyRetrieved { uuid: req.uuid, hostname: req.hostname });
        Ok(ManualRetrieveKeyResponse { key_material: material })
    }

    /// §4.5: a batch of uuids reported alive in one call; each is checked
    /// independently, and uuids the caller is not a live holder of (or
    /// that don't exist) come back in `rejected_uuids`.
    pub async fn report_alive(&self, peer: IpAddr, req: ReportAliveRequest) -> Result<ReportAliveResponse> {
        let now = now();
        let mut rejected = Vec::new();
        for uuid in req.uuids {
            let hostname = req.hostname.clone();
            let accepted = self.store.with_record(&uuid, |rec| rec.report_alive(peer, hostname, now)).await?;
            match accepted {
                Some(true) => {}
                Some(false) => {
                    self.mailer.notify(Event::HolderRevoked { uuid: uuid.clone(), hostname: req.hostname.clone() });
                    rejected.push(uuid);
                }
                None => rejected.push(uuid),
            }
        }
        Ok(ReportAliveResponse { rejected_uuids: rejected })
    }

    pub async fn erase_key(&self, origin: Origin, req: EraseKeyRequest) -> Result<EraseKeyResponse> {
        self.check_password(origin, true, &req.password)?;
        if self.store.get_by_uuid(&req.uuid).await.is_none() {
            return Err(Error::unknown_uuid(&req.uuid));
        }
        self.store.erase(&req.uuid).await?;
        Ok(EraseKeyResponse)
    }

    pub async fn poll_command(&self, peer: IpAddr, req: PollCommandRequest) -> Result<PollCommandResponse> {
        let now = now();
        let command = self
            .store
            .with_record(&req.uuid, |rec| rec.poll_command(peer, now))
            .await?
            .ok_or_else(|| Error::unknown_uuid(&req.uuid))?;
        Ok(PollCommandResponse { command: command.map(|c| c.content) })
    }

    pub async fn save_command_result(&self, peer: IpAddr, req: SaveCommandResultRequest) -> Result<SaveCommandResultResponse> {
        let now = now();
        let accepted = self
            .store
            .with_record(&req.uuid, |rec| rec.save_command_result(peer, now, req.result))
            .await?
            .ok_or_else(|| Error::unknown_uuid(&req.uuid))?;
        Ok(SaveCommandResultResponse { accepted })
    }

    pub async fn reload_record(&self, origin: Origin, req: ReloadRecordRequest) -> Result<ReloadRecordResponse> {
        self.check_password(origin, true, &req.password)?;
        self.store.reload_one(&req.uuid).await?;
        Ok(ReloadRecordResponse)
    }

    /// Shutdown requires the admin-challenge token minted at startup and
    /// printed to the daemon log (§4.6) — neither transport's trust model
    /// (password, or Unix-socket root) substitutes for it, so a
    /// misbehaving remote client can never stop the server.
    pub async fn shutdown(&self, _origin: Origin, req: ShutdownRequest) -> Result<ShutdownResponse> {
        if !auth::verify_str(&self.admin_challenge, &req.admin_challenge) {
            return Err(Error::BadPassword);
        }
        tracing::warn!("shutdown requested over RPC");
        self.shutdown.notify_waiters();
        Ok(ShutdownResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::net::Ipv4Addr;

    const TEST_PASSWORD: &str = "hunter2";

    /// A service with a password configured — `CreateKey`/`EraseKey`/
    /// `ReloadRecord` still enforce it even over the Unix socket (§4.7), so
    /// tests that call those verbs need a real salt/hash in place.
    async fn test_service(dir: &std::path::Path) -> Service {
        let salt = auth::generate_salt();
        let hash = auth::hash_password(&salt, TEST_PASSWORD);
        let config = ServerConfig::parse(&format!(
            "KEYDB_DIR={}\nLISTEN_PORT=3737\nTLS_CERT=cert.pem\nTLS_KEY=key.pem\nPASS_SALT={}\nPASS_HASH={}\n",
            dir.display(),
            hex::encode(salt),
            hex::encode(hash),
        ))
        .unwrap();
        let store = RecordStore::open_all(dir).await.unwrap();
        let mailer = MailerHandle::spawn(crate::mailer::NullMailer);
        Service::new(store, config, mailer, auth::generate_admin_challenge())
    }

    fn peer(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, n))
    }

    #[tokio::test]
    async fn create_and_auto_retrieve_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_service(dir.path()).await;

        let created = svc
            .create_key(
                Origin::UnixSocket,
                CreateKeyRequest {
                    password: TEST_PASSWORD.into(),
                    id: "disk0".into(),
                    mount_point: "/mnt".into(),
                    mount_options: "".into(),
                    max_active: 1,
                    alive_interval_sec: 30,
                    alive_count: 3,
                    use_kmip: false,
                    key_len_bits: 256,
                },
            )
            .await
            .unwrap();

        let retrieved = svc
            .auto_retrieve_key(
                peer(1),
                AutoRetrieveKeyRequest { uuids: vec![created.uuid.clone()], hostname: "h1".into(), max_per_request: 0 },
            )
            .await
            .unwrap();
        assert!(retrieved.rejected_uuids.is_empty());
        assert_eq!(retrieved.granted.get(&created.uuid).unwrap().len(), 32);
    }

    #[tokio::test]
    async fn capacity_exceeded_returns_none_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_service(dir.path()).await;

        let created = svc
            .create_key(
                Origin::UnixSocket,
                CreateKeyRequest {
                    password: TEST_PASSWORD.into(),
                    id: "disk0".into(),
                    mount_point: "/mnt".into(),
                    mount_options: "".into(),
                    max_active: 1,
                    alive_interval_sec: 100,
                    alive_count: 3,
                    use_kmip: false,
                    key_len_bits: 128,
                },
            )
            .await
            .unwrap();

        svc.auto_retrieve_key(
            peer(1),
            AutoRetrieveKeyRequest { uuids: vec![created.uuid.clone()], hostname: "h1".into(), max_per_request: 0 },
        )
        .await
        .unwrap();
        let second = svc
            .auto_retrieve_key(
                peer(2),
                AutoRetrieveKeyRequest { uuids: vec![created.uuid.clone()], hostname: "h2".into(), max_per_request: 0 },
            )
            .await
            .unwrap();
        assert!(second.granted.is_empty());
        assert_eq!(second.rejected_uuids, vec![created.uuid]);
    }

    #[tokio::test]
    async fn unauthenticated_tls_create_is_rejected_when_no_password_configured() {
        // A dedicated service with no PASS_SALT/PASS_HASH, unlike
        // `test_service()` which always configures one.
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::parse(&format!(
            "KEYDB_DIR={}\nLISTEN_PORT=3737\nTLS_CERT=cert.pem\nTLS_KEY=key.pem\n",
            dir.path().display(),
        ))
        .unwrap();
        let store = RecordStore::open_all(dir.path()).await.unwrap();
        let mailer = MailerHandle::spawn(crate::mailer::NullMailer);
        let svc = Service::new(store, config, mailer, auth::generate_admin_challenge());

        let err = svc
            .create_key(
                Origin::Tls,
                CreateKeyRequest {
                    password: "anything".into(),
                    id: "disk0".into(),
                    mount_point: "/mnt".into(),
                    mount_options: "".into(),
                    max_active: 1,
                    alive_interval_sec: 30,
                    alive_count: 3,
                    use_kmip: false,
                    key_len_bits: 128,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotInitialized);
    }

    #[tokio::test]
    async fn unknown_uuid_is_rejected_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_service(dir.path()).await;

        let resp = svc
            .auto_retrieve_key(
                peer(1),
                AutoRetrieveKeyRequest { uuids: vec!["does-not-exist".into()], hostname: "h1".into(), max_per_request: 0 },
            )
            .await
            .unwrap();
        assert!(resp.granted.is_empty());
        assert_eq!(resp.rejected_uuids, vec!["does-not-exist".to_string()]);
    }

    #[tokio::test]
    async fn max_per_request_caps_batch_and_rejects_the_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_service(dir.path()).await;

        let mut uuids = Vec::new();
        for i in 0..3 {
            let created = svc
                .create_key(
                    Origin::UnixSocket,
                    CreateKeyRequest {
                        password: TEST_PASSWORD.into(),
                        id: format!("disk{i}"),
                        mount_point: "/mnt".into(),
                        mount_options: "".into(),
                        max_active: 1,
                        alive_interval_sec: 30,
                        alive_count: 3,
                        use_kmip: false,
                        key_len_bits: 128,
                    },
                )
                .await
                .unwrap();
            uuids.push(created.uuid);
        }

        let resp = svc
            .auto_retrieve_key(peer(1), AutoRetrieveKeyRequest { uuids: uuids.clone(), hostname: "h1".into(), max_per_request: 2 })
            .await
            .unwrap();
        assert_eq!(resp.granted.len(), 2);
        assert_eq!(resp.rejected_uuids, vec![uuids[2].clone()]);
    }

    #[tokio::test]
    async fn report_alive_rejects_non_holder() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_service(dir.path()).await;

        let created = svc
            .create_key(
                Origin::UnixSocket,
                CreateKeyRequest {
                    password: TEST_PASSWORD.into(),
                    id: "disk0".into(),
                    mount_point: "/mnt".into(),
                    mount_options: "".into(),
                    max_active: 2,
                    alive_interval_sec: 30,
                    alive_count: 3,
                    use_kmip: false,
                    key_len_bits: 128,
                },
            )
            .await
            .unwrap();

        let resp = svc
            .report_alive(peer(9), ReportAliveRequest { uuids: vec![created.uuid.clone()], hostname: "h9".into() })
            .await
            .unwrap();
        assert_eq!(resp.rejected_uuids, vec![created.uuid]);
    }

    #[tokio::test]
    async fn shutdown_notifies_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::parse(&format!(
            "KEYDB_DIR={}\nLISTEN_PORT=3737\nTLS_CERT=cert.pem\nTLS_KEY=key.pem\nPASS_SALT={}\nPASS_HASH={}\n",
            dir.path().display(),
            hex::encode(crate::auth::generate_salt()),
            hex::encode([0u8; 64]),
        ))
        .unwrap();
        let store = RecordStore::open_all(dir.path()).await.unwrap();
        let mailer = MailerHandle::spawn(crate::mailer::NullMailer);
        let admin_challenge = auth::generate_admin_challenge();
        let svc = Service::new(store, config, mailer, admin_challenge.clone());
        let signal = svc.shutdown_signal();

        let waiter = tokio::spawn(async move {
            signal.notified().await;
        });

        svc.shutdown(Origin::UnixSocket, ShutdownRequest { admin_challenge }).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_rejects_wrong_admin_challenge() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_service(dir.path()).await;
        let err = svc
            .shutdown(Origin::UnixSocket, ShutdownRequest { admin_challenge: "wrong".into() })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadPassword);
    }
}
