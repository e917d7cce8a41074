//! Wires configuration, the record store, and the dual transport together
//! into a running daemon (§5, §9): build shared state, spawn background
//! workers, bind listeners, wait for a graceful-shutdown signal. Split out
//! of `main.rs` so the binary crate stays a thin entry point.

use std::sync::Arc;

use crate::auth;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::mailer::{LoggingMailer, MailerHandle, NullMailer};
use crate::service::Service;
use crate::store::RecordStore;
use crate::transport;

/// Best-effort `mlockall(MCL_CURRENT | MCL_FUTURE)` (§5 Memory hygiene):
/// key material must never be written to a swap file. Containers
/// frequently deny `CAP_IPC_LOCK`, so a failure here is logged, not fatal.
fn lock_memory() {
    // SAFETY: mlockall has no preconditions beyond the flags being valid;
    // a non-zero return is handled via errno, not undefined behavior.
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        tracing::warn!(error = %err, "mlockall failed; key material may be swappable");
    } else {
        tracing::info!("process memory locked against swap (mlockall)");
    }
}

/// Builds the configured `Mailer` implementation. SMTP delivery itself is
/// out of scope (§1 Non-goals); `LoggingMailer` formats the same fields a
/// real mailer would but only logs them.
fn build_mailer(cfg: &ServerConfig) -> MailerHandle {
    match &cfg.mail {
        Some(mail_cfg) => MailerHandle::spawn(LoggingMailer::new(mail_cfg.clone())),
        None => MailerHandle::spawn(NullMailer),
    }
}

/// Runs the daemon to completion: loads the record store, mints the
/// admin-challenge token, spawns the mailer and both listeners, and
/// returns once a `Shutdown` RPC (or a local ctrl-c) fires.
pub async fn run(cfg: ServerConfig) -> Result<()> {
    lock_memory();

    if cfg.pass_salt.is_none() {
        tracing::warn!("no PASS_SALT/PASS_HASH configured; only Ping and GetSalt will succeed until set");
    }

    let store = RecordStore::open_all(&cfg.keydb_dir).await?;
    let mailer = build_mailer(&cfg);
    let admin_challenge = auth::generate_admin_challenge();
    tracing::info!(admin_challenge = %admin_challenge, "admin challenge minted — required for remote Shutdown");

    let service = Arc::new(Service::new(store, cfg.clone(), mailer, admin_challenge));
    let shutdown = service.shutdown_signal();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, shutting down");
            shutdown.notify_waiters();
        }
    });

    transport::serve(&cfg, service).await
}
