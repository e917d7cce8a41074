//! Fire-and-forget notification hook (§9): the server notifies an operator
//! mailbox on create/retrieve events without letting mail delivery block or
//! fail an RPC. An `mpsc::channel` feeds a `tokio::spawn`ed drain loop that
//! never backs up the caller.

use tokio::sync::mpsc;

use crate::config::MailConfig;

#[derive(Debug, Clone)]
pub enum Event {
    KeyCreated { uuid: String, id: String },
    KeyRetrieved { uuid: String, hostname: String },
    HolderRevoked { uuid: String, hostname: String },
}

/// Anything that can be notified of an event. The log-only `NullMailer` is
/// the only implementation here — actual SMTP formatting/delivery is out of
/// scope.
pub trait Mailer: Send + Sync + 'static {
    fn notify(&self, event: Event);
}

pub struct NullMailer;

impl Mailer for NullMailer {
    fn notify(&self, event: Event) {
        tracing::info!(?event, "mail notification (logged only, no SMTP configured)");
    }
}

/// Sends `event` and logs it via `tracing` as though handing off to SMTP,
/// using the fields a real mailer would key its subject/recipient on.
/// Configuration is accepted so the log line reflects where mail *would*
/// go; no network I/O is performed.
pub struct LoggingMailer {
    cfg: MailConfig,
}

impl LoggingMailer {
    pub fn new(cfg: MailConfig) -> Self {
        LoggingMailer { cfg }
    }
}

impl Mailer for LoggingMailer {
    fn notify(&self, event: Event) {
        let subject = render_template(&self.cfg.subject_template, &event);
        let text = render_template(&self.cfg.text_template, &event);
        tracing::info!(
            agent = %self.cfg.agent,
            from = %self.cfg.from,
            to = %self.cfg.recipients.join(","),
            %subject,
            %text,
            "mail notification dispatched"
        );
    }
}

/// Fills the `{event}` placeholder in a `MAIL_SUBJECT`/`MAIL_TEXT`
/// template (§3.1) with a one-line rendering of the event. No general
/// templating engine — formatting beyond this is out of scope (§1
/// Non-goals: "email notification formatting").
fn render_template(template: &str, event: &Event) -> String {
    let rendered = match event {
        Event::KeyCreated { uuid, id } => format!("key {id} ({uuid}) created"),
        Event::KeyRetrieved { uuid, hostname } => format!("key {uuid} retrieved by {hostname}"),
        Event::HolderRevoked { uuid, hostname } => format!("holder {hostname} revoked for key {uuid}"),
    };
    template.replace("{event}", &rendered)
}

/// A handle that forwards `notify` calls onto a background drain task, so
/// callers never block on mail delivery.
#[derive(Clone)]
pub struct MailerHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl MailerHandle {
    pub fn spawn(mailer: impl Mailer) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                mailer.notify(event);
            }
        });
        MailerHandle { tx }
    }

    /// Fire-and-forget: a full or closed channel never surfaces to the
    /// caller as an RPC failure. A closed channel only happens during
    /// shutdown, after which notifications are moot.
    pub fn notify(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingMailer(Arc<Mutex<Vec<Event>>>);

    impl Mailer for RecordingMailer {
        fn notify(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn notify_reaches_the_mailer_asynchronously() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let handle = MailerHandle::spawn(RecordingMailer(received.clone()));

        handle.notify(Event::KeyCreated { uuid: "u1".into(), id: "disk0".into() });
        // Give the drain task a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let got = received.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert!(matches!(got[0], Event::KeyCreated { .. }));
    }

    #[test]
    fn null_mailer_does_not_panic() {
        NullMailer.notify(Event::HolderRevoked { uuid: "u1".into(), hostname: "h".into() });
    }
}
