//! Run notifications.
//!
//! # Design
//!
//! - **Policy gated**: nothing is sent unless `notifications.enabled`
//!   resolves true for the environment; the channel list comes from
//!   `notifications.channels` at environment scope.
//! - **Independent channels**: every channel is attempted; a failure is
//!   recorded on the event and never changes the run's outcome.
//! - **Transport behind a trait**: [`Channel`] hides HTTP and sendmail so
//!   tests can count deliveries.
//!
//! | Channel kind | Transport                        | Body                         |
//! |--------------|----------------------------------|------------------------------|
//! | `webhook`    | HTTP POST                        | JSON [`NotificationMessage`] |
//! | `chat`       | HTTP POST                        | `{"text": "..."}`            |
//! | `email`      | `sendmail -t` on stdin           | plain-text mail              |

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ChannelConfig;
use crate::error::{DeliveryError, EngineError, Result};
use crate::policy::PolicyKey;
use crate::policy::resolver::PolicyResolver;
use crate::process_guard::{self, ChildRegistry, CommandProcessGroup};
use crate::runtime::{POLL_INTERVAL, collect, drain};
use crate::types::{OperationKind, Severity};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for one sendmail invocation
const SENDMAIL_TIMEOUT: Duration = Duration::from_secs(30);

/// What a channel delivers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub environment: String,
    pub kind: OperationKind,
    pub severity: Severity,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

impl NotificationMessage {
    pub fn subject(&self) -> String {
        format!(
            "[stackkeeper] {} {} {}",
            self.environment,
            self.kind,
            match self.severity {
                Severity::Info => "succeeded",
                Severity::Warning => "partially failed",
                Severity::Critical => "failed",
            }
        )
    }

    /// One-line rendering for chat channels
    pub fn text(&self) -> String {
        format!("{} ({}): {}", self.subject(), self.severity, self.summary)
    }
}

/// Outcome of one notification attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub environment: String,
    pub kind: OperationKind,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub channels_attempted: Vec<String>,
    pub channels_succeeded: Vec<String>,
    pub failures: Vec<DeliveryError>,
}

/// A delivery transport
pub trait Channel: Send + Sync {
    fn deliver(&self, message: &NotificationMessage) -> std::result::Result<(), String>;
}

// ============================================================================
// Transports
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookBody {
    /// The serialized message
    Json,
    /// `{"text": ...}`
    Chat,
}

pub struct WebhookChannel {
    url: String,
    body: WebhookBody,
    client: reqwest::blocking::Client,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, body: WebhookBody) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("stackkeeper/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            body,
            client,
        })
    }
}

impl Channel for WebhookChannel {
    fn deliver(&self, message: &NotificationMessage) -> std::result::Result<(), String> {
        let request = self.client.post(&self.url);
        let request = match self.body {
            WebhookBody::Json => request.json(message),
            WebhookBody::Chat => request.json(&serde_json::json!({ "text": message.text() })),
        };
        request
            .send()
            .and_then(|response| response.error_for_status())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

pub struct EmailChannel {
    to: Vec<String>,
    from: Option<String>,
    sendmail: PathBuf,
    timeout: Duration,
}

impl EmailChannel {
    pub fn new(to: Vec<String>, from: Option<String>, sendmail: PathBuf) -> Self {
        Self {
            to,
            from,
            sendmail,
            timeout: SENDMAIL_TIMEOUT,
        }
    }

    /// Time allowed for sendmail before its process group is killed
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn render(&self, message: &NotificationMessage) -> String {
        let mut mail = String::new();
        mail.push_str(&format!("To: {}\n", self.to.join(", ")));
        if let Some(from) = &self.from {
            mail.push_str(&format!("From: {}\n", from));
        }
        mail.push_str(&format!("Subject: {}\n", message.subject()));
        mail.push_str("Content-Type: text/plain; charset=utf-8\n\n");
        mail.push_str(&format!("Environment: {}\n", message.environment));
        mail.push_str(&format!("Operation:   {}\n", message.kind));
        mail.push_str(&format!("Severity:    {}\n", message.severity));
        mail.push_str(&format!("Time:        {}\n\n", message.timestamp.to_rfc3339()));
        mail.push_str(&message.summary);
        mail.push('\n');
        mail
    }

    /// Kill the whole group and reap the child
    fn stop(child: &mut Child) {
        process_guard::terminate_group(child.id(), process_guard::TERMINATION_GRACE);
        let _ = child.wait();
    }

    fn supervise(&self, child: &mut Child, mail: &str) -> std::result::Result<(), String> {
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(mail.as_bytes()) {
                Self::stop(child);
                return Err(format!("writing mail: {}", e));
            }
        }

        let stderr = child.stderr.take().map(drain);
        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    Self::stop(child);
                    return Err(e.to_string());
                }
            }
            if started.elapsed() >= self.timeout {
                tracing::warn!(sendmail = %self.sendmail.display(), "sendmail exceeded its time budget, terminating");
                Self::stop(child);
                return Err(format!(
                    "{} timed out after {}s",
                    self.sendmail.display(),
                    self.timeout.as_secs()
                ));
            }
            thread::sleep(POLL_INTERVAL);
        };

        if status.success() {
            Ok(())
        } else {
            Err(format!(
                "{} exited with {}: {}",
                self.sendmail.display(),
                status,
                collect(stderr).trim()
            ))
        }
    }
}

impl Channel for EmailChannel {
    fn deliver(&self, message: &NotificationMessage) -> std::result::Result<(), String> {
        let mut child = Command::new(&self.sendmail)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .in_new_process_group()
            .spawn()
            .map_err(|e| format!("cannot run {}: {}", self.sendmail.display(), e))?;

        let pid = child.id();
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }
        let result = self.supervise(&mut child, &self.render(message));
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(pid);
        }
        result
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Channel id → transport
#[derive(Default)]
pub struct NotificationDispatcher {
    channels: BTreeMap<String, Box<dyn Channel>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(channels: &BTreeMap<String, ChannelConfig>) -> Result<Self> {
        let mut dispatcher = Self::new();
        for (id, config) in channels {
            let channel: Box<dyn Channel> = match config {
                ChannelConfig::Webhook { url } => Box::new(WebhookChannel::new(url, WebhookBody::Json)?),
                ChannelConfig::Chat { url } => Box::new(WebhookChannel::new(url, WebhookBody::Chat)?),
                ChannelConfig::Email { to, from, sendmail } => {
                    Box::new(EmailChannel::new(to.clone(), from.clone(), sendmail.clone()))
                }
            };
            dispatcher.register(id, channel);
        }
        Ok(dispatcher)
    }

    pub fn register(&mut self, id: impl Into<String>, channel: Box<dyn Channel>) {
        self.channels.insert(id.into(), channel);
    }

    /// Send `message` through every channel policy routes it to.
    ///
    /// With notifications disabled the returned event lists no attempted
    /// channel and nothing is contacted.
    pub fn notify(&self, resolver: &PolicyResolver<'_>, message: &NotificationMessage) -> NotificationEvent {
        let environment = message.environment.as_str();
        let mut event = NotificationEvent {
            environment: message.environment.clone(),
            kind: message.kind,
            message: message.summary.clone(),
            severity: message.severity,
            timestamp: message.timestamp,
            channels_attempted: Vec::new(),
            channels_succeeded: Vec::new(),
            failures: Vec::new(),
        };

        if !resolver.flag(environment, None, PolicyKey::NotificationsEnabled) {
            tracing::debug!(environment, "notifications disabled by policy");
            return event;
        }

        for id in resolver.channels(environment) {
            event.channels_attempted.push(id.clone());
            let Some(channel) = self.channels.get(&id) else {
                tracing::warn!(environment, channel = %id, "notification channel is not configured");
                event.failures.push(DeliveryError::UnknownChannel { channel: id });
                continue;
            };
            match channel.deliver(message) {
                Ok(()) => {
                    tracing::info!(environment, channel = %id, "notification delivered");
                    event.channels_succeeded.push(id);
                }
                Err(reason) => {
                    tracing::warn!(environment, channel = %id, error = %reason, "notification delivery failed");
                    event.failures.push(DeliveryError::Failed { channel: id, reason });
                }
            }
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyStore;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Channel for Counting {
        fn deliver(&self, _message: &NotificationMessage) -> std::result::Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail { Err("HTTP 500".to_string()) } else { Ok(()) }
        }
    }

    fn message(environment: &str) -> NotificationMessage {
        NotificationMessage {
            environment: environment.to_string(),
            kind: OperationKind::Backup,
            severity: Severity::Warning,
            summary: "backup production: 4 succeeded, 1 failed in 12s".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 5, 1, 2, 0, 0).unwrap(),
        }
    }

    fn dispatcher(calls: &Arc<AtomicUsize>) -> NotificationDispatcher {
        let mut dispatcher = NotificationDispatcher::new();
        dispatcher.register("ops", Box::new(Counting { calls: calls.clone(), fail: false }));
        dispatcher.register("pager", Box::new(Counting { calls: calls.clone(), fail: true }));
        dispatcher
    }

    #[test]
    fn test_disabled_contacts_nobody() {
        let store = PolicyStore::from_yaml(&[(
            "p.yaml",
            "environments:\n  staging:\n    notifications:\n      enabled: false\n      channels: [ops]\n",
        )])
        .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let event = dispatcher(&calls).notify(&PolicyResolver::new(&store), &message("staging"));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(event.channels_attempted.is_empty());
        assert!(event.failures.is_empty());
    }

    #[test]
    fn test_failures_are_recorded_per_channel() {
        let store = PolicyStore::from_yaml(&[(
            "p.yaml",
            "environments:\n  production:\n    notifications:\n      enabled: true\n      channels: [ops, pager, missing]\n",
        )])
        .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let event = dispatcher(&calls).notify(&PolicyResolver::new(&store), &message("production"));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(event.channels_attempted, vec!["ops", "pager", "missing"]);
        assert_eq!(event.channels_succeeded, vec!["ops"]);
        assert_eq!(event.failures.len(), 2);
        assert!(event.failures.contains(&DeliveryError::UnknownChannel {
            channel: "missing".to_string()
        }));
    }

    #[test]
    fn test_email_rendering() {
        let channel = EmailChannel::new(
            vec!["ops@example.com".to_string()],
            Some("backup@example.com".to_string()),
            PathBuf::from("/usr/sbin/sendmail"),
        );
        let mail = channel.render(&message("production"));
        assert!(mail.starts_with("To: ops@example.com\nFrom: backup@example.com\n"));
        assert!(mail.contains("Subject: [stackkeeper] production backup partially failed\n"));
        assert!(mail.ends_with("1 failed in 12s\n"));
    }

    #[test]
    fn test_email_failure_is_reported() {
        let channel = EmailChannel::new(
            vec!["ops@example.com".to_string()],
            None,
            PathBuf::from("/nonexistent/sendmail"),
        );
        assert!(channel.deliver(&message("production")).is_err());
    }

    /// Executable stand-in for sendmail
    fn fake_sendmail(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("sendmail");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn email(sendmail: PathBuf) -> EmailChannel {
        EmailChannel::new(
            vec!["oncall@example.com".to_string()],
            Some("stackkeeper@example.com".to_string()),
            sendmail,
        )
    }

    #[test]
    fn test_email_pipes_rendered_mail() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("mail.txt");
        let sendmail = fake_sendmail(dir.path(), &format!("cat > '{}'", out.display()));

        email(sendmail).deliver(&message("production")).unwrap();
        let mail = std::fs::read_to_string(&out).unwrap();
        assert!(mail.starts_with("To: oncall@example.com\nFrom: stackkeeper@example.com\n"));
        assert!(mail.contains("Subject: [stackkeeper] production backup partially failed\n"));
        assert!(mail.contains("4 succeeded, 1 failed"));
    }

    #[test]
    fn test_email_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let sendmail = fake_sendmail(dir.path(), "cat >/dev/null; echo 'relay refused' >&2; exit 75");

        let err = email(sendmail).deliver(&message("production")).unwrap_err();
        assert!(err.contains("relay refused"), "{}", err);
    }

    #[test]
    fn test_email_hung_sendmail_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let sendmail = fake_sendmail(dir.path(), "cat >/dev/null; sleep 25");
        let channel = email(sendmail).with_timeout(Duration::from_millis(300));

        let started = std::time::Instant::now();
        let err = channel.deliver(&message("production")).unwrap_err();
        assert!(err.contains("timed out"), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_email_closed_stdin_does_not_hang() {
        let dir = tempfile::tempdir().unwrap();
        let sendmail = fake_sendmail(dir.path(), "exec 0<&-; sleep 25");
        let channel = email(sendmail).with_timeout(Duration::from_millis(300));

        let started = std::time::Instant::now();
        assert!(channel.deliver(&message("production")).is_err());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
