//! IMAP access for one poll cycle. Sessions are short-lived: open, search,
//! fetch, logout. The guard guarantees LOGOUT on every exit path, including
//! errors and timeouts.

use native_tls::TlsConnector;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::mailbox::MailboxConfig;

pub type ImapSession = imap::Session<native_tls::TlsStream<std::net::TcpStream>>;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("mailbox operation failed: {0}")]
    Protocol(String),
    #[error("{0} exceeded its time budget")]
    Timeout(&'static str),
}

#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub uid: u32,
    pub reason: String,
}

/// Result of one fetch pass. Per-message failures ride alongside the
/// successes instead of aborting the batch.
#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    pub messages: Vec<FetchedMessage>,
    pub failures: Vec<FetchFailure>,
}

pub trait MailSource: Send + Sync {
    /// Pull candidate messages for one config. Blocking; run it under
    /// `spawn_blocking`.
    fn fetch_unseen(&self, config: &MailboxConfig) -> Result<FetchedBatch, ConnectorError>;

    /// Flag messages as seen once they are durably disposed of, so the next
    /// search skips them. Messages whose ingestion failed stay unseen and
    /// are picked up again.
    fn mark_seen(&self, config: &MailboxConfig, uids: &[u32]) -> Result<(), ConnectorError>;
}

pub struct ImapSource {
    connect_timeout: Duration,
    fetch_timeout: Duration,
}

impl ImapSource {
    pub fn new(connect_timeout: Duration, fetch_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            fetch_timeout,
        }
    }

    fn open_session(
        &self,
        config: &MailboxConfig,
        started: Instant,
    ) -> Result<SessionGuard, ConnectorError> {
        let password = config.decrypted_password().map_err(ConnectorError::Auth)?;
        let port = u16::try_from(config.imap_port)
            .map_err(|_| ConnectorError::Connect(format!("invalid IMAP port {}", config.imap_port)))?;
        let tls = TlsConnector::builder()
            .build()
            .map_err(|e| ConnectorError::Connect(format!("TLS setup failed: {e}")))?;

        let addr = (config.imap_host.as_str(), port);
        let client = if config.imap_tls {
            imap::connect(addr, &config.imap_host, &tls)
        } else {
            // No-TLS configs still upgrade the connection before LOGIN.
            imap::connect_starttls(addr, &config.imap_host, &tls)
        }
        .map_err(|e| ConnectorError::Connect(e.to_string()))?;

        let session = client
            .login(&config.username, &password)
            .map_err(|(e, _)| ConnectorError::Auth(e.to_string()))?;

        if started.elapsed() > self.connect_timeout {
            return Err(ConnectorError::Timeout("session establishment"));
        }
        Ok(SessionGuard(session))
    }
}

impl MailSource for ImapSource {
    fn fetch_unseen(&self, config: &MailboxConfig) -> Result<FetchedBatch, ConnectorError> {
        let started = Instant::now();
        let mut session = self.open_session(config, started)?;

        session
            .select("INBOX")
            .map_err(|e| ConnectorError::Protocol(format!("SELECT failed: {e}")))?;

        // Seen flags are only a hint; other clients can flip them. The dedup
        // guard is what actually prevents double ingestion.
        let mut uids: Vec<u32> = session
            .uid_search("UNSEEN")
            .map_err(|e| ConnectorError::Protocol(format!("SEARCH failed: {e}")))?
            .into_iter()
            .collect();
        uids.sort_unstable();

        // The connect timeout covers everything up to the first fetch.
        if started.elapsed() > self.connect_timeout {
            return Err(ConnectorError::Timeout("session establishment"));
        }

        let mut batch = FetchedBatch::default();
        for uid in uids {
            let fetch_started = Instant::now();
            // BODY.PEEK keeps the message unseen until we have actually
            // persisted it.
            match session.uid_fetch(uid.to_string(), "(UID BODY.PEEK[])") {
                Ok(fetches) => match fetches.iter().next().and_then(|f| f.body()) {
                    Some(body) => batch.messages.push(FetchedMessage {
                        uid,
                        raw: body.to_vec(),
                    }),
                    None => batch.failures.push(FetchFailure {
                        uid,
                        reason: "server returned no body".to_string(),
                    }),
                },
                Err(e) => batch.failures.push(FetchFailure {
                    uid,
                    reason: e.to_string(),
                }),
            }
            if fetch_started.elapsed() > self.fetch_timeout {
                return Err(ConnectorError::Timeout("message fetch"));
            }
        }

        Ok(batch)
    }

    fn mark_seen(&self, config: &MailboxConfig, uids: &[u32]) -> Result<(), ConnectorError> {
        if uids.is_empty() {
            return Ok(());
        }

        let mut session = self.open_session(config, Instant::now())?;
        session
            .select("INBOX")
            .map_err(|e| ConnectorError::Protocol(format!("SELECT failed: {e}")))?;

        let uid_set = uids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");
        session
            .uid_store(uid_set, "+FLAGS (\\Seen)")
            .map_err(|e| ConnectorError::Protocol(format!("STORE failed: {e}")))?;

        Ok(())
    }
}

/// Owns the live session and issues LOGOUT when dropped, whatever path got
/// us there.
struct SessionGuard(ImapSession);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.logout().ok();
    }
}

impl Deref for SessionGuard {
    type Target = ImapSession;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
