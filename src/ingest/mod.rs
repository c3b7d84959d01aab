//! The poll cycle: fetch unseen mail for one mailbox config, parse each
//! message, correlate it to a ticket and persist it, then flag the handled
//! messages as seen on the server.
//!
//! A cycle never panics and never propagates an error to the scheduler. It
//! reports a [`CycleOutcome`]: per-message problems are counted and audited
//! but leave the cycle successful, while connector-level failures (connect,
//! auth, timeout) mark the whole cycle fatal so the poll marker is not
//! advanced and the same messages are retried next time.

pub mod correlator;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::audit::{AuditEntry, AuditLog};
use crate::connector::{ConnectorError, FetchedBatch, MailSource};
use crate::core::shared::enums::AuditCode;
use crate::mailbox::MailboxConfig;
use crate::notify::{ActivityKind, TicketActivity};
use crate::parser;
use store::{IngestOutcome, IngestStore};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error("poll cycle exceeded its time budget")]
    Budget,
    #[error("poll cycle task failed: {0}")]
    Internal(String),
}

impl CycleError {
    pub fn audit_code(&self) -> AuditCode {
        match self {
            CycleError::Connector(e) => connector_audit_code(e),
            CycleError::Budget => AuditCode::Timeout,
            CycleError::Internal(_) => AuditCode::StorageFailed,
        }
    }
}

fn connector_audit_code(error: &ConnectorError) -> AuditCode {
    match error {
        ConnectorError::Connect(_) | ConnectorError::Protocol(_) => AuditCode::ConnectFailed,
        ConnectorError::Auth(_) => AuditCode::AuthFailed,
        ConnectorError::Timeout(_) => AuditCode::Timeout,
    }
}

#[derive(Debug, Default, Clone)]
pub struct CycleStats {
    pub fetched: usize,
    pub ingested: usize,
    pub tickets_created: usize,
    pub duplicates: usize,
    pub parse_failures: usize,
    pub fetch_failures: usize,
    pub storage_failures: usize,
}

#[derive(Debug)]
pub struct CycleOutcome {
    pub stats: CycleStats,
    pub fatal: Option<CycleError>,
}

impl CycleOutcome {
    /// Per-message failures do not make a cycle unsuccessful; only a
    /// connector-level failure or a blown budget does.
    pub fn is_success(&self) -> bool {
        self.fatal.is_none()
    }

    fn failed(error: CycleError) -> Self {
        Self {
            stats: CycleStats::default(),
            fatal: Some(error),
        }
    }
}

pub struct IngestPipeline {
    source: Arc<dyn MailSource>,
    store: Arc<dyn IngestStore>,
    audit: Arc<dyn AuditLog>,
    activity: broadcast::Sender<TicketActivity>,
    cycle_budget: Duration,
}

impl IngestPipeline {
    pub fn new(
        source: Arc<dyn MailSource>,
        store: Arc<dyn IngestStore>,
        audit: Arc<dyn AuditLog>,
        activity: broadcast::Sender<TicketActivity>,
        cycle_budget: Duration,
    ) -> Self {
        Self {
            source,
            store,
            audit,
            activity,
            cycle_budget,
        }
    }

    /// Run one full poll cycle for `config` and audit its outcome.
    pub async fn run_cycle(&self, config: &MailboxConfig) -> CycleOutcome {
        debug!("polling mailbox {} ({})", config.name, config.address);

        let outcome = match timeout(self.cycle_budget, self.cycle_inner(config)).await {
            Ok(outcome) => outcome,
            // The inner future was dropped mid-flight. Whatever it already
            // committed stays committed; the rest is retried next cycle.
            Err(_) => CycleOutcome::failed(CycleError::Budget),
        };

        match &outcome.fatal {
            None => {
                let s = &outcome.stats;
                self.audit.record(AuditEntry::info(
                    config.id,
                    format!(
                        "cycle completed: {} fetched, {} ingested ({} new tickets), \
                         {} duplicates skipped, {} parse failures, {} fetch failures, \
                         {} storage failures",
                        s.fetched,
                        s.ingested,
                        s.tickets_created,
                        s.duplicates,
                        s.parse_failures,
                        s.fetch_failures,
                        s.storage_failures
                    ),
                ));
            }
            Some(error) => {
                self.audit.record(AuditEntry::error(
                    config.id,
                    error.audit_code(),
                    format!("cycle failed: {error}"),
                ));
            }
        }
        outcome
    }

    async fn cycle_inner(&self, config: &MailboxConfig) -> CycleOutcome {
        let source = self.source.clone();
        let fetch_config = config.clone();
        let batch = match spawn_blocking(move || source.fetch_unseen(&fetch_config)).await {
            Ok(Ok(batch)) => batch,
            Ok(Err(error)) => return CycleOutcome::failed(error.into()),
            Err(join) => return CycleOutcome::failed(CycleError::Internal(join.to_string())),
        };

        for failure in &batch.failures {
            self.audit.record(AuditEntry::warning(
                config.id,
                AuditCode::FetchFailed,
                format!("message uid {} could not be fetched: {}", failure.uid, failure.reason),
            ));
        }

        let store = self.store.clone();
        let audit = self.audit.clone();
        let activity = self.activity.clone();
        let process_config = config.clone();
        let processed = spawn_blocking(move || {
            process_batch(&*store, &*audit, &activity, &process_config, batch)
        })
        .await;
        let (stats, disposed) = match processed {
            Ok(done) => done,
            Err(join) => return CycleOutcome::failed(CycleError::Internal(join.to_string())),
        };

        if !disposed.is_empty() {
            let source = self.source.clone();
            let flag_config = config.clone();
            match spawn_blocking(move || source.mark_seen(&flag_config, &disposed)).await {
                Ok(Ok(())) => {}
                // Not fatal: the dedup guard absorbs the refetch next cycle.
                Ok(Err(error)) => {
                    self.audit.record(AuditEntry::warning(
                        config.id,
                        connector_audit_code(&error),
                        format!("handled messages could not be flagged as seen: {error}"),
                    ));
                }
                Err(join) => warn!("seen-flag task failed: {join}"),
            }
        }

        CycleOutcome {
            stats,
            fatal: None,
        }
    }
}

/// Parse, dedup, correlate and persist one fetched batch. Returns the cycle
/// stats and the uids that were durably disposed of (ingested, duplicate,
/// or unparseable) and may now be flagged seen.
fn process_batch(
    store: &dyn IngestStore,
    audit: &dyn AuditLog,
    activity: &broadcast::Sender<TicketActivity>,
    config: &MailboxConfig,
    batch: FetchedBatch,
) -> (CycleStats, Vec<u32>) {
    let mut stats = CycleStats {
        fetched: batch.messages.len(),
        fetch_failures: batch.failures.len(),
        ..CycleStats::default()
    };
    let mut disposed = Vec::new();

    for message in batch.messages {
        let email = match parser::parse_email(&message.raw) {
            Ok(email) => email,
            Err(error) => {
                stats.parse_failures += 1;
                audit.record(AuditEntry::warning(
                    config.id,
                    AuditCode::ParseFailed,
                    format!("message uid {} could not be parsed: {error}", message.uid),
                ));
                // An unparseable message has no dedup key and would be
                // refetched forever; flag it seen and move on.
                disposed.push(message.uid);
                continue;
            }
        };

        match store.already_ingested(config.id, &email.message_id) {
            Ok(true) => {
                stats.duplicates += 1;
                debug!("message {} already ingested, skipping", email.message_id);
                disposed.push(message.uid);
                continue;
            }
            Ok(false) => {}
            Err(error) => {
                stats.storage_failures += 1;
                audit.record(AuditEntry::warning(
                    config.id,
                    AuditCode::StorageFailed,
                    format!("dedup lookup failed for message {}: {error}", email.message_id),
                ));
                continue;
            }
        }

        let record = match correlator::correlate(store, config.id, &email) {
            Ok(record) => record,
            Err(error) => {
                stats.storage_failures += 1;
                audit.record(AuditEntry::warning(
                    config.id,
                    AuditCode::StorageFailed,
                    format!(
                        "correlation lookup failed for message {}: {error}",
                        email.message_id
                    ),
                ));
                continue;
            }
        };

        match store.ingest(record) {
            Ok(IngestOutcome::Written(receipt)) => {
                stats.ingested += 1;
                if receipt.created_ticket {
                    stats.tickets_created += 1;
                }
                disposed.push(message.uid);
                let _ = activity.send(TicketActivity {
                    ticket_id: receipt.ticket_id,
                    ticket_number: receipt.ticket_number,
                    company_id: receipt.company_id,
                    mailbox_id: config.id,
                    kind: if receipt.created_ticket {
                        ActivityKind::Created
                    } else {
                        ActivityKind::Replied
                    },
                });
            }
            Ok(IngestOutcome::Duplicate) => {
                stats.duplicates += 1;
                disposed.push(message.uid);
            }
            Err(error) => {
                stats.storage_failures += 1;
                audit.record(AuditEntry::warning(
                    config.id,
                    AuditCode::StorageFailed,
                    format!("message {} could not be persisted: {error}", email.message_id),
                ));
                // Stays unseen and undeduped; the next cycle retries it.
            }
        }
    }

    (stats, disposed)
}
