//! In-memory stand-ins for the persistence and mail seams, used by unit
//! and integration tests. They honor the same contracts as the Postgres
//! and IMAP implementations: atomic ingest with max+1 ticket numbering,
//! dedup on (mailbox, message id), and per-config fetch scripting.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::engine::general_purpose;
use base64::Engine;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLog};
use crate::connector::{ConnectorError, FetchedBatch, FetchedMessage, MailSource};
use crate::ingest::store::{
    IngestOutcome, IngestReceipt, IngestRecord, IngestStore, StoreError, TicketTarget,
};
use crate::mailbox::{ConfigStore, MailboxConfig};
use crate::ticketing::{Company, PortalUser, Ticket, TicketMessage};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An active config with a 5 minute interval that has never been polled.
pub fn sample_config(name: &str) -> MailboxConfig {
    let now = Utc::now();
    MailboxConfig {
        id: Uuid::new_v4(),
        name: name.to_string(),
        address: format!("{name}@example.test"),
        imap_host: "imap.example.test".to_string(),
        imap_port: 993,
        imap_tls: true,
        smtp_host: "smtp.example.test".to_string(),
        smtp_port: 587,
        smtp_tls: true,
        username: format!("{name}@example.test"),
        password_encrypted: general_purpose::STANDARD.encode("hunter2"),
        is_active: true,
        poll_interval_minutes: 5,
        last_polled_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// Minimal RFC 5322 message bytes for parser and pipeline tests.
pub fn raw_email(message_id: &str, from: &str, subject: &str, body: &str) -> Vec<u8> {
    format!(
        "Message-ID: {message_id}\r\n\
         From: {from}\r\n\
         To: support@example.test\r\n\
         Subject: {subject}\r\n\
         Date: Mon, 5 May 2025 10:00:00 +0000\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         {body}\r\n"
    )
    .into_bytes()
}

#[derive(Default)]
pub struct MemoryConfigStore {
    configs: Mutex<Vec<MailboxConfig>>,
}

impl MemoryConfigStore {
    pub fn new(configs: Vec<MailboxConfig>) -> Self {
        Self {
            configs: Mutex::new(configs),
        }
    }

    pub fn last_polled(&self, id: Uuid) -> Option<DateTime<Utc>> {
        lock(&self.configs)
            .iter()
            .find(|c| c.id == id)
            .and_then(|c| c.last_polled_at)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<MailboxConfig>, StoreError> {
        Ok(lock(&self.configs)
            .iter()
            .filter(|c| c.is_due(now))
            .cloned()
            .collect())
    }

    fn list_all(&self) -> Result<Vec<MailboxConfig>, StoreError> {
        Ok(lock(&self.configs).clone())
    }

    fn get(&self, id: Uuid) -> Result<Option<MailboxConfig>, StoreError> {
        Ok(lock(&self.configs).iter().find(|c| c.id == id).cloned())
    }

    fn mark_polled(&self, id: Uuid, polled_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut configs = lock(&self.configs);
        if let Some(config) = configs.iter_mut().find(|c| c.id == id) {
            config.last_polled_at = Some(polled_at);
            config.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[derive(Default)]
struct Tables {
    companies: Vec<Company>,
    users: Vec<PortalUser>,
    tickets: Vec<Ticket>,
    messages: Vec<TicketMessage>,
    ingested: HashMap<(Uuid, String), Option<Uuid>>,
    fail_writes: bool,
}

/// Ticketing tables behind one mutex, so `ingest` is atomic exactly like
/// the Postgres transaction it mimics.
pub struct MemoryIngestStore {
    tables: Mutex<Tables>,
    fallback: Uuid,
}

impl MemoryIngestStore {
    pub fn new() -> Self {
        let fallback = Uuid::new_v4();
        let now = Utc::now();
        let tables = Tables {
            companies: vec![Company {
                id: fallback,
                name: "Unassigned".to_string(),
                is_fallback: true,
                created_at: now,
                updated_at: now,
            }],
            ..Tables::default()
        };
        Self {
            tables: Mutex::new(tables),
            fallback,
        }
    }

    pub fn fallback_company_id(&self) -> Uuid {
        self.fallback
    }

    pub fn add_company(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        lock(&self.tables).companies.push(Company {
            id,
            name: name.to_string(),
            is_fallback: false,
            created_at: now,
            updated_at: now,
        });
        id
    }

    pub fn add_user(&self, company_id: Uuid, email: &str) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        lock(&self.tables).users.push(PortalUser {
            id,
            company_id,
            email: email.to_lowercase(),
            display_name: email.split('@').next().unwrap_or(email).to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
        });
        id
    }

    pub fn add_ticket(&self, company_id: Uuid, number: i64, title: &str) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        lock(&self.tables).tickets.push(Ticket {
            id,
            number,
            company_id,
            title: title.to_string(),
            status: "open".to_string(),
            created_at: now,
            updated_at: now,
        });
        id
    }

    /// Pre-seed a dedup record, as if the message had been ingested in an
    /// earlier cycle and filed on `ticket_id`.
    pub fn link_message(&self, mailbox_id: Uuid, message_id: &str, ticket_id: Uuid) {
        lock(&self.tables)
            .ingested
            .insert((mailbox_id, message_id.to_string()), Some(ticket_id));
    }

    /// Make every subsequent `ingest` fail, to exercise the retry path.
    pub fn fail_writes(&self, fail: bool) {
        lock(&self.tables).fail_writes = fail;
    }

    pub fn tickets(&self) -> Vec<Ticket> {
        lock(&self.tables).tickets.clone()
    }

    pub fn messages(&self) -> Vec<TicketMessage> {
        lock(&self.tables).messages.clone()
    }
}

impl Default for MemoryIngestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStore for MemoryIngestStore {
    fn already_ingested(&self, mailbox_id: Uuid, message_id: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.tables)
            .ingested
            .contains_key(&(mailbox_id, message_id.to_string())))
    }

    fn ticket_by_number(&self, number: i64) -> Result<Option<Ticket>, StoreError> {
        Ok(lock(&self.tables)
            .tickets
            .iter()
            .find(|t| t.number == number)
            .cloned())
    }

    fn ticket_for_message(
        &self,
        mailbox_id: Uuid,
        message_id: &str,
    ) -> Result<Option<Ticket>, StoreError> {
        let tables = lock(&self.tables);
        let ticket_id = tables
            .ingested
            .get(&(mailbox_id, message_id.to_string()))
            .copied()
            .flatten();
        Ok(ticket_id.and_then(|tid| tables.tickets.iter().find(|t| t.id == tid).cloned()))
    }

    fn user_by_email(&self, address: &str) -> Result<Option<PortalUser>, StoreError> {
        let wanted = address.to_lowercase();
        Ok(lock(&self.tables)
            .users
            .iter()
            .find(|u| u.email == wanted && u.is_active)
            .cloned())
    }

    fn fallback_company(&self) -> Result<Company, StoreError> {
        lock(&self.tables)
            .companies
            .iter()
            .find(|c| c.is_fallback)
            .cloned()
            .ok_or(StoreError::MissingFallbackCompany)
    }

    fn ingest(&self, record: IngestRecord) -> Result<IngestOutcome, StoreError> {
        let mut tables = lock(&self.tables);
        if tables.fail_writes {
            return Err(StoreError::Pool("injected write failure".to_string()));
        }

        let key = (record.mailbox_id, record.message_id.clone());
        if tables.ingested.contains_key(&key) {
            return Ok(IngestOutcome::Duplicate);
        }

        let now = Utc::now();
        let (ticket_id, ticket_number, company_id, created_ticket) = match &record.target {
            TicketTarget::Existing { ticket_id } => {
                let ticket = tables
                    .tickets
                    .iter_mut()
                    .find(|t| t.id == *ticket_id)
                    .ok_or(StoreError::Database(diesel::result::Error::NotFound))?;
                ticket.updated_at = now;
                (ticket.id, ticket.number, ticket.company_id, false)
            }
            TicketTarget::New {
                company_id,
                title,
                triage,
            } => {
                let number = tables.tickets.iter().map(|t| t.number).max().unwrap_or(0) + 1;
                let id = Uuid::new_v4();
                tables.tickets.push(Ticket {
                    id,
                    number,
                    company_id: *company_id,
                    title: title.clone(),
                    status: if *triage { "triage" } else { "open" }.to_string(),
                    created_at: now,
                    updated_at: now,
                });
                (id, number, *company_id, true)
            }
        };

        tables.messages.push(TicketMessage {
            id: Uuid::new_v4(),
            ticket_id,
            author_id: record.author_id,
            author_email: record.author_email.clone(),
            content: record.body.clone(),
            is_system: record.author_id.is_none(),
            is_internal: false,
            created_at: now,
        });
        tables.ingested.insert(key, Some(ticket_id));

        Ok(IngestOutcome::Written(IngestReceipt {
            ticket_id,
            ticket_number,
            company_id,
            created_ticket,
        }))
    }
}

#[derive(Default)]
pub struct RecordingAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        lock(&self.entries).clone()
    }
}

impl AuditLog for RecordingAuditLog {
    fn record(&self, entry: AuditEntry) {
        lock(&self.entries).push(entry);
    }

    fn recent(&self, mailbox_id: Uuid, limit: i64) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(lock(&self.entries)
            .iter()
            .rev()
            .filter(|e| e.mailbox_id == mailbox_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    fn recent_all(&self, limit: i64) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(lock(&self.entries)
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

/// Mail source with per-config scripted fetch results. Unscripted fetches
/// return an empty batch; an optional delay stalls the fetch to exercise
/// the cycle budget.
#[derive(Default)]
pub struct ScriptedMailSource {
    scripts: Mutex<HashMap<Uuid, VecDeque<Result<FetchedBatch, ConnectorError>>>>,
    delays: Mutex<HashMap<Uuid, Duration>>,
    fetches: Mutex<Vec<Uuid>>,
    seen: Mutex<Vec<(Uuid, Vec<u32>)>>,
}

impl ScriptedMailSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, mailbox_id: Uuid, result: Result<FetchedBatch, ConnectorError>) {
        lock(&self.scripts)
            .entry(mailbox_id)
            .or_default()
            .push_back(result);
    }

    pub fn script_messages(&self, mailbox_id: Uuid, messages: Vec<FetchedMessage>) {
        self.script(
            mailbox_id,
            Ok(FetchedBatch {
                messages,
                failures: Vec::new(),
            }),
        );
    }

    pub fn set_delay(&self, mailbox_id: Uuid, delay: Duration) {
        lock(&self.delays).insert(mailbox_id, delay);
    }

    pub fn fetch_count(&self, mailbox_id: Uuid) -> usize {
        lock(&self.fetches)
            .iter()
            .filter(|id| **id == mailbox_id)
            .count()
    }

    /// Every uid flagged seen for `mailbox_id`, across all calls.
    pub fn seen_uids(&self, mailbox_id: Uuid) -> Vec<u32> {
        lock(&self.seen)
            .iter()
            .filter(|(id, _)| *id == mailbox_id)
            .flat_map(|(_, uids)| uids.iter().copied())
            .collect()
    }
}

impl MailSource for ScriptedMailSource {
    fn fetch_unseen(&self, config: &MailboxConfig) -> Result<FetchedBatch, ConnectorError> {
        lock(&self.fetches).push(config.id);
        let delay = lock(&self.delays).get(&config.id).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let next = lock(&self.scripts)
            .get_mut(&config.id)
            .and_then(VecDeque::pop_front);
        next.unwrap_or_else(|| Ok(FetchedBatch::default()))
    }

    fn mark_seen(&self, config: &MailboxConfig, uids: &[u32]) -> Result<(), ConnectorError> {
        lock(&self.seen).push((config.id, uids.to_vec()));
        Ok(())
    }
}
