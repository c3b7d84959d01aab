use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::shared::schema::mailbox_configs;
use crate::core::shared::state::AppState;
use crate::core::shared::utils::DbPool;
use crate::ingest::store::StoreError;
use crate::scheduler::TriggerOutcome;

/// One tenant-configured inbound mailbox. Credentials stay inside this
/// struct and the connector; the HTTP surface only ever sees
/// [`MailboxStatus`].
#[derive(Debug, Clone, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = mailbox_configs)]
pub struct MailboxConfig {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub imap_host: String,
    pub imap_port: i32,
    pub imap_tls: bool,
    pub smtp_host: String,
    pub smtp_port: i32,
    pub smtp_tls: bool,
    pub username: String,
    pub password_encrypted: String,
    pub is_active: bool,
    pub poll_interval_minutes: i32,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MailboxConfig {
    /// A config is due when it is active and its polling interval has fully
    /// elapsed since the last completed cycle. A never-polled config is due
    /// immediately.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        let interval = Duration::minutes(i64::from(self.poll_interval_minutes.max(1)));
        match self.last_polled_at {
            None => true,
            Some(last) => now - last >= interval,
        }
    }

    pub fn decrypted_password(&self) -> Result<String, String> {
        general_purpose::STANDARD
            .decode(&self.password_encrypted)
            .map_err(|e| format!("Decryption failed: {e}"))
            .and_then(|bytes| {
                String::from_utf8(bytes).map_err(|e| format!("UTF-8 conversion failed: {e}"))
            })
    }
}

pub trait ConfigStore: Send + Sync {
    /// Active configs whose interval has elapsed, ready for a poll cycle.
    fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<MailboxConfig>, StoreError>;
    fn list_all(&self) -> Result<Vec<MailboxConfig>, StoreError>;
    fn get(&self, id: Uuid) -> Result<Option<MailboxConfig>, StoreError>;
    /// Advance the last-poll marker to the given cycle start time.
    fn mark_polled(&self, id: Uuid, polled_at: DateTime<Utc>) -> Result<(), StoreError>;
}

pub struct PgConfigStore {
    conn: DbPool,
}

impl PgConfigStore {
    pub fn new(conn: DbPool) -> Self {
        Self { conn }
    }
}

impl ConfigStore for PgConfigStore {
    fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<MailboxConfig>, StoreError> {
        let mut conn = self.conn.get().map_err(|e| StoreError::Pool(e.to_string()))?;
        let active: Vec<MailboxConfig> = mailbox_configs::table
            .filter(mailbox_configs::is_active.eq(true))
            .order(mailbox_configs::name.asc())
            .load(&mut conn)?;
        Ok(active.into_iter().filter(|c| c.is_due(now)).collect())
    }

    fn list_all(&self) -> Result<Vec<MailboxConfig>, StoreError> {
        let mut conn = self.conn.get().map_err(|e| StoreError::Pool(e.to_string()))?;
        let configs = mailbox_configs::table
            .order(mailbox_configs::name.asc())
            .load(&mut conn)?;
        Ok(configs)
    }

    fn get(&self, id: Uuid) -> Result<Option<MailboxConfig>, StoreError> {
        let mut conn = self.conn.get().map_err(|e| StoreError::Pool(e.to_string()))?;
        let config = mailbox_configs::table
            .filter(mailbox_configs::id.eq(id))
            .first(&mut conn)
            .optional()?;
        Ok(config)
    }

    fn mark_polled(&self, id: Uuid, polled_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.conn.get().map_err(|e| StoreError::Pool(e.to_string()))?;
        diesel::update(mailbox_configs::table.filter(mailbox_configs::id.eq(id)))
            .set((
                mailbox_configs::last_polled_at.eq(Some(polled_at)),
                mailbox_configs::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
        Ok(())
    }
}

/// What operators see. Never carries username or password material.
#[derive(Debug, Clone, Serialize)]
pub struct MailboxStatus {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub imap_host: String,
    pub is_active: bool,
    pub poll_interval_minutes: i32,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub polling_now: bool,
}

impl MailboxStatus {
    pub fn from_config(config: &MailboxConfig, polling_now: bool) -> Self {
        Self {
            id: config.id,
            name: config.name.clone(),
            address: config.address.clone(),
            imap_host: config.imap_host.clone(),
            is_active: config.is_active,
            poll_interval_minutes: config.poll_interval_minutes,
            last_polled_at: config.last_polled_at,
            polling_now,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PollNowResponse {
    pub mailbox_id: Uuid,
    pub status: String,
}

pub async fn list_mailboxes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<MailboxStatus>>, (StatusCode, String)> {
    let configs = state
        .configs
        .list_all()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;

    let statuses = configs
        .iter()
        .map(|c| MailboxStatus::from_config(c, state.sweeper.is_polling(c.id)))
        .collect();

    Ok(Json(statuses))
}

pub async fn poll_mailbox_now(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<PollNowResponse>, (StatusCode, String)> {
    let config = state
        .configs
        .get(id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?
        .ok_or((StatusCode::NOT_FOUND, "Mailbox not found".to_string()))?;

    if !config.is_active {
        return Err((StatusCode::CONFLICT, "Mailbox is inactive".to_string()));
    }

    let status = match state.sweeper.trigger(config) {
        TriggerOutcome::Started => "started",
        TriggerOutcome::AlreadyRunning => "already_running",
    };

    Ok(Json(PollNowResponse {
        mailbox_id: id,
        status: status.to_string(),
    }))
}

pub fn configure_mailbox_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/mailboxes", get(list_mailboxes))
        .route("/api/mailboxes/:id/poll", post(poll_mailbox_now))
}
