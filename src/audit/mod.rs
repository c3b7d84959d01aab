//! Append-only audit trail for poll cycles. Every entry is mirrored to the
//! process log; the table is what operational dashboards read.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::core::shared::enums::{AuditCode, AuditLevel};
use crate::core::shared::schema::mailbox_audit_log;
use crate::core::shared::state::AppState;
use crate::core::shared::utils::DbPool;
use crate::ingest::store::StoreError;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = mailbox_audit_log)]
pub struct AuditEntry {
    pub id: Uuid,
    pub mailbox_id: Uuid,
    pub level: AuditLevel,
    pub code: Option<AuditCode>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn info(mailbox_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mailbox_id,
            level: AuditLevel::Info,
            code: None,
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    pub fn warning(mailbox_id: Uuid, code: AuditCode, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mailbox_id,
            level: AuditLevel::Warning,
            code: Some(code),
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    pub fn error(mailbox_id: Uuid, code: AuditCode, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mailbox_id,
            level: AuditLevel::Error,
            code: Some(code),
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

pub trait AuditLog: Send + Sync {
    /// Append one entry. Infallible by contract: a failed write is logged
    /// and dropped rather than failing the cycle that produced it.
    fn record(&self, entry: AuditEntry);

    fn recent(&self, mailbox_id: Uuid, limit: i64) -> Result<Vec<AuditEntry>, StoreError>;
    fn recent_all(&self, limit: i64) -> Result<Vec<AuditEntry>, StoreError>;
}

pub struct PgAuditLog {
    conn: DbPool,
}

impl PgAuditLog {
    pub fn new(conn: DbPool) -> Self {
        Self { conn }
    }
}

impl AuditLog for PgAuditLog {
    fn record(&self, entry: AuditEntry) {
        let code = entry
            .code
            .map(|c| format!(" [{c}]"))
            .unwrap_or_default();
        match entry.level {
            AuditLevel::Info => info!("mailbox {}{}: {}", entry.mailbox_id, code, entry.message),
            AuditLevel::Warning => warn!("mailbox {}{}: {}", entry.mailbox_id, code, entry.message),
            AuditLevel::Error => error!("mailbox {}{}: {}", entry.mailbox_id, code, entry.message),
        }

        let mut conn = match self.conn.get() {
            Ok(conn) => conn,
            Err(e) => {
                error!("Audit entry dropped, no database connection: {e}");
                return;
            }
        };
        if let Err(e) = diesel::insert_into(mailbox_audit_log::table)
            .values(&entry)
            .execute(&mut conn)
        {
            error!("Failed to write audit entry: {e}");
        }
    }

    fn recent(&self, mailbox_id: Uuid, limit: i64) -> Result<Vec<AuditEntry>, StoreError> {
        let mut conn = self.conn.get().map_err(|e| StoreError::Pool(e.to_string()))?;
        let entries = mailbox_audit_log::table
            .filter(mailbox_audit_log::mailbox_id.eq(mailbox_id))
            .order(mailbox_audit_log::created_at.desc())
            .limit(limit.clamp(1, 500))
            .load(&mut conn)?;
        Ok(entries)
    }

    fn recent_all(&self, limit: i64) -> Result<Vec<AuditEntry>, StoreError> {
        let mut conn = self.conn.get().map_err(|e| StoreError::Pool(e.to_string()))?;
        let entries = mailbox_audit_log::table
            .order(mailbox_audit_log::created_at.desc())
            .limit(limit.clamp(1, 500))
            .load(&mut conn)?;
        Ok(entries)
    }
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<i64>,
}

pub async fn list_audit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, (StatusCode, String)> {
    let entries = state
        .audit
        .recent_all(query.limit.unwrap_or(50))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;
    Ok(Json(entries))
}

pub async fn list_mailbox_audit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, (StatusCode, String)> {
    let entries = state
        .audit
        .recent(id, query.limit.unwrap_or(50))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;
    Ok(Json(entries))
}

pub fn configure_audit_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/audit", get(list_audit))
        .route("/api/mailboxes/:id/audit", get(list_mailbox_audit))
}
