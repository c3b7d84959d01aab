//! Persistence seam for the ingestion pipeline. One trait, one Postgres
//! implementation, and the record types that cross it.

use chrono::Utc;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::Uuid as DieselUuid;
use diesel::sql_types::{Text, Timestamptz};
use thiserror::Error;
use uuid::Uuid;

use crate::core::shared::schema::{
    companies, ingested_messages, portal_users, ticket_messages, tickets,
};
use crate::core::shared::utils::DbPool;
use crate::ticketing::{Company, PortalUser, Ticket, TicketMessage};

/// Ticket numbers are claimed inside the insert itself, so two workers can
/// collide on the unique index and one of them has to try again.
const NUMBER_ALLOCATION_RETRIES: usize = 3;

const DEDUP_CONSTRAINT: &str = "uq_ingested_messages_mailbox_message";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("no fallback company is configured")]
    MissingFallbackCompany,
}

/// Where a correlated message lands.
#[derive(Debug, Clone)]
pub enum TicketTarget {
    Existing {
        ticket_id: Uuid,
    },
    New {
        company_id: Uuid,
        title: String,
        triage: bool,
    },
}

/// Everything needed to persist one email as a ticket message.
#[derive(Debug, Clone)]
pub struct IngestRecord {
    pub mailbox_id: Uuid,
    pub message_id: String,
    pub target: TicketTarget,
    pub author_id: Option<Uuid>,
    pub author_email: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct IngestReceipt {
    pub ticket_id: Uuid,
    pub ticket_number: i64,
    pub company_id: Uuid,
    pub created_ticket: bool,
}

#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Written(IngestReceipt),
    /// Another cycle recorded the same (mailbox, message id) pair first.
    /// Nothing was written.
    Duplicate,
}

pub trait IngestStore: Send + Sync {
    fn already_ingested(&self, mailbox_id: Uuid, message_id: &str) -> Result<bool, StoreError>;

    fn ticket_by_number(&self, number: i64) -> Result<Option<Ticket>, StoreError>;

    /// The ticket a previously ingested message was filed on, if any.
    fn ticket_for_message(
        &self,
        mailbox_id: Uuid,
        message_id: &str,
    ) -> Result<Option<Ticket>, StoreError>;

    fn user_by_email(&self, address: &str) -> Result<Option<PortalUser>, StoreError>;

    fn fallback_company(&self) -> Result<Company, StoreError>;

    /// Persist the ticket (when new), the message and the dedup record in a
    /// single transaction. Either everything lands or nothing does.
    fn ingest(&self, record: IngestRecord) -> Result<IngestOutcome, StoreError>;
}

pub struct PgIngestStore {
    conn: DbPool,
}

impl PgIngestStore {
    pub fn new(conn: DbPool) -> Self {
        Self { conn }
    }

    fn write_record(
        conn: &mut PgConnection,
        record: &IngestRecord,
    ) -> Result<IngestReceipt, DieselError> {
        conn.transaction::<_, DieselError, _>(|conn| {
            let now = Utc::now();

            let (ticket_id, ticket_number, company_id, created_ticket) = match &record.target {
                TicketTarget::Existing { ticket_id } => {
                    let ticket: Ticket = tickets::table
                        .filter(tickets::id.eq(ticket_id))
                        .first(conn)?;
                    diesel::update(tickets::table.filter(tickets::id.eq(ticket_id)))
                        .set(tickets::updated_at.eq(now))
                        .execute(conn)?;
                    (ticket.id, ticket.number, ticket.company_id, false)
                }
                TicketTarget::New {
                    company_id,
                    title,
                    triage,
                } => {
                    #[derive(QueryableByName)]
                    struct TicketNumberRow {
                        #[diesel(sql_type = diesel::sql_types::BigInt)]
                        number: i64,
                    }

                    let id = Uuid::new_v4();
                    let status = if *triage { "triage" } else { "open" };
                    let row: TicketNumberRow = diesel::sql_query(
                        "INSERT INTO tickets (id, number, company_id, title, status, created_at, updated_at) \
                         VALUES ($1, (SELECT COALESCE(MAX(number), 0) + 1 FROM tickets), $2, $3, $4, $5, $5) \
                         RETURNING number",
                    )
                    .bind::<DieselUuid, _>(id)
                    .bind::<DieselUuid, _>(company_id)
                    .bind::<Text, _>(title)
                    .bind::<Text, _>(status)
                    .bind::<Timestamptz, _>(now)
                    .get_result(conn)?;
                    (id, row.number, *company_id, true)
                }
            };

            let message = TicketMessage {
                id: Uuid::new_v4(),
                ticket_id,
                author_id: record.author_id,
                author_email: record.author_email.clone(),
                content: record.body.clone(),
                is_system: record.author_id.is_none(),
                is_internal: false,
                created_at: now,
            };
            diesel::insert_into(ticket_messages::table)
                .values(&message)
                .execute(conn)?;

            diesel::insert_into(ingested_messages::table)
                .values((
                    ingested_messages::id.eq(Uuid::new_v4()),
                    ingested_messages::mailbox_id.eq(record.mailbox_id),
                    ingested_messages::message_id.eq(&record.message_id),
                    ingested_messages::ingested_at.eq(now),
                    ingested_messages::ticket_id.eq(Some(ticket_id)),
                ))
                .execute(conn)?;

            Ok(IngestReceipt {
                ticket_id,
                ticket_number,
                company_id,
                created_ticket,
            })
        })
    }
}

impl IngestStore for PgIngestStore {
    fn already_ingested(&self, mailbox_id: Uuid, message_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.get().map_err(|e| StoreError::Pool(e.to_string()))?;
        let found = diesel::select(diesel::dsl::exists(
            ingested_messages::table
                .filter(ingested_messages::mailbox_id.eq(mailbox_id))
                .filter(ingested_messages::message_id.eq(message_id)),
        ))
        .get_result::<bool>(&mut conn)?;
        Ok(found)
    }

    fn ticket_by_number(&self, number: i64) -> Result<Option<Ticket>, StoreError> {
        let mut conn = self.conn.get().map_err(|e| StoreError::Pool(e.to_string()))?;
        let ticket = tickets::table
            .filter(tickets::number.eq(number))
            .first::<Ticket>(&mut conn)
            .optional()?;
        Ok(ticket)
    }

    fn ticket_for_message(
        &self,
        mailbox_id: Uuid,
        message_id: &str,
    ) -> Result<Option<Ticket>, StoreError> {
        let mut conn = self.conn.get().map_err(|e| StoreError::Pool(e.to_string()))?;
        let ticket_id: Option<Option<Uuid>> = ingested_messages::table
            .filter(ingested_messages::mailbox_id.eq(mailbox_id))
            .filter(ingested_messages::message_id.eq(message_id))
            .select(ingested_messages::ticket_id)
            .first(&mut conn)
            .optional()?;
        match ticket_id.flatten() {
            Some(tid) => {
                let ticket = tickets::table
                    .filter(tickets::id.eq(tid))
                    .first::<Ticket>(&mut conn)
                    .optional()?;
                Ok(ticket)
            }
            None => Ok(None),
        }
    }

    fn user_by_email(&self, address: &str) -> Result<Option<PortalUser>, StoreError> {
        let mut conn = self.conn.get().map_err(|e| StoreError::Pool(e.to_string()))?;
        let user = portal_users::table
            .filter(portal_users::email.eq(address.to_lowercase()))
            .filter(portal_users::is_active.eq(true))
            .first::<PortalUser>(&mut conn)
            .optional()?;
        Ok(user)
    }

    fn fallback_company(&self) -> Result<Company, StoreError> {
        let mut conn = self.conn.get().map_err(|e| StoreError::Pool(e.to_string()))?;
        let company = companies::table
            .filter(companies::is_fallback.eq(true))
            .first::<Company>(&mut conn)
            .optional()?;
        company.ok_or(StoreError::MissingFallbackCompany)
    }

    fn ingest(&self, record: IngestRecord) -> Result<IngestOutcome, StoreError> {
        let mut conn = self.conn.get().map_err(|e| StoreError::Pool(e.to_string()))?;
        let mut attempts = 0;
        loop {
            match Self::write_record(&mut conn, &record) {
                Ok(receipt) => return Ok(IngestOutcome::Written(receipt)),
                Err(e) => {
                    if let DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, ref info) =
                        e
                    {
                        if info.constraint_name() == Some(DEDUP_CONSTRAINT) {
                            return Ok(IngestOutcome::Duplicate);
                        }
                        attempts += 1;
                        if attempts < NUMBER_ALLOCATION_RETRIES {
                            continue;
                        }
                    }
                    return Err(e.into());
                }
            }
        }
    }
}
