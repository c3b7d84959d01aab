use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Created,
    Replied,
}

/// Published after every successful ingestion so the portal can notify the
/// company's other users. Fire and forget: ingestion never waits on, or
/// fails because of, a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketActivity {
    pub ticket_id: Uuid,
    pub ticket_number: i64,
    pub company_id: Uuid,
    pub mailbox_id: Uuid,
    pub kind: ActivityKind,
}

pub fn activity_channel() -> (
    broadcast::Sender<TicketActivity>,
    broadcast::Receiver<TicketActivity>,
) {
    broadcast::channel(256)
}
