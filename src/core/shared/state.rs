use std::sync::Arc;

use tokio::sync::broadcast;

use crate::audit::AuditLog;
use crate::core::config::AppConfig;
use crate::mailbox::ConfigStore;
use crate::notify::TicketActivity;
use crate::scheduler::MailboxSweeper;

/// Shared handles for the HTTP surface. Handlers reach persistence through
/// the same trait objects the sweeper uses, so tests can swap in the
/// in-memory fakes.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub configs: Arc<dyn ConfigStore>,
    pub audit: Arc<dyn AuditLog>,
    pub sweeper: Arc<MailboxSweeper>,
    pub activity: broadcast::Sender<TicketActivity>,
}
