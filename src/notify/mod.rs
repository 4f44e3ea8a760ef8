pub mod log;

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct NotificationData {
    pub run_id: String,
    pub success: bool,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationResult {
    Sent,
    Skipped,
}

/// Contract every notification transport implements. `is_critical` is
/// always `false` here by design — a failed notification must never fail
/// the backup run itself.
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_enabled(&self) -> bool;
    fn is_critical(&self) -> bool {
        false
    }
    fn send(&self, data: &NotificationData) -> Result<NotificationResult>;
}
