use anyhow::Result;

use super::{NotificationData, NotificationResult, Notifier};

/// Always-available reference implementation: writes the notification to
/// the structured log rather than an external transport. Richer transports
/// (webhook, email, ...) implement the same trait but live outside this
/// crate's scope.
pub struct LogNotifier {
    enabled: bool,
}

impl LogNotifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn send(&self, data: &NotificationData) -> Result<NotificationResult> {
        if !self.enabled {
            return Ok(NotificationResult::Skipped);
        }
        if data.success {
            tracing::info!(run_id = %data.run_id, summary = %data.summary, "backup succeeded");
        } else {
            tracing::error!(run_id = %data.run_id, summary = %data.summary, "backup failed");
        }
        Ok(NotificationResult::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_notifier_skips() {
        let n = LogNotifier::new(false);
        let data = NotificationData {
            run_id: "r1".into(),
            success: true,
            summary: "ok".into(),
        };
        assert_eq!(n.send(&data).unwrap(), NotificationResult::Skipped);
    }

    #[test]
    fn enabled_notifier_sends() {
        let n = LogNotifier::new(true);
        let data = NotificationData {
            run_id: "r1".into(),
            success: false,
            summary: "boom".into(),
        };
        assert_eq!(n.send(&data).unwrap(), NotificationResult::Sent);
    }

    #[test]
    fn never_critical() {
        let n = LogNotifier::new(true);
        assert!(!n.is_critical());
    }
}
