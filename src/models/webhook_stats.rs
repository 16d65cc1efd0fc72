use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::failed_webhook::WebhookStatus;

/// One `GROUP BY status, webhook_type` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCount {
    pub webhook_type: String,
    pub status: WebhookStatus,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTotals {
    pub pending: i64,
    pub processing: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub total: i64,
}

impl StatusTotals {
    fn add(&mut self, status: WebhookStatus, count: i64) {
        match status {
            WebhookStatus::Pending => self.pending += count,
            WebhookStatus::Processing => self.processing += count,
            WebhookStatus::Succeeded => self.succeeded += count,
            WebhookStatus::Failed => self.failed += count,
        }
        self.total += count;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookStatistics {
    #[serde(flatten)]
    pub totals: StatusTotals,
    pub by_type: BTreeMap<String, StatusTotals>,
}

impl WebhookStatistics {
    pub fn from_counts(rows: impl IntoIterator<Item = StatusCount>) -> Self {
        let mut stats = Self::default();
        for row in rows {
            stats.totals.add(row.status, row.count);
            stats
                .by_type
                .entry(row.webhook_type)
                .or_default()
                .add(row.status, row.count);
        }
        stats
    }
}
