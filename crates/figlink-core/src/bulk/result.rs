//! Aggregate outcome of a bulk command.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of one fanned-out item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Position in the fan-out.
    pub index: usize,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-item outcomes in fan-out order, with counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkResult {
    pub outcomes: Vec<ItemOutcome>,
    pub success_count: usize,
    pub error_count: usize,
    /// Items the plan called for; more than `outcomes.len()` after a
    /// fail-fast abort.
    pub planned: usize,
    /// A failure stopped the remaining items.
    pub aborted: bool,
}

impl BulkResult {
    pub fn with_planned(planned: usize) -> Self {
        Self {
            planned,
            ..Self::default()
        }
    }

    pub fn record_success(&mut self, index: usize, data: Value) {
        self.success_count += 1;
        self.outcomes.push(ItemOutcome {
            index,
            success: true,
            data: Some(data),
            error: None,
        });
    }

    pub fn record_failure(&mut self, index: usize, error: impl Into<String>) {
        self.error_count += 1;
        self.outcomes.push(ItemOutcome {
            index,
            success: false,
            data: None,
            error: Some(error.into()),
        });
    }

    /// Items actually attempted.
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.error_count == 0 && !self.aborted
    }

    /// Outcomes that failed, for reporting.
    pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.success)
    }
}
