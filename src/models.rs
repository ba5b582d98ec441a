use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

/// Prefix for ids synthesized locally by the mutation coordinator before the
/// server has assigned a real identity. Resync reconciliation never evicts
/// entries carrying this prefix.
pub const LOCAL_ID_PREFIX: &str = "local-";

pub type JsonMap = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Task,
    Category,
    RecurringTemplate,
}

impl EntityKind {
    /// Kinds mirrored into the EntityStore and covered by change-feed
    /// subscriptions. Templates are fetched on demand by the scheduler.
    pub const SYNCED: [EntityKind; 2] = [EntityKind::Task, EntityKind::Category];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Category => "category",
            Self::RecurringTemplate => "recurring-template",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriorityClass {
    Urgent,
    Important,
    Later,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub priority_class: PriorityClass,
    pub status: TaskStatus,
    pub category_id: Option<String>,
    pub recurring_template_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecurrencePattern {
    Daily,
    Weekly,
    Monthly,
    Custom {
        #[serde(rename = "intervalDays")]
        interval_days: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecurringTemplate {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub recurrence_pattern: RecurrencePattern,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeEventType {
    Insert,
    Update,
    Delete,
}

/// One notification from the remote change feed. Ephemeral: applied to the
/// store by the subscriber that receives it and then dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub entity_kind: EntityKind,
    pub event_type: ChangeEventType,
    pub entity_id: String,
    pub payload: JsonMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationOperation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationStatus {
    InFlight,
    Confirmed,
    Failed,
}

/// Bookkeeping entry for an optimistic write between issuance and its remote
/// outcome. Removed from the coordinator's table once confirmed or failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub mutation_id: String,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub operation: MutationOperation,
    pub submitted_at: DateTime<Utc>,
    pub status: MutationStatus,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Capacity of each subscription's event channel.
    pub event_channel_capacity: usize,
    /// First resubscription delay after a transport drop.
    pub resubscribe_initial_backoff: Duration,
    /// Ceiling for the exponential resubscription backoff.
    pub resubscribe_max_backoff: Duration,
    /// Bound on each scheduler-issued remote call.
    pub remote_timeout: Duration,
    /// How often the scheduler loop re-checks the daily run marker.
    pub scheduler_check_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: 256,
            resubscribe_initial_backoff: Duration::from_millis(500),
            resubscribe_max_backoff: Duration::from_secs(30),
            remote_timeout: Duration::from_secs(10),
            scheduler_check_interval: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_round_trips_through_kebab_case() {
        let json = serde_json::to_string(&EntityKind::RecurringTemplate).expect("serialize");
        assert_eq!(json, "\"recurring-template\"");
        let back: EntityKind = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, EntityKind::RecurringTemplate);
    }

    #[test]
    fn recurrence_pattern_custom_carries_interval_days() {
        let pattern = RecurrencePattern::Custom { interval_days: 3 };
        let json = serde_json::to_value(pattern).expect("serialize");
        assert_eq!(json["custom"]["intervalDays"], 3);

        let daily: RecurrencePattern = serde_json::from_str("\"daily\"").expect("deserialize");
        assert_eq!(daily, RecurrencePattern::Daily);
    }

    #[test]
    fn task_serializes_camel_case() {
        let task = Task {
            id: "t1".to_string(),
            user_id: "u1".to_string(),
            title: "Water the plants".to_string(),
            description: None,
            priority_class: PriorityClass::Later,
            status: TaskStatus::Pending,
            category_id: None,
            recurring_template_id: Some("r1".to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_value(&task).expect("serialize");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["recurringTemplateId"], "r1");
        assert_eq!(json["priorityClass"], "later");
    }
}
