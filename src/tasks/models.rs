use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// key: generation-task-status
/// `Succeeded` and `Failed` are terminal. Once a row carries either, no later event may change it.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(TaskStatus::Pending),
            "PROCESSING" => Some(TaskStatus::Processing),
            "SUCCEEDED" => Some(TaskStatus::Succeeded),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

/// key: generation-platform -> upstream provider identity
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Replicate,
    Ark,
    Runway,
    Luma,
    Kie,
    Hedra,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Platform::Replicate,
        Platform::Ark,
        Platform::Runway,
        Platform::Luma,
        Platform::Kie,
        Platform::Hedra,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Replicate => "replicate",
            Platform::Ark => "ark",
            Platform::Runway => "runway",
            Platform::Luma => "luma",
            Platform::Kie => "kie",
            Platform::Hedra => "hedra",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Platform::ALL
            .into_iter()
            .find(|platform| platform.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    #[default]
    Video,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "image" => Some(MediaType::Image),
            "video" => Some(MediaType::Video),
            _ => None,
        }
    }
}

/// Normalized request parameters captured at submission. Persisted with the task so that a
/// fallback provider can be resubmitted with the same inputs.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<Value>,
}

impl TaskPayload {
    /// The first reference image, whether given singly or as a list.
    pub fn primary_image(&self) -> Option<&str> {
        self.image
            .as_deref()
            .or_else(|| self.images.first().map(String::as_str))
            .filter(|url| !url.trim().is_empty())
    }
}

/// key: generation-task-model
/// One user-initiated generation job, mirrored against an external provider job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationTask {
    pub id: Uuid,
    pub user_id: Uuid,
    pub platform: Platform,
    pub model: String,
    pub external_task_id: String,
    pub previous_external_task_id: Option<String>,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    pub output: Option<String>,
    /// Price quoted at submission; charged on success.
    pub quoted_cost: i64,
    /// Final charge, written only at the terminal transition.
    pub cost: Option<i64>,
    pub media_type: MediaType,
    pub tool: String,
    pub progress: Option<i32>,
    pub failure: Option<String>,
    pub failure_code: Option<String>,
    pub settlement_warning: Option<String>,
    pub created_at: DateTime<Utc>,
    /// When the current provider job was submitted. Reset by a fallback reroute.
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewGenerationTask {
    pub user_id: Uuid,
    pub platform: Platform,
    pub model: String,
    pub external_task_id: String,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    pub quoted_cost: i64,
    pub media_type: MediaType,
    pub tool: String,
}

/// key: reservation-mapping
/// Credits set aside for a provider job whose charge is deferred to completion. Written in the
/// same transaction as its task.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReservationMapping {
    pub external_task_id: String,
    pub task_id: Uuid,
    pub user_id: Uuid,
    pub reserved_credits: i64,
    pub output_locator: Option<String>,
    pub metadata: Value,
    pub outcome: Option<ReservationOutcome>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReservationOutcome {
    Committed,
    Released,
}

impl ReservationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationOutcome::Committed => "committed",
            ReservationOutcome::Released => "released",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "committed" => Some(ReservationOutcome::Committed),
            "released" => Some(ReservationOutcome::Released),
            _ => None,
        }
    }
}

/// Terminal transition requested against a non-terminal row.
#[derive(Clone, Debug, PartialEq)]
pub enum TerminalUpdate {
    Succeeded {
        output: String,
    },
    Failed {
        failure: Option<String>,
        failure_code: Option<String>,
    },
}

/// Rewrites an in-flight row to point at a fallback provider job.
/// Applies only while the row still carries `expected_external_task_id` and has never been
/// rerouted, so concurrent failure deliveries for the same job reroute at most once.
#[derive(Clone, Debug)]
pub struct RerouteUpdate {
    pub expected_external_task_id: String,
    pub platform: Platform,
    pub model: String,
    pub external_task_id: String,
    pub payload: TaskPayload,
}

/// Selection applied when listing a user's tasks.
#[derive(Clone, Debug, Default)]
pub struct TaskFilter {
    pub task_ids: Vec<Uuid>,
    pub statuses: Vec<TaskStatus>,
    pub tool: Option<String>,
    pub media_type: MediaType,
}

impl TaskFilter {
    pub fn matches(&self, task: &GenerationTask) -> bool {
        (self.task_ids.is_empty() || self.task_ids.contains(&task.id))
            && (self.statuses.is_empty() || self.statuses.contains(&task.status))
            && self.tool.as_deref().map_or(true, |tool| task.tool == tool)
            && task.media_type == self.media_type
    }
}

/// Selection of in-flight tasks handed to the reconciler.
#[derive(Clone, Debug)]
pub struct InFlightFilter {
    pub platform: Platform,
    pub user_id: Option<Uuid>,
    pub submitted_before: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl InFlightFilter {
    pub fn matches(&self, task: &GenerationTask) -> bool {
        !task.status.is_terminal()
            && task.platform == self.platform
            && self.user_id.map_or(true, |user_id| task.user_id == user_id)
            && self
                .submitted_before
                .map_or(true, |cutoff| task.submitted_at < cutoff)
    }
}

/// A persisted output row surfaced as `generation_id` on queries.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GenerationRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub task_id: Uuid,
    pub media_type: MediaType,
    pub url: String,
    pub tool: String,
    pub model: String,
    pub prompt: Option<String>,
    pub meta_data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_column_text() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("TIMEOUT"), None);
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }

    #[test]
    fn platform_parse_ignores_case() {
        assert_eq!(Platform::parse("Replicate"), Some(Platform::Replicate));
        assert_eq!(Platform::parse(" hedra "), Some(Platform::Hedra));
        assert_eq!(Platform::parse("fal"), None);
    }

    #[test]
    fn primary_image_falls_back_to_list() {
        let payload = TaskPayload {
            images: vec!["https://cdn.example/a.png".into()],
            ..TaskPayload::default()
        };
        assert_eq!(payload.primary_image(), Some("https://cdn.example/a.png"));
        let blank = TaskPayload {
            image: Some("  ".into()),
            ..TaskPayload::default()
        };
        assert_eq!(blank.primary_image(), None);
    }
}
