use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Priority level for broadcast tasks (higher wins in conflicts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const IDLE: Priority = Priority(0);
    pub const BACKGROUND: Priority = Priority(10);
    pub const SCHEDULE: Priority = Priority(20);
    pub const REALTIME: Priority = Priority(30);
    pub const EMERGENCY: Priority = Priority(100);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::IDLE
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of broadcast a task carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Live microphone broadcast streamed in PCM chunks.
    Voice,
    /// One-shot synthesized text announcement.
    Text,
    /// Timed announcement promoted from the queue.
    Schedule,
    /// Background music.
    Background,
    /// Emergency alert with siren.
    Emergency,
}

impl TaskType {
    /// The priority this type carries when submitted through the request surface.
    pub fn default_priority(&self) -> Priority {
        match self {
            TaskType::Voice | TaskType::Text => Priority::REALTIME,
            TaskType::Schedule => Priority::SCHEDULE,
            TaskType::Background => Priority::BACKGROUND,
            TaskType::Emergency => Priority::EMERGENCY,
        }
    }

    /// Parse a type from a string (case-insensitive).
    pub fn from_str_loose(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "voice" => Ok(TaskType::Voice),
            "text" => Ok(TaskType::Text),
            "schedule" => Ok(TaskType::Schedule),
            "background" => Ok(TaskType::Background),
            "emergency" => Ok(TaskType::Emergency),
            _ => Err(format!(
                "Unknown task type '{}'. Expected: voice, text, schedule, background, emergency",
                s
            )),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::Voice => write!(f, "voice"),
            TaskType::Text => write!(f, "text"),
            TaskType::Schedule => write!(f, "schedule"),
            TaskType::Background => write!(f, "background"),
            TaskType::Emergency => write!(f, "emergency"),
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Playing,
    Interrupted,
    Completed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Playing => write!(f, "playing"),
            TaskStatus::Interrupted => write!(f, "interrupted"),
            TaskStatus::Completed => write!(f, "completed"),
        }
    }
}

/// How often a scheduled announcement repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Repeat {
    #[default]
    Once,
    Daily,
    Weekly,
}

impl Repeat {
    /// Parse a repeat mode; anything unrecognized is treated as one-shot.
    pub fn from_str_loose(s: &str) -> Repeat {
        match s.to_lowercase().as_str() {
            "daily" => Repeat::Daily,
            "weekly" => Repeat::Weekly,
            _ => Repeat::Once,
        }
    }
}

impl fmt::Display for Repeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repeat::Once => write!(f, "once"),
            Repeat::Daily => write!(f, "daily"),
            Repeat::Weekly => write!(f, "weekly"),
        }
    }
}

/// Recognized request options carried by a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskData {
    /// Requester identity; ownership key for stop/seek permission checks.
    #[serde(default)]
    pub user: String,
    /// Requested zone names, or the "All Zones" sentinel.
    #[serde(default)]
    pub zones: Vec<String>,
    /// Text to speak, background music filename, or encoded payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Announcement text for schedules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Base64 audio blob for recorded schedules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    /// Voice alias: female, male, or an explicit model stem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    /// Seek offset in seconds for background music.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    /// Opaque string tying the task to a client session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default)]
    pub repeat: Repeat,
    /// Original wall-clock date (YYYY-MM-DD) for recurrence drift prevention.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Original wall-clock time (HH:MM) for recurrence drift prevention.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

/// The unit of broadcast work flowing through the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: NaiveDateTime,
    pub scheduled_time: NaiveDateTime,
    pub data: TaskData,
}

impl Task {
    /// Create a pending task due immediately, with a fresh identifier.
    pub fn new(task_type: TaskType, data: TaskData) -> Self {
        Self::new_at(task_type, data, chrono::Local::now().naive_local())
    }

    /// Create a pending task with an explicit creation instant.
    pub fn new_at(task_type: TaskType, data: TaskData, now: NaiveDateTime) -> Self {
        Task {
            id: uuid::Uuid::new_v4().to_string(),
            task_type,
            priority: task_type.default_priority(),
            status: TaskStatus::Pending,
            created_at: now,
            scheduled_time: now,
            data,
        }
    }

    /// Create a schedule task with a known identifier and firing time.
    pub fn schedule(id: String, scheduled_time: NaiveDateTime, data: TaskData) -> Self {
        Task {
            id,
            task_type: TaskType::Schedule,
            priority: Priority::SCHEDULE,
            status: TaskStatus::Pending,
            created_at: chrono::Local::now().naive_local(),
            scheduled_time,
            data,
        }
    }
}

/// Users whose name alone carries admin override rights.
pub const ADMIN_USERS: &[&str] = &["System", "System Admin", "Admin"];

/// Returns true if this user may override ownership checks.
pub fn is_admin(user: &str) -> bool {
    ADMIN_USERS.contains(&user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ladder_ordering() {
        assert!(Priority::EMERGENCY > Priority::REALTIME);
        assert!(Priority::REALTIME > Priority::SCHEDULE);
        assert!(Priority::SCHEDULE > Priority::BACKGROUND);
        assert!(Priority::BACKGROUND > Priority::IDLE);
    }

    #[test]
    fn task_type_default_priorities() {
        assert_eq!(TaskType::Voice.default_priority(), Priority::REALTIME);
        assert_eq!(TaskType::Text.default_priority(), Priority::REALTIME);
        assert_eq!(TaskType::Schedule.default_priority(), Priority::SCHEDULE);
        assert_eq!(TaskType::Background.default_priority(), Priority::BACKGROUND);
        assert_eq!(TaskType::Emergency.default_priority(), Priority::EMERGENCY);
    }

    #[test]
    fn task_type_from_str() {
        assert_eq!(TaskType::from_str_loose("VOICE").unwrap(), TaskType::Voice);
        assert_eq!(
            TaskType::from_str_loose("background").unwrap(),
            TaskType::Background
        );
        assert!(TaskType::from_str_loose("bogus").is_err());
    }

    #[test]
    fn repeat_from_str_defaults_to_once() {
        assert_eq!(Repeat::from_str_loose("daily"), Repeat::Daily);
        assert_eq!(Repeat::from_str_loose("WEEKLY"), Repeat::Weekly);
        assert_eq!(Repeat::from_str_loose("once"), Repeat::Once);
        assert_eq!(Repeat::from_str_loose("whenever"), Repeat::Once);
    }

    #[test]
    fn new_tasks_get_unique_ids() {
        let a = Task::new(TaskType::Text, TaskData::default());
        let b = Task::new(TaskType::Text, TaskData::default());
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, TaskStatus::Pending);
    }

    #[test]
    fn task_serialization_roundtrip() {
        let mut data = TaskData::default();
        data.user = "u1".to_string();
        data.zones = vec!["Library".to_string()];
        data.content = Some("hello".to_string());
        let task = Task::new(TaskType::Text, data);
        let json = serde_json::to_string(&task).unwrap();
        let loaded: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.task_type, TaskType::Text);
        assert_eq!(loaded.data.user, "u1");
        assert_eq!(loaded.data.content.as_deref(), Some("hello"));
    }

    #[test]
    fn task_data_defaults_when_missing_from_json() {
        let json = r#"{"user":"u1","zones":[]}"#;
        let data: TaskData = serde_json::from_str(json).unwrap();
        assert_eq!(data.repeat, Repeat::Once);
        assert!(data.content.is_none());
        assert!(data.start_time.is_none());
    }

    #[test]
    fn admin_users_recognized() {
        assert!(is_admin("System"));
        assert!(is_admin("System Admin"));
        assert!(is_admin("Admin"));
        assert!(!is_admin("u1"));
        assert!(!is_admin("admin"));
    }
}
