use crate::store::{NotificationDoc, NotificationKind, StateDoc, Store};
use crate::task::{Priority, Task, TaskType};
use std::fmt;
use std::sync::Arc;

/// Observable system mode, derived from the active task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMode {
    Idle,
    Broadcast,
    Schedule,
    Background,
    Emergency,
}

impl SystemMode {
    /// The mode a playing task puts the system in.
    pub fn for_task(task: &Task) -> Self {
        match task.task_type {
            TaskType::Emergency => SystemMode::Emergency,
            TaskType::Schedule => SystemMode::Schedule,
            TaskType::Background => SystemMode::Background,
            TaskType::Voice | TaskType::Text => SystemMode::Broadcast,
        }
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemMode::Idle => write!(f, "IDLE"),
            SystemMode::Broadcast => write!(f, "BROADCAST"),
            SystemMode::Schedule => write!(f, "SCHEDULE"),
            SystemMode::Background => write!(f, "BACKGROUND"),
            SystemMode::Emergency => write!(f, "EMERGENCY"),
        }
    }
}

/// Mirrors controller transitions into the store and emits notifications.
/// Store failures are logged; in-memory state stays authoritative and the
/// next transition writes again.
#[derive(Clone)]
pub struct StatePublisher {
    store: Arc<dyn Store>,
}

impl StatePublisher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        StatePublisher { store }
    }

    /// Write the observable state document for a transition.
    pub fn publish(&self, task: Option<&Task>, priority: Priority, mode: SystemMode) {
        let doc = StateDoc {
            active_task: task.cloned(),
            priority: priority.0,
            mode: mode.to_string(),
            timestamp: chrono::Local::now().naive_local(),
        };
        if let Err(e) = self.store.save_state(&doc) {
            eprintln!("[Publisher] State write failed: {}", e);
        }
    }

    /// Publish the idle state.
    pub fn publish_idle(&self) {
        self.publish(None, Priority::IDLE, SystemMode::Idle);
    }

    /// Emit a notification record. Write failures are logged and swallowed.
    pub fn notify(
        &self,
        title: &str,
        message: &str,
        kind: NotificationKind,
        target_user: Option<&str>,
        target_role: Option<&str>,
    ) {
        let doc = NotificationDoc {
            title: title.to_string(),
            message: message.to_string(),
            kind,
            target_user: target_user.map(str::to_string),
            target_role: target_role.map(str::to_string),
            read_by: Vec::new(),
            cleared_by: Vec::new(),
            timestamp: chrono::Local::now().naive_local(),
        };
        println!("[Notification] {}: {}", title, message);
        if let Err(e) = self.store.add_notification(&doc) {
            eprintln!("[Publisher] Notification write failed: {}", e);
        }
    }
}
