//! Document store seam.
//!
//! The appliance persists schedules, the observable state document,
//! notifications and broadcast logs to an external document store. The
//! store supports concurrent per-document last-writer-wins writes and no
//! transactions; everything here is keyed JSON documents. `MemoryStore`
//! backs tests, `JsonStore` backs standalone deployments with one JSON
//! file per collection.

use crate::task::{Repeat, Task};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Lifecycle status of a schedule row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleStatus {
    Pending,
    Completed,
}

/// A persisted scheduled announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDoc {
    /// Firing date, YYYY-MM-DD.
    pub date: String,
    /// Firing time, HH:MM.
    pub time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Base64 audio blob for recorded announcements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, deserialize_with = "zones_field")]
    pub zones: Vec<String>,
    #[serde(default)]
    pub repeat: Repeat,
    pub status: ScheduleStatus,
    #[serde(default)]
    pub user: String,
}

// Older clients stored a single zone as a bare string.
fn zones_field<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ZonesRepr {
        One(String),
        Many(Vec<String>),
    }
    Ok(match ZonesRepr::deserialize(deserializer)? {
        ZonesRepr::One(zone) => vec![zone],
        ZonesRepr::Many(zones) => zones,
    })
}

/// The single well-known observable state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDoc {
    pub active_task: Option<Task>,
    pub priority: u8,
    pub mode: String,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

/// An append-only notification record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationDoc {
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(rename = "targetUser", default, skip_serializing_if = "Option::is_none")]
    pub target_user: Option<String>,
    #[serde(rename = "targetRole", default, skip_serializing_if = "Option::is_none")]
    pub target_role: Option<String>,
    #[serde(default)]
    pub read_by: Vec<String>,
    #[serde(default)]
    pub cleared_by: Vec<String>,
    pub timestamp: NaiveDateTime,
}

/// An append-only broadcast log row; the collection the daily GC trims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDoc {
    #[serde(default)]
    pub user: String,
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub details: String,
    pub timestamp: NaiveDateTime,
}

/// Batched (id, date, time) updates written by the queue time-shift.
pub type ScheduleTimeUpdate = (String, String, String);

/// External document store interface.
pub trait Store: Send + Sync {
    fn save_state(&self, state: &StateDoc) -> Result<(), String>;
    fn load_state(&self) -> Result<Option<StateDoc>, String>;

    /// Insert a schedule row; returns the assigned document id.
    fn add_schedule(&self, doc: &ScheduleDoc) -> Result<String, String>;
    /// Insert a schedule row under a caller-chosen id (rehydration tests).
    fn put_schedule(&self, id: &str, doc: &ScheduleDoc) -> Result<(), String>;
    fn pending_schedules(&self) -> Result<Vec<(String, ScheduleDoc)>, String>;
    fn get_schedule(&self, id: &str) -> Result<Option<ScheduleDoc>, String>;
    fn set_schedule_status(&self, id: &str, status: ScheduleStatus) -> Result<(), String>;
    /// Apply a batch of time-shift updates in one pass.
    fn update_schedule_times(&self, updates: &[ScheduleTimeUpdate]) -> Result<(), String>;
    fn delete_schedule(&self, id: &str) -> Result<(), String>;

    fn add_notification(&self, doc: &NotificationDoc) -> Result<(), String>;
    fn notifications(&self) -> Result<Vec<NotificationDoc>, String>;

    fn add_log(&self, doc: &LogDoc) -> Result<String, String>;
    /// Delete log rows older than `cutoff`, at most `limit` per pass.
    /// Returns the number deleted.
    fn delete_logs_before(&self, cutoff: NaiveDateTime, limit: usize) -> Result<usize, String>;
    fn log_count(&self) -> Result<usize, String>;
}

// ── In-memory store ──────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    state: Option<StateDoc>,
    schedules: BTreeMap<String, ScheduleDoc>,
    notifications: Vec<NotificationDoc>,
    logs: BTreeMap<String, LogDoc>,
}

/// A process-local store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn save_state(&self, state: &StateDoc) -> Result<(), String> {
        self.inner.lock().unwrap().state = Some(state.clone());
        Ok(())
    }

    fn load_state(&self) -> Result<Option<StateDoc>, String> {
        Ok(self.inner.lock().unwrap().state.clone())
    }

    fn add_schedule(&self, doc: &ScheduleDoc) -> Result<String, String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.inner
            .lock()
            .unwrap()
            .schedules
            .insert(id.clone(), doc.clone());
        Ok(id)
    }

    fn put_schedule(&self, id: &str, doc: &ScheduleDoc) -> Result<(), String> {
        self.inner
            .lock()
            .unwrap()
            .schedules
            .insert(id.to_string(), doc.clone());
        Ok(())
    }

    fn pending_schedules(&self) -> Result<Vec<(String, ScheduleDoc)>, String> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .schedules
            .iter()
            .filter(|(_, doc)| doc.status == ScheduleStatus::Pending)
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect())
    }

    fn get_schedule(&self, id: &str) -> Result<Option<ScheduleDoc>, String> {
        Ok(self.inner.lock().unwrap().schedules.get(id).cloned())
    }

    fn set_schedule_status(&self, id: &str, status: ScheduleStatus) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap();
        match inner.schedules.get_mut(id) {
            Some(doc) => {
                doc.status = status;
                Ok(())
            }
            None => Err(format!("Schedule '{}' not found", id)),
        }
    }

    fn update_schedule_times(&self, updates: &[ScheduleTimeUpdate]) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap();
        for (id, date, time) in updates {
            if let Some(doc) = inner.schedules.get_mut(id) {
                doc.date = date.clone();
                doc.time = time.clone();
            }
        }
        Ok(())
    }

    fn delete_schedule(&self, id: &str) -> Result<(), String> {
        self.inner.lock().unwrap().schedules.remove(id);
        Ok(())
    }

    fn add_notification(&self, doc: &NotificationDoc) -> Result<(), String> {
        self.inner.lock().unwrap().notifications.push(doc.clone());
        Ok(())
    }

    fn notifications(&self) -> Result<Vec<NotificationDoc>, String> {
        Ok(self.inner.lock().unwrap().notifications.clone())
    }

    fn add_log(&self, doc: &LogDoc) -> Result<String, String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.inner.lock().unwrap().logs.insert(id.clone(), doc.clone());
        Ok(id)
    }

    fn delete_logs_before(&self, cutoff: NaiveDateTime, limit: usize) -> Result<usize, String> {
        let mut inner = self.inner.lock().unwrap();
        let victims: Vec<String> = inner
            .logs
            .iter()
            .filter(|(_, doc)| doc.timestamp < cutoff)
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &victims {
            inner.logs.remove(id);
        }
        Ok(victims.len())
    }

    fn log_count(&self) -> Result<usize, String> {
        Ok(self.inner.lock().unwrap().logs.len())
    }
}

// ── JSON file store ──────────────────────────────────────────────────────────

/// One JSON file per collection under a store directory. Writes hold a
/// process-wide mutex; last writer wins, matching the store contract.
pub struct JsonStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStore {
    pub fn open(dir: &Path) -> Result<Self, String> {
        fs::create_dir_all(dir)
            .map_err(|e| format!("Cannot create store directory '{}': {}", dir.display(), e))?;
        Ok(JsonStore {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn read_collection<T: serde::de::DeserializeOwned + Default>(&self, name: &str) -> T {
        let path = self.file(name);
        if !path.exists() {
            return T::default();
        }
        match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(value) => value,
                Err(e) => {
                    eprintln!("Warning: corrupt store file '{}': {}", path.display(), e);
                    T::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: cannot read store file '{}': {}", path.display(), e);
                T::default()
            }
        }
    }

    fn write_collection<T: Serialize>(&self, name: &str, value: &T) -> Result<(), String> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| format!("Serialize error: {}", e))?;
        fs::write(self.file(name), json)
            .map_err(|e| format!("Write error for '{}': {}", name, e))
    }
}

impl Store for JsonStore {
    fn save_state(&self, state: &StateDoc) -> Result<(), String> {
        let _guard = self.write_lock.lock().unwrap();
        self.write_collection("state.json", state)
    }

    fn load_state(&self) -> Result<Option<StateDoc>, String> {
        let path = self.file("state.json");
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path).map_err(|e| format!("Read error: {}", e))?;
        serde_json::from_str(&data)
            .map(Some)
            .map_err(|e| format!("Corrupt state document: {}", e))
    }

    fn add_schedule(&self, doc: &ScheduleDoc) -> Result<String, String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.put_schedule(&id, doc)?;
        Ok(id)
    }

    fn put_schedule(&self, id: &str, doc: &ScheduleDoc) -> Result<(), String> {
        let _guard = self.write_lock.lock().unwrap();
        let mut all: BTreeMap<String, ScheduleDoc> = self.read_collection("schedules.json");
        all.insert(id.to_string(), doc.clone());
        self.write_collection("schedules.json", &all)
    }

    fn pending_schedules(&self) -> Result<Vec<(String, ScheduleDoc)>, String> {
        let all: BTreeMap<String, ScheduleDoc> = self.read_collection("schedules.json");
        Ok(all
            .into_iter()
            .filter(|(_, doc)| doc.status == ScheduleStatus::Pending)
            .collect())
    }

    fn get_schedule(&self, id: &str) -> Result<Option<ScheduleDoc>, String> {
        let all: BTreeMap<String, ScheduleDoc> = self.read_collection("schedules.json");
        Ok(all.get(id).cloned())
    }

    fn set_schedule_status(&self, id: &str, status: ScheduleStatus) -> Result<(), String> {
        let _guard = self.write_lock.lock().unwrap();
        let mut all: BTreeMap<String, ScheduleDoc> = self.read_collection("schedules.json");
        match all.get_mut(id) {
            Some(doc) => {
                doc.status = status;
                self.write_collection("schedules.json", &all)
            }
            None => Err(format!("Schedule '{}' not found", id)),
        }
    }

    fn update_schedule_times(&self, updates: &[ScheduleTimeUpdate]) -> Result<(), String> {
        let _guard = self.write_lock.lock().unwrap();
        let mut all: BTreeMap<String, ScheduleDoc> = self.read_collection("schedules.json");
        for (id, date, time) in updates {
            if let Some(doc) = all.get_mut(id) {
                doc.date = date.clone();
                doc.time = time.clone();
            }
        }
        self.write_collection("schedules.json", &all)
    }

    fn delete_schedule(&self, id: &str) -> Result<(), String> {
        let _guard = self.write_lock.lock().unwrap();
        let mut all: BTreeMap<String, ScheduleDoc> = self.read_collection("schedules.json");
        all.remove(id);
        self.write_collection("schedules.json", &all)
    }

    fn add_notification(&self, doc: &NotificationDoc) -> Result<(), String> {
        let _guard = self.write_lock.lock().unwrap();
        let mut all: Vec<NotificationDoc> = self.read_collection("notifications.json");
        all.push(doc.clone());
        self.write_collection("notifications.json", &all)
    }

    fn notifications(&self) -> Result<Vec<NotificationDoc>, String> {
        Ok(self.read_collection("notifications.json"))
    }

    fn add_log(&self, doc: &LogDoc) -> Result<String, String> {
        let _guard = self.write_lock.lock().unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        let mut all: BTreeMap<String, LogDoc> = self.read_collection("logs.json");
        all.insert(id.clone(), doc.clone());
        self.write_collection("logs.json", &all)?;
        Ok(id)
    }

    fn delete_logs_before(&self, cutoff: NaiveDateTime, limit: usize) -> Result<usize, String> {
        let _guard = self.write_lock.lock().unwrap();
        let mut all: BTreeMap<String, LogDoc> = self.read_collection("logs.json");
        let victims: Vec<String> = all
            .iter()
            .filter(|(_, doc)| doc.timestamp < cutoff)
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &victims {
            all.remove(id);
        }
        self.write_collection("logs.json", &all)?;
        Ok(victims.len())
    }

    fn log_count(&self) -> Result<usize, String> {
        let all: BTreeMap<String, LogDoc> = self.read_collection("logs.json");
        Ok(all.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_schedule() -> ScheduleDoc {
        ScheduleDoc {
            date: "2024-05-01".to_string(),
            time: "08:00".to_string(),
            message: Some("Morning assembly".to_string()),
            audio: None,
            voice: Some("female".to_string()),
            zones: vec!["Library".to_string()],
            repeat: Repeat::Daily,
            status: ScheduleStatus::Pending,
            user: "u1".to_string(),
        }
    }

    fn ts(date: (i32, u32, u32), time: (u32, u32)) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(date.0, date.1, date.2)
            .unwrap()
            .and_hms_opt(time.0, time.1, 0)
            .unwrap()
    }

    #[test]
    fn memory_schedule_lifecycle() {
        let store = MemoryStore::new();
        let id = store.add_schedule(&sample_schedule()).unwrap();
        assert_eq!(store.pending_schedules().unwrap().len(), 1);

        store
            .set_schedule_status(&id, ScheduleStatus::Completed)
            .unwrap();
        assert!(store.pending_schedules().unwrap().is_empty());
        assert_eq!(
            store.get_schedule(&id).unwrap().unwrap().status,
            ScheduleStatus::Completed
        );
    }

    #[test]
    fn memory_batch_time_update() {
        let store = MemoryStore::new();
        let id = store.add_schedule(&sample_schedule()).unwrap();
        store
            .update_schedule_times(&[(id.clone(), "2024-05-02".into(), "08:03".into())])
            .unwrap();
        let doc = store.get_schedule(&id).unwrap().unwrap();
        assert_eq!(doc.date, "2024-05-02");
        assert_eq!(doc.time, "08:03");
    }

    #[test]
    fn memory_log_gc_respects_cutoff_and_limit() {
        let store = MemoryStore::new();
        for day in 1..=5 {
            store
                .add_log(&LogDoc {
                    user: "u1".into(),
                    task_type: "voice".into(),
                    action: "START".into(),
                    details: String::new(),
                    timestamp: ts((2024, 5, day), (12, 0)),
                })
                .unwrap();
        }
        // Cutoff keeps day 4 and 5
        let deleted = store
            .delete_logs_before(ts((2024, 5, 4), (0, 0)), 100)
            .unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(store.log_count().unwrap(), 2);

        // Limit caps a pass
        for day in 1..=3 {
            store
                .add_log(&LogDoc {
                    user: "u1".into(),
                    task_type: "voice".into(),
                    action: "START".into(),
                    details: String::new(),
                    timestamp: ts((2024, 4, day), (12, 0)),
                })
                .unwrap();
        }
        let deleted = store
            .delete_logs_before(ts((2024, 5, 4), (0, 0)), 2)
            .unwrap();
        assert_eq!(deleted, 2);
    }

    #[test]
    fn schedule_doc_accepts_bare_string_zones() {
        let doc: ScheduleDoc = serde_json::from_str(
            r#"{"date":"2024-05-01","time":"08:00","zones":"Library","status":"Pending"}"#,
        )
        .unwrap();
        assert_eq!(doc.zones, vec!["Library"]);
        assert_eq!(doc.repeat, Repeat::Once);
    }

    #[test]
    fn json_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("store_{}", uuid::Uuid::new_v4().simple()));
        let store = JsonStore::open(&dir).unwrap();

        let id = store.add_schedule(&sample_schedule()).unwrap();
        assert_eq!(store.pending_schedules().unwrap().len(), 1);
        store
            .set_schedule_status(&id, ScheduleStatus::Completed)
            .unwrap();
        assert!(store.pending_schedules().unwrap().is_empty());

        store
            .save_state(&StateDoc {
                active_task: None,
                priority: 0,
                mode: "IDLE".to_string(),
                timestamp: ts((2024, 5, 1), (8, 0)),
            })
            .unwrap();
        let state = store.load_state().unwrap().unwrap();
        assert_eq!(state.mode, "IDLE");

        store
            .add_notification(&NotificationDoc {
                title: "Device Status".into(),
                message: "online".into(),
                kind: NotificationKind::Success,
                target_user: None,
                target_role: Some("admin".into()),
                read_by: vec![],
                cleared_by: vec![],
                timestamp: ts((2024, 5, 1), (8, 0)),
            })
            .unwrap();
        assert_eq!(store.notifications().unwrap().len(), 1);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn notification_doc_uses_camel_case_targets() {
        let doc = NotificationDoc {
            title: "t".into(),
            message: "m".into(),
            kind: NotificationKind::Warning,
            target_user: Some("u1".into()),
            target_role: Some("admin".into()),
            read_by: vec![],
            cleared_by: vec![],
            timestamp: ts((2024, 5, 1), (8, 0)),
        };
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"targetUser\":\"u1\""));
        assert!(json.contains("\"targetRole\":\"admin\""));
        assert!(json.contains("\"type\":\"warning\""));
    }
}
