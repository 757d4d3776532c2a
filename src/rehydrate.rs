//! Startup rehydration — rebuild the pending-schedule queue from the store.
//!
//! Runs once at startup, after a restart or crash. Rows go straight into
//! the controller queue: no admission logic, no notifications, no
//! emergency handling. Unparseable rows are logged and skipped so one bad
//! document cannot hold the service down.

use crate::controller::Controller;
use crate::store::ScheduleDoc;
use crate::task::{Task, TaskData};
use chrono::NaiveDateTime;

/// Parse a schedule row's firing instant from its date and time fields.
pub fn parse_schedule_time(date: &str, time: &str) -> Result<NaiveDateTime, String> {
    let joined = format!("{} {}", date, time);
    NaiveDateTime::parse_from_str(&joined, "%Y-%m-%d %H:%M")
        .map_err(|_| format!("Invalid schedule time '{}'. Expected YYYY-MM-DD HH:MM", joined))
}

/// Build the task payload for a persisted schedule row.
fn task_data_from_doc(doc: &ScheduleDoc) -> TaskData {
    let mut data = TaskData::default();
    data.user = doc.user.clone();
    data.zones = doc.zones.clone();
    data.message = doc.message.clone();
    data.audio = doc.audio.clone();
    data.voice = doc.voice.clone();
    data.repeat = doc.repeat;
    data.date = Some(doc.date.clone());
    data.time = Some(doc.time.clone());
    data
}

/// Load every pending schedule into the controller queue. Returns how many
/// rows were rehydrated.
pub fn rehydrate_queue(controller: &Controller) -> usize {
    println!("[Rehydrate] Loading pending schedules from store...");
    let pending = match controller.store().pending_schedules() {
        Ok(rows) => rows,
        Err(e) => {
            eprintln!("[Rehydrate] Failed to load pending schedules: {}", e);
            return 0;
        }
    };

    let mut count = 0;
    for (id, doc) in pending {
        let scheduled_time = match parse_schedule_time(&doc.date, &doc.time) {
            Ok(t) => t,
            Err(e) => {
                eprintln!("[Rehydrate] Skipping {}: {}", id, e);
                continue;
            }
        };
        controller.enqueue_schedule(Task::schedule(id, scheduled_time, task_data_from_doc(&doc)));
        count += 1;
    }

    println!("[Rehydrate] Loaded {} pending tasks", count);
    count
}
