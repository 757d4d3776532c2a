//! Scheduler loop — time-driven promotion of queued announcements.
//!
//! A dedicated worker ticks once per second: it runs the heartbeat
//! watchdog, promotes due schedules into the controller, emits recurring
//! instances, and once a day garbage-collects old log rows.

use crate::controller::Controller;
use crate::store::{ScheduleDoc, ScheduleStatus, Store};
use crate::task::{Repeat, Task};
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Seconds between cleanup passes.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// Maximum log rows deleted per cleanup pass.
const CLEANUP_BATCH: usize = 100;

/// Running scheduler worker. Dropping the handle leaves the thread running;
/// call `shutdown` for an orderly stop.
pub struct SchedulerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Start the scheduler worker.
pub fn spawn_scheduler(controller: Controller) -> SchedulerHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    let thread = std::thread::Builder::new()
        .name("scheduler".into())
        .spawn(move || {
            let mut last_cleanup = Instant::now();
            while !stop_flag.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_secs(1));

                controller.check_heartbeats();

                if last_cleanup.elapsed() > CLEANUP_INTERVAL {
                    let retention = controller.config().log_retention_days;
                    run_cleanup(controller.store().as_ref(), retention);
                    last_cleanup = Instant::now();
                }

                if let Some(promoted) = controller.promote_due() {
                    handle_recurrence(&controller, &promoted);
                }
            }
        })
        .expect("failed to spawn scheduler thread");

    SchedulerHandle {
        stop,
        thread: Some(thread),
    }
}

/// Delete log rows older than the retention window. Returns the number
/// deleted; failures are logged and the loop carries on.
pub fn run_cleanup(store: &dyn Store, retention_days: i64) -> usize {
    run_cleanup_at(store, retention_days, chrono::Local::now().naive_local())
}

/// Cleanup with an explicit clock. For testing.
pub fn run_cleanup_at(store: &dyn Store, retention_days: i64, now: NaiveDateTime) -> usize {
    let cutoff = now - ChronoDuration::days(retention_days);
    match store.delete_logs_before(cutoff, CLEANUP_BATCH) {
        Ok(0) => 0,
        Ok(count) => {
            println!("[Scheduler] Cleanup: deleted {} old log entries", count);
            count
        }
        Err(e) => {
            eprintln!("[Scheduler] Cleanup failed: {}", e);
            0
        }
    }
}

/// The next firing of a recurring schedule. Drift-free: the date advances
/// from the task's own scheduled date, and the wall-clock time is the
/// original time string, never "now".
pub fn next_occurrence(
    scheduled_date: NaiveDate,
    original_time: &str,
    repeat: Repeat,
) -> Option<(NaiveDate, NaiveDateTime)> {
    let interval = match repeat {
        Repeat::Once => return None,
        Repeat::Daily => ChronoDuration::days(1),
        Repeat::Weekly => ChronoDuration::weeks(1),
    };
    let time = NaiveTime::parse_from_str(original_time, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(original_time, "%H:%M:%S"))
        .ok()?;
    let next_date = scheduled_date + interval;
    Some((next_date, next_date.and_time(time)))
}

/// After a recurring schedule fires, persist and enqueue its next instance.
pub fn handle_recurrence(controller: &Controller, fired: &Task) {
    let repeat = fired.data.repeat;
    if repeat == Repeat::Once {
        return;
    }

    let original_time = fired
        .data
        .time
        .clone()
        .unwrap_or_else(|| fired.scheduled_time.format("%H:%M").to_string());

    let (next_date, next_time) =
        match next_occurrence(fired.scheduled_time.date(), &original_time, repeat) {
            Some(next) => next,
            None => {
                eprintln!(
                    "[Scheduler] Recurrence skipped for {}: bad time '{}'",
                    fired.id, original_time
                );
                return;
            }
        };

    let mut data = fired.data.clone();
    data.date = Some(next_date.format("%Y-%m-%d").to_string());
    data.time = Some(original_time.clone());

    let doc = ScheduleDoc {
        date: next_date.format("%Y-%m-%d").to_string(),
        time: original_time,
        message: data.message.clone(),
        audio: data.audio.clone(),
        voice: data.voice.clone(),
        zones: data.zones.clone(),
        repeat,
        status: ScheduleStatus::Pending,
        user: data.user.clone(),
    };

    match controller.store().add_schedule(&doc) {
        Ok(new_id) => {
            println!(
                "[Scheduler] Recurring instance {} for {} at {}",
                new_id, doc.date, doc.time
            );
            controller.enqueue_schedule(Task::schedule(new_id, next_time, data));
        }
        Err(e) => eprintln!("[Scheduler] Recurrence persist failed: {}", e),
    }
}
