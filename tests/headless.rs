//! Headless integration tests for zonecast.
//!
//! These exercise the controller end-to-end with the silent playback
//! backend and the in-memory store — no audio hardware, no external
//! binaries. Explicit-clock variants drive every time-dependent path.

use chrono::{NaiveDate, NaiveDateTime};
use std::time::{Duration, Instant};
use zonecast::controller::Controller;
use zonecast::rehydrate;
use zonecast::scheduler;
use zonecast::store::{ScheduleDoc, ScheduleStatus};
use zonecast::task::{Repeat, Task, TaskData, TaskStatus, TaskType};
use zonecast::zones::Channel;

fn make_controller() -> Controller {
    Controller::new_test()
}

fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 1)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

fn task(task_type: TaskType, user: &str, zones: &[&str]) -> Task {
    let mut data = TaskData::default();
    data.user = user.to_string();
    data.zones = zones.iter().map(|z| z.to_string()).collect();
    if task_type == TaskType::Text {
        data.content = Some("attention please".to_string());
    }
    if task_type == TaskType::Background {
        data.content = Some("song.mp3".to_string());
    }
    Task::new_at(task_type, data, at(12, 0, 0))
}

fn schedule_row(date: &str, time: &str, repeat: Repeat) -> ScheduleDoc {
    ScheduleDoc {
        date: date.to_string(),
        time: time.to_string(),
        message: Some("Morning assembly".to_string()),
        audio: None,
        voice: Some("female".to_string()),
        zones: vec!["Library".to_string()],
        repeat,
        status: ScheduleStatus::Pending,
        user: "u1".to_string(),
    }
}

/// Let detached audio dispatch workers run.
fn settle() {
    std::thread::sleep(Duration::from_millis(120));
}

// ── S1: emergency beats live voice ────────────────────────────────────────

#[test]
fn emergency_preempts_live_voice() {
    let c = make_controller();

    let voice = task(TaskType::Voice, "u1", &["Library"]);
    let voice_id = voice.id.clone();
    assert!(c.request_playback_at(voice, at(12, 0, 0)));
    settle(); // chime + stream pipes open on a worker
    assert!(c.engine().open_stream_count() > 0);

    let emergency = task(TaskType::Emergency, "admin", &[]);
    assert!(c.request_playback_at(emergency, at(12, 0, 10)));

    assert!(c.emergency_mode());
    assert!(c.engine().siren_active());
    assert_eq!(c.engine().open_stream_count(), 0);
    // The voice task was hard-killed, not suspended or queued
    assert!(c.suspended_task().is_none());
    assert!(c.queued_tasks().iter().all(|t| t.id != voice_id));

    // Everything below emergency is locked out
    assert!(!c.request_playback_at(task(TaskType::Voice, "u1", &["Library"]), at(12, 0, 20)));
}

#[test]
fn emergency_latches_after_script_until_authorized_stop() {
    let c = make_controller();
    c.request_playback_at(task(TaskType::Emergency, "chief", &[]), at(12, 0, 0));
    settle(); // script runs (test config collapses the lead and ramp)

    // Script finished: task slot empty, emergency still armed
    assert!(c.emergency_mode());
    assert_eq!(c.active_emergency_user().as_deref(), Some("chief"));

    // A bystander cannot clear it; the owner can
    assert!(!c.stop_task(None, None, "bystander"));
    assert!(c.stop_task(None, None, "chief"));
    assert!(!c.emergency_mode());
    settle();
    assert!(!c.engine().siren_active());
}

// ── S2: schedule time-shift ───────────────────────────────────────────────

#[test]
fn voice_interrupt_shifts_schedules_uniformly() {
    let c = make_controller();
    c.request_playback_at(
        Task::schedule("noon".into(), at(12, 0, 0), TaskData::default()),
        at(11, 50, 0),
    );
    c.request_playback_at(
        Task::schedule("five-past".into(), at(12, 5, 0), TaskData::default()),
        at(11, 50, 1),
    );

    let voice = task(TaskType::Voice, "u1", &["Library"]);
    let voice_id = voice.id.clone();
    c.request_playback_at(voice, at(11, 59, 30));
    c.stop_task_at(Some(&voice_id), None, "u1", at(12, 1, 0));

    // 90 s of interruption applied to both, order preserved
    let queue = c.queued_tasks();
    assert_eq!(queue[0].id, "noon");
    assert_eq!(queue[0].scheduled_time, at(12, 1, 30));
    assert_eq!(queue[1].id, "five-past");
    assert_eq!(queue[1].scheduled_time, at(12, 6, 30));

    // The shifted noon schedule fires first
    let promoted = c.promote_due_at(at(12, 1, 31)).unwrap();
    assert_eq!(promoted.id, "noon");
}

// ── S3: background resume across interruption ─────────────────────────────

#[test]
fn background_resumes_near_interruption_offset() {
    let c = make_controller();
    c.request_playback_at(task(TaskType::Background, "u1", &["Playground"]), at(12, 0, 0));
    // Stand in for 30 s of listening
    assert!(c.seek_background_music("u1", 30.0));

    let text = task(TaskType::Text, "u2", &["Library"]);
    let text_id = text.id.clone();
    c.request_playback_at(text, at(12, 0, 30));
    assert!(c.suspended_task().is_some());
    assert!(c.background_resume_secs() >= 30.0);

    // Text completes; music resumes from where it left off
    assert!(c.complete_task(&text_id));
    let resumed = c.current_task().unwrap();
    assert_eq!(resumed.task_type, TaskType::Background);
    assert_eq!(resumed.data.content.as_deref(), Some("song.mp3"));
    settle();
    let journal = c.engine().journal();
    let last_music = journal
        .iter()
        .filter(|e| e.starts_with("music"))
        .last()
        .expect("music restarted");
    assert!(last_music.contains("start=30"), "journal: {}", last_music);
}

#[test]
fn same_track_restart_keeps_offset_different_track_resets() {
    let c = make_controller();
    c.request_playback_at(task(TaskType::Background, "u1", &["Playground"]), at(12, 0, 0));
    c.seek_background_music("u1", 45.0);
    c.stop_task_at(None, Some("background"), "u1", at(12, 1, 0));
    assert!(c.background_resume_secs() >= 45.0);

    // Same content, no explicit seek: saved offset survives
    c.request_playback_at(task(TaskType::Background, "u1", &["Playground"]), at(12, 2, 0));
    assert!(c.background_resume_secs() >= 45.0);

    // A different track clears it
    let mut other = task(TaskType::Background, "u1", &["Playground"]);
    other.data.content = Some("other.mp3".to_string());
    c.request_playback_at(other, at(12, 3, 0));
    assert_eq!(c.background_resume_secs(), 0.0);
}

// ── S4: daily recurrence ──────────────────────────────────────────────────

#[test]
fn daily_schedule_emits_next_instance() {
    let c = make_controller();
    let store = c.store();
    store
        .put_schedule("morning", &schedule_row("2024-05-01", "08:00", Repeat::Daily))
        .unwrap();
    assert_eq!(rehydrate::rehydrate_queue(&c), 1);

    let fired = c.promote_due_at(at(8, 0, 40)).expect("schedule fires");
    scheduler::handle_recurrence(&c, &fired);

    // Original row Completed
    assert_eq!(
        store.get_schedule("morning").unwrap().unwrap().status,
        ScheduleStatus::Completed
    );

    // Fresh pending row for the next day, same wall-clock time
    let pending = store.pending_schedules().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].1.date, "2024-05-02");
    assert_eq!(pending[0].1.time, "08:00");

    // And it is queued for the next firing
    let queue = c.queued_tasks();
    assert_eq!(queue.len(), 1);
    assert_eq!(
        queue[0].scheduled_time,
        NaiveDate::from_ymd_opt(2024, 5, 2)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    );
}

// ── S5: heartbeat watchdog ────────────────────────────────────────────────

#[test]
fn zombie_background_session_is_stopped() {
    let c = make_controller();
    let start = Instant::now();
    c.request_playback_at(task(TaskType::Background, "u2", &["Playground"]), at(12, 0, 0));

    c.check_heartbeats_at(start + Duration::from_secs(24));
    assert!(c.current_task().is_some());

    c.check_heartbeats_at(start + Duration::from_secs(26));
    assert!(c.current_task().is_none());
}

#[test]
fn heartbeats_keep_a_session_alive() {
    let c = make_controller();
    let start = Instant::now();
    c.request_playback_at(task(TaskType::Background, "u2", &["Playground"]), at(12, 0, 0));

    c.register_heartbeat_at("u2", start + Duration::from_secs(20));
    c.check_heartbeats_at(start + Duration::from_secs(30));
    assert!(c.current_task().is_some());

    // Heartbeats stop; 15 s later the watchdog fires
    c.check_heartbeats_at(start + Duration::from_secs(36));
    assert!(c.current_task().is_none());
}

#[test]
fn watchdog_never_kills_schedules() {
    let c = make_controller();
    c.enqueue_schedule(Task::schedule("sched".into(), at(11, 59, 0), TaskData::default()));
    c.promote_due_at(at(12, 0, 0));
    c.check_heartbeats_at(Instant::now() + Duration::from_secs(3600));
    assert_eq!(c.current_task().unwrap().task_type, TaskType::Schedule);
}

// ── S6: zone resolution ───────────────────────────────────────────────────

#[test]
fn unknown_zone_falls_through_to_substring_match() {
    let c = make_controller();
    let targets = c
        .engine()
        .resolve(&["Unknown".to_string(), "lib".to_string()]);
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].device, 2);
    assert_eq!(targets[0].channel, Some(Channel::Left));
}

// ── Full lifecycle ────────────────────────────────────────────────────────

#[test]
fn full_broadcast_lifecycle() {
    let c = make_controller();

    // Background music starts the day
    c.request_playback_at(task(TaskType::Background, "dj", &["Playground"]), at(9, 0, 0));
    assert_eq!(c.current_task().unwrap().task_type, TaskType::Background);

    // A live voice broadcast suspends it
    let voice = task(TaskType::Voice, "principal", &["Library"]);
    c.request_playback_at(voice, at(9, 5, 0));
    assert_eq!(c.current_task().unwrap().task_type, TaskType::Voice);
    assert!(c.suspended_task().is_some());

    // An emergency kills the voice broadcast; the suspended slot survives
    c.request_playback_at(task(TaskType::Emergency, "chief", &[]), at(9, 6, 0));
    assert!(c.emergency_mode());
    assert!(c.suspended_task().is_some());
    settle();

    // Deactivation resumes the music
    assert!(c.stop_task(None, None, "chief"));
    assert!(!c.emergency_mode());
    let resumed = c.current_task().expect("background resumed");
    assert_eq!(resumed.task_type, TaskType::Background);
    assert_eq!(resumed.data.user, "dj");
    assert!(c.suspended_task().is_none());
}

#[test]
fn queue_stays_sorted_through_mutations() {
    let c = make_controller();
    for (id, when) in [("c", at(12, 30, 0)), ("a", at(12, 0, 0)), ("b", at(12, 15, 0))] {
        c.request_playback_at(
            Task::schedule(id.into(), when, TaskData::default()),
            at(11, 0, 0),
        );
    }
    let ids: Vec<String> = c.queued_tasks().iter().map(|t| t.id.clone()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);

    // An interrupt + stop reshuffles times but not relative order
    let voice = task(TaskType::Voice, "u1", &["Library"]);
    let voice_id = voice.id.clone();
    c.request_playback_at(voice, at(11, 50, 0));
    c.stop_task_at(Some(&voice_id), None, "u1", at(11, 52, 0));

    let queue = c.queued_tasks();
    let ids: Vec<String> = queue.iter().map(|t| t.id.clone()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert!(queue.windows(2).all(|w| w[0].scheduled_time <= w[1].scheduled_time));
}

#[test]
fn interrupted_schedule_refires_after_interrupt_ends() {
    let c = make_controller();
    c.enqueue_schedule(Task::schedule("sched".into(), at(11, 59, 0), TaskData::default()));
    c.promote_due_at(at(12, 0, 0));
    assert_eq!(c.current_task().unwrap().id, "sched");

    // Emergency interrupts the schedule mid-play
    c.request_playback_at(task(TaskType::Emergency, "chief", &[]), at(12, 0, 30));
    let queue = c.queued_tasks();
    assert_eq!(queue[0].id, "sched");
    assert_eq!(queue[0].status, TaskStatus::Interrupted);
    settle();

    // After deactivation and the time shift, the schedule is due again
    c.stop_task_at(None, None, "chief", at(12, 2, 0));
    let promoted = c.promote_due_at(at(12, 3, 0)).expect("schedule refires");
    assert_eq!(promoted.id, "sched");
    assert_eq!(c.current_task().unwrap().id, "sched");
}

#[test]
fn voice_chunks_flow_only_during_voice_broadcast() {
    let c = make_controller();
    c.request_playback_at(task(TaskType::Voice, "u1", &["Library"]), at(12, 0, 0));
    settle();

    c.speak_chunk("data:audio/webm;base64,AAAA");
    c.speak_chunk("AAAA");
    let feeds = c
        .engine()
        .journal()
        .iter()
        .filter(|e| e.starts_with("stream-feed"))
        .count();
    assert_eq!(feeds, 2);

    // After the broadcast ends, chunks are dropped
    c.stop_task(None, Some("voice"), "u1");
    c.speak_chunk("AAAA");
    let feeds_after = c
        .engine()
        .journal()
        .iter()
        .filter(|e| e.starts_with("stream-feed"))
        .count();
    assert_eq!(feeds_after, 2);
}

#[test]
fn rehydration_then_promotion_round_trip() {
    let c = make_controller();
    let store = c.store();
    store
        .put_schedule("r1", &schedule_row("2024-05-01", "08:00", Repeat::Once))
        .unwrap();
    store
        .put_schedule("r2", &schedule_row("2024-05-01", "09:00", Repeat::Once))
        .unwrap();
    store
        .put_schedule("bad", &schedule_row("someday", "late", Repeat::Once))
        .unwrap();

    assert_eq!(rehydrate::rehydrate_queue(&c), 2);

    // Only the first is due
    let fired = c.promote_due_at(at(8, 30, 0)).unwrap();
    assert_eq!(fired.id, "r1");
    assert_eq!(c.queued_tasks().len(), 1);
    assert_eq!(
        store.get_schedule("r1").unwrap().unwrap().status,
        ScheduleStatus::Completed
    );
    assert_eq!(
        store.get_schedule("r2").unwrap().unwrap().status,
        ScheduleStatus::Pending
    );
}
