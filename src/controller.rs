//! Broadcast controller — the single arbiter of what plays, where, and who
//! wins. All shared state sits behind one mutex; every public operation
//! acquires it, and only brief work (state mutation, store writes,
//! non-blocking engine calls) happens inside. Blocking audio rendering is
//! dispatched to worker threads after the critical section.

use crate::config::AppConfig;
use crate::media;
use crate::playback::PlaybackEngine;
use crate::publisher::{StatePublisher, SystemMode};
use crate::store::{LogDoc, MemoryStore, NotificationKind, ScheduleStatus, Store};
use crate::task::{is_admin, Priority, Task, TaskStatus, TaskType};
use crate::tts::TtsEngine;
use crate::zones::{Target, ZoneMap, ALL_ZONES};
use chrono::NaiveDateTime;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// The fixed emergency announcement.
pub const EMERGENCY_SCRIPT: &str = "Attention. This is an emergency alert. \
Please remain calm and follow the instructions carefully. The situation is \
urgent. Stay tuned for further information.";

/// Siren volume while the emergency script has not yet played.
const SIREN_START_VOLUME: f32 = 0.05;
/// Siren volume after the script, reached via the post-script ramp.
const SIREN_RAMP_TARGET: f32 = 0.8;

// ── Log buffer ──────────────────────────────────────────────────────────────

const LOG_BUFFER_MAX: usize = 500;

#[derive(Debug, Clone, serde::Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
}

impl LogBuffer {
    pub fn new() -> Self {
        LogBuffer {
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, level: &str, message: String) {
        let timestamp = chrono::Local::now().format("%H:%M:%S").to_string();
        self.entries.push_back(LogEntry {
            timestamp,
            level: level.to_string(),
            message,
        });
        while self.entries.len() > LOG_BUFFER_MAX {
            self.entries.pop_front();
        }
    }

    pub fn get(&self, since_index: usize) -> Vec<LogEntry> {
        self.entries.iter().skip(since_index).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ── Controller state ────────────────────────────────────────────────────────

struct ControlState {
    current: Option<Task>,
    queue: Vec<Task>,
    suspended: Option<Task>,
    emergency_mode: bool,
    emergency_owner: Option<String>,
    /// Set when a ≥REALTIME task starts; basis of the queue time-shift.
    pause_start: Option<NaiveDateTime>,
    /// Saved background-music offset, in seconds.
    background_resume_secs: f64,
    background_play_start: Option<Instant>,
    last_background_content: Option<String>,
    heartbeats: HashMap<String, Instant>,
}

impl ControlState {
    fn new() -> Self {
        ControlState {
            current: None,
            queue: Vec::new(),
            suspended: None,
            emergency_mode: false,
            emergency_owner: None,
            pause_start: None,
            background_resume_secs: 0.0,
            background_play_start: None,
            last_background_content: None,
            heartbeats: HashMap::new(),
        }
    }

    fn current_priority(&self) -> Priority {
        self.current
            .as_ref()
            .map(|t| t.priority)
            .unwrap_or(Priority::IDLE)
    }

    fn add_to_queue(&mut self, task: Task) {
        self.queue.push(task);
        self.queue.sort_by_key(|t| t.scheduled_time);
    }

    /// Fold the running background stretch into the saved resume offset.
    fn flush_background_elapsed(&mut self) {
        if let Some(started) = self.background_play_start.take() {
            self.background_resume_secs += started.elapsed().as_secs_f64();
        }
    }
}

/// Audio work decided under the lock, executed on a worker after release.
enum AudioAction {
    Voice {
        zones: Vec<String>,
    },
    Announce {
        text: String,
        voice: String,
        zones: Vec<String>,
    },
    RecordedWav {
        audio_b64: String,
        zones: Vec<String>,
    },
    Background {
        path: PathBuf,
        zones: Vec<String>,
        offset: f64,
    },
    Emergency {
        zones: Vec<String>,
    },
}

struct ControllerInner {
    state: Mutex<ControlState>,
    engine: PlaybackEngine,
    tts: TtsEngine,
    publisher: StatePublisher,
    store: Arc<dyn Store>,
    config: AppConfig,
    logs: Mutex<LogBuffer>,
}

/// Handle to the controller. Clones share one instance; construct once at
/// startup and pass to every caller.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    pub fn new(
        config: AppConfig,
        engine: PlaybackEngine,
        tts: TtsEngine,
        store: Arc<dyn Store>,
    ) -> Self {
        let publisher = StatePublisher::new(store.clone());
        let controller = Controller {
            inner: Arc::new(ControllerInner {
                state: Mutex::new(ControlState::new()),
                engine,
                tts,
                publisher,
                store,
                config,
                logs: Mutex::new(LogBuffer::new()),
            }),
        };

        // Clean observable state on startup, then announce the device
        controller.inner.publisher.publish_idle();
        controller.inner.publisher.notify(
            "Device Status",
            "PA system is online (service started)",
            NotificationKind::Success,
            None,
            Some("admin"),
        );
        controller.log("info", "Controller initialized".to_string());
        controller
    }

    /// A controller wired to the silent engine and an in-memory store,
    /// with all transition delays collapsed. For testing.
    pub fn new_test() -> Self {
        let zones = ZoneMap::from_json(
            r#"{
                "Library": {"card": 2, "channel": "left"},
                "Admin Office": {"card": 2, "channel": "right"},
                "Playground": 3
            }"#,
            Target::stereo(2),
        )
        .expect("test zone map");
        let mut config = AppConfig::default();
        config.resume_delay_secs = 0.0;
        config.emergency_lead_secs = 0.01;
        config.siren_ramp_secs = 0.02;
        Controller::new(
            config,
            PlaybackEngine::silent(zones),
            TtsEngine::disabled(),
            Arc::new(MemoryStore::new()),
        )
    }

    pub fn engine(&self) -> PlaybackEngine {
        self.inner.engine.clone()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.inner.store.clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    pub fn current_task(&self) -> Option<Task> {
        self.lock_state().current.clone()
    }

    pub fn suspended_task(&self) -> Option<Task> {
        self.lock_state().suspended.clone()
    }

    pub fn queued_tasks(&self) -> Vec<Task> {
        self.lock_state().queue.clone()
    }

    pub fn emergency_mode(&self) -> bool {
        self.lock_state().emergency_mode
    }

    /// Owner of the active emergency, for the Deactivate gate.
    pub fn active_emergency_user(&self) -> Option<String> {
        let state = self.lock_state();
        if state.emergency_mode {
            state.emergency_owner.clone()
        } else {
            None
        }
    }

    /// Saved background-music resume offset, in seconds.
    pub fn background_resume_secs(&self) -> f64 {
        self.lock_state().background_resume_secs
    }

    pub fn get_logs(&self, since_index: usize) -> Vec<LogEntry> {
        self.inner.logs.lock().unwrap().get(since_index)
    }

    fn log(&self, level: &str, message: String) {
        match level {
            "error" | "warn" => eprintln!("[Controller] {}", message),
            _ => println!("[Controller] {}", message),
        }
        self.inner.logs.lock().unwrap().push(level, message);
    }

    fn lock_state(&self) -> MutexGuard<'_, ControlState> {
        self.inner.state.lock().unwrap()
    }

    // ── Admission ───────────────────────────────────────────────────────

    /// Main entry point: ask to play a task. Returns false when denied
    /// (busy with equal/higher priority, or emergency lockout).
    pub fn request_playback(&self, task: Task) -> bool {
        self.request_playback_at(task, chrono::Local::now().naive_local())
    }

    /// Admission with an explicit clock. For testing.
    pub fn request_playback_at(&self, mut task: Task, now: NaiveDateTime) -> bool {
        let action = {
            let mut state = self.lock_state();
            self.log(
                "info",
                format!("Request: {} (pri {})", task.task_type, task.priority),
            );

            // 1. Emergency lockout
            if state.emergency_mode && task.priority < Priority::EMERGENCY {
                self.log("warn", "Denied: emergency active".to_string());
                return false;
            }

            // 2. Schedules queue; they never preempt on submission
            if task.task_type == TaskType::Schedule {
                self.log("info", format!("Queued schedule {}", task.id));
                state.add_to_queue(task);
                return true;
            }

            // 3. Priority + ownership
            let current_pri = state.current_priority();
            let same_user = state
                .current
                .as_ref()
                .map(|c| c.data.user == task.data.user)
                .unwrap_or(false);

            if !(task.priority > current_pri || (task.priority == current_pri && same_user)) {
                self.log(
                    "warn",
                    format!("Denied: busy (current {}, new {})", current_pri, task.priority),
                );
                return false;
            }

            // Duplicate background request for the same track: accept, no restart
            if task.task_type == TaskType::Background {
                if let Some(current) = &state.current {
                    if current.task_type == TaskType::Background
                        && current.data.content == task.data.content
                        && task.data.start_time.unwrap_or(0.0) == 0.0
                    {
                        self.log("info", "Background already playing this track".to_string());
                        return true;
                    }
                }
                // A different track invalidates the saved offset
                if state.last_background_content != task.data.content {
                    state.background_resume_secs = 0.0;
                }
            }

            self.preempt_current(&mut state, task.priority);
            task.status = TaskStatus::Pending;
            self.start_task_locked(&mut state, task, now)
        };

        self.dispatch(action, 0.0);
        true
    }

    /// Request-surface adapter: build a task from the broadcast-start shape
    /// and submit it. Returns the task id, or an error when the system is
    /// busy (the HTTP edge translates that to 409).
    pub fn start_broadcast(
        &self,
        user: &str,
        zones: Vec<String>,
        type_str: &str,
        content: Option<String>,
        voice: Option<String>,
        session_token: Option<String>,
    ) -> Result<String, String> {
        let task_type = match TaskType::from_str_loose(type_str)? {
            t @ (TaskType::Voice | TaskType::Text | TaskType::Background) => t,
            other => {
                return Err(format!(
                    "'{}' broadcasts go through their own surface, not start_broadcast",
                    other
                ));
            }
        };

        let mut data = crate::task::TaskData::default();
        data.user = user.to_string();
        data.zones = zones;
        data.content = content;
        data.voice = voice;
        data.session_token = session_token;

        let task = Task::new(task_type, data);
        let id = task.id.clone();
        if self.request_playback(task) {
            Ok(id)
        } else {
            Err("System busy or higher priority active".to_string())
        }
    }

    /// Feed a live PCM chunk to the open stream pipes. Ignored unless the
    /// current task is a voice broadcast.
    pub fn speak_chunk(&self, payload_b64: &str) {
        let active = {
            let state = self.lock_state();
            matches!(
                state.current.as_ref().map(|t| t.task_type),
                Some(TaskType::Voice)
            )
        };
        if !active {
            self.log("warn", "Denied chunk: no voice broadcast active".to_string());
            return;
        }
        match media::decode_audio_payload(payload_b64) {
            Ok(pcm) => self.inner.engine.feed_stream(&pcm),
            Err(e) => self.log("warn", format!("Chunk error: {}", e)),
        }
    }

    // ── Stopping ────────────────────────────────────────────────────────

    /// Manually stop the current task. `task_type` of "any" matches every
    /// type. Returns true if something was stopped.
    pub fn stop_task(&self, task_id: Option<&str>, task_type: Option<&str>, user: &str) -> bool {
        self.stop_task_at(task_id, task_type, user, chrono::Local::now().naive_local())
    }

    /// Stop with an explicit clock. For testing.
    pub fn stop_task_at(
        &self,
        task_id: Option<&str>,
        task_type: Option<&str>,
        user: &str,
        now: NaiveDateTime,
    ) -> bool {
        let resume = {
            let mut state = self.lock_state();

            if state.current.is_none() && !state.emergency_mode {
                return false;
            }

            if let (Some(id), Some(current)) = (task_id, state.current.as_ref()) {
                if current.id != id {
                    self.log(
                        "warn",
                        format!("Denied stop: id mismatch ({} vs {})", id, current.id),
                    );
                    return false;
                }
            }

            // The post-script emergency latch has no current task; clearing
            // it always requires the owner or an admin, id or not
            let latched = state.current.is_none() && state.emergency_mode;
            if (task_id.is_none() || latched)
                && !self.generic_stop_allowed(&state, task_type, user)
            {
                return false;
            }

            self.log(
                "info",
                format!(
                    "Stopping task {}",
                    state
                        .current
                        .as_ref()
                        .map(|t| t.id.clone())
                        .unwrap_or_else(|| "<emergency latch>".to_string())
                ),
            );
            self.stop_current_locked(&mut state, now)
        };

        if let Some(action) = resume {
            self.dispatch(action, self.inner.config.resume_delay_secs);
        }
        true
    }

    /// Stop the current task when its session ends (logout, watchdog).
    /// Schedules survive: they do not belong to a client session.
    pub fn stop_session_task(&self, user: &str) -> bool {
        let resume = {
            let mut state = self.lock_state();
            let current = match state.current.as_ref() {
                Some(task) => task,
                None => return false,
            };
            if current.task_type == TaskType::Schedule {
                return false;
            }
            if current.data.user != user && !is_admin(user) {
                return false;
            }
            self.log("info", format!("Stopping session task for '{}'", user));
            self.stop_current_locked(&mut state, chrono::Local::now().naive_local())
        };

        if let Some(action) = resume {
            self.dispatch(action, self.inner.config.resume_delay_secs);
        }
        true
    }

    /// External completion signal (playback worker returned, or the
    /// request surface's `complete` call). Requester is the system.
    pub fn complete_task(&self, task_id: &str) -> bool {
        self.stop_task(Some(task_id), None, "System")
    }

    fn generic_stop_allowed(
        &self,
        state: &ControlState,
        task_type: Option<&str>,
        user: &str,
    ) -> bool {
        let current = match state.current.as_ref() {
            // Emergency latch: no current task, emergency still armed
            None => {
                let owner_ok = state.emergency_owner.as_deref() == Some(user);
                if !(owner_ok || is_admin(user)) {
                    self.log("warn", format!("Denied stop: '{}' may not clear emergency", user));
                    return false;
                }
                return true;
            }
            Some(task) => task,
        };

        // Type filter, unless the caller said "any"
        if let Some(wanted) = task_type {
            if !wanted.eq_ignore_ascii_case("any") {
                match TaskType::from_str_loose(wanted) {
                    Ok(t) if t == current.task_type => {}
                    Ok(t) => {
                        self.log(
                            "warn",
                            format!("Denied stop: type mismatch ({} vs {})", t, current.task_type),
                        );
                        return false;
                    }
                    Err(e) => {
                        self.log("warn", format!("Denied stop: {}", e));
                        return false;
                    }
                }
            }
        }

        match current.task_type {
            TaskType::Schedule => {
                if !is_admin(user) {
                    self.log(
                        "warn",
                        "Denied stop: schedules require a task id or admin".to_string(),
                    );
                    return false;
                }
                true
            }
            TaskType::Emergency => {
                let owner_ok = current.data.user == user;
                if !(owner_ok || is_admin(user)) {
                    self.log("warn", format!("Denied stop: '{}' may not clear emergency", user));
                    return false;
                }
                true
            }
            _ => {
                let owner_ok = current.data.user == user;
                if !(owner_ok || is_admin(user)) {
                    self.log(
                        "warn",
                        format!(
                            "Denied stop: '{}' is not the owner and not an admin",
                            user
                        ),
                    );
                    return false;
                }
                true
            }
        }
    }

    /// Tear down the current task under the lock. Returns the audio action
    /// for a resumed suspended task, if any.
    fn stop_current_locked(&self, state: &mut ControlState, now: NaiveDateTime) -> Option<AudioAction> {
        if state.emergency_mode {
            state.emergency_mode = false;
            state.emergency_owner = None;
        }

        match state.current.as_ref().map(|t| t.task_type) {
            Some(TaskType::Voice) => self.inner.engine.stop_streaming(),
            Some(TaskType::Background) => state.flush_background_elapsed(),
            _ => {}
        }
        if let Some(mut finished) = state.current.take() {
            finished.status = TaskStatus::Completed;
            self.write_log_row(&finished, "STOP");
        }

        self.inner.engine.stop();
        self.inner.publisher.publish_idle();
        self.apply_queue_shift(state, now);

        self.inner.publisher.notify(
            "Broadcast Ended",
            "Announcement finished or was stopped.",
            NotificationKind::Info,
            None,
            Some("admin"),
        );

        // Resume the suspended task, if one is waiting
        let mut resumed = state.suspended.take()?;
        self.log(
            "info",
            format!("Resuming suspended task {} ({})", resumed.id, resumed.task_type),
        );
        resumed.status = TaskStatus::Pending;
        Some(self.start_task_locked(state, resumed, now))
    }

    // ── Preemption ──────────────────────────────────────────────────────

    fn preempt_current(&self, state: &mut ControlState, new_priority: Priority) {
        let current = match state.current.take() {
            Some(task) => task,
            None => return,
        };
        self.log("info", format!("Preempting {} ({})", current.task_type, current.id));

        match current.task_type {
            TaskType::Schedule => {
                // Soft stop: back to the head of the queue
                let mut requeued = current;
                requeued.status = TaskStatus::Interrupted;
                self.inner.publisher.notify(
                    "Scheduled Announcement Interrupted",
                    &format!(
                        "Schedule '{}' was interrupted by a higher priority task.",
                        requeued.data.message.as_deref().unwrap_or("announcement")
                    ),
                    NotificationKind::Warning,
                    Some(&requeued.data.user),
                    Some("admin"),
                );
                state.queue.insert(0, requeued);
            }
            TaskType::Voice | TaskType::Text => {
                // Hard stop
                if current.task_type == TaskType::Voice {
                    self.inner.engine.stop_streaming();
                }
                self.inner.publisher.notify(
                    "Live Announcement Interrupted",
                    "Your live broadcast was interrupted by a higher priority event.",
                    NotificationKind::Error,
                    Some(&current.data.user),
                    Some("admin"),
                );
            }
            TaskType::Background => {
                if new_priority == Priority::BACKGROUND {
                    // Track switch: just drop the old one
                    state.background_play_start = None;
                } else {
                    // Suspend for resume; capture elapsed before the engine stops
                    state.flush_background_elapsed();
                    state.suspended = Some(current);
                }
            }
            TaskType::Emergency => {}
        }

        self.inner.engine.stop();
    }

    // ── Starting ────────────────────────────────────────────────────────

    /// Install a task as current and prepare its audio action. Runs under
    /// the lock; the returned action must be dispatched after release.
    fn start_task_locked(
        &self,
        state: &mut ControlState,
        mut task: Task,
        now: NaiveDateTime,
    ) -> AudioAction {
        task.status = TaskStatus::Playing;

        if task.priority >= Priority::REALTIME && state.pause_start.is_none() {
            state.pause_start = Some(now);
            self.log("info", format!("Time shift started at {}", now));
        }

        if task.priority == Priority::EMERGENCY {
            state.emergency_mode = true;
            state.emergency_owner = Some(task.data.user.clone());
            self.inner.engine.play_siren(&task.data.zones, SIREN_START_VOLUME);
            self.inner.publisher.notify(
                "Emergency Activated",
                "Emergency broadcast in progress. All other schedules paused.",
                NotificationKind::Error,
                None,
                Some("admin"),
            );
            self.inner.publisher.notify(
                "Emergency Activated",
                "Emergency broadcast in progress.",
                NotificationKind::Error,
                None,
                Some("user"),
            );
        }

        let mode = SystemMode::for_task(&task);
        self.log("info", format!("Starting {} (mode {})", task.task_type, mode));
        self.write_log_row(&task, "START");

        let action = self.prepare_audio_action(state, &mut task);
        self.inner
            .publisher
            .publish(Some(&task), task.priority, mode);
        state.current = Some(task);
        action
    }

    fn prepare_audio_action(&self, state: &mut ControlState, task: &mut Task) -> AudioAction {
        let zones = task.data.zones.clone();
        match task.task_type {
            TaskType::Voice => AudioAction::Voice { zones },
            TaskType::Text => {
                let text = task
                    .data
                    .content
                    .clone()
                    .or_else(|| task.data.message.clone())
                    .unwrap_or_default();
                self.inner.publisher.notify(
                    "Live Text Announcement",
                    &format!("Now broadcasting text: {:.30}...", text),
                    NotificationKind::Info,
                    Some(&task.data.user),
                    Some("admin"),
                );
                AudioAction::Announce {
                    text,
                    voice: task.data.voice.clone().unwrap_or_else(|| "female".into()),
                    zones,
                }
            }
            TaskType::Schedule => {
                self.inner.publisher.notify(
                    "Scheduled Announcement Started",
                    "Broadcast started.",
                    NotificationKind::Success,
                    Some(&task.data.user),
                    Some("admin"),
                );
                if let Some(audio) = task.data.audio.clone() {
                    AudioAction::RecordedWav {
                        audio_b64: audio,
                        zones,
                    }
                } else {
                    let message = task
                        .data
                        .message
                        .clone()
                        .filter(|m| !m.is_empty())
                        .unwrap_or_else(|| "Scheduled Announcement.".to_string());
                    AudioAction::Announce {
                        text: message,
                        voice: task.data.voice.clone().unwrap_or_else(|| "female".into()),
                        zones,
                    }
                }
            }
            TaskType::Background => {
                // An explicit seek applies once; afterwards the saved offset rules
                let offset = task
                    .data
                    .start_time
                    .take()
                    .unwrap_or(state.background_resume_secs);
                state.background_play_start = Some(Instant::now());
                state.last_background_content = task.data.content.clone();
                let path = self.resolve_media_path(task.data.content.as_deref().unwrap_or(""));
                AudioAction::Background {
                    path,
                    zones,
                    offset,
                }
            }
            TaskType::Emergency => AudioAction::Emergency { zones },
        }
    }

    fn resolve_media_path(&self, content: &str) -> PathBuf {
        let direct = PathBuf::from(content);
        if direct.is_absolute() || direct.exists() {
            direct
        } else {
            self.inner.config.media_dir.join(content)
        }
    }

    // ── Audio dispatch (outside the lock) ───────────────────────────────

    fn dispatch(&self, action: AudioAction, delay_secs: f64) {
        let controller = self.clone();
        std::thread::Builder::new()
            .name("audio-dispatch".into())
            .spawn(move || {
                if delay_secs > 0.0 {
                    std::thread::sleep(Duration::from_secs_f64(delay_secs));
                }
                controller.run_action(action);
            })
            .ok();
    }

    fn run_action(&self, action: AudioAction) {
        let engine = &self.inner.engine;
        let chime = self.inner.config.chime_path();
        match action {
            AudioAction::Voice { zones } => {
                engine.play_chime_sync(&chime, &zones);
                engine.start_streaming(&zones);
            }
            AudioAction::Announce { text, voice, zones } => {
                match self.inner.tts.synthesize_with_fallback(&text, &voice) {
                    Some(wav) => engine.play_announcement(Some(&chime), Some(&wav), &zones),
                    None => {
                        engine.play_chime_sync(&chime, &zones);
                        engine.speak_espeak(&text);
                    }
                }
            }
            AudioAction::RecordedWav { audio_b64, zones } => {
                match self.write_temp_wav(&audio_b64) {
                    Ok(temp) => engine.play_wav(Some(&chime), &temp, &zones),
                    Err(e) => self.log("error", format!("Recorded announcement failed: {}", e)),
                }
            }
            AudioAction::Background {
                path,
                zones,
                offset,
            } => {
                engine.play_background_music(&path, &zones, offset);
            }
            AudioAction::Emergency { zones } => self.run_emergency_script(zones),
        }
    }

    /// The fixed emergency sequence: two siren sweeps, the spoken script
    /// on every zone, then the siren ramps back up and stays latched.
    fn run_emergency_script(&self, zones: Vec<String>) {
        let engine = &self.inner.engine;
        std::thread::sleep(Duration::from_secs_f64(
            self.inner.config.emergency_lead_secs,
        ));

        // Synthesis gets one retry before the espeak fallback
        let script = self
            .inner
            .tts
            .synthesize_with_fallback(EMERGENCY_SCRIPT, "female")
            .or_else(|| self.inner.tts.synthesize_with_fallback(EMERGENCY_SCRIPT, "female"));

        engine.stop_siren();
        let all_zones = vec![ALL_ZONES.to_string()];
        match script {
            Some(wav) => engine.play_announcement(None, Some(&wav), &all_zones),
            None => engine.speak_espeak(EMERGENCY_SCRIPT),
        }

        // The emergency may have been deactivated while the script played;
        // only bring the siren back if the latch still holds
        if !self.emergency_mode() {
            return;
        }
        engine.play_siren(&zones, SIREN_START_VOLUME);
        engine.ramp_siren_volume(
            SIREN_RAMP_TARGET,
            Duration::from_secs_f64(self.inner.config.siren_ramp_secs),
        );

        let mut state = self.lock_state();
        if state
            .current
            .as_ref()
            .map(|t| t.task_type == TaskType::Emergency)
            .unwrap_or(false)
        {
            state.current = None;
            // emergency_mode stays latched until an authorized stop
            self.inner
                .publisher
                .publish(None, Priority::EMERGENCY, SystemMode::Emergency);
            self.log("info", "Emergency script finished; siren latched".to_string());
        }
    }

    fn write_temp_wav(&self, audio_b64: &str) -> Result<PathBuf, String> {
        let decoded = media::decode_audio_payload(audio_b64)?;
        let path = self.inner.config.sounds_dir.join(format!(
            "broadcast_{}.wav",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&self.inner.config.sounds_dir)
            .map_err(|e| format!("Cannot create sounds dir: {}", e))?;
        std::fs::write(&path, decoded).map_err(|e| format!("Cannot write temp WAV: {}", e))?;
        Ok(path)
    }

    fn write_log_row(&self, task: &Task, action: &str) {
        let row = LogDoc {
            user: task.data.user.clone(),
            task_type: task.task_type.to_string(),
            action: action.to_string(),
            details: task.data.content.clone().or_else(|| task.data.message.clone()).unwrap_or_default(),
            timestamp: chrono::Local::now().naive_local(),
        };
        if let Err(e) = self.inner.store.add_log(&row) {
            eprintln!("[Controller] Log write failed: {}", e);
        }
    }

    // ── Queue time-shift ────────────────────────────────────────────────

    /// Shift every queued schedule forward by the interruption length and
    /// persist the new wall-clock times in one batch.
    fn apply_queue_shift(&self, state: &mut ControlState, now: NaiveDateTime) {
        let pause_start = match state.pause_start.take() {
            Some(t) => t,
            None => return,
        };
        let duration = now - pause_start;
        if duration < chrono::Duration::zero() {
            return;
        }
        self.log("info", format!("Applying time shift: +{}s", duration.num_seconds()));

        let mut updates = Vec::new();
        for task in &mut state.queue {
            task.scheduled_time += duration;
            updates.push((
                task.id.clone(),
                task.scheduled_time.format("%Y-%m-%d").to_string(),
                task.scheduled_time.format("%H:%M").to_string(),
            ));
        }
        state.queue.sort_by_key(|t| t.scheduled_time);

        if !updates.is_empty() {
            if let Err(e) = self.inner.store.update_schedule_times(&updates) {
                eprintln!("[Controller] Shift persist failed: {}", e);
            }
        }
    }

    // ── Background seek ─────────────────────────────────────────────────

    /// Restart the current background track at a new offset.
    pub fn seek_background_music(&self, user: &str, seconds: f64) -> bool {
        let action = {
            let mut state = self.lock_state();
            let current = match state.current.as_ref() {
                Some(task) if task.task_type == TaskType::Background => task.clone(),
                _ => return false,
            };
            if current.data.user != user && !is_admin(user) {
                return false;
            }
            state.background_resume_secs = seconds.max(0.0);
            state.background_play_start = None;
            self.inner.engine.stop();

            let now = chrono::Local::now().naive_local();
            let mut restarted = current;
            restarted.data.start_time = None;
            self.start_task_locked(&mut state, restarted, now)
        };
        self.dispatch(action, 0.0);
        true
    }

    // ── Heartbeat watchdog ──────────────────────────────────────────────

    pub fn register_heartbeat(&self, user: &str) {
        self.register_heartbeat_at(user, Instant::now());
    }

    /// Record a heartbeat at an explicit instant. For testing.
    pub fn register_heartbeat_at(&self, user: &str, at: Instant) {
        self.lock_state().heartbeats.insert(user.to_string(), at);
    }

    /// Run one watchdog pass against the current clock.
    pub fn check_heartbeats(&self) {
        self.check_heartbeats_at(Instant::now());
    }

    /// Watchdog pass with an explicit clock. Stops the current session task
    /// when its owner has gone silent past the timeout, or never checked in
    /// at all on a long-running background task.
    pub fn check_heartbeats_at(&self, now: Instant) {
        let timeout = Duration::from_secs_f64(self.inner.config.heartbeat_timeout_secs);
        let zombie = Duration::from_secs_f64(self.inner.config.zombie_timeout_secs);

        let victim = {
            let state = self.lock_state();
            let current = match state.current.as_ref() {
                Some(task) => task,
                None => return,
            };
            if !matches!(current.task_type, TaskType::Background | TaskType::Voice) {
                return;
            }
            let user = current.data.user.clone();
            if user == "System" {
                return;
            }

            match state.heartbeats.get(&user) {
                Some(&last) if now.saturating_duration_since(last) > timeout => Some(user),
                Some(_) => None,
                None => {
                    // Zombie session: background audio with no client ever seen
                    let running = state
                        .background_play_start
                        .map(|started| now.saturating_duration_since(started))
                        .unwrap_or(Duration::ZERO);
                    if current.task_type == TaskType::Background && running > zombie {
                        Some(user)
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(user) = victim {
            self.log("warn", format!("Watchdog: stopping silent session of '{}'", user));
            self.stop_session_task(&user);
        }
    }

    // ── Queue management ────────────────────────────────────────────────

    /// Append a schedule task directly to the queue (rehydration and
    /// recurrence paths; no notifications, no emergency logic).
    pub fn enqueue_schedule(&self, task: Task) {
        self.lock_state().add_to_queue(task);
    }

    /// Remove a queued schedule, e.g. when its row is deleted.
    pub fn remove_from_queue(&self, schedule_id: &str) {
        self.lock_state().queue.retain(|t| t.id != schedule_id);
    }

    // ── Scheduler promotion ─────────────────────────────────────────────

    /// Promote the first due schedule, if the current task does not outrank
    /// it. Returns the promoted task for recurrence handling.
    pub fn promote_due(&self) -> Option<Task> {
        self.promote_due_at(chrono::Local::now().naive_local())
    }

    /// Promotion with an explicit clock. For testing.
    pub fn promote_due_at(&self, now: NaiveDateTime) -> Option<Task> {
        let (action, promoted) = {
            let mut state = self.lock_state();

            let due_index = state
                .queue
                .iter()
                .position(|t| t.scheduled_time <= now)?;
            // Queue is sorted, so the first due task is the next one
            let next_priority = state.queue[due_index].priority;
            if state.current_priority() >= next_priority {
                return None;
            }

            let mut next = state.queue.remove(due_index);
            next.priority = Priority::SCHEDULE;
            self.log("info", format!("Promoting schedule {}", next.id));

            // Mark the row Completed before starting; a failed write is
            // logged and playback proceeds
            if let Err(e) = self
                .inner
                .store
                .set_schedule_status(&next.id, ScheduleStatus::Completed)
            {
                eprintln!("[Controller] Failed to mark schedule completed: {}", e);
            } else {
                self.inner.publisher.notify(
                    "Scheduled Announcement Completed",
                    &format!(
                        "Your announcement '{:.20}' finished successfully.",
                        next.data.message.as_deref().unwrap_or("")
                    ),
                    NotificationKind::Success,
                    Some(&next.data.user),
                    None,
                );
            }

            if state.current.is_some() {
                self.preempt_current(&mut state, next_priority);
            }

            let promoted = next.clone();
            let action = self.start_task_locked(&mut state, next, now);
            (action, promoted)
        };

        self.dispatch(action, 0.0);
        Some(promoted)
    }
}
