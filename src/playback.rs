//! Playback engine — per-device audio process supervision.
//!
//! The ALSA backend renders everything out-of-process: `aplay` for plain
//! WAV playback, sox `play` for channel-split, seek and siren synthesis,
//! `amixer` for device priming. Every spawned child is registered in a
//! mutex-guarded tracker; `stop()` is the only correct termination path.
//!
//! The fallback backend drives the system default device through rodio on
//! a dedicated thread (the output stream is not Send), with no multi-zone
//! or channel splitting. The silent backend records intent and does
//! nothing — constructors used by tests select it.

use crate::media;
use crate::siren::SirenControl;
use crate::zones::{Channel, Target, ZoneMap};
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Delay between per-device worker dispatches. USB audio interfaces on the
/// target hardware misbehave when opened simultaneously.
const DEVICE_STAGGER: Duration = Duration::from_millis(50);

/// Grace period between SIGTERM and SIGKILL when stopping children.
const KILL_GRACE: Duration = Duration::from_millis(300);

/// Length of one siren sweep.
const SWEEP_SECS: u32 = 1;

/// Mixer controls primed to full volume before playback.
const MIXER_CONTROLS: &[&str] = &["Speaker", "PCM", "Master", "Headphone", "Playback"];

/// External tools swept up by the stray-process kill in `stop()`.
const AUDIO_TOOLS: &[&str] = &["aplay", "play", "sox"];

const JOURNAL_MAX: usize = 200;

/// Which rendering pipeline the engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Multi-zone playback through external ALSA/sox processes.
    Alsa,
    /// System default device via rodio; single zone, no channel split.
    Fallback,
    /// No audio side effects; operations succeed and record intent.
    Silent,
}

impl Backend {
    pub fn from_str_loose(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "alsa" => Ok(Backend::Alsa),
            "fallback" | "default" => Ok(Backend::Fallback),
            "silent" => Ok(Backend::Silent),
            _ => Err(format!(
                "Unknown playback backend '{}'. Expected: alsa, fallback, silent",
                s
            )),
        }
    }
}

// ── Argument builders ────────────────────────────────────────────────────────

/// `aplay` arguments for plain WAV playback on a device.
pub fn build_aplay_args(path: &Path, target: Target) -> Vec<String> {
    vec![
        "-q".into(),
        "-D".into(),
        target.alsa_device(),
        path.to_string_lossy().to_string(),
    ]
}

/// sox `play` arguments for file playback with optional channel remix and
/// seek. The output device is selected through the AUDIODEV environment
/// variable, so it does not appear here.
pub fn build_sox_play_args(path: &Path, channel: Option<Channel>, start_secs: f64) -> Vec<String> {
    let mut args = vec!["-q".to_string(), path.to_string_lossy().to_string()];
    push_remix(&mut args, channel);
    if start_secs > 0.0 {
        args.push("trim".into());
        args.push(format!("{:.3}", start_secs));
    }
    args
}

/// `aplay` arguments for a long-lived raw PCM stream pipe on stdin.
pub fn build_aplay_stream_args(target: Target) -> Vec<String> {
    vec![
        "-q".into(),
        "-D".into(),
        target.alsa_device(),
        "-f".into(),
        "S16_LE".into(),
        "-r".into(),
        media::STREAM_SAMPLE_RATE.to_string(),
        "-c".into(),
        "1".into(),
        "-t".into(),
        "raw".into(),
        "-".into(),
    ]
}

/// sox `play` arguments for a raw PCM stream pipe with a channel remix.
pub fn build_sox_stream_args(channel: Option<Channel>) -> Vec<String> {
    let mut args = vec![
        "-q".to_string(),
        "-t".into(),
        "raw".into(),
        "-r".into(),
        media::STREAM_SAMPLE_RATE.to_string(),
        "-e".into(),
        "signed".into(),
        "-b".into(),
        "16".into(),
        "-c".into(),
        "1".into(),
        "-".into(),
    ];
    push_remix(&mut args, channel);
    args
}

/// sox `play` arguments for one synthetic siren sweep (600→1200 Hz).
pub fn build_siren_sweep_args(channel: Option<Channel>, volume: f32) -> Vec<String> {
    let mut args = vec![
        "-q".to_string(),
        "-n".into(),
        "synth".into(),
        SWEEP_SECS.to_string(),
        "sine".into(),
        "600-1200".into(),
    ];
    push_remix(&mut args, channel);
    args.push("vol".into());
    args.push(format!("{:.3}", volume.clamp(0.0, 1.0)));
    args
}

/// `amixer` arguments to set one control on one card.
pub fn build_amixer_args(device: u32, control: &str, value: &str) -> Vec<String> {
    vec![
        "-c".into(),
        device.to_string(),
        "set".into(),
        control.to_string(),
        value.to_string(),
    ]
}

fn push_remix(args: &mut Vec<String>, channel: Option<Channel>) {
    match channel {
        Some(Channel::Left) => {
            args.push("remix".into());
            args.push("1".into());
            args.push("0".into());
        }
        Some(Channel::Right) => {
            args.push("remix".into());
            args.push("0".into());
            args.push("1".into());
        }
        None => {}
    }
}

/// True when aplay alone can render this file on this target.
fn aplay_suffices(path: &Path, target: Target, start_secs: f64) -> bool {
    target.channel.is_none()
        && start_secs == 0.0
        && path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("wav"))
            .unwrap_or(false)
}

// ── Engine ───────────────────────────────────────────────────────────────────

struct StreamPipe {
    target: Target,
    /// None on the silent backend, which tracks pipe counts only.
    child: Option<Child>,
}

struct EngineInner {
    backend: Backend,
    zones: Mutex<ZoneMap>,
    procs: Mutex<Vec<Arc<Mutex<Child>>>>,
    streams: Mutex<Vec<StreamPipe>>,
    siren: SirenControl,
    fallback: Mutex<Option<FallbackHandle>>,
    journal: Mutex<VecDeque<String>>,
}

/// Handle to the playback engine. Clones share one engine.
#[derive(Clone)]
pub struct PlaybackEngine {
    inner: Arc<EngineInner>,
}

impl PlaybackEngine {
    pub fn new(backend: Backend, zones: ZoneMap) -> Self {
        let fallback = match backend {
            Backend::Fallback => Some(spawn_fallback_runtime()),
            _ => None,
        };
        PlaybackEngine {
            inner: Arc::new(EngineInner {
                backend,
                zones: Mutex::new(zones),
                procs: Mutex::new(Vec::new()),
                streams: Mutex::new(Vec::new()),
                siren: SirenControl::new(),
                fallback: Mutex::new(fallback),
                journal: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// A silent engine for tests: no audio side effects.
    pub fn silent(zones: ZoneMap) -> Self {
        Self::new(Backend::Silent, zones)
    }

    pub fn backend(&self) -> Backend {
        self.inner.backend
    }

    /// Resolve zone names to concrete targets.
    pub fn resolve(&self, zones: &[String]) -> Vec<Target> {
        self.inner.zones.lock().unwrap().resolve(zones)
    }

    /// Recent engine operations, oldest first. Used by tests and diagnostics.
    pub fn journal(&self) -> Vec<String> {
        self.inner.journal.lock().unwrap().iter().cloned().collect()
    }

    fn record(&self, entry: String) {
        let mut journal = self.inner.journal.lock().unwrap();
        journal.push_back(entry);
        while journal.len() > JOURNAL_MAX {
            journal.pop_front();
        }
    }

    // ── File playback ───────────────────────────────────────────────────

    /// Play an optional intro then a body file across the given zones,
    /// one worker per target. Blocks until every worker has finished.
    pub fn play_announcement(
        &self,
        intro: Option<&Path>,
        body: Option<&Path>,
        zones: &[String],
    ) {
        let files = playable_files(&[intro, body]);
        self.record(format!(
            "announce files={} zones={}",
            files.len(),
            zones.join(",")
        ));
        if files.is_empty() {
            eprintln!("[Playback] Nothing to announce (no playable files)");
            return;
        }
        self.play_files_blocking(&files, zones);
    }

    /// Play an intro chime then a pre-rendered WAV. Blocks.
    pub fn play_wav(&self, intro: Option<&Path>, wav: &Path, zones: &[String]) {
        let files = playable_files(&[intro, Some(wav)]);
        self.record(format!(
            "wav files={} zones={}",
            files.len(),
            zones.join(",")
        ));
        if files.is_empty() {
            eprintln!("[Playback] Missing WAV '{}'", wav.display());
            return;
        }
        self.play_files_blocking(&files, zones);
    }

    /// Play the intro chime alone across the given zones. Blocks.
    pub fn play_chime_sync(&self, chime: &Path, zones: &[String]) {
        self.record(format!("chime zones={}", zones.join(",")));
        let files = playable_files(&[Some(chime)]);
        if files.is_empty() {
            eprintln!("[Playback] Missing chime '{}'", chime.display());
            return;
        }
        self.play_files_blocking(&files, zones);
    }

    /// Start background music in a detached worker, seeking to `start_secs`.
    pub fn play_background_music(&self, path: &Path, zones: &[String], start_secs: f64) {
        let start_secs = clamp_to_track(path, start_secs);
        self.record(format!(
            "music path={} start={:.1} zones={}",
            path.display(),
            start_secs,
            zones.join(",")
        ));
        if !path.exists() {
            eprintln!("[Playback] Missing media file '{}'", path.display());
            return;
        }

        match self.inner.backend {
            Backend::Silent => {}
            Backend::Fallback => {
                self.with_fallback(|handle| {
                    handle.send(FallbackCmd::PlayMusic {
                        path: path.to_path_buf(),
                        start: Duration::from_secs_f64(start_secs.max(0.0)),
                    })
                });
            }
            Backend::Alsa => {
                let engine = self.clone();
                let path = path.to_path_buf();
                let targets = self.resolve(zones);
                std::thread::Builder::new()
                    .name("music-worker".into())
                    .spawn(move || {
                        engine.fan_out(&[path], &targets, start_secs);
                    })
                    .ok();
            }
        }
    }

    fn play_files_blocking(&self, files: &[PathBuf], zones: &[String]) {
        match self.inner.backend {
            Backend::Silent => {}
            Backend::Fallback => {
                let (done_tx, done_rx) = mpsc::channel();
                self.with_fallback(|handle| {
                    handle.send(FallbackCmd::PlayFiles {
                        files: files.to_vec(),
                        done: Some(done_tx.clone()),
                    })
                });
                let _ = done_rx.recv_timeout(Duration::from_secs(600));
            }
            Backend::Alsa => {
                let targets = self.resolve(zones);
                self.fan_out(files, &targets, 0.0);
            }
        }
    }

    /// Spawn one worker per target, staggered, each playing the file list
    /// in order. Blocks until all workers return.
    fn fan_out(&self, files: &[PathBuf], targets: &[Target], start_secs: f64) {
        let mut workers = Vec::new();
        for &target in targets {
            self.ensure_device_active(target.device);
            let engine = self.clone();
            let files = files.to_vec();
            let worker = std::thread::Builder::new()
                .name(format!("play-dev{}", target.device))
                .spawn(move || {
                    for file in &files {
                        if let Err(e) = engine.play_file_on_target(file, target, start_secs) {
                            eprintln!("[Playback] {}: {}", target, e);
                        }
                    }
                })
                .ok();
            if let Some(handle) = worker {
                workers.push(handle);
            }
            std::thread::sleep(DEVICE_STAGGER);
        }
        for worker in workers {
            let _ = worker.join();
        }
    }

    fn play_file_on_target(&self, path: &Path, target: Target, start_secs: f64) -> Result<(), String> {
        let child = if aplay_suffices(path, target, start_secs) {
            Command::new("aplay")
                .args(build_aplay_args(path, target))
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| format!("Failed to launch aplay: {}", e))?
        } else {
            Command::new("play")
                .args(build_sox_play_args(path, target.channel, start_secs))
                .env("AUDIODEV", target.alsa_device())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| format!("Failed to launch play: {}", e))?
        };

        let handle = self.register(child);
        let status = self.wait_child(&handle);
        self.deregister(&handle);

        match status {
            Some(status) if status.success() => Ok(()),
            Some(status) => match status.code() {
                Some(code) => Err(format!("Player exited with status {}", code)),
                // Signal-terminated through stop(): not a playback failure
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    // ── Streaming pipes ─────────────────────────────────────────────────

    /// Open one long-lived raw-PCM player per resolved target.
    pub fn start_streaming(&self, zones: &[String]) {
        let targets = self.resolve(zones);
        self.record(format!("stream-open pipes={}", targets.len()));

        match self.inner.backend {
            Backend::Silent => {
                let mut streams = self.inner.streams.lock().unwrap();
                for &target in &targets {
                    streams.push(StreamPipe {
                        target,
                        child: None,
                    });
                }
            }
            Backend::Fallback => {
                self.with_fallback(|handle| handle.send(FallbackCmd::StartStream));
            }
            Backend::Alsa => {
                let mut streams = self.inner.streams.lock().unwrap();
                for &target in &targets {
                    self.ensure_device_active(target.device);
                    let spawned = if target.channel.is_none() {
                        Command::new("aplay")
                            .args(build_aplay_stream_args(target))
                            .stdin(Stdio::piped())
                            .stdout(Stdio::null())
                            .stderr(Stdio::null())
                            .spawn()
                    } else {
                        Command::new("play")
                            .args(build_sox_stream_args(target.channel))
                            .env("AUDIODEV", target.alsa_device())
                            .stdin(Stdio::piped())
                            .stdout(Stdio::null())
                            .stderr(Stdio::null())
                            .spawn()
                    };
                    match spawned {
                        Ok(child) => streams.push(StreamPipe {
                            target,
                            child: Some(child),
                        }),
                        Err(e) => eprintln!("[Playback] Stream pipe for {} failed: {}", target, e),
                    }
                    std::thread::sleep(DEVICE_STAGGER);
                }
            }
        }
    }

    /// Write one PCM chunk to every open pipe. Broken pipes are culled.
    pub fn feed_stream(&self, pcm: &[u8]) {
        match self.inner.backend {
            Backend::Silent => {
                self.record(format!("stream-feed bytes={}", pcm.len()));
            }
            Backend::Fallback => {
                self.record(format!("stream-feed bytes={}", pcm.len()));
                self.with_fallback(|handle| handle.send(FallbackCmd::FeedPcm(pcm.to_vec())));
            }
            Backend::Alsa => {
                let mut streams = self.inner.streams.lock().unwrap();
                streams.retain_mut(|pipe| {
                    let child = match pipe.child.as_mut() {
                        Some(child) => child,
                        None => return false,
                    };
                    match child.stdin.as_mut() {
                        Some(stdin) => {
                            let ok = stdin.write_all(pcm).and_then(|_| stdin.flush()).is_ok();
                            if !ok {
                                eprintln!("[Playback] Culling broken pipe for {}", pipe.target);
                                let _ = child.kill();
                                let _ = child.wait();
                            }
                            ok
                        }
                        None => false,
                    }
                });
            }
        }
    }

    /// Close every stream pipe.
    pub fn stop_streaming(&self) {
        self.record("stream-close".to_string());
        if self.inner.backend == Backend::Fallback {
            self.with_fallback(|handle| handle.send(FallbackCmd::StopStream));
            return;
        }
        let mut streams = self.inner.streams.lock().unwrap();
        for pipe in streams.iter_mut() {
            if let Some(child) = pipe.child.as_mut() {
                // Dropping stdin sends EOF; the kill covers players that linger
                child.stdin.take();
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        streams.clear();
    }

    /// Number of currently open stream pipes.
    pub fn open_stream_count(&self) -> usize {
        self.inner.streams.lock().unwrap().len()
    }

    // ── Siren ───────────────────────────────────────────────────────────

    /// Start the siren loop at the given volume. Idempotent: if a loop is
    /// already active this only updates the volume.
    pub fn play_siren(&self, zones: &[String], volume: f32) {
        self.inner.siren.set_volume(volume);
        if !self.inner.siren.try_activate() {
            return;
        }
        self.record(format!("siren-start vol={:.2}", volume));

        let engine = self.clone();
        let targets = self.resolve(zones);
        std::thread::Builder::new()
            .name("siren-loop".into())
            .spawn(move || {
                while !engine.inner.siren.stop_requested() {
                    engine.render_sweep(&targets);
                }
                engine.inner.siren.mark_inactive();
                engine.record("siren-loop-exit".to_string());
            })
            .ok();
    }

    pub fn set_siren_volume(&self, volume: f32) {
        self.inner.siren.set_volume(volume);
    }

    pub fn siren_volume(&self) -> f32 {
        self.inner.siren.volume()
    }

    pub fn siren_active(&self) -> bool {
        self.inner.siren.is_active()
    }

    /// Stop the siren loop without touching other playback.
    pub fn stop_siren(&self) {
        self.record("siren-stop".to_string());
        self.inner.siren.request_stop();
    }

    /// Linearly ramp the siren volume over `duration`. Blocks; aborts early
    /// if the siren stop signal is raised.
    pub fn ramp_siren_volume(&self, target: f32, duration: Duration) {
        self.record(format!("siren-ramp to={:.2}", target));
        self.inner.siren.ramp(target, duration);
    }

    /// Render one sweep across all targets at the current volume.
    fn render_sweep(&self, targets: &[Target]) {
        let volume = self.inner.siren.volume();
        match self.inner.backend {
            Backend::Silent => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Backend::Fallback => {
                let (done_tx, done_rx) = mpsc::channel();
                self.with_fallback(|handle| {
                    handle.send(FallbackCmd::PlaySweep {
                        volume,
                        done: done_tx.clone(),
                    })
                });
                let _ = done_rx.recv_timeout(Duration::from_secs(3));
            }
            Backend::Alsa => {
                let mut children = Vec::new();
                for &target in targets {
                    let spawned = Command::new("play")
                        .args(build_siren_sweep_args(target.channel, volume))
                        .env("AUDIODEV", target.alsa_device())
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .spawn();
                    if let Ok(child) = spawned {
                        children.push(self.register(child));
                    }
                    std::thread::sleep(DEVICE_STAGGER);
                }
                for handle in children {
                    self.wait_child(&handle);
                    self.deregister(&handle);
                }
            }
        }
    }

    /// Last-resort speech through the system espeak tool, on the default
    /// device. Used when TTS synthesis fails entirely.
    pub fn speak_espeak(&self, text: &str) {
        self.record(format!("espeak chars={}", text.len()));
        if self.inner.backend != Backend::Alsa {
            return;
        }
        match Command::new("espeak")
            .arg(text)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                let handle = self.register(child);
                self.wait_child(&handle);
                self.deregister(&handle);
            }
            Err(_) => eprintln!("[Playback] espeak not installed; cannot speak"),
        }
    }

    // ── Device priming ──────────────────────────────────────────────────

    /// Set the common mixer controls on a device to full and unmute.
    /// Failures are swallowed: not every card exposes every control.
    fn ensure_device_active(&self, device: u32) {
        if self.inner.backend != Backend::Alsa {
            return;
        }
        for control in MIXER_CONTROLS {
            for value in ["100%", "unmute"] {
                let _ = Command::new("amixer")
                    .args(build_amixer_args(device, control, value))
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
            }
        }
    }

    // ── Stop ────────────────────────────────────────────────────────────

    /// Terminate every tracked child, raise the siren stop signal, close
    /// stream pipes, and sweep up stray audio tool processes. Returns with
    /// no live tracked processes.
    pub fn stop(&self) {
        self.record("stop".to_string());
        self.inner.siren.request_stop();

        let tracked: Vec<Arc<Mutex<Child>>> = {
            let mut procs = self.inner.procs.lock().unwrap();
            procs.drain(..).collect()
        };
        for handle in tracked {
            let mut child = handle.lock().unwrap();
            terminate_child(&mut child);
        }

        self.stop_streaming();

        match self.inner.backend {
            Backend::Alsa => {
                for tool in AUDIO_TOOLS {
                    let _ = Command::new("killall")
                        .args(["-q", tool])
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .status();
                }
            }
            Backend::Fallback => {
                self.with_fallback(|handle| handle.send(FallbackCmd::StopAll));
            }
            Backend::Silent => {}
        }
    }

    /// Number of live tracked child processes.
    pub fn tracked_process_count(&self) -> usize {
        self.inner.procs.lock().unwrap().len()
    }

    // ── Child registry ──────────────────────────────────────────────────

    fn register(&self, child: Child) -> Arc<Mutex<Child>> {
        let handle = Arc::new(Mutex::new(child));
        self.inner.procs.lock().unwrap().push(handle.clone());
        handle
    }

    fn deregister(&self, handle: &Arc<Mutex<Child>>) {
        let mut procs = self.inner.procs.lock().unwrap();
        procs.retain(|h| !Arc::ptr_eq(h, handle));
    }

    /// Wait for a registered child without holding its lock across sleeps.
    /// Returns None if the child was reaped elsewhere (stopped).
    fn wait_child(&self, handle: &Arc<Mutex<Child>>) -> Option<std::process::ExitStatus> {
        loop {
            {
                let mut child = handle.lock().unwrap();
                match child.try_wait() {
                    Ok(Some(status)) => return Some(status),
                    Ok(None) => {}
                    Err(_) => return None,
                }
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn with_fallback<F: FnOnce(&FallbackHandle)>(&self, f: F) {
        if let Some(handle) = self.inner.fallback.lock().unwrap().as_ref() {
            f(handle);
        }
    }
}

/// SIGTERM, a short grace, then SIGKILL.
fn terminate_child(child: &mut Child) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }
    let _ = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    let deadline = std::time::Instant::now() + KILL_GRACE;
    while std::time::Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Keep a seek offset inside the track. Unprobeable files pass through
/// unchanged and the player decides.
fn clamp_to_track(path: &Path, start_secs: f64) -> f64 {
    if start_secs <= 0.0 {
        return 0.0;
    }
    match media::probe_duration(path) {
        Ok(duration) if start_secs > duration.as_secs_f64() => {
            eprintln!(
                "[Playback] Seek {:.1}s past end of '{}'; starting at the top",
                start_secs,
                path.display()
            );
            0.0
        }
        _ => start_secs,
    }
}

/// Existing files from an optional list, order preserved.
fn playable_files(candidates: &[Option<&Path>]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for candidate in candidates.iter().flatten() {
        if candidate.exists() {
            files.push(candidate.to_path_buf());
        } else {
            eprintln!("[Playback] Skipping missing asset '{}'", candidate.display());
        }
    }
    files
}

// ── Fallback runtime ─────────────────────────────────────────────────────────
//
// rodio's output stream is not Send, so a dedicated thread owns it and
// external code communicates through a channel, mirroring the command
// dispatch used for the ALSA child registry.

enum FallbackCmd {
    PlayFiles {
        files: Vec<PathBuf>,
        done: Option<mpsc::Sender<()>>,
    },
    PlayMusic {
        path: PathBuf,
        start: Duration,
    },
    StartStream,
    FeedPcm(Vec<u8>),
    StopStream,
    PlaySweep {
        volume: f32,
        done: mpsc::Sender<()>,
    },
    StopAll,
}

struct FallbackHandle {
    tx: mpsc::Sender<FallbackCmd>,
}

impl FallbackHandle {
    fn send(&self, cmd: FallbackCmd) {
        let _ = self.tx.send(cmd);
    }
}

fn spawn_fallback_runtime() -> FallbackHandle {
    let (tx, rx) = mpsc::channel::<FallbackCmd>();
    std::thread::Builder::new()
        .name("fallback-audio".into())
        .spawn(move || fallback_thread_loop(rx))
        .expect("failed to spawn fallback audio thread");
    FallbackHandle { tx }
}

fn fallback_thread_loop(rx: mpsc::Receiver<FallbackCmd>) {
    use rodio::{Decoder, OutputStream, Sink};
    use std::fs::File;
    use std::io::BufReader;

    let output = OutputStream::try_default();
    let (_stream, handle) = match output {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("[Playback] Fallback audio unavailable: {}", e);
            // Drain commands so senders never block; answer done signals
            while let Ok(cmd) = rx.recv() {
                match cmd {
                    FallbackCmd::PlayFiles { done: Some(done), .. } => {
                        let _ = done.send(());
                    }
                    FallbackCmd::PlaySweep { done, .. } => {
                        let _ = done.send(());
                    }
                    _ => {}
                }
            }
            return;
        }
    };

    let mut active: Vec<(Sink, Option<mpsc::Sender<()>>)> = Vec::new();
    let mut music: Option<Sink> = None;
    let mut stream_sink: Option<Sink> = None;

    loop {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(FallbackCmd::PlayFiles { files, done }) => {
                match Sink::try_new(&handle) {
                    Ok(sink) => {
                        for file in &files {
                            match File::open(file).map(BufReader::new).map(Decoder::new) {
                                Ok(Ok(source)) => sink.append(source),
                                Ok(Err(e)) => {
                                    eprintln!("[Playback] Cannot decode '{}': {}", file.display(), e)
                                }
                                Err(e) => {
                                    eprintln!("[Playback] Cannot open '{}': {}", file.display(), e)
                                }
                            }
                        }
                        sink.play();
                        active.push((sink, done));
                    }
                    Err(e) => {
                        eprintln!("[Playback] Sink creation failed: {}", e);
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                    }
                }
            }
            Ok(FallbackCmd::PlayMusic { path, start }) => {
                if let Some(old) = music.take() {
                    old.stop();
                }
                if let Ok(sink) = Sink::try_new(&handle) {
                    match File::open(&path).map(BufReader::new).map(Decoder::new) {
                        Ok(Ok(source)) => {
                            sink.append(source);
                            if start > Duration::ZERO {
                                let _ = sink.try_seek(start);
                            }
                            sink.play();
                            music = Some(sink);
                        }
                        _ => eprintln!("[Playback] Cannot play '{}'", path.display()),
                    }
                }
            }
            Ok(FallbackCmd::StartStream) => {
                if let Ok(sink) = Sink::try_new(&handle) {
                    stream_sink = Some(sink);
                }
            }
            Ok(FallbackCmd::FeedPcm(pcm)) => {
                if let Some(sink) = &stream_sink {
                    // Raw chunks become playable by wrapping them in a WAV header
                    let wav = media::wrap_pcm_in_wav(&pcm, media::STREAM_SAMPLE_RATE);
                    match Decoder::new(std::io::Cursor::new(wav)) {
                        Ok(source) => {
                            sink.append(source);
                            sink.play();
                        }
                        Err(e) => eprintln!("[Playback] Bad PCM chunk: {}", e),
                    }
                }
            }
            Ok(FallbackCmd::StopStream) => {
                if let Some(sink) = stream_sink.take() {
                    sink.stop();
                }
            }
            Ok(FallbackCmd::PlaySweep { volume, done }) => {
                if let Ok(sink) = Sink::try_new(&handle) {
                    let buffer = rodio::buffer::SamplesBuffer::new(
                        1,
                        media::STREAM_SAMPLE_RATE,
                        sweep_samples(volume),
                    );
                    sink.append(buffer);
                    sink.play();
                    active.push((sink, Some(done)));
                } else {
                    let _ = done.send(());
                }
            }
            Ok(FallbackCmd::StopAll) => {
                for (sink, done) in active.drain(..) {
                    sink.stop();
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                if let Some(sink) = music.take() {
                    sink.stop();
                }
                if let Some(sink) = stream_sink.take() {
                    sink.stop();
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                // Reap finished sinks and signal their waiters
                let mut still_active = Vec::new();
                for (sink, done) in active.drain(..) {
                    if sink.empty() {
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                    } else {
                        still_active.push((sink, done));
                    }
                }
                active = still_active;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// One second of a 600→1200 Hz linear sine sweep at the given amplitude.
fn sweep_samples(volume: f32) -> Vec<i16> {
    let rate = media::STREAM_SAMPLE_RATE as f32;
    let count = media::STREAM_SAMPLE_RATE as usize;
    let amplitude = volume.clamp(0.0, 1.0) * i16::MAX as f32;
    let mut phase = 0.0f32;
    let mut samples = Vec::with_capacity(count);
    for i in 0..count {
        let t = i as f32 / rate;
        let freq = 600.0 + 600.0 * t;
        phase += 2.0 * std::f32::consts::PI * freq / rate;
        samples.push((phase.sin() * amplitude) as i16);
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zones::ZoneMap;

    fn test_zones() -> ZoneMap {
        ZoneMap::from_json(
            r#"{"Library": {"card": 2, "channel": "left"}, "Hall": 3}"#,
            Target::stereo(2),
        )
        .unwrap()
    }

    // -- Argument builders --

    #[test]
    fn aplay_args_select_device() {
        let args = build_aplay_args(Path::new("a.wav"), Target::stereo(3));
        assert_eq!(args, vec!["-q", "-D", "plughw:3,0", "a.wav"]);
    }

    #[test]
    fn sox_args_left_channel_remix() {
        let args = build_sox_play_args(Path::new("a.mp3"), Some(Channel::Left), 0.0);
        assert_eq!(args, vec!["-q", "a.mp3", "remix", "1", "0"]);
    }

    #[test]
    fn sox_args_right_channel_remix() {
        let args = build_sox_play_args(Path::new("a.mp3"), Some(Channel::Right), 0.0);
        assert_eq!(args, vec!["-q", "a.mp3", "remix", "0", "1"]);
    }

    #[test]
    fn sox_args_with_seek() {
        let args = build_sox_play_args(Path::new("song.mp3"), None, 30.0);
        assert_eq!(args, vec!["-q", "song.mp3", "trim", "30.000"]);
    }

    #[test]
    fn stream_args_raw_pcm_shape() {
        let args = build_aplay_stream_args(Target::stereo(2));
        assert!(args.contains(&"S16_LE".to_string()));
        assert!(args.contains(&"16000".to_string()));
        assert!(args.contains(&"raw".to_string()));
        assert_eq!(args.last().unwrap(), "-");

        let sox = build_sox_stream_args(Some(Channel::Right));
        assert!(sox.contains(&"signed".to_string()));
        assert!(sox.ends_with(&["remix".to_string(), "0".to_string(), "1".to_string()]));
    }

    #[test]
    fn siren_sweep_args_shape() {
        let args = build_siren_sweep_args(None, 0.5);
        assert_eq!(
            args,
            vec!["-q", "-n", "synth", "1", "sine", "600-1200", "vol", "0.500"]
        );
    }

    #[test]
    fn siren_sweep_volume_clamped() {
        let args = build_siren_sweep_args(None, 7.0);
        assert_eq!(args.last().unwrap(), "1.000");
    }

    #[test]
    fn amixer_args_shape() {
        assert_eq!(
            build_amixer_args(2, "Master", "100%"),
            vec!["-c", "2", "set", "Master", "100%"]
        );
    }

    #[test]
    fn aplay_only_for_plain_stereo_wav() {
        assert!(aplay_suffices(Path::new("a.wav"), Target::stereo(2), 0.0));
        assert!(!aplay_suffices(Path::new("a.mp3"), Target::stereo(2), 0.0));
        assert!(!aplay_suffices(
            Path::new("a.wav"),
            Target {
                device: 2,
                channel: Some(Channel::Left)
            },
            0.0
        ));
        assert!(!aplay_suffices(Path::new("a.wav"), Target::stereo(2), 5.0));
    }

    // -- Silent engine behavior --

    #[test]
    fn silent_engine_records_intent() {
        let engine = PlaybackEngine::silent(test_zones());
        engine.play_announcement(None, None, &["Library".to_string()]);
        engine.stop();
        let journal = engine.journal();
        assert!(journal.iter().any(|e| e.starts_with("announce")));
        assert!(journal.iter().any(|e| e == "stop"));
    }

    #[test]
    fn silent_streaming_tracks_pipe_count() {
        let engine = PlaybackEngine::silent(test_zones());
        assert_eq!(engine.open_stream_count(), 0);
        engine.start_streaming(&["Library".to_string(), "Hall".to_string()]);
        assert_eq!(engine.open_stream_count(), 2);
        engine.feed_stream(&[0u8; 640]);
        engine.stop_streaming();
        assert_eq!(engine.open_stream_count(), 0);
    }

    #[test]
    fn siren_is_idempotent_and_stoppable() {
        let engine = PlaybackEngine::silent(test_zones());
        engine.play_siren(&[], 0.05);
        assert!(engine.siren_active());
        // Second start only adjusts volume
        engine.play_siren(&[], 0.2);
        assert!((engine.siren_volume() - 0.2).abs() < 0.001);

        engine.stop_siren();
        // The loop observes the signal between sweeps
        std::thread::sleep(Duration::from_millis(100));
        assert!(!engine.siren_active());
    }

    #[test]
    fn stop_clears_tracked_processes_and_raises_siren_stop() {
        let engine = PlaybackEngine::silent(test_zones());
        engine.play_siren(&[], 0.1);
        engine.start_streaming(&["Hall".to_string()]);
        engine.stop();
        assert_eq!(engine.tracked_process_count(), 0);
        assert_eq!(engine.open_stream_count(), 0);
        std::thread::sleep(Duration::from_millis(100));
        assert!(!engine.siren_active());
    }

    #[test]
    fn backend_from_str() {
        assert_eq!(Backend::from_str_loose("ALSA").unwrap(), Backend::Alsa);
        assert_eq!(
            Backend::from_str_loose("fallback").unwrap(),
            Backend::Fallback
        );
        assert_eq!(Backend::from_str_loose("silent").unwrap(), Backend::Silent);
        assert!(Backend::from_str_loose("asio").is_err());
    }

    #[test]
    fn sweep_samples_scale_with_volume() {
        let quiet = sweep_samples(0.1);
        let loud = sweep_samples(0.9);
        assert_eq!(quiet.len(), 16_000);
        let quiet_peak = quiet.iter().map(|s| s.unsigned_abs()).max().unwrap();
        let loud_peak = loud.iter().map(|s| s.unsigned_abs()).max().unwrap();
        assert!(loud_peak > quiet_peak * 5);
    }

    #[test]
    fn seek_clamp_passes_through_unprobeable_files() {
        assert_eq!(clamp_to_track(Path::new("__missing__.mp3"), 30.0), 30.0);
        assert_eq!(clamp_to_track(Path::new("__missing__.mp3"), -5.0), 0.0);
    }

    #[test]
    fn missing_assets_are_skipped() {
        let engine = PlaybackEngine::silent(test_zones());
        // Should not panic or block
        engine.play_wav(None, Path::new("__missing__.wav"), &[]);
        engine.play_background_music(Path::new("__missing__.mp3"), &[], 0.0);
    }
}
