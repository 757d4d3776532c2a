use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Number of interpolation steps in a volume ramp.
const RAMP_STEPS: usize = 20;

/// Shared siren state: an active latch, an edge-triggered stop signal, and
/// the current volume stored as f32 bits. Cloned into the sweep worker;
/// the stop signal is checked between each sweep and between ramp steps.
#[derive(Clone)]
pub struct SirenControl {
    active: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    volume: Arc<AtomicU32>,
}

impl SirenControl {
    pub fn new() -> Self {
        SirenControl {
            active: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            volume: Arc::new(AtomicU32::new(0.0f32.to_bits())),
        }
    }

    /// Attempt to mark the siren active. Returns false if it already was —
    /// callers must not start a second sweep loop.
    pub fn try_activate(&self) -> bool {
        self.stop.store(false, Ordering::Relaxed);
        !self.active.swap(true, Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Raise the stop signal. The sweep loop observes it before the next sweep.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Called by the sweep loop as it exits.
    pub fn mark_inactive(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Current volume, 0.0–1.0.
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    /// Set the volume, clamped to [0, 1].
    pub fn set_volume(&self, volume: f32) {
        self.volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Linearly ramp the volume to `target` across `duration`, in 20 steps.
    /// Blocks the calling thread. Returns false if the stop signal aborted
    /// the ramp partway.
    pub fn ramp(&self, target: f32, duration: Duration) -> bool {
        let start = self.volume();
        let step_duration = duration / RAMP_STEPS as u32;
        for volume in ramp_steps(start, target) {
            if self.stop_requested() {
                return false;
            }
            self.set_volume(volume);
            std::thread::sleep(step_duration);
        }
        true
    }
}

impl Default for SirenControl {
    fn default() -> Self {
        Self::new()
    }
}

/// The interpolated volume values of a ramp, endpoint included.
fn ramp_steps(from: f32, to: f32) -> Vec<f32> {
    (1..=RAMP_STEPS)
        .map(|step| from + (to - from) * step as f32 / RAMP_STEPS as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activate_is_idempotent() {
        let siren = SirenControl::new();
        assert!(siren.try_activate());
        assert!(!siren.try_activate());
        assert!(siren.is_active());
    }

    #[test]
    fn activate_clears_previous_stop_signal() {
        let siren = SirenControl::new();
        siren.request_stop();
        assert!(siren.try_activate());
        assert!(!siren.stop_requested());
    }

    #[test]
    fn volume_clamps_to_unit_range() {
        let siren = SirenControl::new();
        siren.set_volume(1.5);
        assert_eq!(siren.volume(), 1.0);
        siren.set_volume(-0.2);
        assert_eq!(siren.volume(), 0.0);
        siren.set_volume(0.35);
        assert!((siren.volume() - 0.35).abs() < f32::EPSILON);
    }

    #[test]
    fn ramp_steps_are_linear_and_hit_target() {
        let steps = ramp_steps(0.0, 0.8);
        assert_eq!(steps.len(), 20);
        assert!((steps[9] - 0.4).abs() < 0.001);
        assert!((steps[19] - 0.8).abs() < 0.001);
    }

    #[test]
    fn ramp_reaches_target() {
        let siren = SirenControl::new();
        siren.set_volume(0.1);
        assert!(siren.ramp(0.8, Duration::from_millis(20)));
        assert!((siren.volume() - 0.8).abs() < 0.001);
    }

    #[test]
    fn ramp_aborts_on_stop_signal() {
        let siren = SirenControl::new();
        siren.set_volume(0.0);
        siren.request_stop();
        assert!(!siren.ramp(1.0, Duration::from_millis(20)));
        assert_eq!(siren.volume(), 0.0);
    }

    #[test]
    fn mark_inactive_allows_reactivation() {
        let siren = SirenControl::new();
        assert!(siren.try_activate());
        siren.request_stop();
        siren.mark_inactive();
        assert!(siren.try_activate());
    }
}
