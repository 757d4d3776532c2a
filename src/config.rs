use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "zonecast_config.json";

/// Appliance configuration, persisted as JSON next to the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the zone→target mapping file.
    #[serde(default = "default_zone_config")]
    pub zone_config: PathBuf,
    /// Directory holding the intro chime and scratch WAV files.
    #[serde(default = "default_sounds_dir")]
    pub sounds_dir: PathBuf,
    /// Directory searched for the TTS binary and voice models.
    #[serde(default = "default_tts_dir")]
    pub tts_dir: PathBuf,
    /// Directory holding uploaded background music.
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
    /// Directory for the JSON document store.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    /// Device used when zone resolution yields nothing.
    #[serde(default = "default_fallback_device")]
    pub fallback_device: u32,
    /// Playback backend: "alsa" (multi-zone) or "fallback" (default device only).
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Seconds of heartbeat silence before a session task is stopped.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: f64,
    /// Seconds a heartbeat-less background task may run before the zombie kill.
    #[serde(default = "default_zombie_timeout")]
    pub zombie_timeout_secs: f64,
    /// Pause before a suspended task's audio resumes.
    #[serde(default = "default_resume_delay")]
    pub resume_delay_secs: f64,
    /// Siren lead-in before the emergency script is spoken.
    #[serde(default = "default_emergency_lead")]
    pub emergency_lead_secs: f64,
    /// Duration of the post-script siren volume ramp.
    #[serde(default = "default_siren_ramp")]
    pub siren_ramp_secs: f64,
    /// Days a log row survives before the daily cleanup deletes it.
    #[serde(default = "default_log_retention")]
    pub log_retention_days: i64,
}

fn default_zone_config() -> PathBuf {
    PathBuf::from("zones.json")
}
fn default_sounds_dir() -> PathBuf {
    PathBuf::from("system_sounds")
}
fn default_tts_dir() -> PathBuf {
    PathBuf::from("piper_tts")
}
fn default_media_dir() -> PathBuf {
    PathBuf::from("media")
}
fn default_store_dir() -> PathBuf {
    PathBuf::from("store")
}
fn default_fallback_device() -> u32 {
    2
}
fn default_backend() -> String {
    "alsa".to_string()
}
fn default_heartbeat_timeout() -> f64 {
    15.0
}
fn default_zombie_timeout() -> f64 {
    25.0
}
fn default_resume_delay() -> f64 {
    1.0
}
fn default_emergency_lead() -> f64 {
    2.5
}
fn default_siren_ramp() -> f64 {
    5.0
}
fn default_log_retention() -> i64 {
    7
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            zone_config: default_zone_config(),
            sounds_dir: default_sounds_dir(),
            tts_dir: default_tts_dir(),
            media_dir: default_media_dir(),
            store_dir: default_store_dir(),
            fallback_device: default_fallback_device(),
            backend: default_backend(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            zombie_timeout_secs: default_zombie_timeout(),
            resume_delay_secs: default_resume_delay(),
            emergency_lead_secs: default_emergency_lead(),
            siren_ramp_secs: default_siren_ramp(),
            log_retention_days: default_log_retention(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location, or fall back to defaults.
    pub fn load() -> Self {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Load configuration from a path, or create defaults if not found.
    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str(&data) {
                    Ok(config) => return config,
                    Err(e) => eprintln!("Warning: corrupt config file, using defaults: {}", e),
                },
                Err(e) => eprintln!("Warning: could not read config file: {}", e),
            }
        }
        AppConfig::default()
    }

    /// Persist current configuration to a path.
    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| format!("Serialize error: {}", e))?;
        fs::write(path, json).map_err(|e| format!("Write error: {}", e))?;
        Ok(())
    }

    /// The intro chime asset path.
    pub fn chime_path(&self) -> PathBuf {
        self.sounds_dir.join("intro.mp3")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.fallback_device, 2);
        assert_eq!(config.heartbeat_timeout_secs, 15.0);
        assert_eq!(config.zombie_timeout_secs, 25.0);
        assert_eq!(config.log_retention_days, 7);
        assert_eq!(config.backend, "alsa");
    }

    #[test]
    fn defaults_when_fields_missing_from_json() {
        let config: AppConfig = serde_json::from_str(r#"{"fallback_device": 5}"#).unwrap();
        assert_eq!(config.fallback_device, 5);
        assert_eq!(config.heartbeat_timeout_secs, 15.0);
        assert_eq!(config.sounds_dir, PathBuf::from("system_sounds"));
    }

    #[test]
    fn load_from_missing_path_gives_defaults() {
        let config = AppConfig::load_from(Path::new("__nonexistent_config__.json"));
        assert_eq!(config.fallback_device, 2);
    }

    #[test]
    fn chime_path_under_sounds_dir() {
        let config = AppConfig::default();
        assert_eq!(config.chime_path(), PathBuf::from("system_sounds/intro.mp3"));
    }

    #[test]
    fn config_roundtrip() {
        let mut config = AppConfig::default();
        config.fallback_device = 7;
        config.emergency_lead_secs = 0.1;
        let json = serde_json::to_string(&config).unwrap();
        let loaded: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.fallback_device, 7);
        assert_eq!(loaded.emergency_lead_secs, 0.1);
    }
}
