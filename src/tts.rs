//! Synthesized speech via the external piper binary.
//!
//! Voice models are `.onnx` files discovered under the TTS directory; the
//! aliases `female` and `male` map onto preferred models when present.
//! Every synthesis call writes a fresh WAV at a unique path — cleanup is
//! delegated to the host filesystem policy.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub struct TtsEngine {
    base_dir: PathBuf,
    piper_exe: Option<PathBuf>,
    voices: HashMap<String, PathBuf>,
}

impl TtsEngine {
    /// Scan a directory for the piper executable and voice models.
    pub fn new(base_dir: &Path) -> Self {
        let piper_exe = find_piper_executable(base_dir);
        let voices = scan_voices(base_dir);

        if piper_exe.is_none() {
            eprintln!("[TTS] Warning: piper executable not found under '{}'", base_dir.display());
        }

        TtsEngine {
            base_dir: base_dir.to_path_buf(),
            piper_exe,
            voices,
        }
    }

    /// An engine with no binary and no voices; every synthesis returns None.
    pub fn disabled() -> Self {
        TtsEngine {
            base_dir: PathBuf::new(),
            piper_exe: None,
            voices: HashMap::new(),
        }
    }

    /// Known voice keys (aliases and model stems).
    pub fn voice_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.voices.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn has_voice(&self, voice_key: &str) -> bool {
        self.voices.contains_key(voice_key)
    }

    /// Synthesize text to a fresh WAV file. Returns the path on success,
    /// or None on binary absence, unknown voice, non-zero exit, or a
    /// missing output file.
    pub fn synthesize(&self, text: &str, voice_key: &str) -> Option<PathBuf> {
        let piper = self.piper_exe.as_ref()?;
        let model = self.voices.get(voice_key)?;
        let output = self
            .base_dir
            .join(format!("tts_{}.wav", uuid::Uuid::new_v4().simple()));

        let mut child = match Command::new(piper)
            .arg("--model")
            .arg(model)
            .arg("--output_file")
            .arg(&output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                eprintln!("[TTS] Failed to launch piper: {}", e);
                return None;
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(text.as_bytes()) {
                eprintln!("[TTS] Failed to feed text to piper: {}", e);
            }
        }

        match child.wait_with_output() {
            Ok(result) if result.status.success() && output.exists() => Some(output),
            Ok(result) => {
                let stderr = String::from_utf8_lossy(&result.stderr);
                eprintln!("[TTS] Piper failed ({}): {}", result.status, stderr.trim());
                None
            }
            Err(e) => {
                eprintln!("[TTS] Piper wait failed: {}", e);
                None
            }
        }
    }

    /// Synthesize with the requested voice, falling back to the default
    /// female alias when the requested key is missing or synthesis fails.
    pub fn synthesize_with_fallback(&self, text: &str, voice_key: &str) -> Option<PathBuf> {
        if let Some(path) = self.synthesize(text, voice_key) {
            return Some(path);
        }
        if voice_key != "female" {
            eprintln!("[TTS] Voice '{}' unavailable, trying female", voice_key);
            return self.synthesize(text, "female");
        }
        None
    }
}

fn find_piper_executable(base_dir: &Path) -> Option<PathBuf> {
    if !base_dir.exists() {
        return None;
    }
    let exe_name = if cfg!(windows) { "piper.exe" } else { "piper" };

    let direct = base_dir.join(exe_name);
    if direct.exists() {
        return Some(direct);
    }
    // Release archives often unpack into a 'piper' subfolder
    let subfolder = base_dir.join("piper").join(exe_name);
    if subfolder.exists() {
        return Some(subfolder);
    }

    let mut found = None;
    walk_files(base_dir, &mut |path| {
        if found.is_none() && path.file_name().map(|n| n == exe_name).unwrap_or(false) {
            found = Some(path.to_path_buf());
        }
    });
    found
}

fn scan_voices(base_dir: &Path) -> HashMap<String, PathBuf> {
    let mut voices = HashMap::new();
    if !base_dir.exists() {
        return voices;
    }

    walk_files(base_dir, &mut |path| {
        if path.extension().map(|e| e == "onnx").unwrap_or(false) {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                voices.insert(stem.to_string(), path.to_path_buf());
            }
        }
    });

    // Aliases, in preference order
    if let Some(amy) = voices.get("en_US-amy-medium").cloned() {
        voices.insert("female".to_string(), amy);
    } else if let Some(lessac) = voices.get("en_US-lessac-medium").cloned() {
        voices.insert("female".to_string(), lessac);
    }
    if let Some(ryan) = voices.get("en_US-ryan-medium").cloned() {
        voices.insert("male".to_string(), ryan);
    }

    voices
}

fn walk_files(dir: &Path, visit: &mut dyn FnMut(&Path)) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_files(&path, visit);
        } else {
            visit(&path);
        }
    }
}
