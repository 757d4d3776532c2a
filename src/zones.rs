use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// Stereo channel restriction for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Left,
    Right,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Left => write!(f, "left"),
            Channel::Right => write!(f, "right"),
        }
    }
}

/// A concrete audio output: a sound device, optionally restricted to one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub device: u32,
    pub channel: Option<Channel>,
}

impl Target {
    pub fn stereo(device: u32) -> Self {
        Target {
            device,
            channel: None,
        }
    }

    /// The ALSA device string for this target.
    pub fn alsa_device(&self) -> String {
        format!("plughw:{},0", self.device)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel {
            Some(ch) => write!(f, "device {} ({})", self.device, ch),
            None => write!(f, "device {}", self.device),
        }
    }
}

// Config file shapes: a target is either a bare card number (stereo)
// or {"card": N, "channel": "left"|"right"|null}; a zone maps to one
// target or a list of them.

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TargetSpec {
    Card(u32),
    Full {
        card: u32,
        #[serde(default)]
        channel: Option<Channel>,
    },
}

impl TargetSpec {
    fn to_target(&self) -> Target {
        match self {
            TargetSpec::Card(card) => Target::stereo(*card),
            TargetSpec::Full { card, channel } => Target {
                device: *card,
                channel: *channel,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ZoneSpec {
    One(TargetSpec),
    Many(Vec<TargetSpec>),
}

/// The sentinel zone name meaning "every configured target".
pub const ALL_ZONES: &str = "All Zones";

/// Static mapping of logical zone names to physical output targets.
#[derive(Debug, Clone)]
pub struct ZoneMap {
    zones: Vec<(String, Vec<Target>)>,
    fallback: Target,
}

impl ZoneMap {
    /// An empty map resolving everything to the fallback target.
    pub fn empty(fallback: Target) -> Self {
        ZoneMap {
            zones: Vec::new(),
            fallback,
        }
    }

    /// Load a zone map from a JSON config file.
    pub fn load(path: &Path, fallback: Target) -> Result<Self, String> {
        let data = fs::read_to_string(path)
            .map_err(|e| format!("Cannot read zone config '{}': {}", path.display(), e))?;
        Self::from_json(&data, fallback)
    }

    /// Parse a zone map from a JSON string.
    pub fn from_json(json: &str, fallback: Target) -> Result<Self, String> {
        let raw: std::collections::BTreeMap<String, ZoneSpec> =
            serde_json::from_str(json).map_err(|e| format!("Invalid zone config: {}", e))?;

        let zones = raw
            .into_iter()
            .map(|(name, spec)| {
                let targets = match spec {
                    ZoneSpec::One(t) => vec![t.to_target()],
                    ZoneSpec::Many(ts) => ts.iter().map(TargetSpec::to_target).collect(),
                };
                (name, targets)
            })
            .collect();

        Ok(ZoneMap { zones, fallback })
    }

    /// Configured zone names, in iteration order.
    pub fn zone_names(&self) -> Vec<&str> {
        self.zones.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn fallback(&self) -> Target {
        self.fallback
    }

    /// Resolve requested zone names to concrete targets.
    ///
    /// An empty request or the "All Zones" sentinel selects every configured
    /// target. Otherwise each requested name is matched case-insensitively as
    /// a substring of the configured keys; unmatched names are logged and
    /// skipped. If nothing resolves, the fallback target is returned alone.
    pub fn resolve(&self, requested: &[String]) -> Vec<Target> {
        let mut out: Vec<Target> = Vec::new();

        let want_all = requested.is_empty()
            || requested.iter().any(|z| z.eq_ignore_ascii_case(ALL_ZONES));

        if want_all {
            for (_, targets) in &self.zones {
                for t in targets {
                    push_unique(&mut out, *t);
                }
            }
        } else {
            for zone in requested {
                let needle = zone.to_lowercase();
                let mut matched = false;
                for (name, targets) in &self.zones {
                    if name.to_lowercase().contains(&needle) {
                        matched = true;
                        for t in targets {
                            push_unique(&mut out, *t);
                        }
                    }
                }
                if !matched {
                    eprintln!("[Zones] Warning: no match for zone '{}'", zone);
                }
            }
        }

        if out.is_empty() {
            out.push(self.fallback);
        }
        out
    }
}

fn push_unique(out: &mut Vec<Target>, target: Target) {
    if !out.contains(&target) {
        out.push(target);
    }
}
