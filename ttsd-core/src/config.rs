//! On-disk configuration persistence.
//!
//! Format: whitespace-separated key-value lines, matching the original
//! `ttsd_config.c` format rather than a structured serde format.
//!
//! ```text
//! ENGINE_ID default
//! VOICE en_US 1
//! SPEED 3
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::Result;
use crate::voice::VoiceType;

/// Default voice type: Male (`1`), matching `ttsd_config.c`'s `g_vc_type`.
pub const DEFAULT_VOICE_TYPE: VoiceType = VoiceType::Male;
/// Default speed on the config file's 1..5 scale, matching `g_speed`.
pub const DEFAULT_SPEED: u32 = 3;
/// Default engine id when no config file exists yet.
pub const DEFAULT_ENGINE_ID: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub engine_id: String,
    pub default_language: String,
    pub default_voice_type: VoiceType,
    pub speed: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            engine_id: DEFAULT_ENGINE_ID.to_string(),
            default_language: "en_US".to_string(),
            default_voice_type: DEFAULT_VOICE_TYPE,
            speed: DEFAULT_SPEED,
        }
    }
}

impl DaemonConfig {
    /// Loads the config at `path`. On any parse error, or if the file is
    /// missing, falls back to `DaemonConfig::default()` and immediately
    /// rewrites a fresh file from that default — matching
    /// `ttsd_config.c`'s load-then-fallback-then-rewrite behavior.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => match parse(&contents) {
                Ok(cfg) => Ok(cfg),
                Err(e) => {
                    warn!("config parse error at {:?}: {e}, rewriting default", path);
                    let cfg = DaemonConfig::default();
                    cfg.save(path)?;
                    Ok(cfg)
                }
            },
            Err(_) => {
                let cfg = DaemonConfig::default();
                cfg.save(path)?;
                Ok(cfg)
            }
        }
    }

    /// Re-reads and parses the config file for the daemon's periodic
    /// change-watch, without `load_or_init`'s fallback-to-default-and-save
    /// behavior. `None` means "no change" — a missing, unreadable, or
    /// unparseable file during a poll is not treated as a reset.
    pub fn reload(path: &Path) -> Option<Self> {
        let contents = fs::read_to_string(path).ok()?;
        parse(&contents).ok()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        writeln!(file, "ENGINE_ID {}", self.engine_id)?;
        writeln!(
            file,
            "VOICE {} {}",
            self.default_language, self.default_voice_type as i32
        )?;
        writeln!(file, "SPEED {}", self.speed)?;
        Ok(())
    }
}

fn parse(contents: &str) -> std::result::Result<DaemonConfig, String> {
    let mut cfg = DaemonConfig::default();
    let mut saw_any = false;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let key = parts.next().ok_or("missing key")?;
        match key {
            "ENGINE_ID" => {
                cfg.engine_id = parts.next().ok_or("ENGINE_ID missing value")?.to_string();
                saw_any = true;
            }
            "VOICE" => {
                let lang = parts.next().ok_or("VOICE missing language")?.to_string();
                let ty: i32 = parts
                    .next()
                    .ok_or("VOICE missing type")?
                    .parse()
                    .map_err(|_| "VOICE type not an integer")?;
                cfg.default_language = lang;
                cfg.default_voice_type =
                    VoiceType::from_i32(ty).ok_or("VOICE type out of range")?;
                saw_any = true;
            }
            "SPEED" => {
                cfg.speed = parts
                    .next()
                    .ok_or("SPEED missing value")?
                    .parse()
                    .map_err(|_| "SPEED not an integer")?;
                saw_any = true;
            }
            other => {
                warn!("ignoring unknown config key: {other}");
            }
        }
    }

    if !saw_any {
        return Err("empty or unrecognized config file".to_string());
    }
    Ok(cfg)
}

/// The default path for the daemon config, relative to a config directory
/// supplied by the caller (no Tizen-specific absolute path is assumed).
pub fn default_config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("ttsd_config.conf")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_falls_back_to_default_and_creates_it() {
        let dir = tempdir().unwrap();
        let path = default_config_path(dir.path());
        let cfg = DaemonConfig::load_or_init(&path).unwrap();
        assert_eq!(cfg, DaemonConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempdir().unwrap();
        let path = default_config_path(dir.path());
        let cfg = DaemonConfig {
            engine_id: "festival".into(),
            default_language: "ko_KR".into(),
            default_voice_type: VoiceType::Female,
            speed: 5,
        };
        cfg.save(&path).unwrap();
        let loaded = DaemonConfig::load_or_init(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn corrupt_file_is_replaced_with_default() {
        let dir = tempdir().unwrap();
        let path = default_config_path(dir.path());
        fs::write(&path, "not a valid config\nrandom garbage").unwrap();
        let cfg = DaemonConfig::load_or_init(&path).unwrap();
        assert_eq!(cfg, DaemonConfig::default());
        let rewritten = fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains("ENGINE_ID"));
    }

    #[test]
    fn reload_returns_none_for_missing_file() {
        let dir = tempdir().unwrap();
        let path = default_config_path(dir.path());
        assert!(DaemonConfig::reload(&path).is_none());
    }

    #[test]
    fn reload_picks_up_a_changed_engine_id() {
        let dir = tempdir().unwrap();
        let path = default_config_path(dir.path());
        let cfg = DaemonConfig::default();
        cfg.save(&path).unwrap();
        let mut changed = cfg.clone();
        changed.engine_id = "festival".into();
        changed.save(&path).unwrap();
        assert_eq!(DaemonConfig::reload(&path).unwrap().engine_id, "festival");
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let contents = "ENGINE_ID default\nUNKNOWN_KEY 1 2 3\nSPEED 4\n";
        let cfg = parse(contents).unwrap();
        assert_eq!(cfg.engine_id, "default");
        assert_eq!(cfg.speed, 4);
    }
}
