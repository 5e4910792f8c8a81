//! Capture settings: an immutable snapshot loaded at startup and replaced
//! wholesale by a supervised reload. The worker reads its share of these
//! through `VOXKEY_*` environment variables at spawn time, which is why
//! capture-affecting changes cannot be applied live.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const AUTO_STOP_MIN_MS: u64 = 1200;
pub const AUTO_STOP_MAX_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerMode {
    /// Recording runs while the hotkey combination is held.
    #[default]
    HoldToTalk,
    /// A hotkey release arms a session; the next release stops it.
    PressToTalk,
    /// The worker detects a spoken wake phrase and signals us.
    WakeWord,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::HoldToTalk => "hold-to-talk",
            TriggerMode::PressToTalk => "press-to-talk",
            TriggerMode::WakeWord => "wake-word",
        }
    }

    /// Whether this mode registers the hotkey poller at all.
    pub fn uses_hotkey(&self) -> bool {
        !matches!(self, TriggerMode::WakeWord)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub trigger_mode: TriggerMode,
    pub hotkey: String,
    pub wake_word: String,
    pub language: String,
    pub auto_stop_ms: u64,
    pub silence_rms_threshold: f64,
    pub silence_ms: u64,
    pub capture_source: String,
    pub input_device: Option<String>,
    pub system_audio_device: Option<String>,
    pub port: u16,
    pub pre_buffer_ms: u64,
    pub model_dir: Option<PathBuf>,
    pub model_name: String,
    pub compute_type: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub worker_command: String,
    pub worker_args: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            trigger_mode: TriggerMode::HoldToTalk,
            hotkey: "Ctrl+Shift+Space".to_string(),
            wake_word: String::new(),
            language: "auto".to_string(),
            auto_stop_ms: 8000,
            silence_rms_threshold: 0.0025,
            silence_ms: 1500,
            capture_source: "microphone".to_string(),
            input_device: None,
            system_audio_device: None,
            port: 9876,
            pre_buffer_ms: 500,
            model_dir: None,
            model_name: "small".to_string(),
            compute_type: "int8".to_string(),
            sample_rate: 16_000,
            channels: 1,
            worker_command: "voxkey-stt".to_string(),
            worker_args: Vec::new(),
        }
    }
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

pub fn load_settings(data_dir: &Path) -> Result<Settings> {
    let p = settings_path(data_dir);
    if !p.exists() {
        return Ok(Settings::default());
    }
    let s = fs::read_to_string(&p).context("read settings.json failed")?;
    let v: Settings = serde_json::from_str(&s).context("parse settings.json failed")?;
    Ok(v)
}

pub fn save_settings(data_dir: &Path, settings: &Settings) -> Result<()> {
    fs::create_dir_all(data_dir).ok();
    let p = settings_path(data_dir);
    let s = serde_json::to_string_pretty(settings).context("serialize settings failed")?;
    fs::write(&p, s).context("write settings.json failed")?;
    Ok(())
}

/// Configuration errors here are surfaced before anything is spawned; a
/// session can never start from an invalid snapshot.
pub fn validate(settings: &Settings) -> Result<()> {
    if settings.port == 0 {
        bail!("E_SETTINGS_PORT: control port must be non-zero");
    }
    if settings.worker_command.trim().is_empty() {
        bail!("E_SETTINGS_WORKER_COMMAND: worker command is empty");
    }
    match settings.trigger_mode {
        TriggerMode::WakeWord => {
            if settings.wake_word.trim().is_empty() {
                bail!("E_SETTINGS_WAKE_WORD: wake-word mode requires a wake phrase");
            }
        }
        TriggerMode::HoldToTalk | TriggerMode::PressToTalk => {
            if settings.hotkey.trim().is_empty() {
                bail!(
                    "E_SETTINGS_HOTKEY: {} mode requires a hotkey combination",
                    settings.trigger_mode.as_str()
                );
            }
        }
    }
    Ok(())
}

pub fn clamp_auto_stop_ms(ms: u64) -> u64 {
    ms.clamp(AUTO_STOP_MIN_MS, AUTO_STOP_MAX_MS)
}

/// True when a settings change alters the worker's capture behavior or the
/// trigger wiring and thus needs the full supervised reload (the worker is
/// parameterized at spawn; the hotkey poller is registered alongside it).
pub fn requires_reload(old: &Settings, new: &Settings) -> bool {
    old.trigger_mode != new.trigger_mode
        || old.hotkey != new.hotkey
        || old.wake_word != new.wake_word
        || old.silence_rms_threshold != new.silence_rms_threshold
        || old.silence_ms != new.silence_ms
        || old.language != new.language
        || old.capture_source != new.capture_source
        || old.input_device != new.input_device
        || old.system_audio_device != new.system_audio_device
        || old.port != new.port
        || old.pre_buffer_ms != new.pre_buffer_ms
        || old.model_dir != new.model_dir
        || old.model_name != new.model_name
        || old.compute_type != new.compute_type
        || old.sample_rate != new.sample_rate
        || old.channels != new.channels
        || old.worker_command != new.worker_command
        || old.worker_args != new.worker_args
}

/// The environment map injected into the worker at spawn.
pub fn worker_env(settings: &Settings) -> Vec<(String, String)> {
    let mut env = vec![
        ("VOXKEY_STT_PORT".to_string(), settings.port.to_string()),
        (
            "VOXKEY_PRE_BUFFER_MS".to_string(),
            settings.pre_buffer_ms.to_string(),
        ),
        (
            "VOXKEY_MODEL_NAME".to_string(),
            settings.model_name.clone(),
        ),
        (
            "VOXKEY_COMPUTE_TYPE".to_string(),
            settings.compute_type.clone(),
        ),
        (
            "VOXKEY_SAMPLE_RATE".to_string(),
            settings.sample_rate.to_string(),
        ),
        ("VOXKEY_CHANNELS".to_string(), settings.channels.to_string()),
        ("VOXKEY_LANGUAGE".to_string(), settings.language.clone()),
        (
            "VOXKEY_TRIGGER_MODE".to_string(),
            settings.trigger_mode.as_str().to_string(),
        ),
        ("VOXKEY_WAKE_WORD".to_string(), settings.wake_word.clone()),
        (
            "VOXKEY_SILENCE_RMS_THRESHOLD".to_string(),
            settings.silence_rms_threshold.to_string(),
        ),
        (
            "VOXKEY_SILENCE_MS".to_string(),
            settings.silence_ms.to_string(),
        ),
        (
            "VOXKEY_CAPTURE_SOURCE".to_string(),
            settings.capture_source.clone(),
        ),
    ];
    if let Some(dir) = &settings.model_dir {
        env.push((
            "VOXKEY_MODEL_DIR".to_string(),
            dir.display().to_string(),
        ));
    }
    if let Some(dev) = &settings.input_device {
        env.push(("VOXKEY_INPUT_DEVICE".to_string(), dev.clone()));
    }
    if let Some(dev) = &settings.system_audio_device {
        env.push(("VOXKEY_SYSTEM_AUDIO_DEVICE".to_string(), dev.clone()));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_defaults_when_file_missing() {
        let td = tempfile::tempdir().expect("tempdir");
        let s = load_settings(td.path()).expect("load");
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut s = Settings::default();
        s.trigger_mode = TriggerMode::WakeWord;
        s.wake_word = "hey vox".to_string();
        s.auto_stop_ms = 5000;
        save_settings(td.path(), &s).expect("save");
        let loaded = load_settings(td.path()).expect("load");
        assert_eq!(loaded, s);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let td = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(td.path()).expect("mkdir");
        fs::write(
            settings_path(td.path()),
            r#"{"language": "en", "obsolete_field": true}"#,
        )
        .expect("write");
        let s = load_settings(td.path()).expect("load");
        assert_eq!(s.language, "en");
    }

    #[test]
    fn auto_stop_bound_is_clamped() {
        assert_eq!(clamp_auto_stop_ms(0), AUTO_STOP_MIN_MS);
        assert_eq!(clamp_auto_stop_ms(1200), 1200);
        assert_eq!(clamp_auto_stop_ms(8000), 8000);
        assert_eq!(clamp_auto_stop_ms(120_000), AUTO_STOP_MAX_MS);
    }

    #[test]
    fn wake_mode_requires_wake_word() {
        let mut s = Settings::default();
        s.trigger_mode = TriggerMode::WakeWord;
        s.wake_word = "  ".to_string();
        let err = validate(&s).expect_err("should fail");
        assert!(err.to_string().contains("E_SETTINGS_WAKE_WORD"));
    }

    #[test]
    fn hotkey_modes_require_hotkey() {
        let mut s = Settings::default();
        s.hotkey = String::new();
        let err = validate(&s).expect_err("should fail");
        assert!(err.to_string().contains("E_SETTINGS_HOTKEY"));
    }

    #[test]
    fn worker_env_covers_capture_parameters() {
        let mut s = Settings::default();
        s.input_device = Some("mic-2".to_string());
        let env = worker_env(&s);
        let get = |k: &str| {
            env.iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("VOXKEY_STT_PORT"), Some("9876"));
        assert_eq!(get("VOXKEY_PRE_BUFFER_MS"), Some("500"));
        assert_eq!(get("VOXKEY_TRIGGER_MODE"), Some("hold-to-talk"));
        assert_eq!(get("VOXKEY_CAPTURE_SOURCE"), Some("microphone"));
        assert_eq!(get("VOXKEY_INPUT_DEVICE"), Some("mic-2"));
        assert_eq!(get("VOXKEY_SYSTEM_AUDIO_DEVICE"), None);
    }

    #[test]
    fn reload_needed_only_for_capture_affecting_changes() {
        let old = Settings::default();
        let mut new = old.clone();
        new.auto_stop_ms = 3000;
        assert!(!requires_reload(&old, &new));

        new.wake_word = "hey vox".to_string();
        assert!(requires_reload(&old, &new));

        let mut rebound = old.clone();
        rebound.hotkey = "F9".to_string();
        assert!(requires_reload(&old, &rebound));
    }
}
