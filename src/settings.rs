use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// HTTP base of the screening service; the call socket URL is derived
    /// from it.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Recognition locale, fixed for the lifetime of a call.
    #[serde(default = "default_language")]
    pub language: String,
    /// API key for the streaming speech-to-text engine.
    #[serde(default)]
    pub stt_api_key: String,
    /// Input device name; empty means the system default.
    #[serde(default)]
    pub mic_device: String,
}

impl Settings {
    pub fn mic_device(&self) -> Option<&str> {
        if self.mic_device.is_empty() {
            None
        } else {
            Some(&self.mic_device)
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            language: default_language(),
            stt_api_key: String::new(),
            mic_device: String::new(),
        }
    }
}

fn default_api_base_url() -> String {
    "http://localhost:8000".into()
}

fn default_language() -> String {
    "en-US".into()
}

pub fn settings_path() -> Result<PathBuf, String> {
    if let Some(dir) = dirs::data_local_dir() {
        return Ok(dir.join("callscreen").join("settings.json"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".callscreen").join("settings.json"));
    }
    Err("Failed to resolve data directory".into())
}

pub fn load() -> Settings {
    match settings_path() {
        Ok(path) => load_path(&path),
        Err(_) => Settings::default(),
    }
}

pub fn load_path(path: &Path) -> Settings {
    match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
        Err(_) => Settings::default(),
    }
}

pub fn save(settings: &Settings) -> Result<(), String> {
    let path = settings_path()?;
    save_path(&path, settings)
}

pub fn save_path(path: &Path, settings: &Settings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create settings dir: {}", e))?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    fs::write(path, json).map_err(|e| format!("Failed to write settings: {}", e))?;
    Ok(())
}
