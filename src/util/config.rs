use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct State {
    /// Saved default device address, `host[:port]`.
    pub device: Option<String>,
}

fn state_path() -> PathBuf {
    if let Some(dir) = dirs_next::config_dir() {
        return dir.join("apkbeam").join("state.json");
    }
    // Fallback to current directory
    PathBuf::from(".apkbeam_state.json")
}

/// Where adb itself keeps its keypair.
pub fn default_key_dir() -> PathBuf {
    match dirs_next::home_dir() {
        Some(home) => home.join(".android"),
        None => PathBuf::from(".android"),
    }
}

pub fn load_state() -> State {
    let path = state_path();
    if let Ok(bytes) = fs::read(&path) {
        if let Ok(state) = serde_json::from_slice::<State>(&bytes) {
            return state;
        }
    }
    State::default()
}

pub fn save_state(state: &State) -> Result<()> {
    let path = state_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }
    let bytes = serde_json::to_vec_pretty(state)?;
    fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))
}
