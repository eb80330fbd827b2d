// Settings persistence and supervisor timing knobs

use crate::filters::IpsetMode;
use crate::launch::{DEFAULT_EXECUTABLE, DEFAULT_GAME_FILTER_PORTS, ResourceLayout};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR: &str = "zapret-supervisor";
const CONFIG_FILE: &str = "settings.json";

/// User settings shared with the desktop front end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Restart the last strategy when winws dies on its own
    pub auto_restart_enabled: bool,

    /// Stop winws when the supervisor shuts down
    pub close_on_exit: bool,

    /// Strategy that last reached `Running`
    pub last_strategy_id: String,

    pub game_filter_enabled: bool,

    pub ipset_mode: IpsetMode,

    /// Start `last_strategy_id` at launch when nothing is running
    pub auto_start_last_strategy: bool,

    /// winws folder; None = `winws` next to the executable
    pub winws_path: Option<PathBuf>,

    /// What `%GameFilter%` expands to
    pub game_filter_ports: String,

    pub executable_name: String,

    /// Process names closed and relaunched before every strategy start
    pub auto_restart_apps: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_restart_enabled: false,
            close_on_exit: true,
            last_strategy_id: String::new(),
            game_filter_enabled: false,
            ipset_mode: IpsetMode::Loaded,
            auto_start_last_strategy: false,
            winws_path: None,
            game_filter_ports: DEFAULT_GAME_FILTER_PORTS.to_string(),
            executable_name: DEFAULT_EXECUTABLE.to_string(),
            auto_restart_apps: Vec::new(),
        }
    }
}

impl Settings {
    /// Get the settings file path, creating its directory
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("No configuration directory on this platform")?
            .join(CONFIG_DIR);

        fs::create_dir_all(&config_dir).context(format!(
            "Failed to create config directory: {:?}",
            config_dir
        ))?;

        Ok(config_dir.join(CONFIG_FILE))
    }

    /// Load settings from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Settings file not found, using defaults");
            return Ok(Settings::default());
        }

        let contents =
            fs::read_to_string(path).context(format!("Failed to read settings file: {:?}", path))?;

        let settings: Settings =
            serde_json::from_str(&contents).context("Failed to parse settings file")?;

        log::info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize settings")?;

        fs::write(path, contents).context(format!("Failed to write settings file: {:?}", path))?;

        log::debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// winws folder: explicit override, configured path, or `winws` beside the binary
    pub fn winws_root(&self, override_root: Option<&Path>) -> PathBuf {
        if let Some(root) = override_root {
            return root.to_path_buf();
        }
        if let Some(root) = self.winws_path.as_ref().filter(|p| !p.as_os_str().is_empty()) {
            return root.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("winws")))
            .unwrap_or_else(|| PathBuf::from("winws"))
    }

    pub fn layout(&self, override_root: Option<&Path>) -> ResourceLayout {
        ResourceLayout {
            root: self.winws_root(override_root),
            executable_name: self.executable_name.clone(),
            game_filter_ports: self.game_filter_ports.clone(),
        }
    }
}

/// Settings as seen by the supervisor
pub trait SettingsStore: Send {
    fn current(&self) -> &Settings;

    /// Remember the strategy that just came up
    fn record_last_strategy(&mut self, id: &str) -> Result<()>;
}

/// In-memory settings, nothing persisted
impl SettingsStore for Settings {
    fn current(&self) -> &Settings {
        self
    }

    fn record_last_strategy(&mut self, id: &str) -> Result<()> {
        self.last_strategy_id = id.to_string();
        Ok(())
    }
}

/// Settings backed by a JSON file, written through on every change
#[derive(Debug, Clone)]
pub struct FileSettings {
    path: PathBuf,
    settings: Settings,
}

impl FileSettings {
    pub fn open(path: PathBuf) -> Result<Self> {
        let settings = Settings::load_from(&path)?;
        Ok(Self { path, settings })
    }

    pub fn open_default() -> Result<Self> {
        Self::open(Settings::config_path()?)
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn save(&self) -> Result<()> {
        self.settings.save_to(&self.path)
    }
}

impl SettingsStore for FileSettings {
    fn current(&self) -> &Settings {
        &self.settings
    }

    fn record_last_strategy(&mut self, id: &str) -> Result<()> {
        if self.settings.last_strategy_id == id {
            return Ok(());
        }
        self.settings.last_strategy_id = id.to_string();
        self.save()
    }
}

/// Durations that drive the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorTimings {
    /// Liveness poll period
    pub poll_interval: Duration,
    /// How long a spawned process has to show up
    pub start_confirmation: Duration,
    /// Wait between graceful and forced termination
    pub termination_grace: Duration,
    /// Delay before an automatic restart
    pub restart_settle: Duration,
    /// Pause before spawning so a previous instance can release the driver
    pub pre_spawn_settle: Duration,
    /// Step of the start confirmation loop
    pub confirmation_poll: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            start_confirmation: Duration::from_secs(5),
            termination_grace: Duration::from_millis(500),
            restart_settle: Duration::from_secs(1),
            pre_spawn_settle: Duration::from_millis(500),
            confirmation_poll: Duration::from_millis(100),
        }
    }
}
