// Game filter and ipset filter mode files
//
// Both modes are realized on disk where `service.bat` and the launchers pick
// them up: a flag file for the game filter, and the contents of
// `lists/ipset-all.txt` for the ipset mode.

use crate::launch::ResourceLayout;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

const GAME_FILTER_FLAG: &str = "game_filter.enabled";
const IPSET_LIST: &str = "ipset-all.txt";
const IPSET_BACKUP: &str = "ipset-all.txt.backup";

/// Address from TEST-NET-3 that nothing routes to; a list holding only it matches nothing
pub const IPSET_SENTINEL: &str = "203.0.113.113/32";

/// How the `ipset-all.txt` list is applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IpsetMode {
    /// The downloaded list is in place
    #[default]
    Loaded,
    /// Only the sentinel address, so no IP matches
    None,
    /// Empty list, so every IP matches
    Any,
}

impl fmt::Display for IpsetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IpsetMode::Loaded => "loaded",
            IpsetMode::None => "none",
            IpsetMode::Any => "any",
        };
        f.write_str(name)
    }
}

impl FromStr for IpsetMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "loaded" => Ok(IpsetMode::Loaded),
            "none" => Ok(IpsetMode::None),
            "any" => Ok(IpsetMode::Any),
            other => bail!("Unknown ipset mode: {}", other),
        }
    }
}

/// Reads and writes the filter mode files of one winws installation
#[derive(Debug, Clone)]
pub struct FilterFiles {
    lists_dir: PathBuf,
    utils_dir: PathBuf,
}

impl FilterFiles {
    pub fn new(layout: &ResourceLayout) -> Self {
        Self {
            lists_dir: layout.lists_dir(),
            utils_dir: layout.utils_dir(),
        }
    }

    fn game_filter_flag(&self) -> PathBuf {
        self.utils_dir.join(GAME_FILTER_FLAG)
    }

    fn ipset_list(&self) -> PathBuf {
        self.lists_dir.join(IPSET_LIST)
    }

    fn ipset_backup(&self) -> PathBuf {
        self.lists_dir.join(IPSET_BACKUP)
    }

    pub fn game_filter_enabled(&self) -> bool {
        self.game_filter_flag().exists()
    }

    pub fn set_game_filter(&self, enabled: bool) -> Result<()> {
        let flag = self.game_filter_flag();
        if enabled {
            fs::create_dir_all(&self.utils_dir)
                .context(format!("Failed to create {:?}", self.utils_dir))?;
            fs::write(&flag, "ENABLED").context(format!("Failed to write {:?}", flag))?;
        } else {
            match fs::remove_file(&flag) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).context(format!("Failed to remove {:?}", flag)),
            }
        }
        log::info!(
            "Game filter {}",
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Current ipset mode; a missing or unreadable list counts as `loaded`
    pub fn ipset_mode(&self) -> IpsetMode {
        let Ok(content) = fs::read_to_string(self.ipset_list()) else {
            return IpsetMode::Loaded;
        };
        let content = content.trim();
        if content.lines().all(|l| l.trim().is_empty()) {
            IpsetMode::Any
        } else if content == IPSET_SENTINEL {
            IpsetMode::None
        } else {
            IpsetMode::Loaded
        }
    }

    /// Switch ipset mode, keeping the real list in a backup while it is replaced
    pub fn set_ipset_mode(&self, mode: IpsetMode) -> Result<()> {
        let list = self.ipset_list();
        let backup = self.ipset_backup();

        match mode {
            IpsetMode::Loaded => {
                if !backup.exists() {
                    bail!("No ipset backup at {:?}; update the ipset list first", backup);
                }
                fs::rename(&backup, &list)
                    .context(format!("Failed to restore {:?} from backup", list))?;
            }
            IpsetMode::None | IpsetMode::Any => {
                self.backup_real_list()?;
                let content = if mode == IpsetMode::None { IPSET_SENTINEL } else { "" };
                fs::create_dir_all(&self.lists_dir)
                    .context(format!("Failed to create {:?}", self.lists_dir))?;
                fs::write(&list, content).context(format!("Failed to write {:?}", list))?;
            }
        }

        log::info!("IPSet filter mode set to {}", mode);
        Ok(())
    }

    /// Copy the list aside unless it is already a placeholder or a backup exists
    fn backup_real_list(&self) -> Result<()> {
        let backup = self.ipset_backup();
        if backup.exists() {
            return Ok(());
        }
        let content = match fs::read_to_string(self.ipset_list()) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context("Failed to read ipset list"),
        };
        let content = content.trim();
        if !content.is_empty() && content != IPSET_SENTINEL {
            fs::write(&backup, content).context(format!("Failed to write {:?}", backup))?;
        }
        Ok(())
    }
}
