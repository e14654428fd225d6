// Daemon configuration load/save

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::bpf::BpfMode;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/trafficd/config.json";

const DEFAULT_BPF_ROOT: &str = "/sys/fs/bpf";
const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
const DEFAULT_BPF_OBJECT: &str = "/etc/trafficd/trafficd-bpf.o";
const DEFAULT_QTAGUID_CTRL: &str = "/proc/net/xt_qtaguid/ctrl";

/// Group allowed to read the cookie and counter-set maps
const AID_NET_BW_ACCT: u32 = 3007;
/// Group allowed to read the stats maps
const AID_NET_BW_STATS: u32 = 3006;

/// Configuration file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// bpf filesystem mount the maps and programs are pinned under
    #[serde(default = "default_bpf_root")]
    pub bpf_root: PathBuf,

    /// cgroup v2 root the accounting programs attach to
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    /// Compiled kernel programs
    #[serde(default = "default_bpf_object")]
    pub bpf_object: PathBuf,

    /// Control file of the legacy qtaguid module
    #[serde(default = "default_qtaguid_ctrl")]
    pub qtaguid_ctrl: PathBuf,

    #[serde(default)]
    pub bpf_mode: BpfMode,

    /// Platform API level, when running on a platform that reports one
    #[serde(default)]
    pub platform_api_level: Option<u32>,

    /// Register every existing interface in the index->name map at start
    #[serde(default = "default_true")]
    pub sync_interfaces: bool,

    /// Owner uid of the pinned maps. None leaves ownership untouched.
    #[serde(default = "default_map_owner")]
    pub map_owner: Option<u32>,

    #[serde(default = "default_accounting_group")]
    pub accounting_group: Option<u32>,

    #[serde(default = "default_stats_group")]
    pub stats_group: Option<u32>,
}

fn default_bpf_root() -> PathBuf {
    PathBuf::from(DEFAULT_BPF_ROOT)
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from(DEFAULT_CGROUP_ROOT)
}

fn default_bpf_object() -> PathBuf {
    PathBuf::from(DEFAULT_BPF_OBJECT)
}

fn default_qtaguid_ctrl() -> PathBuf {
    PathBuf::from(DEFAULT_QTAGUID_CTRL)
}

fn default_true() -> bool {
    true
}

fn default_map_owner() -> Option<u32> {
    Some(0)
}

fn default_accounting_group() -> Option<u32> {
    Some(AID_NET_BW_ACCT)
}

fn default_stats_group() -> Option<u32> {
    Some(AID_NET_BW_STATS)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bpf_root: default_bpf_root(),
            cgroup_root: default_cgroup_root(),
            bpf_object: default_bpf_object(),
            qtaguid_ctrl: default_qtaguid_ctrl(),
            bpf_mode: BpfMode::Auto,
            platform_api_level: None,
            sync_interfaces: true,
            map_owner: default_map_owner(),
            accounting_group: default_accounting_group(),
            stats_group: default_stats_group(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Config file {:?} not found, using defaults", path);
            return Ok(Config::default());
        }

        let contents =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to `path`, creating its directory if needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .context(format!("Failed to create config directory: {:?}", dir))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents).context(format!("Failed to write config file: {:?}", path))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }
}
