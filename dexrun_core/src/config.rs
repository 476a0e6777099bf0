use crate::architecture::Architecture;
use crate::device::{DEFAULT_BRIDGE, DeviceOptions};
use crate::executor::{
    DEFAULT_BISECTION_SCRIPT, DEFAULT_EXECUTE_CLASS, DEFAULT_EXECUTE_DIR, ExecutorSettings,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Cannot execute on the host and on a specific device at the same time")]
    HostAndDevice,

    #[error("No architecture to execute on was specified")]
    NoArchitecture,

    /// Two architecture families were selected together, almost always a typo.
    #[error("Cannot mix {0} and {1} architectures")]
    MixedFamilies(&'static str, &'static str),

    /// Fewer than two things to compare against each other.
    #[error("Not enough backends specified ({0}); enable both the interpreter and the optimizing backend")]
    NotEnoughBackends(usize),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    #[serde(default)]
    pub host: bool,
    /// Serial passed to the bridge with `-s`.
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub no_boot_image: bool,
    #[serde(default = "default_bridge")]
    pub bridge: String,
    #[serde(default = "default_execute_dir")]
    pub execute_dir: String,
    #[serde(default)]
    pub android_root: Option<String>,
}

fn default_bridge() -> String {
    DEFAULT_BRIDGE.to_string()
}

fn default_execute_dir() -> String {
    DEFAULT_EXECUTE_DIR.to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: false,
            serial: None,
            no_boot_image: false,
            bridge: default_bridge(),
            execute_dir: default_execute_dir(),
            android_root: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorsConfig {
    #[serde(default)]
    pub interpreter: bool,
    #[serde(default)]
    pub optimizing: bool,
    #[serde(default)]
    pub architectures: BTreeSet<Architecture>,
    #[serde(default = "default_execute_class")]
    pub execute_class: String,
    #[serde(default)]
    pub short_timeouts: bool,
}

fn default_execute_class() -> String {
    DEFAULT_EXECUTE_CLASS.to_string()
}

impl Default for ExecutorsConfig {
    fn default() -> Self {
        Self {
            interpreter: false,
            optimizing: false,
            architectures: BTreeSet::new(),
            execute_class: default_execute_class(),
            short_timeouts: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default)]
    pub skip_host_verify: bool,
    #[serde(default)]
    pub dump_output: bool,
    #[serde(default)]
    pub dump_verify: bool,
    /// Extra runs of the golden executor when checking for self-divergence.
    #[serde(default = "default_divergence_retry")]
    pub divergence_retry: u32,
    #[serde(default)]
    pub bisection_search: bool,
    #[serde(default = "default_bisection_script")]
    pub bisection_script: String,
    #[serde(default)]
    pub report_file: Option<PathBuf>,
    #[serde(default = "default_unique_db")]
    pub unique_db: PathBuf,
    #[serde(default)]
    pub report_unique: bool,
    #[serde(default)]
    pub quiet: bool,
}

pub fn default_divergence_retry() -> u32 {
    10
}

pub fn default_bisection_script() -> String {
    DEFAULT_BISECTION_SCRIPT.to_string()
}

pub fn default_report_file() -> PathBuf {
    PathBuf::from("report.log")
}

pub fn default_unique_db() -> PathBuf {
    PathBuf::from("unique_progs.db")
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            skip_host_verify: false,
            dump_output: false,
            dump_verify: false,
            divergence_retry: default_divergence_retry(),
            bisection_search: false,
            bisection_script: default_bisection_script(),
            report_file: None,
            unique_db: default_unique_db(),
            report_unique: false,
            quiet: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DexrunConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub executors: ExecutorsConfig,
    #[serde(default)]
    pub run: RunConfig,
}

impl DexrunConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: DexrunConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Architectures executors are created for. Host execution always
    /// includes x86.
    pub fn effective_architectures(&self) -> BTreeSet<Architecture> {
        let mut architectures = self.executors.architectures.clone();
        if self.device.host {
            architectures.insert(Architecture::X86);
        }
        architectures
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.host && self.device.serial.is_some() {
            return Err(ConfigError::HostAndDevice);
        }
        let architectures = self.effective_architectures();
        if architectures.is_empty() {
            return Err(ConfigError::NoArchitecture);
        }

        let arm = architectures.iter().any(Architecture::is_arm);
        let x86 = architectures.iter().any(Architecture::is_x86);
        let mips = architectures.iter().any(Architecture::is_mips);
        if arm && x86 {
            return Err(ConfigError::MixedFamilies("ARM", "x86"));
        }
        if arm && mips {
            return Err(ConfigError::MixedFamilies("ARM", "MIPS"));
        }
        if x86 && mips {
            return Err(ConfigError::MixedFamilies("x86", "MIPS"));
        }

        let mut backends = 0;
        if self.executors.interpreter {
            backends += 1;
        }
        if self.executors.optimizing {
            backends += 1;
        }
        // ARM against ARM64 is a comparison in its own right.
        if architectures.contains(&Architecture::Arm) && architectures.contains(&Architecture::Arm64)
        {
            backends += 1;
        }
        if backends < 2 {
            return Err(ConfigError::NotEnoughBackends(backends));
        }
        Ok(())
    }

    pub fn device_options(&self) -> DeviceOptions {
        let base = if self.device.host {
            DeviceOptions::host()
        } else {
            DeviceOptions::remote(self.device.serial.clone())
        };
        DeviceOptions {
            no_boot_image: self.device.no_boot_image,
            bridge: self.device.bridge.clone(),
            ..base
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            execute_class: self.executors.execute_class.clone(),
            execute_dir: self.device.execute_dir.clone(),
            android_root: self.device.android_root.clone().unwrap_or_default(),
            short_timeouts: self.executors.short_timeouts,
            dump_verify: self.run.dump_verify,
            bisection_script: self.run.bisection_script.clone(),
        }
    }
}
