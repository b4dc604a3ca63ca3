use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use pkgswap_host::{HostLayout, ShellRunner, DEFAULT_ARCHIVE_TOOLS};
use pkgswap_orchestrator::ReplaceOptions;
use serde::{Deserialize, Serialize};

pub const CONFIG_ENV: &str = "PKGSWAP_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PkgswapConfig {
    /// Argv prefix the privileged command script is appended to.
    pub shell: Vec<String>,
    /// Quote the script as one word for prefixes that re-parse it on the
    /// device. Detected from an `adb ... shell` prefix when unset.
    pub remote_shell: Option<bool>,
    pub data_root: PathBuf,
    pub user_data_root: PathBuf,
    pub external_data_root: PathBuf,
    pub staging_root: PathBuf,
    pub relabel: bool,
    pub force_stop: bool,
    pub archive_tools: Vec<String>,
    pub state_dir: Option<PathBuf>,
}

impl Default for PkgswapConfig {
    fn default() -> Self {
        let layout = HostLayout::default();
        Self {
            shell: vec!["su".to_string(), "-c".to_string()],
            remote_shell: None,
            data_root: layout.data_root().to_path_buf(),
            user_data_root: layout.user_data_root().to_path_buf(),
            external_data_root: layout.external_data_root().to_path_buf(),
            staging_root: layout.staging_root().to_path_buf(),
            relabel: true,
            force_stop: true,
            archive_tools: DEFAULT_ARCHIVE_TOOLS
                .iter()
                .map(|tool| tool.to_string())
                .collect(),
            state_dir: None,
        }
    }
}

impl PkgswapConfig {
    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("failed parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the first config found at `explicit`, `$PKGSWAP_CONFIG`, or the
    /// per-user default path. Only the per-user default may be absent.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let Some((path, required)) = resolve_config_path(explicit, env_path, home.as_deref())
        else {
            return Ok(Self::default());
        };

        if !required && !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self
            .shell
            .first()
            .map_or(true, |program| program.trim().is_empty())
        {
            return Err(anyhow!("config key 'shell' must name a program"));
        }
        if self.archive_tools.is_empty() {
            return Err(anyhow!("config key 'archive_tools' must list at least one tool"));
        }
        for (key, path) in [
            ("data_root", &self.data_root),
            ("user_data_root", &self.user_data_root),
            ("external_data_root", &self.external_data_root),
            ("staging_root", &self.staging_root),
        ] {
            if !path.is_absolute() {
                return Err(anyhow!(
                    "config key '{key}' must be an absolute device path: {}",
                    path.display()
                ));
            }
        }
        Ok(())
    }

    pub fn layout(&self) -> HostLayout {
        HostLayout::new(
            &self.data_root,
            &self.user_data_root,
            &self.external_data_root,
            &self.staging_root,
        )
    }

    pub fn runner(&self) -> Result<ShellRunner> {
        let runner = ShellRunner::new(&self.shell)?;
        Ok(match self.remote_shell {
            Some(remote) => runner.with_remote(remote),
            None => runner,
        })
    }

    pub fn replace_options(&self) -> ReplaceOptions {
        ReplaceOptions {
            force_stop: self.force_stop,
            relabel: self.relabel,
            archive_tools: self.archive_tools.clone(),
        }
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        if let Some(state_dir) = &self.state_dir {
            return Ok(state_dir.clone());
        }
        let home = std::env::var("HOME").context("HOME is not set; cannot resolve state dir")?;
        Ok(PathBuf::from(home).join(".pkgswap"))
    }
}

/// Config path to read and whether it must exist.
pub fn resolve_config_path(
    explicit: Option<&Path>,
    env_path: Option<PathBuf>,
    home: Option<&Path>,
) -> Option<(PathBuf, bool)> {
    if let Some(path) = explicit {
        return Some((path.to_path_buf(), true));
    }
    if let Some(path) = env_path.filter(|path| !path.as_os_str().is_empty()) {
        return Some((path, true));
    }
    home.map(|home| {
        (
            home.join(".config").join("pkgswap").join("config.toml"),
            false,
        )
    })
}
