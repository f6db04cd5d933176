use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct KeystoneSettings {
    pub product_id: String,
    pub lockdown_product_id: String,
    pub update_url: String,
    pub lock_path: PathBuf,
    /// Process-list substring identifying a live desktop session.
    pub session_start_marker: String,
    /// Process-list substring identifying a running agent.
    pub session_stop_marker: String,
    pub broken_tickets: Vec<BrokenTicket>,
}

/// A third-party ticket known to have been registered with a wrong
/// existence-check path. Re-registered with `xc_path` when `version` matches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BrokenTicket {
    pub product_id: String,
    pub version: String,
    pub xc_path: String,
    pub url: String,
}

impl Default for KeystoneSettings {
    fn default() -> Self {
        Self {
            product_id: "com.google.Keystone".to_string(),
            lockdown_product_id: "com.google.Keystone.Lockdown".to_string(),
            update_url: "https://tools.google.com/service/update2".to_string(),
            lock_path: PathBuf::from("/tmp/.keystone_install_lock"),
            session_start_marker: "/System/Library/CoreServices/Finder.app".to_string(),
            session_stop_marker: crate::AGENT_PROCESS_NAME.to_string(),
            broken_tickets: vec![BrokenTicket {
                product_id: "com.google.talkplugin".to_string(),
                version: "1.0.15.1351".to_string(),
                xc_path: "/Library/Internet Plug-Ins/googletalkbrowserplugin.plugin".to_string(),
                url: "https://tools.google.com/service/update2".to_string(),
            }],
        }
    }
}

impl KeystoneSettings {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let settings: Self = toml::from_str(input).context("failed to parse keystone settings")?;
        for (field, value) in [
            ("product_id", &settings.product_id),
            ("lockdown_product_id", &settings.lockdown_product_id),
            ("session_start_marker", &settings.session_start_marker),
            ("session_stop_marker", &settings.session_stop_marker),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("settings field '{field}' must not be empty"));
            }
        }
        if settings.product_id == settings.lockdown_product_id {
            return Err(anyhow!(
                "lockdown_product_id must differ from product_id '{}'",
                settings.product_id
            ));
        }
        if settings.lock_path.as_os_str().is_empty() {
            return Err(anyhow!("settings field 'lock_path' must not be empty"));
        }
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid settings file: {}", path.display()))
    }
}
