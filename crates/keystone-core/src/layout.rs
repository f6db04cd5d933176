use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Result};

pub const BUNDLE_NAME: &str = "GoogleSoftwareUpdate.bundle";
pub const AGENT_PROCESS_NAME: &str = "GoogleSoftwareUpdateAgent";
pub const AGENT_DESCRIPTOR_NAME: &str = "com.google.keystone.agent.plist";
pub const DAEMON_DESCRIPTOR_NAME: &str = "com.google.keystone.daemon.plist";

const KEYSTONE_REL_DIR: &str = "Library/Google/GoogleSoftwareUpdate";
const AGENT_PREFERENCES_NAME: &str = "com.google.Keystone.Agent.plist";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallScope {
    System,
    User,
}

impl InstallScope {
    /// Value substituted for `${INSTALL_TYPE}` in job descriptors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "root",
            Self::User => "user",
        }
    }

    pub fn is_system(self) -> bool {
        self == Self::System
    }
}

/// Filesystem layout of one install root.
///
/// The root is stored normalized: absolute, no `.`/`..` segments, no doubled
/// separators. `root_display` renders it with the trailing separator that job
/// descriptors and error messages expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    root: PathBuf,
    scope: InstallScope,
}

impl InstallLayout {
    pub fn new(root: impl AsRef<Path>, scope: InstallScope) -> Result<Self> {
        Ok(Self {
            root: normalize_root(root.as_ref())?,
            scope,
        })
    }

    /// Scope is derived from the root: `/` is a system install, anything else
    /// is a per-user install.
    pub fn for_root(root: impl AsRef<Path>) -> Result<Self> {
        let root = normalize_root(root.as_ref())?;
        let scope = if root == Path::new("/") {
            InstallScope::System
        } else {
            InstallScope::User
        };
        Ok(Self { root, scope })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn root_display(&self) -> String {
        let mut rendered = self.root.display().to_string();
        if !rendered.ends_with('/') {
            rendered.push('/');
        }
        rendered
    }

    pub fn scope(&self) -> InstallScope {
        self.scope
    }

    pub fn is_system(&self) -> bool {
        self.scope.is_system()
    }

    pub fn library_dir(&self) -> PathBuf {
        self.root.join("Library")
    }

    pub fn keystone_dir(&self) -> PathBuf {
        self.root.join(KEYSTONE_REL_DIR)
    }

    pub fn bundle_dir(&self) -> PathBuf {
        self.keystone_dir().join(BUNDLE_NAME)
    }

    pub fn backup_bundle_dir(&self) -> PathBuf {
        self.keystone_dir().join(format!("{BUNDLE_NAME}.old"))
    }

    pub fn ticket_store_dir(&self) -> PathBuf {
        self.keystone_dir().join("TicketStore")
    }

    pub fn bundle_info_plist_path(&self) -> PathBuf {
        self.bundle_dir().join("Contents").join("Info.plist")
    }

    /// Path of the bundle manifest as stored inside the package archive.
    pub fn archive_info_plist_member(&self) -> String {
        format!("{BUNDLE_NAME}/Contents/Info.plist")
    }

    pub fn ksadmin_path(&self) -> PathBuf {
        self.bundle_dir().join("Contents").join("MacOS").join("ksadmin")
    }

    pub fn agent_app_path(&self) -> PathBuf {
        self.bundle_dir()
            .join("Contents")
            .join("Resources")
            .join(format!("{AGENT_PROCESS_NAME}.app"))
    }

    pub fn descriptor_template_path(&self, descriptor_name: &str) -> PathBuf {
        self.bundle_dir()
            .join("Contents")
            .join("Resources")
            .join(descriptor_name)
    }

    pub fn launch_agents_dir(&self) -> PathBuf {
        self.library_dir().join("LaunchAgents")
    }

    pub fn launch_daemons_dir(&self) -> PathBuf {
        self.library_dir().join("LaunchDaemons")
    }

    pub fn agent_descriptor_path(&self) -> PathBuf {
        self.launch_agents_dir().join(AGENT_DESCRIPTOR_NAME)
    }

    pub fn daemon_descriptor_path(&self) -> PathBuf {
        self.launch_daemons_dir().join(DAEMON_DESCRIPTOR_NAME)
    }

    pub fn caches_dir(&self) -> PathBuf {
        self.library_dir().join("Caches")
    }

    pub fn receipts_dir(&self) -> PathBuf {
        self.library_dir().join("Receipts")
    }

    pub fn manifest_cache_dirs(&self) -> Vec<PathBuf> {
        manifest_cache_dirs_under(&self.root)
    }
}

pub fn agent_preferences_path(home: &Path) -> PathBuf {
    home.join("Library")
        .join("Preferences")
        .join(AGENT_PREFERENCES_NAME)
}

pub fn user_caches_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Caches")
}

pub fn manifest_cache_dirs_under(base: &Path) -> Vec<PathBuf> {
    vec![
        base.join(KEYSTONE_REL_DIR).join("Manifests"),
        base.join("Library/Caches/com.google.UpdateEngine.Framework/ServerManifests"),
        base.join("Library/Caches/com.google.Keystone.Agent/ServerManifests"),
    ]
}

pub fn normalize_root(root: &Path) -> Result<PathBuf> {
    if root.as_os_str().is_empty() {
        return Err(anyhow!("install root must not be empty"));
    }
    if !root.is_absolute() {
        return Err(anyhow!(
            "install root must be absolute: {}",
            root.display()
        ));
    }

    let mut normalized = PathBuf::new();
    for component in root.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::Normal(segment) => normalized.push(segment),
            Component::ParentDir => {
                return Err(anyhow!(
                    "install root must not contain '..': {}",
                    root.display()
                ));
            }
        }
    }
    Ok(normalized)
}
