mod layout;
mod manifest;
mod settings;
mod template;
mod version;

pub use layout::{
    agent_preferences_path, manifest_cache_dirs_under, normalize_root, user_caches_dir,
    InstallLayout, InstallScope, AGENT_DESCRIPTOR_NAME, AGENT_PROCESS_NAME, BUNDLE_NAME,
    DAEMON_DESCRIPTOR_NAME,
};
pub use manifest::{bundle_version_from_plist, read_plist_string, BUNDLE_VERSION_KEY};
pub use settings::{BrokenTicket, KeystoneSettings};
pub use template::{render_job_descriptor, DescriptorTokens, DEFAULT_START_INTERVAL};
pub use version::{is_version_greater, BundleVersion};
