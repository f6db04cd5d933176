mod activity;
mod bundle;
mod command;
mod error;
mod fs_utils;
mod jobs;
mod lock;
mod login_items;
mod orchestrator;
mod privilege;
mod receipts;
mod tickets;

pub use activity::{activity_file_path, resolve_home_dir, touch_activity_file};
pub use bundle::{
    clear_quarantine, BundleInstallOutcome, BundleInstaller, QuarantineStrategy,
    QUARANTINE_STRATEGIES, TAR_PATH,
};
pub use command::{CommandOutput, CommandRunner, SystemCommandRunner};
pub use error::{FailureKind, KeystoneError};
pub use fs_utils::{create_dir_tree, path_exists, remove_path_if_exists, write_file_atomically};
pub use jobs::{
    is_legacy_host_version, parse_session_processes, probe_host_version, select_strategy,
    JobContext, JobKind, JobLifecycleController, JobLifecycleStrategy, JobTransition,
    LegacyProcessControl, ModernSupervisor, SessionProcess, LAUNCHCTL_PATH,
};
pub use lock::InstallLock;
pub use login_items::{LoginItemManager, LoginItemWrite, DEFAULTS_PATH, LOGIN_ITEMS_KEY};
pub use orchestrator::{
    system_layout, FixupReport, InstallOrchestrator, InstallReport, InstallerConfig, Operation,
};
pub use privilege::{
    HostIdentity, PrivilegeContext, PrivilegeSnapshot, SystemIdentity, ADMIN_STAFF_GID,
    ELEVATED_UMASK, SUPERUSER_UID, WHEEL_GID,
};
pub use receipts::{remove_legacy_receipts, LEGACY_RECEIPT_NAMES};
pub use tickets::{
    TicketDeletion, TicketRegistrar, TicketRegistration, LOCKDOWN_TICKET_VERSION, NO_TICKET_MARKER,
};
