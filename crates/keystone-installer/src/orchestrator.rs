use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use keystone_core::{
    agent_preferences_path, bundle_version_from_plist, is_version_greater,
    manifest_cache_dirs_under, render_job_descriptor, user_caches_dir, BundleVersion,
    DescriptorTokens, InstallLayout, InstallScope, KeystoneSettings, AGENT_DESCRIPTOR_NAME,
    BUNDLE_VERSION_KEY, DAEMON_DESCRIPTOR_NAME, DEFAULT_START_INTERVAL,
};

use crate::bundle::{build_read_member_command, BundleInstaller};
use crate::command::{run_checked, CommandRunner};
use crate::error::{FailureKind, KeystoneError};
use crate::fs_utils::{path_exists, remove_path_if_exists, write_file_atomically};
use crate::jobs::{
    probe_host_version, select_strategy, JobContext, JobKind, JobLifecycleController,
    JobLifecycleStrategy, JobTransition,
};
use crate::login_items::LoginItemManager;
use crate::privilege::{HostIdentity, PrivilegeContext};
use crate::receipts::remove_legacy_receipts;
use crate::tickets::{TicketRegistrar, TicketRegistration, LOCKDOWN_TICKET_VERSION};

const PURGED_CACHE_PREFIXES: [&str; 2] = ["com.google.Keystone", "com.google.UpdateEngine"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerConfig {
    pub layout: InstallLayout,
    /// Root consulted to decide whether a system install exists.
    pub system_root: PathBuf,
    pub package: Option<PathBuf>,
    pub write_job_descriptors: bool,
    pub control_jobs: bool,
    pub self_destruct: bool,
    pub force: bool,
    pub lockdown: bool,
    pub simulate_legacy_host: bool,
    pub start_interval: u32,
    pub invoking_uid: u32,
    pub home_dir: PathBuf,
    pub settings: KeystoneSettings,
}

impl InstallerConfig {
    pub fn new(layout: InstallLayout, home_dir: PathBuf, invoking_uid: u32) -> Self {
        Self {
            layout,
            system_root: PathBuf::from("/"),
            package: None,
            write_job_descriptors: true,
            control_jobs: true,
            self_destruct: false,
            force: false,
            lockdown: false,
            simulate_legacy_host: false,
            start_interval: DEFAULT_START_INTERVAL,
            invoking_uid,
            home_dir,
            settings: KeystoneSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Install,
    Uninstall,
    Nuke,
    RemoveReceipts,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Version placed on disk; `None` when the installed version was current.
    pub installed: Option<BundleVersion>,
    pub replaced_existing: bool,
    pub lockdown_registered: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixupReport {
    pub removed_manifest_caches: usize,
    pub repaired_tickets: Vec<String>,
}

pub struct InstallOrchestrator<'a> {
    config: InstallerConfig,
    runner: &'a dyn CommandRunner,
    identity: &'a dyn HostIdentity,
    privilege: PrivilegeContext<'a>,
    strategy: Box<dyn JobLifecycleStrategy>,
}

impl<'a> InstallOrchestrator<'a> {
    /// Detects the host variant once and picks the matching job strategy.
    pub fn new(
        config: InstallerConfig,
        runner: &'a dyn CommandRunner,
        identity: &'a dyn HostIdentity,
    ) -> Self {
        let host_version = if config.simulate_legacy_host {
            None
        } else {
            probe_host_version(runner)
        };
        let strategy = select_strategy(config.simulate_legacy_host, host_version.as_deref());
        Self::with_strategy(config, runner, identity, strategy)
    }

    pub fn with_strategy(
        config: InstallerConfig,
        runner: &'a dyn CommandRunner,
        identity: &'a dyn HostIdentity,
        strategy: Box<dyn JobLifecycleStrategy>,
    ) -> Self {
        tracing::debug!(
            strategy = strategy.name(),
            root = %config.layout.root().display(),
            scope = config.layout.scope().as_str(),
            "orchestrator configured"
        );
        Self {
            config,
            runner,
            identity,
            privilege: PrivilegeContext::new(identity),
            strategy,
        }
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn run(&self, operation: Operation) -> Result<(), KeystoneError> {
        match operation {
            Operation::Install => self.install().map(|_| ()),
            Operation::Uninstall => self.uninstall(),
            Operation::Nuke => self.nuke(),
            Operation::RemoveReceipts => {
                self.remove_receipts();
                Ok(())
            }
        }
    }

    pub fn installed_version(&self) -> Option<BundleVersion> {
        installed_version_at(self.layout())
    }

    /// Version of the bundle inside the package archive.
    pub fn package_version(&self) -> Result<BundleVersion> {
        let package = self
            .config
            .package
            .as_deref()
            .ok_or_else(|| anyhow!("no package archive given"))?;
        let member = self.layout().archive_info_plist_member();
        let mut command = build_read_member_command(package, &member);
        let output = run_checked(
            self.runner,
            &mut command,
            &format!("failed to read {member} from {}", package.display()),
        )?;
        bundle_version_from_plist(&output.stdout)
            .with_context(|| format!("invalid {member} in {}", package.display()))?
            .ok_or_else(|| {
                anyhow!(
                    "{member} in {} has no {BUNDLE_VERSION_KEY}",
                    package.display()
                )
            })
    }

    pub fn should_install(&self) -> Result<bool> {
        let proposed = self.package_version()?;
        Ok(self.should_install_version(&proposed))
    }

    /// A system install supersedes any user install regardless of version.
    pub fn should_install_version(&self, proposed: &BundleVersion) -> bool {
        if !self.layout().is_system() {
            match system_layout(&self.config.system_root) {
                Ok(system) if path_exists(&system.bundle_dir()) => {
                    tracing::debug!(
                        system_bundle = %system.bundle_dir().display(),
                        "system install present; user install not needed"
                    );
                    return false;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "invalid system root; ignoring system install");
                }
            }
        }
        let installed = self.installed_version();
        let greater = is_version_greater(Some(proposed), installed.as_ref());
        tracing::debug!(
            proposed = %proposed,
            installed = ?installed.as_ref().map(ToString::to_string),
            greater,
            "upgrade decision"
        );
        greater
    }

    pub fn install(&self) -> Result<InstallReport, KeystoneError> {
        let package = self
            .check_install_paths()
            .map_err(self.fail(FailureKind::PathCheck))?;
        let proposed = self
            .package_version()
            .map_err(self.fail(FailureKind::Install))?;

        let mut report = InstallReport::default();
        if self.config.force || self.should_install_version(&proposed) {
            report = self.install_bundle(&package, &proposed)?;
        } else {
            tracing::debug!(proposed = %proposed, "installed version is current; nothing to install");
        }

        if self.config.lockdown {
            self.register_lockdown()
                .map_err(self.fail(FailureKind::Install))?;
            report.lockdown_registered = true;
        }
        Ok(report)
    }

    fn install_bundle(
        &self,
        package: &Path,
        proposed: &BundleVersion,
    ) -> Result<InstallReport, KeystoneError> {
        let jobs = self.jobs();
        if self.config.control_jobs {
            jobs.stop_all_ignoring_failures();
        }

        let (outcome, installed) = self
            .privileged(|| {
                let installer = self.bundle_installer();
                let outcome = installer.install_archive(package)?;
                let store = installer.ensure_ticket_store()?;
                let installed = self
                    .installed_version()
                    .unwrap_or_else(|| proposed.clone());
                let version = installed.to_string();
                let bundle = self.layout().bundle_dir();
                self.registrar_for(store).register(&TicketRegistration {
                    product_id: &self.config.settings.product_id,
                    version: &version,
                    xc_path: &bundle,
                    url: &self.config.settings.update_url,
                })?;
                Ok((outcome, installed))
            })
            .map_err(self.fail(FailureKind::Install))?;
        tracing::debug!(version = %installed, replaced = outcome.replaced_existing, "bundle installed");

        if self.config.write_job_descriptors {
            // Daemon first: if the agent write fails the daemon can still
            // update the machine.
            if self.layout().is_system() {
                self.privileged(|| {
                    self.write_job_descriptor(
                        DAEMON_DESCRIPTOR_NAME,
                        &self.layout().daemon_descriptor_path(),
                    )
                })
                .map_err(self.fail(FailureKind::Install))?;
            }
            if self.strategy.writes_agent_descriptor() {
                self.privileged(|| {
                    self.write_job_descriptor(
                        AGENT_DESCRIPTOR_NAME,
                        &self.layout().agent_descriptor_path(),
                    )
                })
                .map_err(self.fail(FailureKind::Install))?;
            }
        }

        if self.strategy.uses_login_items() {
            let refreshed = self.privileged(|| {
                self.remove_login_items();
                Ok(self.login_items().add())
            });
            if !matches!(refreshed, Ok(Some(_))) {
                tracing::debug!("login item for agent was not added");
            }
        }

        self.fixup_products();

        if self.config.control_jobs {
            jobs.transition(JobKind::Daemon, JobTransition::Start, false)
                .map_err(self.fail(FailureKind::JobControl))?;
            jobs.transition(JobKind::Agent, JobTransition::Start, false)
                .map_err(self.fail(FailureKind::JobControl))?;
        }

        Ok(InstallReport {
            installed: Some(installed),
            replaced_existing: outcome.replaced_existing,
            lockdown_registered: false,
        })
    }

    fn register_lockdown(&self) -> Result<()> {
        self.privileged(|| {
            let store = self.bundle_installer().ensure_ticket_store()?;
            let registrar = self.registrar_for(store);
            if !registrar.is_available() {
                return Err(anyhow!(
                    "cannot register lockdown ticket: {} is missing",
                    self.layout().ksadmin_path().display()
                ));
            }
            registrar.register(&TicketRegistration {
                product_id: &self.config.settings.lockdown_product_id,
                version: LOCKDOWN_TICKET_VERSION,
                xc_path: self.layout().root(),
                url: &self.config.settings.update_url,
            })
        })
    }

    pub fn uninstall(&self) -> Result<(), KeystoneError> {
        let self_destruct = self.config.self_destruct;
        let jobs = self.jobs();
        if !self_destruct && self.config.control_jobs {
            jobs.stop_all_ignoring_failures();
        }

        self.privileged(|| {
            // A self-destructing run still needs the descriptors to stop the
            // jobs afterwards.
            if !self_destruct {
                self.remove_job_descriptors()?;
            }
            self.remove_login_items();
            self.unregister_ticket()?;
            self.remove_bundle_tree()?;
            self.purge_caches();
            let preferences = agent_preferences_path(&self.config.home_dir);
            remove_path_if_exists(&preferences)
                .with_context(|| format!("failed to remove {}", preferences.display()))?;
            Ok(())
        })
        .map_err(self.fail(FailureKind::Install))?;

        self.remove_receipts();

        if self_destruct {
            // May terminate this very process; nothing reports errors after.
            if self.config.control_jobs {
                jobs.stop_all_ignoring_failures();
            }
            self.privileged(|| self.remove_job_descriptors())
                .map_err(self.fail(FailureKind::Install))?;
        }
        Ok(())
    }

    pub fn nuke(&self) -> Result<(), KeystoneError> {
        self.uninstall()?;
        self.privileged(|| {
            let keystone_dir = self.layout().keystone_dir();
            remove_path_if_exists(&keystone_dir)
                .with_context(|| format!("failed to remove {}", keystone_dir.display()))?;
            Ok(())
        })
        .map_err(self.fail(FailureKind::Install))
    }

    /// System installs only; every failure is ignored. Returns how many
    /// receipt paths were deleted.
    pub fn remove_receipts(&self) -> usize {
        if !self.layout().is_system() {
            return 0;
        }
        match self.privileged(|| Ok(remove_legacy_receipts(self.layout(), self.runner))) {
            Ok(removed) => removed,
            Err(err) => {
                tracing::debug!(error = %format!("{err:#}"), "ignoring receipt removal failure");
                0
            }
        }
    }

    /// Best-effort repair pass: clears stale update manifests and
    /// re-registers known-broken third-party tickets.
    pub fn fixup_products(&self) -> FixupReport {
        let result = self.privileged(|| {
            let mut report = FixupReport::default();

            let mut cache_dirs = self.layout().manifest_cache_dirs();
            for dir in manifest_cache_dirs_under(&self.config.home_dir) {
                if !cache_dirs.contains(&dir) {
                    cache_dirs.push(dir);
                }
            }
            for dir in cache_dirs {
                match remove_path_if_exists(&dir) {
                    Ok(true) => report.removed_manifest_caches += 1,
                    Ok(false) => {}
                    Err(err) => {
                        tracing::debug!(dir = %dir.display(), error = %err, "ignoring manifest cache removal failure");
                    }
                }
            }

            let registrar = self.registrar_for(self.layout().ticket_store_dir());
            if !registrar.is_available() {
                return Ok(report);
            }
            for broken in &self.config.settings.broken_tickets {
                match registrar.registered_version(&broken.product_id) {
                    Ok(Some(version)) if version == broken.version => {
                        let repaired = registrar.register(&TicketRegistration {
                            product_id: &broken.product_id,
                            version: &broken.version,
                            xc_path: Path::new(&broken.xc_path),
                            url: &broken.url,
                        });
                        match repaired {
                            Ok(()) => report.repaired_tickets.push(broken.product_id.clone()),
                            Err(err) => {
                                tracing::debug!(product_id = %broken.product_id, error = %format!("{err:#}"), "ticket repair failed");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(product_id = %broken.product_id, error = %format!("{err:#}"), "ticket query failed");
                    }
                }
            }
            Ok(report)
        });

        result.unwrap_or_else(|err| {
            tracing::debug!(error = %format!("{err:#}"), "ignoring product fixup failure");
            FixupReport::default()
        })
    }

    fn layout(&self) -> &InstallLayout {
        &self.config.layout
    }

    /// Elevates for system installs; user installs never acquire.
    fn privileged<T>(&self, work: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.layout().is_system() {
            self.privilege.elevated(work)
        } else {
            work()
        }
    }

    fn fail(&self, kind: FailureKind) -> impl Fn(anyhow::Error) -> KeystoneError + '_ {
        move |err| {
            let package = match &self.config.package {
                Some(package) => package.display().to_string(),
                None => self.config.settings.product_id.clone(),
            };
            tracing::debug!(kind = kind.as_str(), "operation failed");
            KeystoneError {
                kind,
                package,
                root: self.layout().root_display(),
                message: format!("{err:#}"),
            }
        }
    }

    fn jobs(&self) -> JobLifecycleController<'_> {
        JobLifecycleController::new(
            JobContext {
                layout: &self.config.layout,
                runner: self.runner,
                identity: self.identity,
                privilege: &self.privilege,
                settings: &self.config.settings,
                invoking_uid: self.config.invoking_uid,
            },
            self.strategy.as_ref(),
        )
    }

    fn bundle_installer(&self) -> BundleInstaller<'_> {
        BundleInstaller::new(
            self.layout(),
            self.runner,
            self.identity,
            self.strategy.quarantine_strategies(),
        )
    }

    fn registrar_for(&self, store: PathBuf) -> TicketRegistrar<'_> {
        TicketRegistrar::new(self.runner, self.layout().ksadmin_path(), store)
    }

    fn login_items(&self) -> LoginItemManager<'_> {
        LoginItemManager::for_layout(self.runner, self.layout())
    }

    fn check_install_paths(&self) -> Result<PathBuf> {
        let package = self
            .config
            .package
            .clone()
            .ok_or_else(|| anyhow!("no package archive given"))?;
        let metadata = fs::metadata(&package)
            .with_context(|| format!("package archive is missing: {}", package.display()))?;
        if !metadata.is_file() {
            return Err(anyhow!(
                "package archive is not a file: {}",
                package.display()
            ));
        }
        if metadata.permissions().mode() & 0o444 == 0 {
            return Err(anyhow!(
                "package archive is not readable: {}",
                package.display()
            ));
        }

        let root = self.layout().root();
        let metadata = fs::metadata(root)
            .with_context(|| format!("install root is missing: {}", root.display()))?;
        if !metadata.is_dir() {
            return Err(anyhow!(
                "install root is not a directory: {}",
                root.display()
            ));
        }
        if metadata.permissions().mode() & 0o300 != 0o300 {
            return Err(anyhow!(
                "install root lacks owner write and search permission: {}",
                root.display()
            ));
        }
        Ok(package)
    }

    fn write_job_descriptor(&self, descriptor_name: &str, destination: &Path) -> Result<()> {
        let template_path = self.layout().descriptor_template_path(descriptor_name);
        let template = fs::read_to_string(&template_path).with_context(|| {
            format!(
                "failed to read job descriptor template: {}",
                template_path.display()
            )
        })?;
        let install_root = self.layout().root_display();
        let rendered = render_job_descriptor(
            &template,
            &DescriptorTokens {
                install_root: &install_root,
                scope: self.layout().scope(),
                start_interval: self.config.start_interval,
            },
        );

        let parent = destination
            .parent()
            .ok_or_else(|| anyhow!("descriptor path has no parent: {}", destination.display()))?;
        let installer = self.bundle_installer();
        installer.ensure_dir(parent)?;
        write_file_atomically(destination, rendered.as_bytes())?;
        if self.layout().is_system() {
            installer.set_root_owned(destination, 0o644)?;
        } else {
            fs::set_permissions(destination, fs::Permissions::from_mode(0o644)).with_context(
                || format!("failed to set mode 644 on {}", destination.display()),
            )?;
        }
        Ok(())
    }

    fn remove_job_descriptors(&self) -> Result<()> {
        let mut descriptors = vec![self.layout().agent_descriptor_path()];
        if self.layout().is_system() {
            descriptors.push(self.layout().daemon_descriptor_path());
        }
        for descriptor in descriptors {
            remove_path_if_exists(&descriptor)
                .with_context(|| format!("failed to remove {}", descriptor.display()))?;
        }
        Ok(())
    }

    fn remove_login_items(&self) {
        if let Err(err) = self.login_items().remove() {
            tracing::debug!(error = %format!("{err:#}"), "ignoring login item removal failure");
        }
    }

    fn unregister_ticket(&self) -> Result<()> {
        let registrar = self.registrar_for(self.layout().ticket_store_dir());
        if !registrar.is_available() {
            tracing::debug!("registrar not installed; no ticket to remove");
            return Ok(());
        }
        registrar.delete(&self.config.settings.product_id)?;
        Ok(())
    }

    fn remove_bundle_tree(&self) -> Result<()> {
        for bundle in [self.layout().bundle_dir(), self.layout().backup_bundle_dir()] {
            remove_path_if_exists(&bundle)
                .with_context(|| format!("failed to remove {}", bundle.display()))?;
        }
        Ok(())
    }

    fn purge_caches(&self) -> usize {
        let mut cache_roots = vec![self.layout().caches_dir()];
        let user_caches = user_caches_dir(&self.config.home_dir);
        if !cache_roots.contains(&user_caches) {
            cache_roots.push(user_caches);
        }

        let mut purged = 0;
        for cache_root in cache_roots {
            let entries = match fs::read_dir(&cache_root) {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    tracing::debug!(dir = %cache_root.display(), error = %err, "ignoring unreadable cache dir");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !PURGED_CACHE_PREFIXES
                    .iter()
                    .any(|prefix| name.starts_with(prefix))
                {
                    continue;
                }
                match remove_path_if_exists(&entry.path()) {
                    Ok(_) => purged += 1,
                    Err(err) => {
                        tracing::debug!(path = %entry.path().display(), error = %err, "ignoring cache purge failure");
                    }
                }
            }
        }
        purged
    }
}

fn installed_version_at(layout: &InstallLayout) -> Option<BundleVersion> {
    let path = layout.bundle_info_plist_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "unreadable installed bundle manifest");
            return None;
        }
    };
    match bundle_version_from_plist(&raw) {
        Ok(version) => version,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %format!("{err:#}"), "treating unparsable installed version as absent");
            None
        }
    }
}

/// Layout of the machine-wide install under `system_root`.
pub fn system_layout(system_root: &Path) -> Result<InstallLayout> {
    InstallLayout::new(system_root, InstallScope::System)
}
