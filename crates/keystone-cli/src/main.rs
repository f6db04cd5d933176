use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Result};
use clap::{ArgGroup, Parser};
use keystone_core::{InstallLayout, KeystoneSettings};
use keystone_installer::{
    resolve_home_dir, touch_activity_file, FailureKind, HostIdentity, InstallLock,
    InstallOrchestrator, InstallerConfig, KeystoneError, Operation, SystemCommandRunner,
    SystemIdentity, SUPERUSER_UID,
};

mod logging;

#[derive(Parser, Debug)]
#[command(name = "ksinstall")]
#[command(about = "Installs, upgrades and removes the background update agent", long_about = None)]
#[command(group(
    ArgGroup::new("operation")
        .required(true)
        .args(["install", "uninstall", "nuke", "remove_receipts", "record_activity"])
))]
struct Cli {
    /// Install or upgrade from this package archive.
    #[arg(long, value_name = "PKG")]
    install: Option<PathBuf>,
    #[arg(long)]
    uninstall: bool,
    /// Uninstall, then delete everything under the install root.
    #[arg(long)]
    nuke: bool,
    #[arg(long)]
    remove_receipts: bool,
    /// Mark a product as used by the current user.
    #[arg(long, value_name = "PRODUCT_ID")]
    record_activity: Option<String>,
    /// Install root; `/` selects a system install.
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,
    /// Do not write job descriptors. Implies --no-launchdjobs.
    #[arg(long)]
    no_launchd: bool,
    /// Do not start or stop jobs.
    #[arg(long)]
    no_launchdjobs: bool,
    /// Stop jobs last; the running agent may be this process's parent.
    #[arg(long)]
    self_destruct: bool,
    #[arg(long)]
    force: bool,
    /// Behave as on a host without a per-user job supervisor.
    #[arg(long)]
    tiger: bool,
    #[arg(long)]
    lockdown: bool,
    /// Agent wake interval in seconds.
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u32).range(1..))]
    interval: Option<u32>,
    /// TOML settings file.
    #[arg(long, value_name = "TOML")]
    config: Option<PathBuf>,
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn operation(&self) -> Option<Operation> {
        if self.install.is_some() {
            Some(Operation::Install)
        } else if self.uninstall {
            Some(Operation::Uninstall)
        } else if self.nuke {
            Some(Operation::Nuke)
        } else if self.remove_receipts {
            Some(Operation::RemoveReceipts)
        } else {
            None
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let identity = SystemIdentity;
    let env_home = std::env::var("HOME").ok();
    let home = resolve_home_dir(&identity, env_home.as_deref());

    if let Some(product_id) = &cli.record_activity {
        let recorded = home
            .as_deref()
            .is_some_and(|home| touch_activity_file(home, product_id));
        tracing::debug!(product_id = %product_id, recorded, "activity marker");
        return Ok(());
    }

    let operation = cli
        .operation()
        .ok_or_else(|| anyhow!("no operation selected"))?;
    let home = home.ok_or_else(|| {
        anyhow!(
            "cannot determine the home directory of uid {}",
            identity.real_uid()
        )
    })?;

    let config = prepare_config(cli, &identity, home)?;
    // Held until the process exits, error paths included.
    let _lock = InstallLock::acquire(&config.settings.lock_path).map_err(failure_for(
        cli,
        &config.settings.product_id,
        &config.layout.root_display(),
    ))?;
    let runner = SystemCommandRunner;
    let orchestrator = InstallOrchestrator::new(config, &runner, &identity);
    orchestrator.run(operation)?;
    Ok(())
}

/// Loads settings and builds the run configuration. Failures here happen
/// before anything is touched and are labelled like orchestration failures.
fn prepare_config(
    cli: &Cli,
    identity: &dyn HostIdentity,
    home: PathBuf,
) -> Result<InstallerConfig, KeystoneError> {
    let root = match &cli.root {
        Some(root) => root.clone(),
        None => default_root(identity, &home),
    };
    let root_label = root.display().to_string();
    let settings = match &cli.config {
        Some(path) => KeystoneSettings::load(path).map_err(failure_for(
            cli,
            &KeystoneSettings::default().product_id,
            &root_label,
        ))?,
        None => KeystoneSettings::default(),
    };
    let layout = InstallLayout::for_root(&root)
        .map_err(failure_for(cli, &settings.product_id, &root_label))?;
    Ok(build_config(
        cli,
        layout,
        home,
        identity.real_uid(),
        settings,
    ))
}

fn failure_for<'a>(
    cli: &'a Cli,
    product_id: &'a str,
    root: &'a str,
) -> impl Fn(anyhow::Error) -> KeystoneError + 'a {
    move |err| KeystoneError {
        kind: FailureKind::PathCheck,
        package: match &cli.install {
            Some(package) => package.display().to_string(),
            None => product_id.to_string(),
        },
        root: root.to_string(),
        message: format!("{err:#}"),
    }
}

fn default_root(identity: &dyn HostIdentity, home: &Path) -> PathBuf {
    if identity.effective_ids().0 == SUPERUSER_UID {
        PathBuf::from("/")
    } else {
        home.to_path_buf()
    }
}

fn build_config(
    cli: &Cli,
    layout: InstallLayout,
    home: PathBuf,
    invoking_uid: u32,
    settings: KeystoneSettings,
) -> InstallerConfig {
    let mut config = InstallerConfig::new(layout, home, invoking_uid);
    config.package = cli.install.clone();
    config.write_job_descriptors = !cli.no_launchd;
    config.control_jobs = !cli.no_launchd && !cli.no_launchdjobs;
    config.self_destruct = cli.self_destruct;
    config.force = cli.force;
    config.lockdown = cli.lockdown;
    config.simulate_legacy_host = cli.tiger;
    if let Some(interval) = cli.interval {
        config.start_interval = interval;
    }
    config.settings = settings;
    config
}

#[cfg(test)]
mod tests;
