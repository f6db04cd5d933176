use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};

use crate::command::{run_checked, CommandRunner};

/// Registrar output substring reported when deleting a ticket that does not
/// exist.
pub const NO_TICKET_MARKER: &str = "No ticket to delete";

/// Version registered for the lockdown ticket. It never changes.
pub const LOCKDOWN_TICKET_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketRegistration<'a> {
    pub product_id: &'a str,
    pub version: &'a str,
    pub xc_path: &'a Path,
    pub url: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketDeletion {
    Deleted,
    NotRegistered,
}

/// Wrapper over the external `ksadmin` registration tool.
pub struct TicketRegistrar<'a> {
    runner: &'a dyn CommandRunner,
    ksadmin: PathBuf,
    store: PathBuf,
}

impl<'a> TicketRegistrar<'a> {
    pub fn new(runner: &'a dyn CommandRunner, ksadmin: PathBuf, store: PathBuf) -> Self {
        Self {
            runner,
            ksadmin,
            store,
        }
    }

    pub fn is_available(&self) -> bool {
        self.ksadmin.is_file()
    }

    pub fn register(&self, registration: &TicketRegistration<'_>) -> Result<()> {
        let mut command = build_register_command(&self.ksadmin, &self.store, registration);
        run_checked(
            self.runner,
            &mut command,
            &format!(
                "failed to register ticket for {} version {}",
                registration.product_id, registration.version
            ),
        )?;
        tracing::debug!(
            product_id = registration.product_id,
            version = registration.version,
            "ticket registered"
        );
        Ok(())
    }

    pub fn delete(&self, product_id: &str) -> Result<TicketDeletion> {
        let mut command = build_delete_command(&self.ksadmin, &self.store, product_id);
        let output = self.runner.run(&mut command).with_context(|| {
            format!("failed to delete ticket for {product_id}: command failed to start")
        })?;
        if output.success() {
            return Ok(TicketDeletion::Deleted);
        }
        if output.mentions(NO_TICKET_MARKER) {
            tracing::debug!(product_id, "no ticket to delete");
            return Ok(TicketDeletion::NotRegistered);
        }
        Err(anyhow!(
            "failed to delete ticket for {product_id}: status={:?} stdout='{}' stderr='{}'",
            output.status,
            output.stdout.trim(),
            output.stderr.trim()
        ))
    }

    /// Version of the currently registered ticket for `product_id`, if any.
    pub fn registered_version(&self, product_id: &str) -> Result<Option<String>> {
        let mut command = build_print_command(&self.ksadmin, &self.store, product_id);
        let output = run_checked(
            self.runner,
            &mut command,
            &format!("failed to query ticket for {product_id}"),
        )?;
        Ok(parse_ticket_version(&output.stdout))
    }
}

pub(crate) fn build_register_command(
    ksadmin: &Path,
    store: &Path,
    registration: &TicketRegistration<'_>,
) -> Command {
    let mut command = Command::new(ksadmin);
    command
        .arg("--store")
        .arg(store)
        .arg("--register")
        .arg("--productid")
        .arg(registration.product_id)
        .arg("--version")
        .arg(registration.version)
        .arg("--xcpath")
        .arg(registration.xc_path)
        .arg("--url")
        .arg(registration.url)
        .arg("--preserve-tttoken");
    command
}

pub(crate) fn build_delete_command(ksadmin: &Path, store: &Path, product_id: &str) -> Command {
    let mut command = Command::new(ksadmin);
    command
        .arg("--store")
        .arg(store)
        .arg("--delete")
        .arg("--productid")
        .arg(product_id);
    command
}

fn build_print_command(ksadmin: &Path, store: &Path, product_id: &str) -> Command {
    let mut command = Command::new(ksadmin);
    command
        .arg("--store")
        .arg(store)
        .arg("--print-tickets")
        .arg("--productid")
        .arg(product_id);
    command
}

pub(crate) fn parse_ticket_version(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("version="))
        .map(str::trim)
        .find(|version| !version.is_empty())
        .map(str::to_string)
}
