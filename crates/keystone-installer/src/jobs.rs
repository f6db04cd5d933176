use std::process::Command;

use anyhow::Result;
use keystone_core::{InstallLayout, KeystoneSettings, AGENT_PROCESS_NAME};

use crate::bundle::{QuarantineStrategy, QUARANTINE_STRATEGIES};
use crate::command::{describe_command, run_checked, CommandRunner};
use crate::privilege::{HostIdentity, PrivilegeContext};

pub const LAUNCHCTL_PATH: &str = "/bin/launchctl";
const PS_PATH: &str = "/bin/ps";
const SUDO_PATH: &str = "/usr/bin/sudo";
const GRAPHICAL_SESSION: &str = "Aqua";

use JobTransition::{Start, Stop};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Agent,
    Daemon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTransition {
    Start,
    Stop,
}

impl JobTransition {
    fn launchctl_verb(self) -> &'static str {
        match self {
            Self::Start => "load",
            Self::Stop => "unload",
        }
    }
}

/// Host facilities a job strategy drives.
pub struct JobContext<'a> {
    pub layout: &'a InstallLayout,
    pub runner: &'a dyn CommandRunner,
    pub identity: &'a dyn HostIdentity,
    pub privilege: &'a PrivilegeContext<'a>,
    pub settings: &'a KeystoneSettings,
    pub invoking_uid: u32,
}

/// Capability set that differs between job-supervisor hosts and legacy hosts.
pub trait JobLifecycleStrategy {
    fn name(&self) -> &'static str;

    fn writes_agent_descriptor(&self) -> bool;

    fn uses_login_items(&self) -> bool;

    fn quarantine_strategies(&self) -> &'static [QuarantineStrategy];

    fn transition_agent(
        &self,
        ctx: &JobContext<'_>,
        transition: JobTransition,
        ignore_failure: bool,
    ) -> Result<()>;

    /// The daemon exists only on system installs; user installs are a no-op.
    fn transition_daemon(
        &self,
        ctx: &JobContext<'_>,
        transition: JobTransition,
        ignore_failure: bool,
    ) -> Result<()> {
        if !ctx.layout.is_system() {
            return Ok(());
        }
        let descriptor = ctx.layout.daemon_descriptor_path();
        ctx.privilege.elevated(|| {
            let mut command = Command::new(LAUNCHCTL_PATH);
            command.arg(transition.launchctl_verb()).arg(&descriptor);
            settle(
                run_checked(ctx.runner, &mut command, "daemon job transition failed").map(|_| ()),
                ignore_failure,
            )
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ModernSupervisor;

#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyProcessControl;

impl JobLifecycleStrategy for ModernSupervisor {
    fn name(&self) -> &'static str {
        "modern-supervisor"
    }

    fn writes_agent_descriptor(&self) -> bool {
        true
    }

    fn uses_login_items(&self) -> bool {
        false
    }

    fn quarantine_strategies(&self) -> &'static [QuarantineStrategy] {
        &QUARANTINE_STRATEGIES
    }

    fn transition_agent(
        &self,
        ctx: &JobContext<'_>,
        transition: JobTransition,
        ignore_failure: bool,
    ) -> Result<()> {
        let descriptor = ctx.layout.agent_descriptor_path();
        if !ctx.layout.is_system() {
            let mut command = Command::new(LAUNCHCTL_PATH);
            command
                .arg(transition.launchctl_verb())
                .args(["-S", GRAPHICAL_SESSION])
                .arg(&descriptor);
            let result =
                run_checked(ctx.runner, &mut command, "agent job transition failed").map(|_| ());
            return settle(result, ignore_failure);
        }

        ctx.privilege.elevated(|| {
            let marker = match transition {
                Start => ctx.settings.session_start_marker.as_str(),
                Stop => ctx.settings.session_stop_marker.as_str(),
            };
            let listing = match list_processes(ctx.runner) {
                Ok(listing) => listing,
                Err(err) => return settle(Err(err), ignore_failure),
            };

            let mut reportable = None;
            for session in parse_session_processes(&listing, marker) {
                let mut command = Command::new(LAUNCHCTL_PATH);
                command
                    .arg("bsexec")
                    .arg(session.pid.to_string())
                    .arg(SUDO_PATH)
                    .arg("-u")
                    .arg(&session.user)
                    .arg(LAUNCHCTL_PATH)
                    .arg(transition.launchctl_verb())
                    .args(["-S", GRAPHICAL_SESSION])
                    .arg(&descriptor);
                let context = format!("agent job transition failed for user {}", session.user);
                let Err(err) = run_checked(ctx.runner, &mut command, &context) else {
                    tracing::debug!(
                        user = %session.user,
                        pid = session.pid,
                        ?transition,
                        "agent transition sent"
                    );
                    continue;
                };

                let owner = ctx.identity.uid_for_user(&session.user);
                if owner == Some(ctx.invoking_uid) && !ignore_failure {
                    reportable.get_or_insert(err);
                } else {
                    tracing::debug!(
                        user = %session.user,
                        error = %format!("{err:#}"),
                        "ignoring agent transition failure"
                    );
                }
            }

            match reportable {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }
}

impl JobLifecycleStrategy for LegacyProcessControl {
    fn name(&self) -> &'static str {
        "legacy-process-control"
    }

    fn writes_agent_descriptor(&self) -> bool {
        false
    }

    fn uses_login_items(&self) -> bool {
        true
    }

    fn quarantine_strategies(&self) -> &'static [QuarantineStrategy] {
        &[]
    }

    fn transition_agent(
        &self,
        ctx: &JobContext<'_>,
        transition: JobTransition,
        ignore_failure: bool,
    ) -> Result<()> {
        match transition {
            Start if ctx.layout.is_system() => {
                // Login items launch the agent in each session at next login.
                tracing::debug!("legacy host: system agent start deferred to login items");
                Ok(())
            }
            Start => {
                let mut command = Command::new("/usr/bin/open");
                command.arg(ctx.layout.agent_app_path());
                let result =
                    run_checked(ctx.runner, &mut command, "agent launch failed").map(|_| ());
                settle(result, ignore_failure)
            }
            Stop => {
                let kill = || {
                    let mut command = Command::new("/usr/bin/killall");
                    command.arg(AGENT_PROCESS_NAME);
                    settle(
                        run_checked(ctx.runner, &mut command, "agent stop failed").map(|_| ()),
                        ignore_failure,
                    )
                };
                if ctx.layout.is_system() {
                    ctx.privilege.elevated(kill)
                } else {
                    kill()
                }
            }
        }
    }
}

/// Drives one strategy for a given install.
pub struct JobLifecycleController<'a> {
    ctx: JobContext<'a>,
    strategy: &'a dyn JobLifecycleStrategy,
}

impl<'a> JobLifecycleController<'a> {
    pub fn new(ctx: JobContext<'a>, strategy: &'a dyn JobLifecycleStrategy) -> Self {
        Self { ctx, strategy }
    }

    pub fn transition(
        &self,
        kind: JobKind,
        transition: JobTransition,
        ignore_failure: bool,
    ) -> Result<()> {
        tracing::debug!(
            ?kind,
            ?transition,
            ignore_failure,
            strategy = self.strategy.name(),
            "job transition"
        );
        match kind {
            JobKind::Agent => self
                .strategy
                .transition_agent(&self.ctx, transition, ignore_failure),
            JobKind::Daemon => self
                .strategy
                .transition_daemon(&self.ctx, transition, ignore_failure),
        }
    }

    /// Best-effort stop of agent then daemon.
    pub fn stop_all_ignoring_failures(&self) {
        for kind in [JobKind::Agent, JobKind::Daemon] {
            if let Err(err) = self.transition(kind, Stop, true) {
                tracing::debug!(?kind, error = %format!("{err:#}"), "ignoring job stop failure");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProcess {
    pub user: String,
    pub pid: u32,
}

fn list_processes(runner: &dyn CommandRunner) -> Result<String> {
    let mut command = Command::new(PS_PATH);
    command.args(["-wwaxo", "user,pid,command"]);
    let output = run_checked(runner, &mut command, "failed to list processes")?;
    Ok(output.stdout)
}

/// Extracts one `(user, pid)` per user from `ps -o user,pid,command` output
/// whose line contains `marker`.
pub fn parse_session_processes(listing: &str, marker: &str) -> Vec<SessionProcess> {
    let mut sessions: Vec<SessionProcess> = Vec::new();
    for line in listing.lines() {
        if !line.contains(marker) {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(user), Some(pid)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(pid) = pid.parse::<u32>() else {
            continue;
        };
        if sessions.iter().any(|session| session.user == user) {
            continue;
        }
        sessions.push(SessionProcess {
            user: user.to_string(),
            pid,
        });
    }
    sessions
}

fn settle(result: Result<()>, ignore_failure: bool) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if ignore_failure => {
            tracing::debug!(error = %format!("{err:#}"), "ignoring job control failure");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Host version reported by `sw_vers`, if the probe works at all.
pub fn probe_host_version(runner: &dyn CommandRunner) -> Option<String> {
    let mut command = Command::new("/usr/bin/sw_vers");
    command.arg("-productVersion");
    match runner.run(&mut command) {
        Ok(output) if output.success() => {
            let version = output.stdout.trim();
            (!version.is_empty()).then(|| version.to_string())
        }
        Ok(_) | Err(_) => {
            tracing::debug!(command = %describe_command(&command), "host version probe failed");
            None
        }
    }
}

/// Hosts before 10.5 have no per-user job supervisor.
pub fn is_legacy_host_version(version: &str) -> bool {
    let mut parts = version.trim().split('.').map(|part| part.parse::<u32>());
    match (parts.next(), parts.next()) {
        (Some(Ok(major)), _) if major < 10 => true,
        (Some(Ok(10)), Some(Ok(minor))) => minor < 5,
        _ => false,
    }
}

pub fn select_strategy(
    simulate_legacy_host: bool,
    host_version: Option<&str>,
) -> Box<dyn JobLifecycleStrategy> {
    let legacy = simulate_legacy_host || host_version.is_some_and(is_legacy_host_version);
    if legacy {
        Box::new(LegacyProcessControl)
    } else {
        Box::new(ModernSupervisor)
    }
}
