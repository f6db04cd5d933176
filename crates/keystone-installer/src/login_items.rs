use std::path::PathBuf;
use std::process::Command;

use anyhow::Result;
use keystone_core::InstallLayout;

use crate::command::{run_checked, CommandRunner};

pub const DEFAULTS_PATH: &str = "/usr/bin/defaults";
pub const LOGIN_ITEMS_KEY: &str = "AutoLaunchedApplicationDictionary";
const SYSTEM_LOGINWINDOW_DOMAIN: &str = "/Library/Preferences/loginwindow";
const USER_LOGINWINDOW_DOMAIN: &str = "loginwindow";

/// Forms of writing a new login item, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginItemWrite {
    /// Appends to an existing array value.
    ArrayAdd,
    /// Replaces a missing or scalar value with a one-element array.
    NewArray,
}

pub const LOGIN_ITEM_WRITES: [LoginItemWrite; 2] =
    [LoginItemWrite::ArrayAdd, LoginItemWrite::NewArray];

impl LoginItemWrite {
    fn flag(self) -> &'static str {
        match self {
            Self::ArrayAdd => "-array-add",
            Self::NewArray => "-array",
        }
    }
}

/// Login-item handling for hosts without a per-user job supervisor.
pub struct LoginItemManager<'a> {
    runner: &'a dyn CommandRunner,
    domain: String,
    agent_app: PathBuf,
}

impl<'a> LoginItemManager<'a> {
    pub fn new(runner: &'a dyn CommandRunner, domain: String, agent_app: PathBuf) -> Self {
        Self {
            runner,
            domain,
            agent_app,
        }
    }

    pub fn for_layout(runner: &'a dyn CommandRunner, layout: &InstallLayout) -> Self {
        let domain = if layout.is_system() {
            SYSTEM_LOGINWINDOW_DOMAIN
        } else {
            USER_LOGINWINDOW_DOMAIN
        };
        Self::new(runner, domain.to_string(), layout.agent_app_path())
    }

    /// Current entries, one dictionary per element. A missing, empty or
    /// scalar value reads as no entries.
    pub fn read_entries(&self) -> Vec<String> {
        let mut command = Command::new(DEFAULTS_PATH);
        command.arg("read").arg(&self.domain).arg(LOGIN_ITEMS_KEY);
        match self.runner.run(&mut command) {
            Ok(output) if output.success() => canonical_entries(&output.stdout),
            _ => Vec::new(),
        }
    }

    /// Adds a hidden login item for the agent. Returns the write form that
    /// succeeded; failure of every form is swallowed.
    pub fn add(&self) -> Option<LoginItemWrite> {
        let item = login_item_value(&self.agent_app.display().to_string());
        for write in LOGIN_ITEM_WRITES {
            let mut command = Command::new(DEFAULTS_PATH);
            command
                .arg("write")
                .arg(&self.domain)
                .arg(LOGIN_ITEMS_KEY)
                .arg(write.flag())
                .arg(&item);
            match self.runner.run(&mut command) {
                Ok(output) if output.success() => return Some(write),
                _ => tracing::debug!(?write, "login item write form failed"),
            }
        }
        None
    }

    /// Strips entries referencing the agent. Writes back only when something
    /// was removed; returns whether it was.
    pub fn remove(&self) -> Result<bool> {
        let entries = self.read_entries();
        let agent_path = self.agent_app.display().to_string();
        let kept = entries
            .iter()
            .filter(|entry| !entry.contains(&agent_path))
            .cloned()
            .collect::<Vec<_>>();
        if kept.len() == entries.len() {
            return Ok(false);
        }

        let mut command = Command::new(DEFAULTS_PATH);
        command
            .arg("write")
            .arg(&self.domain)
            .arg(LOGIN_ITEMS_KEY)
            .arg(collapse_entries(&kept));
        run_checked(self.runner, &mut command, "failed to rewrite login items")?;
        tracing::debug!(removed = entries.len() - kept.len(), "login items removed");
        Ok(true)
    }
}

pub(crate) fn login_item_value(agent_app: &str) -> String {
    format!("{{Hide=1;Path=\"{agent_app}\";}}")
}

/// Splits an old-style property-list array of dictionaries into one entry
/// per dictionary, each on a single line with surrounding whitespace removed.
pub(crate) fn canonical_entries(raw: &str) -> Vec<String> {
    let flattened = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("");
    let Some(body) = flattened
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
    else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;
    for ch in body.chars() {
        if in_quotes {
            current.push(ch);
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_quotes = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => {
                in_quotes = true;
                current.push(ch);
            }
            '{' => {
                depth += 1;
                current.push(ch);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => push_entry(&mut entries, &mut current),
            _ => current.push(ch),
        }
    }
    push_entry(&mut entries, &mut current);
    entries
}

fn push_entry(entries: &mut Vec<String>, current: &mut String) {
    let entry = current.trim();
    if !entry.is_empty() {
        entries.push(entry.to_string());
    }
    current.clear();
}

pub(crate) fn collapse_entries(entries: &[String]) -> String {
    format!("({})", entries.join(","))
}
