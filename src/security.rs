//! Security gatekeeper.
//!
//! A [`SecurityPolicy`] decides which executables and URLs a client connection
//! may be built against, validates subprocess arguments, and assembles the
//! environment handed to spawned children. It also carries the switches that
//! lock server settings and veto the server role entirely.
//!
//! The policy is secure by default: with no allow-list configured, no command
//! and no URL is allowed.
//!
//! # Write-once allow-lists
//!
//! Once a non-empty allow-list has been set it cannot be changed again. A
//! later configuration step therefore cannot widen access after the first
//! trust decision.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use crate::error::SecurityError;

/// Characters and sequences that are never accepted inside a subprocess argument.
const UNSAFE_ARGUMENT_PATTERNS: &[&str] = &["..", "|", ";", "&", "`", "$"];

/// Parent environment variables passed through to child processes.
pub const INHERITED_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "LANG", "LC_ALL", "TZ", "TMPDIR", "TERM",
];

/// Prefixes of dynamic-linker override variables that are always stripped.
const LINKER_OVERRIDE_PREFIXES: &[&str] = &["LD_", "DYLD_"];

#[derive(Debug, Default)]
struct PolicyState {
    allowed_commands: Vec<String>,
    allowed_urls: Vec<String>,
    server_file: Option<PathBuf>,
    servers_locked: bool,
    serving_disabled: bool,
}

/// Allow-lists and locks guarding connection construction and server startup.
///
/// All accessors take `&self`; the policy is meant to be shared behind an
/// [`Arc`](std::sync::Arc) between the components that consult it.
#[derive(Debug, Default)]
pub struct SecurityPolicy {
    state: RwLock<PolicyState>,
}

impl SecurityPolicy {
    /// Creates a policy with empty allow-lists (nothing allowed).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, PolicyState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PolicyState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the command allow-list from a `:`-separated string.
    ///
    /// # Errors
    ///
    /// See [`Self::set_allowed_command_list`].
    pub fn set_allowed_commands(&self, commands: &str) -> Result<(), SecurityError> {
        self.set_allowed_command_list(parse_delimited(commands, ':'))
    }

    /// Sets the command allow-list.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::ServersLocked`] when server settings are locked, or
    /// [`SecurityError::AllowListLocked`] when a non-empty list was already set.
    pub fn set_allowed_command_list<I, S>(&self, commands: I) -> Result<(), SecurityError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let commands = clean_list(commands);
        let mut state = self.write();
        if state.servers_locked {
            return Err(SecurityError::ServersLocked);
        }
        if !state.allowed_commands.is_empty() {
            warn!("Rejected attempt to modify the command allow-list");
            return Err(SecurityError::AllowListLocked { list: "command" });
        }
        info!(count = commands.len(), "Command allow-list set");
        state.allowed_commands = commands;
        Ok(())
    }

    /// Sets the URL allow-list from a space-separated string of prefixes.
    ///
    /// # Errors
    ///
    /// See [`Self::set_allowed_url_list`].
    pub fn set_allowed_urls(&self, urls: &str) -> Result<(), SecurityError> {
        self.set_allowed_url_list(parse_delimited(urls, ' '))
    }

    /// Sets the URL prefix allow-list.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::ServersLocked`] when server settings are locked, or
    /// [`SecurityError::AllowListLocked`] when a non-empty list was already set.
    pub fn set_allowed_url_list<I, S>(&self, urls: I) -> Result<(), SecurityError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let urls = clean_list(urls);
        let mut state = self.write();
        if state.servers_locked {
            return Err(SecurityError::ServersLocked);
        }
        if !state.allowed_urls.is_empty() {
            warn!("Rejected attempt to modify the URL allow-list");
            return Err(SecurityError::AllowListLocked { list: "URL" });
        }
        info!(count = urls.len(), "URL allow-list set");
        state.allowed_urls = urls;
        Ok(())
    }

    /// Records the path of the server definition file.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::ServersLocked`] when server settings are locked.
    pub fn set_server_file(&self, path: impl Into<PathBuf>) -> Result<(), SecurityError> {
        let mut state = self.write();
        if state.servers_locked {
            return Err(SecurityError::ServersLocked);
        }
        state.server_file = Some(path.into());
        Ok(())
    }

    /// Returns the configured server definition file, if any.
    #[must_use]
    pub fn server_file(&self) -> Option<PathBuf> {
        self.read().server_file.clone()
    }

    /// Locks server settings. Locking is one-way.
    pub fn lock_servers(&self) {
        let mut state = self.write();
        if !state.servers_locked {
            info!("Server settings locked");
        }
        state.servers_locked = true;
    }

    /// Returns `true` once server settings have been locked.
    #[must_use]
    pub fn servers_locked(&self) -> bool {
        self.read().servers_locked
    }

    /// Vetoes the server role. Disabling is one-way.
    pub fn disable_serving(&self) {
        let mut state = self.write();
        if !state.serving_disabled {
            info!("Serving disabled");
        }
        state.serving_disabled = true;
    }

    /// Returns `true` when the server role has been vetoed.
    #[must_use]
    pub fn serving_disabled(&self) -> bool {
        self.read().serving_disabled
    }

    /// Returns a copy of the command allow-list.
    #[must_use]
    pub fn allowed_commands(&self) -> Vec<String> {
        self.read().allowed_commands.clone()
    }

    /// Returns a copy of the URL allow-list.
    #[must_use]
    pub fn allowed_urls(&self) -> Vec<String> {
        self.read().allowed_urls.clone()
    }

    /// Checks a command against the allow-list.
    ///
    /// Matches exactly, or by basename against an absolute allow-listed path
    /// (so `python3` matches `/usr/bin/python3`). A candidate containing
    /// whitespace is always rejected.
    #[must_use]
    pub fn is_command_allowed(&self, command: &str) -> bool {
        self.allowed_command_path(command).is_some()
    }

    /// Returns the allow-list entry that approves `command`.
    ///
    /// An exact entry wins over a basename match. For a bare name approved by
    /// basename this is the absolute allow-listed path, which is what must be
    /// spawned; searching `PATH` instead could find a different binary.
    #[must_use]
    pub fn allowed_command_path(&self, command: &str) -> Option<String> {
        if command.is_empty() || command.chars().any(char::is_whitespace) {
            return None;
        }
        let state = self.read();
        if state.allowed_commands.iter().any(|allowed| allowed == command) {
            return Some(command.to_string());
        }
        if command.contains('/') {
            return None;
        }
        state
            .allowed_commands
            .iter()
            .find(|allowed| {
                let path = Path::new(allowed.as_str());
                path.is_absolute() && path.file_name().is_some_and(|name| name == command)
            })
            .cloned()
    }

    /// Checks a URL against the prefix allow-list.
    #[must_use]
    pub fn is_url_allowed(&self, url: &str) -> bool {
        let state = self.read();
        state
            .allowed_urls
            .iter()
            .any(|prefix| url.starts_with(prefix.as_str()))
    }

    /// Validates a subprocess attach request.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::ServersLocked`] when server settings are locked,
    /// [`SecurityError::CommandNotAllowed`] when the command is not allow-listed,
    /// or [`SecurityError::UnsafeArgument`] for the first unsafe argument.
    pub fn validate_attach(&self, command: &str, args: &[String]) -> Result<(), SecurityError> {
        if self.servers_locked() {
            return Err(SecurityError::ServersLocked);
        }
        if !self.is_command_allowed(command) {
            warn!(command, "Command rejected by allow-list");
            return Err(SecurityError::CommandNotAllowed {
                command: command.to_string(),
            });
        }
        args.iter().try_for_each(|arg| validate_argument(arg))?;
        debug!(command, args = args.len(), "Attach request validated");
        Ok(())
    }

    /// Validates an HTTP endpoint against the URL allow-list.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::UrlNotAllowed`] when no prefix matches.
    pub fn validate_url(&self, url: &str) -> Result<(), SecurityError> {
        if self.is_url_allowed(url) {
            Ok(())
        } else {
            warn!(url, "URL rejected by allow-list");
            Err(SecurityError::UrlNotAllowed {
                url: url.to_string(),
            })
        }
    }

    /// Checks that the server role may start.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::ServingDisabled`] when serving has been vetoed.
    pub fn check_serving(&self) -> Result<(), SecurityError> {
        if self.serving_disabled() {
            Err(SecurityError::ServingDisabled)
        } else {
            Ok(())
        }
    }
}

/// Rejects arguments carrying path traversal or shell metacharacters.
///
/// # Errors
///
/// Returns [`SecurityError::UnsafeArgument`] when the argument is unsafe.
pub fn validate_argument(argument: &str) -> Result<(), SecurityError> {
    if UNSAFE_ARGUMENT_PATTERNS
        .iter()
        .any(|pattern| argument.contains(pattern))
    {
        warn!(argument, "Unsafe argument rejected");
        return Err(SecurityError::UnsafeArgument {
            argument: argument.to_string(),
        });
    }
    Ok(())
}

/// Builds the environment for a child process.
///
/// Only [`INHERITED_ENV_VARS`] are taken from the current process; the user
/// variables are layered on top. Dynamic-linker override variables are
/// removed whatever their source.
#[must_use]
pub fn child_environment(user: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let inherited = INHERITED_ENV_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|value| ((*name).to_string(), value)));
    build_environment(inherited, user)
}

fn build_environment(
    inherited: impl Iterator<Item = (String, String)>,
    user: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = inherited.collect();
    env.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.retain(|name, _| {
        let dangerous = LINKER_OVERRIDE_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix));
        if dangerous {
            warn!(variable = %name, "Stripped linker override from child environment");
        }
        !dangerous
    });
    env
}

/// Splits on `delimiter`, trimming items and dropping empty ones.
#[must_use]
pub fn parse_delimited(input: &str, delimiter: char) -> Vec<String> {
    input
        .split(delimiter)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn clean_list<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items
        .into_iter()
        .map(|item| {
            let item: String = item.into();
            item.trim().to_string()
        })
        .filter(|item| !item.is_empty())
        .collect()
}
