//! Persistent-profile launch options
//!
//! Builds and validates the command line for a browser on a persistent
//! profile and prepares the profile directory. Starting the process is left
//! to the caller; the session connects to it once it listens.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ContextError, Result};

const DEFAULT_ARGS: &[&str] = &[
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-renderer-backgrounding",
    "--disable-sync",
    "--metrics-recording-only",
    "--password-store=basic",
];

const HEADLESS_ARGS: &[&str] = &["--headless=new", "--hide-scrollbars", "--mute-audio"];

/// Options for launching a browser on a persistent profile
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistentLaunchOptions {
    /// Profile directory, created if missing
    pub user_data_dir: PathBuf,
    pub headless: bool,
    /// Extra command line switches
    pub args: Vec<String>,
    /// Unpacked extension directories to load
    pub extensions: Vec<PathBuf>,
    /// Pass only `args` (plus the profile and debugging switches)
    pub ignore_default_args: bool,
    #[serde(with = "crate::config::opt_millis")]
    pub timeout: Option<Duration>,
}

impl PersistentLaunchOptions {
    pub fn new(user_data_dir: impl Into<PathBuf>) -> Self {
        Self {
            user_data_dir: user_data_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_extension(mut self, path: impl Into<PathBuf>) -> Self {
        self.extensions.push(path.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_ignore_default_args(mut self, ignore: bool) -> Self {
        self.ignore_default_args = ignore;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Full command line, minus the executable.
    ///
    /// With default args on, a positional argument would open a page the
    /// profile did not ask for, so it is rejected and `about:blank` is
    /// appended instead.
    pub fn launch_args(&self) -> Result<Vec<String>> {
        let mut args = Vec::new();

        if !self.ignore_default_args {
            if self.args.iter().any(|arg| !arg.starts_with('-')) {
                return Err(ContextError::InvalidOptions(
                    "Arguments can not specify page to be opened".to_string(),
                ));
            }
            args.extend(DEFAULT_ARGS.iter().map(|s| s.to_string()));
            if self.headless {
                args.extend(HEADLESS_ARGS.iter().map(|s| s.to_string()));
            }
            if !self.extensions.is_empty() {
                let joined = self
                    .extensions
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                args.push(format!("--disable-extensions-except={}", joined));
                args.push(format!("--load-extension={}", joined));
            }
        }

        args.push(format!("--user-data-dir={}", self.user_data_dir.display()));
        if !self.args.iter().any(|arg| arg.starts_with("--remote-debugging-")) {
            args.push("--remote-debugging-port=0".to_string());
        }
        args.extend(self.args.iter().cloned());

        if !self.ignore_default_args {
            args.push("about:blank".to_string());
        }
        Ok(args)
    }

    /// Create the profile directory if it does not exist yet
    pub async fn prepare_user_data_dir(&self) -> Result<PathBuf> {
        if self.user_data_dir.as_os_str().is_empty() {
            return Err(ContextError::InvalidOptions(
                "user_data_dir must not be empty".to_string(),
            ));
        }
        tokio::fs::create_dir_all(&self.user_data_dir).await?;
        Ok(self.user_data_dir.clone())
    }
}

/// Bound a launch sequence by `timeout`, reporting `LaunchTimeout` when it runs out
pub async fn with_launch_timeout<T, F>(timeout: Duration, launch: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, launch).await {
        Ok(result) => result,
        Err(_) => Err(ContextError::LaunchTimeout(timeout)),
    }
}
