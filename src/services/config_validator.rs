// Config Validator
// Drives nginx's built-in syntax check against a candidate configuration file

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::services::errors::ConfigError;

/// Outcome of a syntax check; `diagnostics` is the combined stdout and
/// stderr of the check invocation, the only evidence shown to the caller
#[derive(Debug, Clone)]
pub struct Validation {
    pub valid: bool,
    pub diagnostics: String,
}

/// How strictly apply() treats the validation stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Skip the syntax check entirely
    Off,
    /// Check when possible; a missing validator binary is only a warning
    Lenient,
    /// Any validation failure aborts the apply
    Strict,
}

impl ValidationMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "off" | "none" | "disabled" => Some(Self::Off),
            "lenient" | "warn" => Some(Self::Lenient),
            "strict" | "required" => Some(Self::Strict),
            _ => None,
        }
    }
}

/// Runs the external binary's syntax-check mode; never starts or stops the
/// managed process itself
pub struct ConfigValidator {
    binary: String,
    timeout: Duration,
}

impl ConfigValidator {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
    const POLL_INTERVAL: Duration = Duration::from_millis(50);

    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Check the file at `config_path` with `nginx -t -c <path>`.
    ///
    /// A non-zero exit is the sole syntax-failure signal. A missing binary or
    /// a hung check is `ConfigError::ValidatorUnavailable`, so operators can
    /// tell "bad config" from "tool missing".
    pub fn validate(&self, config_path: &Path) -> Result<Validation, ConfigError> {
        let binary = which::which(&self.binary).map_err(|_| ConfigError::ValidatorUnavailable {
            reason: format!("'{}' not found", self.binary),
        })?;

        let mut child = Command::new(&binary)
            .arg("-t")
            .arg("-c")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ConfigError::ValidatorUnavailable {
                reason: format!("failed to launch {}: {e}", binary.display()),
            })?;

        let status = self.wait_bounded(&mut child)?;

        let mut diagnostics = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            let _ = stdout.read_to_string(&mut diagnostics);
        }
        if let Some(mut stderr) = child.stderr.take() {
            if !diagnostics.is_empty() && !diagnostics.ends_with('\n') {
                diagnostics.push('\n');
            }
            let _ = stderr.read_to_string(&mut diagnostics);
        }
        let diagnostics = diagnostics.trim().to_string();

        if status.success() {
            log::debug!("Config check passed for {}", config_path.display());
        } else {
            log::warn!("Config check failed for {}", config_path.display());
        }

        Ok(Validation {
            valid: status.success(),
            diagnostics,
        })
    }

    /// Poll the check process until exit or deadline; a hung binary is
    /// killed so it cannot wedge the supervisor
    fn wait_bounded(&self, child: &mut Child) -> Result<std::process::ExitStatus, ConfigError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(ConfigError::ValidatorUnavailable {
                            reason: format!(
                                "syntax check did not finish within {}s",
                                self.timeout.as_secs()
                            ),
                        });
                    }
                    thread::sleep(Self::POLL_INTERVAL);
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ConfigError::ValidatorUnavailable {
                        reason: format!("failed to wait for syntax check: {e}"),
                    });
                }
            }
        }
    }
}
