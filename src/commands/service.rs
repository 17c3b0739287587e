//! System service registration.
//!
//! `install` writes a systemd unit pointing at the current executable and
//! enables it for autostart; `uninstall` refuses while the service is
//! running, then disables and removes the unit. Installing over an
//! existing unit succeeds, matching the broker's idempotent posture
//! elsewhere.

use std::path::PathBuf;
use std::process::Command;

/// Service name used for the unit file and systemctl calls.
pub const SERVICE_NAME: &str = "usb-broker";

const UNIT_DIR: &str = "/etc/systemd/system";

/// Errors raised during service registration.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Could not determine the current executable path.
    #[error("could not determine current executable path: {0}")]
    CurrentExe(std::io::Error),

    /// Unit file could not be written or removed.
    #[error("unit file operation on {path} failed: {source}")]
    UnitFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A systemctl invocation could not be spawned.
    #[error("failed to run systemctl {verb}: {source}")]
    Systemctl {
        verb: &'static str,
        source: std::io::Error,
    },

    /// systemctl ran but reported failure.
    #[error("systemctl {verb} exited with {status}")]
    SystemctlFailed {
        verb: &'static str,
        status: std::process::ExitStatus,
    },

    /// Uninstall was requested while the service is running.
    #[error("service is still running; stop it first")]
    StillRunning,
}

/// Installs and uninstalls the broker as a system service.
#[derive(Debug)]
pub struct ServiceManager {
    binary_path: PathBuf,
    unit_path: PathBuf,
}

impl ServiceManager {
    /// Creates a manager for the given broker binary.
    #[must_use]
    pub fn new(binary_path: PathBuf) -> Self {
        Self {
            binary_path,
            unit_path: PathBuf::from(UNIT_DIR).join(format!("{SERVICE_NAME}.service")),
        }
    }

    /// Creates a manager using the current executable path.
    ///
    /// # Errors
    ///
    /// Returns an error if the current executable path cannot be
    /// determined.
    pub fn from_current_exe() -> Result<Self, ServiceError> {
        let binary_path = std::env::current_exe().map_err(ServiceError::CurrentExe)?;
        Ok(Self::new(binary_path))
    }

    /// Sets a custom unit path (useful for testing).
    #[must_use]
    pub fn with_unit_path(mut self, path: PathBuf) -> Self {
        self.unit_path = path;
        self
    }

    #[must_use]
    pub fn unit_path(&self) -> &PathBuf {
        &self.unit_path
    }

    /// Renders the systemd unit for the broker.
    #[must_use]
    pub fn render_unit(&self) -> String {
        format!(
            "[Unit]\n\
             Description=USB driver broker\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart={}\n\
             Restart=on-failure\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            self.binary_path.display()
        )
    }

    /// Registers the broker as an autostart service.
    ///
    /// # Errors
    ///
    /// Returns an error if the unit cannot be written or systemctl fails.
    pub fn install(&self) -> Result<(), ServiceError> {
        let existed = self.unit_path.exists();
        std::fs::write(&self.unit_path, self.render_unit()).map_err(|source| {
            ServiceError::UnitFile {
                path: self.unit_path.clone(),
                source,
            }
        })?;
        systemctl("daemon-reload", &[])?;
        systemctl("enable", &[SERVICE_NAME])?;
        if existed {
            tracing::info!(unit = %self.unit_path.display(), "Service unit replaced");
        } else {
            tracing::info!(unit = %self.unit_path.display(), "Service installed");
        }
        Ok(())
    }

    /// Unregisters the broker service.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::StillRunning`] while the service is active;
    /// otherwise errors if disabling or unit removal fails.
    pub fn uninstall(&self) -> Result<(), ServiceError> {
        if self.is_running()? {
            return Err(ServiceError::StillRunning);
        }
        systemctl("disable", &[SERVICE_NAME])?;
        if self.unit_path.exists() {
            std::fs::remove_file(&self.unit_path).map_err(|source| ServiceError::UnitFile {
                path: self.unit_path.clone(),
                source,
            })?;
        }
        systemctl("daemon-reload", &[])?;
        tracing::info!("Service uninstalled");
        Ok(())
    }

    /// Whether systemd reports the service as active.
    ///
    /// # Errors
    ///
    /// Returns an error if systemctl cannot be spawned.
    pub fn is_running(&self) -> Result<bool, ServiceError> {
        let status = Command::new("systemctl")
            .args(["is-active", "--quiet", SERVICE_NAME])
            .status()
            .map_err(|source| ServiceError::Systemctl {
                verb: "is-active",
                source,
            })?;
        Ok(status.success())
    }
}

fn systemctl(verb: &'static str, args: &[&str]) -> Result<(), ServiceError> {
    let status = Command::new("systemctl")
        .arg(verb)
        .args(args)
        .status()
        .map_err(|source| ServiceError::Systemctl { verb, source })?;
    if status.success() {
        Ok(())
    } else {
        Err(ServiceError::SystemctlFailed { verb, status })
    }
}
