// Egress Supervisor
// Orchestrates render -> write -> validate -> reload/spawn as one unit

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::models::{ApplyAction, ApplyOutcome, EgressStatus};
use crate::services::config_renderer;
use crate::services::config_validator::{ConfigValidator, ValidationMode};
use crate::services::errors::{ConfigError, ControllerError, EgressError};
use crate::services::process_controller::ProcessController;
use crate::services::state_store::StateStore;

/// The only component the application layer calls directly. Composes the
/// renderer, validator, and process controller over the desired state.
pub struct EgressSupervisor {
    store: Arc<StateStore>,
    controller: Arc<ProcessController>,
    validator: ConfigValidator,
    validation_mode: ValidationMode,
    config_path: PathBuf,
    ingest_key: Option<String>,
    /// Single-flight scope for the whole apply sequence; two overlapping
    /// applies must not validate one writer's file and reload the other's
    apply_lock: Mutex<()>,
}

impl EgressSupervisor {
    pub fn new(
        store: Arc<StateStore>,
        controller: Arc<ProcessController>,
        validator: ConfigValidator,
        validation_mode: ValidationMode,
        config_path: PathBuf,
        ingest_key: Option<String>,
    ) -> Self {
        Self {
            store,
            controller,
            validator,
            validation_mode,
            config_path,
            ingest_key,
            apply_lock: Mutex::new(()),
        }
    }

    /// Reconcile the running process with the desired state.
    ///
    /// Strictly ordered: load desired state, render, persist, validate,
    /// then reload the live process or spawn a fresh one. Each step's
    /// failure short-circuits the rest; nothing here retries automatically.
    pub fn apply(&self) -> Result<ApplyOutcome, EgressError> {
        let _flight = match self.apply_lock.lock() {
            Ok(guard) => guard,
            // A poisoned flight lock only means a previous apply panicked;
            // the sequence below rewrites everything it touches
            Err(poisoned) => poisoned.into_inner(),
        };

        let template = self
            .store
            .load_template()
            .map_err(ConfigError::StoreUnavailable)?
            .ok_or(ConfigError::TemplateNotFound)?;

        let destinations = self
            .store
            .list_destinations()
            .map_err(ConfigError::StoreUnavailable)?;

        let ingest_key = self.ingest_key.as_deref().unwrap_or("");
        let config = config_renderer::render(&template, &destinations, ingest_key)?;

        self.write_config(&config).map_err(ConfigError::Io)?;

        let warning = self.run_validation_stage()?;

        let action = self.reload_or_spawn()?;
        log::info!("Applied egress configuration ({action:?})");

        Ok(ApplyOutcome {
            success: true,
            action,
            config,
            warning,
        })
    }

    /// The configuration most recently persisted, read back from disk;
    /// None if nothing was ever applied
    pub fn rendered_config(&self) -> Option<String> {
        std::fs::read_to_string(&self.config_path).ok()
    }

    /// Liveness of the managed process per the controller's probe
    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    /// Controller state snapshot for the status endpoint
    pub fn status(&self) -> EgressStatus {
        self.controller.status()
    }

    /// Atomic replace: the consumer never observes a partially written file
    fn write_config(&self, config: &str) -> std::io::Result<()> {
        let tmp = self.config_path.with_extension("conf.tmp");
        std::fs::write(&tmp, config)?;
        std::fs::rename(&tmp, &self.config_path)
    }

    /// Validate the persisted file per the deployment's validation mode.
    /// An invalid config must never reach a live reload.
    fn run_validation_stage(&self) -> Result<Option<String>, EgressError> {
        if self.validation_mode == ValidationMode::Off {
            return Ok(None);
        }

        match self.validator.validate(&self.config_path) {
            Ok(validation) if validation.valid => Ok(None),
            Ok(validation) => Err(ConfigError::InvalidSyntax {
                diagnostics: validation.diagnostics,
            }
            .into()),
            Err(ConfigError::ValidatorUnavailable { reason })
                if self.validation_mode == ValidationMode::Lenient =>
            {
                let warning = format!("Config validator unavailable, check skipped: {reason}");
                log::warn!("{warning}");
                Ok(Some(warning))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Prefer an in-place reload whenever the process is live; a respawn
    /// drops active connections, a reload does not
    fn reload_or_spawn(&self) -> Result<ApplyAction, EgressError> {
        if !self.controller.is_running() {
            self.controller.spawn().map_err(EgressError::Controller)?;
            return Ok(ApplyAction::Spawned);
        }

        match self.controller.reload() {
            Ok(()) => Ok(ApplyAction::Reloaded),
            Err(ControllerError::NotRunning) => {
                // Exited between probe and reload; fall back to a cold start
                self.controller.spawn().map_err(EgressError::Controller)?;
                Ok(ApplyAction::Spawned)
            }
            Err(ControllerError::SignalFailed { reason }) => {
                // The process vanished between probe and signal. Re-probe
                // once: retry the reload if it still looks alive, otherwise
                // spawn. No further automatic retries.
                log::warn!("Reload signal failed, re-probing: {reason}");
                if self.controller.is_running() {
                    self.controller.reload().map_err(EgressError::Controller)?;
                    Ok(ApplyAction::Reloaded)
                } else {
                    self.controller.spawn().map_err(EgressError::Controller)?;
                    Ok(ApplyAction::Spawned)
                }
            }
            Err(e) => Err(EgressError::Controller(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Destination;
    use crate::services::process_controller::LivenessProbe;
    use std::path::Path;
    use std::time::Duration;

    #[cfg(unix)]
    fn fake_binary(dir: &Path, name: &str, script_body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{script_body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    fn seeded_store(dir: &Path) -> Arc<StateStore> {
        let store = Arc::new(StateStore::new(dir.join("data")));
        store
            .save_template("app {{INGEST_KEY}} {\n{{PUSH_DESTINATIONS}}\n}")
            .unwrap();
        store
            .add_destination(Destination::new("main", "rtmp://a/b", "s1"))
            .unwrap();
        store
    }

    fn supervisor_with(
        dir: &Path,
        store: Arc<StateStore>,
        egress_binary: &str,
        validator_binary: &str,
        mode: ValidationMode,
        ingest_key: Option<&str>,
    ) -> EgressSupervisor {
        let config_path = dir.join("egress.conf");
        let controller = Arc::new(ProcessController::new(
            egress_binary,
            config_path.clone(),
            LivenessProbe::Handle,
        ));
        EgressSupervisor::new(
            store,
            controller,
            ConfigValidator::with_timeout(validator_binary, Duration::from_secs(5)),
            mode,
            config_path,
            ingest_key.map(str::to_string),
        )
    }

    #[cfg(unix)]
    #[test]
    fn test_apply_renders_validates_and_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let egress = fake_binary(dir.path(), "fake-egress", "trap '' HUP\nsleep 30");
        let checker = fake_binary(dir.path(), "fake-nginx", "exit 0");

        let supervisor = supervisor_with(
            dir.path(),
            store,
            &egress,
            &checker,
            ValidationMode::Strict,
            Some("k"),
        );

        let outcome = supervisor.apply().unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.action, ApplyAction::Spawned);
        assert!(outcome.config.contains("app k {"));
        assert!(outcome.config.contains("push \"rtmp://a/b/s1\";"));
        assert_eq!(supervisor.rendered_config().unwrap(), outcome.config);
        assert!(supervisor.is_running());
        let first_pid = supervisor.status().pid;

        // Second apply prefers reload over respawn: same process, no duplicate
        let second = supervisor.apply().unwrap();
        assert_eq!(second.action, ApplyAction::Reloaded);
        assert_eq!(supervisor.status().pid, first_pid);

        supervisor.controller.stop();
    }

    #[cfg(unix)]
    #[test]
    fn test_invalid_config_never_reaches_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let egress = fake_binary(dir.path(), "fake-egress", "sleep 30");
        let checker = fake_binary(
            dir.path(),
            "fake-nginx",
            "echo 'unknown directive \"push\"' >&2\nexit 1",
        );

        let supervisor = supervisor_with(
            dir.path(),
            store,
            &egress,
            &checker,
            ValidationMode::Strict,
            Some("k"),
        );

        let err = supervisor.apply().unwrap_err();
        match err {
            EgressError::Config(ConfigError::InvalidSyntax { diagnostics }) => {
                assert!(diagnostics.contains("unknown directive"));
            }
            other => panic!("expected InvalidSyntax, got {other:?}"),
        }
        assert!(!supervisor.is_running());
        // The config file was still written; only the process stage was blocked
        assert!(supervisor.rendered_config().is_some());
    }

    #[test]
    fn test_missing_ingest_key_aborts_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());

        let supervisor = supervisor_with(
            dir.path(),
            store,
            "nginx",
            "nginx",
            ValidationMode::Off,
            None,
        );

        let err = supervisor.apply().unwrap_err();
        assert!(matches!(
            err,
            EgressError::Config(ConfigError::MissingIngestKey)
        ));
        assert!(supervisor.rendered_config().is_none());
    }

    #[test]
    fn test_missing_template_aborts_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path().join("data")));

        let supervisor = supervisor_with(
            dir.path(),
            store,
            "nginx",
            "nginx",
            ValidationMode::Off,
            Some("k"),
        );

        let err = supervisor.apply().unwrap_err();
        assert!(matches!(
            err,
            EgressError::Config(ConfigError::TemplateNotFound)
        ));
        assert!(supervisor.rendered_config().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_unavailable_validator_is_soft_in_lenient_mode() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let egress = fake_binary(dir.path(), "fake-egress", "trap '' HUP\nsleep 30");

        let supervisor = supervisor_with(
            dir.path(),
            store,
            &egress,
            "relaygate-no-such-binary",
            ValidationMode::Lenient,
            Some("k"),
        );

        let outcome = supervisor.apply().unwrap();
        assert!(outcome.success);
        assert!(outcome.warning.is_some());

        supervisor.controller.stop();
    }

    #[test]
    fn test_unavailable_validator_is_fatal_in_strict_mode() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());

        let supervisor = supervisor_with(
            dir.path(),
            store,
            "nginx",
            "relaygate-no-such-binary",
            ValidationMode::Strict,
            Some("k"),
        );

        let err = supervisor.apply().unwrap_err();
        assert!(matches!(
            err,
            EgressError::Config(ConfigError::ValidatorUnavailable { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_concurrent_applies_never_interleave_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path().join("data")));
        store.save_template("{{PUSH_DESTINATIONS}}").unwrap();
        for i in 0..20 {
            store
                .add_destination(Destination::new(
                    format!("dest-{i}"),
                    format!("rtmp://host-{i}/app"),
                    format!("key-{i}"),
                ))
                .unwrap();
        }
        let egress = fake_binary(dir.path(), "fake-egress", "trap '' HUP\nsleep 30");

        let supervisor = Arc::new(supervisor_with(
            dir.path(),
            store,
            &egress,
            "nginx",
            ValidationMode::Off,
            Some("k"),
        ));

        let expected = supervisor.apply().unwrap().config;

        let mut workers = Vec::new();
        for _ in 0..4 {
            let supervisor = Arc::clone(&supervisor);
            workers.push(std::thread::spawn(move || {
                for _ in 0..5 {
                    supervisor.apply().unwrap();
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        // The final file is one complete render, never an interleaving
        assert_eq!(supervisor.rendered_config().unwrap(), expected);

        supervisor.controller.stop();
    }
}
