//! Operator settings.
//!
//! Loaded from `<config_dir>/outpost.yaml`. Every field has a default, so a
//! missing file or a partial one is fine. `targets` is the registry source;
//! when it is empty the built-in pair is used. `units` lists the deployable
//! container workloads.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deploy::unit::DeployUnit;
use crate::error::{OutpostError, Result};
use crate::instance::uptime::UptimeAlert;
use crate::rig::config::{TargetConfig, TargetRegistry};
use crate::session::controller::SessionSpec;
use crate::session::watch::WatchConfig;

pub const SETTINGS_FILE: &str = "outpost.yaml";
pub const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Keys the auto-stop flag.
    pub environment: String,
    pub region: String,
    /// `Name` tag of the cloud build instance.
    pub instance_name: String,
    pub ssh_connect_timeout_secs: u64,
    pub start_timeout_secs: u64,
    pub start_poll_interval_secs: u64,
    pub watch_poll_interval_ms: u64,
    pub watch_grace_ms: u64,
    pub scan_window_lines: usize,
    pub session_name: String,
    /// Job log, relative to the target's base directory.
    pub log_file: String,
    pub uptime_alert: UptimeAlert,
    pub targets: Vec<TargetConfig>,
    pub units: Vec<DeployUnit>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            environment: "dev".into(),
            region: "us-east-2".into(),
            instance_name: "yocto-builder".into(),
            ssh_connect_timeout_secs: 10,
            start_timeout_secs: 300,
            start_poll_interval_secs: 5,
            watch_poll_interval_ms: 2000,
            watch_grace_ms: 1000,
            scan_window_lines: 50,
            session_name: "build".into(),
            log_file: "logs/build.log".into(),
            uptime_alert: UptimeAlert::default(),
            targets: Vec::new(),
            units: Vec::new(),
        }
    }
}

impl Settings {
    /// Read `<dir>/outpost.yaml`. A missing file yields the defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Settings::default());
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| OutpostError::Config(format!("read {}: {}", path.display(), e)))?;
        Self::parse(&content).map_err(|e| match e {
            OutpostError::Config(msg) => OutpostError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Settings::default());
        }
        let settings: Settings =
            serde_yaml::from_str(content).map_err(|e| OutpostError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.environment.trim().is_empty() {
            return Err(OutpostError::Config("environment must not be empty".into()));
        }
        if self.session_name.trim().is_empty() {
            return Err(OutpostError::Config("session_name must not be empty".into()));
        }
        if self.watch_poll_interval_ms == 0 || self.start_poll_interval_secs == 0 {
            return Err(OutpostError::Config("poll intervals must be positive".into()));
        }
        for unit in &self.units {
            unit.validate()?;
        }
        for (i, unit) in self.units.iter().enumerate() {
            if self.units[..i].iter().any(|u| u.name == unit.name) {
                return Err(OutpostError::Config(format!("unit '{}' defined twice", unit.name)));
            }
        }
        if !self.targets.is_empty() {
            self.registry()?;
        }
        Ok(())
    }

    /// The target registry, falling back to the built-in targets.
    pub fn registry(&self) -> Result<TargetRegistry> {
        if self.targets.is_empty() {
            Ok(TargetRegistry::builtin())
        } else {
            TargetRegistry::from_entries(self.targets.clone())
        }
    }

    pub fn unit(&self, name: &str) -> Result<&DeployUnit> {
        self.units.iter().find(|u| u.name == name).ok_or_else(|| {
            let known: Vec<&str> = self.units.iter().map(|u| u.name.as_str()).collect();
            OutpostError::Config(format!(
                "unknown deploy unit '{}' (known: {})",
                name,
                if known.is_empty() { "none".to_string() } else { known.join(", ") }
            ))
        })
    }

    pub fn session_spec(&self) -> SessionSpec {
        SessionSpec::new(&self.session_name, &self.log_file)
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            poll_interval: Duration::from_millis(self.watch_poll_interval_ms),
            grace: Duration::from_millis(self.watch_grace_ms),
            scan_window: self.scan_window_lines,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn start_poll_interval(&self) -> Duration {
        Duration::from_secs(self.start_poll_interval_secs)
    }
}

/// `OUTPOST_CONFIG_DIR`, else `$HOME/.config/outpost`.
pub fn resolve_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("OUTPOST_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".config").join("outpost")
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::rig::config::TargetKind;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.registry().unwrap().default_name(), "builder");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(SETTINGS_FILE),
            "environment: prod\nwatch_grace_ms: 250\nuptime_alert:\n  threshold_hours: 8\n",
        )
        .unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.environment, "prod");
        assert_eq!(settings.watch_config().grace, Duration::from_millis(250));
        assert_eq!(settings.uptime_alert.threshold_hours, 8);
        assert_eq!(settings.uptime_alert.interval_hours, 2);
        assert_eq!(settings.session_name, "build");
    }

    #[test]
    fn targets_and_units_load() {
        let yaml = r#"
targets:
  - name: builder
    kind: instance
    user: ubuntu
    base_dir: /home/ubuntu/work
  - name: barn
    kind: edge
    host: 10.0.0.7
    user: root
    base_dir: /data
    default: true
units:
  - name: squirrel-cam
    context: ./apps/cam
    image: squirrel-cam:latest
    target: barn
    devices: [/dev/video0]
"#;
        let settings = Settings::parse(yaml).unwrap();
        let registry = settings.registry().unwrap();
        assert_eq!(registry.list(), vec!["builder", "barn"]);
        assert_eq!(registry.default_name(), "barn");
        assert_eq!(registry.resolve(Some("barn")).unwrap().kind, TargetKind::Edge);
        let unit = settings.unit("squirrel-cam").unwrap();
        assert_eq!(unit.target.as_deref(), Some("barn"));
        assert!(settings.unit("nope").is_err());
    }

    #[test]
    fn invalid_registry_is_config_error() {
        let yaml = "targets:\n  - name: barn\n    kind: edge\n    user: root\n    base_dir: /data\n";
        assert!(matches!(Settings::parse(yaml), Err(OutpostError::Config(_))));
    }

    #[test]
    fn duplicate_units_rejected() {
        let yaml = "units:\n  - {name: a, context: ., image: a}\n  - {name: a, context: ., image: b}\n";
        assert!(matches!(Settings::parse(yaml), Err(OutpostError::Config(_))));
    }

    #[test]
    fn malformed_yaml_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SETTINGS_FILE), "targets: [unclosed").unwrap();
        match Settings::load(dir.path()) {
            Err(OutpostError::Config(msg)) => assert!(msg.contains(SETTINGS_FILE)),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn config_dir_from_env() {
        std::env::set_var("OUTPOST_CONFIG_DIR", "/tmp/test-outpost-config");
        assert_eq!(resolve_config_dir(), PathBuf::from("/tmp/test-outpost-config"));
        std::env::remove_var("OUTPOST_CONFIG_DIR");
    }
}
