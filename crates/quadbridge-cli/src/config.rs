//! Configuration Vault – reads/writes `~/.quadbridge/config.toml`.
//!
//! The file holds every device's sink access token, so it is written
//! owner-only.  Once loaded the configuration is never mutated; the stream
//! runtime only sees `Arc<DeviceDescriptor>`s built from it.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use quadbridge_gateway::DEFAULT_PORT;
use quadbridge_runtime::{RestartPolicy, StreamSettings};
use quadbridge_types::{DEFAULT_SINK_CHANNEL, DeviceDescriptor, Qos, SecretToken, TelemetryKind};

/// Robot address from the stock Go2 local-STA setup.
pub const DEFAULT_ROBOT_TARGET: &str = "192.168.100.101";

/// Persisted bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// ThingsBoard host (`demo.thingsboard.io`) or base URL.
    #[serde(default = "default_sink_host")]
    pub sink_host: String,

    /// Seconds between samples per device.
    #[serde(default = "default_publish_interval")]
    pub publish_interval_secs: u64,

    /// Seconds to wait for one sample before counting it missed.
    #[serde(default = "default_sample_timeout")]
    pub sample_timeout_secs: u64,

    /// Device channel records are published on.
    #[serde(default = "default_sink_channel")]
    pub sink_channel: String,

    #[serde(default)]
    pub qos: Qos,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_secs: u64,
}

/// HTTP command gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Robot the commands go to.
    #[serde(default = "default_robot_target")]
    pub target: String,
    #[serde(default = "default_sample_timeout")]
    pub status_timeout_secs: u64,
}

fn default_sink_host() -> String {
    "demo.thingsboard.io".to_string()
}
fn default_publish_interval() -> u64 {
    3
}
fn default_sample_timeout() -> u64 {
    5
}
fn default_sink_channel() -> String {
    DEFAULT_SINK_CHANNEL.to_string()
}
fn default_max_restarts() -> u32 {
    3
}
fn default_restart_backoff() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_http_port() -> u16 {
    DEFAULT_PORT
}
fn default_robot_target() -> String {
    DEFAULT_ROBOT_TARGET.to_string()
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_backoff_secs: default_restart_backoff(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_http_port(),
            target: default_robot_target(),
            status_timeout_secs: default_sample_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sink_host: default_sink_host(),
            publish_interval_secs: default_publish_interval(),
            sample_timeout_secs: default_sample_timeout(),
            sink_channel: default_sink_channel(),
            qos: Qos::default(),
            supervisor: SupervisorConfig::default(),
            gateway: GatewayConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl Config {
    /// One device per telemetry kind, all sampling the same robot, with
    /// placeholder tokens.
    pub fn starter(target: &str) -> Self {
        let devices = TelemetryKind::ALL
            .iter()
            .enumerate()
            .map(|(index, kind)| {
                let n = index + 1;
                DeviceDescriptor::new(
                    format!("dog-{n}-{kind}"),
                    target,
                    SecretToken::new(format!("ACCESS_TOKEN_{n}")),
                    *kind,
                )
            })
            .collect();
        Self {
            gateway: GatewayConfig {
                target: target.to_string(),
                ..GatewayConfig::default()
            },
            devices,
            ..Self::default()
        }
    }

    /// Reject settings the runtime cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if self.publish_interval_secs == 0 {
            return Err("publish_interval_secs must be at least 1".to_string());
        }
        if self.sample_timeout_secs == 0 {
            return Err("sample_timeout_secs must be at least 1".to_string());
        }
        if self.sink_host.trim().is_empty() {
            return Err("sink_host must not be empty".to_string());
        }
        if self.gateway.enabled {
            if self.gateway.target.trim().is_empty() {
                return Err("gateway.target must not be empty".to_string());
            }
            if self.gateway.status_timeout_secs == 0 {
                return Err("gateway.status_timeout_secs must be at least 1".to_string());
            }
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err("every device needs an id".to_string());
            }
            if !seen.insert(device.id.as_str()) {
                return Err(format!("duplicate device id '{}'", device.id));
            }
            if device.target.trim().is_empty() {
                return Err(format!("device '{}' has no target", device.id));
            }
            if device.topic.trim().is_empty() {
                return Err(format!("device '{}' has no topic", device.id));
            }
        }
        Ok(())
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            publish_interval: Duration::from_secs(self.publish_interval_secs),
            sample_timeout: Duration::from_secs(self.sample_timeout_secs),
            sink_channel: self.sink_channel.clone(),
            qos: self.qos,
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.supervisor.max_restarts,
            backoff: Duration::from_secs(self.supervisor.restart_backoff_secs),
        }
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.status_timeout_secs)
    }

    /// Shared read-only descriptors for the supervisor.
    pub fn device_descriptors(&self) -> Vec<Arc<DeviceDescriptor>> {
        self.devices.iter().cloned().map(Arc::new).collect()
    }
}

/// Return the path to `~/.quadbridge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".quadbridge").join("config.toml")
}

/// Load the config from `path` with environment overrides applied.
/// Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    let mut cfg = read_from(path)?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

/// Parse the file as written, without overrides.
pub(crate) fn read_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse config: {}", e))
}

/// Apply `QUADBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `QUADBRIDGE_SINK_HOST` | `sink_host` |
/// | `QUADBRIDGE_PUBLISH_INTERVAL` | `publish_interval_secs` |
/// | `QUADBRIDGE_HTTP_PORT` | `gateway.port` |
/// | `QUADBRIDGE_ROBOT_TARGET` | `gateway.target` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("QUADBRIDGE_SINK_HOST") {
        cfg.sink_host = v;
    }
    if let Ok(v) = std::env::var("QUADBRIDGE_PUBLISH_INTERVAL")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.publish_interval_secs = secs;
    }
    if let Ok(v) = std::env::var("QUADBRIDGE_HTTP_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.gateway.port = port;
    }
    if let Ok(v) = std::env::var("QUADBRIDGE_ROBOT_TARGET") {
        cfg.gateway.target = v;
    }
}

/// Save the config to `path`, creating the parent directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        (dir, path)
    }

    #[test]
    fn debug_redacts_sink_tokens() {
        let cfg = Config::starter(DEFAULT_ROBOT_TARGET);
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains("ACCESS_TOKEN_1"), "tokens must not appear in debug output");
        assert!(debug_str.contains("<redacted>"));
    }

    #[test]
    fn starter_has_one_device_per_kind() {
        let cfg = Config::starter("10.0.0.7");
        let kinds: Vec<_> = cfg.devices.iter().map(|d| d.kind).collect();
        assert_eq!(kinds, TelemetryKind::ALL.to_vec());
        assert!(cfg.devices.iter().all(|d| d.target == "10.0.0.7"));
        assert_eq!(cfg.gateway.target, "10.0.0.7");
        cfg.validate().expect("starter config is valid");
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, path) = temp_path();
        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = std::fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn roundtrip_starter_config() {
        let (_dir, path) = temp_path();
        let cfg = Config::starter(DEFAULT_ROBOT_TARGET);
        save_to(&cfg, &path).expect("save");

        let loaded = read_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.devices, cfg.devices);
        assert_eq!(loaded.devices[1].sink_token.expose(), "ACCESS_TOKEN_2");
        assert_eq!(loaded.publish_interval_secs, 3);
        assert_eq!(loaded.supervisor, SupervisorConfig::default());
    }

    #[test]
    fn minimal_file_gets_defaults() {
        let (_dir, path) = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"
[[devices]]
id = "dog-1"
target = "192.168.100.101"
sink_token = "abc"
kind = "orientation"
"#,
        )
        .unwrap();

        let cfg = read_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.sink_host, "demo.thingsboard.io");
        assert_eq!(cfg.sample_timeout_secs, 5);
        assert_eq!(cfg.gateway.port, 8080);
        assert_eq!(cfg.devices[0].kind, TelemetryKind::Orientation);
        assert_eq!(cfg.devices[0].topic, "rt/lf/lowstate");
        let settings = cfg.stream_settings();
        assert_eq!(settings.publish_interval, Duration::from_secs(3));
        assert_eq!(settings.qos, Qos::AtLeastOnce);
        assert_eq!(cfg.restart_policy().backoff, Duration::from_secs(10));
    }

    #[test]
    fn config_path_points_to_quadbridge_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".quadbridge"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let (_dir, path) = temp_path();
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let (_dir, path) = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "publish_interval_secs = \"soon\"").unwrap();
        let err = read_from(&path).unwrap_err();
        assert!(err.starts_with("Failed to parse config"), "{err}");
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let mut cfg = Config::default();
        cfg.publish_interval_secs = 0;
        assert!(cfg.validate().unwrap_err().contains("publish_interval_secs"));
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let mut cfg = Config::starter(DEFAULT_ROBOT_TARGET);
        let copy = cfg.devices[0].clone();
        cfg.devices.push(copy);
        assert!(cfg.validate().unwrap_err().contains("duplicate device id"));
    }

    #[test]
    fn validate_rejects_empty_target() {
        let mut cfg = Config::starter(DEFAULT_ROBOT_TARGET);
        cfg.devices[2].target = "  ".to_string();
        assert!(cfg.validate().unwrap_err().contains("has no target"));
    }

    #[test]
    fn disabled_gateway_skips_its_checks() {
        let mut cfg = Config::default();
        cfg.gateway.enabled = false;
        cfg.gateway.target.clear();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn apply_env_overrides_changes_sink_host() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("QUADBRIDGE_SINK_HOST", "tb.example.org") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.sink_host, "tb.example.org");
        unsafe { std::env::remove_var("QUADBRIDGE_SINK_HOST") };
    }

    #[test]
    fn apply_env_overrides_changes_publish_interval() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("QUADBRIDGE_PUBLISH_INTERVAL", "10") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.publish_interval_secs, 10);
        unsafe { std::env::remove_var("QUADBRIDGE_PUBLISH_INTERVAL") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_port() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("QUADBRIDGE_HTTP_PORT", "not-a-port") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.gateway.port, 8080);
        unsafe { std::env::remove_var("QUADBRIDGE_HTTP_PORT") };
    }

    #[test]
    fn apply_env_overrides_changes_robot_target() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("QUADBRIDGE_ROBOT_TARGET", "ws://10.0.0.9:8081/channel") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.gateway.target, "ws://10.0.0.9:8081/channel");
        unsafe { std::env::remove_var("QUADBRIDGE_ROBOT_TARGET") };
    }
}
