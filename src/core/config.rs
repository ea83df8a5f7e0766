use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// MQTT caps the remaining length of a single packet at 256 MiB.
pub const MAX_PAYLOAD_LIMIT: usize = 268_435_455;
/// Number of oldest entries dropped when a permission cache overflows.
pub const PERMISSION_PRUNE_BATCH: usize = 16;

/// Broker options. Consumed once by [`crate::Broker::create`]; not hot-reloadable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    pub host: String,
    pub port: u16,
    /// Maximum concurrently registered sessions; 0 disables the limit.
    pub max_connections: usize,
    /// Keepalive applied when a client asks for 0; 0 leaves such clients without one.
    pub default_keep_alive_secs: u16,
    /// Time a fresh connection gets to deliver CONNECT.
    pub handshake_timeout_ms: u64,
    pub max_payload: usize,
    /// Upper bound for a single socket write before the session is declared a slow consumer.
    pub write_deadline_ms: u64,
    /// Frames buffered per session before fan-out declares it a slow consumer.
    pub outbound_queue_capacity: usize,
    pub permission_cache_capacity: usize,
    pub pid_file: Option<PathBuf>,
    pub auth: AuthOptions,
    pub acl: Vec<AclRule>,
    pub telemetry: TelemetryOptions,
}

/// Credentials a client must present in CONNECT.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthOptions {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Bearer token accepted in the CONNECT password field.
    pub token: Option<String>,
}

impl AuthOptions {
    pub fn is_enabled(&self) -> bool {
        self.username.is_some() || self.token.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclAction {
    Publish,
    Subscribe,
    Any,
}

/// One access rule; rules are evaluated in order and the first match decides.
#[derive(Debug, Clone, Deserialize)]
pub struct AclRule {
    /// Topic filter the rule covers (wildcards allowed).
    pub topic: String,
    #[serde(default = "default_acl_action")]
    pub action: AclAction,
    /// Restrict the rule to one client identifier.
    #[serde(default)]
    pub client_id: Option<String>,
    pub allow: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryOptions {
    pub log_level: Option<String>,
    pub json_logs: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            log_level: Some("info".into()),
            json_logs: false,
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 1883,
            max_connections: 0,
            default_keep_alive_secs: 0,
            handshake_timeout_ms: 10_000,
            max_payload: 1024 * 1024,
            write_deadline_ms: 2_000,
            outbound_queue_capacity: 1_024,
            permission_cache_capacity: 512,
            pid_file: None,
            auth: AuthOptions::default(),
            acl: Vec::new(),
            telemetry: TelemetryOptions::default(),
        }
    }
}

impl Options {
    /// Load options from a file (TOML, or JSON by extension) and apply `FLUXMQ_*` overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        let mut opts: Options = if is_json(path_ref) {
            serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?
        } else {
            toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?
        };
        opts.apply_env_overrides()?;
        Ok(opts)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("FLUXMQ_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("FLUXMQ_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("FLUXMQ_PORT is not a port: {port}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            bail!("host must be non-empty");
        }
        if self.max_payload == 0 || self.max_payload > MAX_PAYLOAD_LIMIT {
            bail!(
                "max_payload must be within 1..={MAX_PAYLOAD_LIMIT}, got {}",
                self.max_payload
            );
        }
        if self.handshake_timeout_ms == 0 {
            bail!("handshake_timeout_ms must be > 0");
        }
        if self.write_deadline_ms == 0 {
            bail!("write_deadline_ms must be > 0");
        }
        if self.outbound_queue_capacity == 0 {
            bail!("outbound_queue_capacity must be > 0");
        }
        if self.permission_cache_capacity < PERMISSION_PRUNE_BATCH {
            bail!(
                "permission_cache_capacity must be >= {PERMISSION_PRUNE_BATCH}, got {}",
                self.permission_cache_capacity
            );
        }
        if self.auth.username.is_some() != self.auth.password.is_some() {
            bail!("auth.username and auth.password must be set together");
        }
        if let Some(pid) = &self.pid_file {
            if let Some(parent) = pid.parent().filter(|p| !p.as_os_str().is_empty()) {
                if !parent.is_dir() {
                    bail!("pid_file directory {} missing", parent.display());
                }
            }
        }
        for rule in &self.acl {
            crate::messaging::validate_filter(&rule.topic)
                .with_context(|| format!("invalid acl topic {:?}", rule.topic))?;
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_millis(self.write_deadline_ms)
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

fn default_acl_action() -> AclAction {
    AclAction::Any
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        let opts = Options::default();
        assert!(opts.validate().is_ok());
        assert_eq!(opts.permission_cache_capacity, 512);
        assert_eq!(opts.port, 1883);
    }

    #[test]
    fn toml_round_trips_nested_sections() {
        let doc = r##"
host = "127.0.0.1"
port = 0
max_connections = 2

[auth]
username = "dev"
password = "secret"

[[acl]]
topic = "sensors/#"
action = "publish"
allow = true

[[acl]]
topic = "#"
allow = false
"##;
        let opts: Options = toml::from_str(doc).unwrap();
        assert_eq!(opts.max_connections, 2);
        assert_eq!(opts.acl.len(), 2);
        assert_eq!(opts.acl[0].action, AclAction::Publish);
        assert_eq!(opts.acl[1].action, AclAction::Any);
        assert!(opts.auth.is_enabled());
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn negative_limits_do_not_deserialize() {
        assert!(toml::from_str::<Options>("max_connections = -1").is_err());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut opts = Options {
            max_payload: 0,
            ..Options::default()
        };
        assert!(opts.validate().is_err());
        opts.max_payload = 1024;
        opts.permission_cache_capacity = 8;
        assert!(opts.validate().is_err());
        opts.permission_cache_capacity = 512;
        opts.auth.username = Some("u".into());
        let err = opts.validate().unwrap_err();
        assert!(format!("{err:?}").contains("set together"));
    }

    #[test]
    fn pid_file_directory_must_exist() {
        let dir = tempdir().unwrap();
        let mut opts = Options {
            pid_file: Some(dir.path().join("fluxmq.pid")),
            ..Options::default()
        };
        assert!(opts.validate().is_ok());
        opts.pid_file = Some(dir.path().join("missing").join("fluxmq.pid"));
        assert!(opts.validate().is_err());
    }

    #[test]
    fn load_reads_json_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fluxmq.json");
        fs::write(&path, r#"{"host": "127.0.0.1", "max_payload": 4096}"#).unwrap();
        let opts = Options::load(&path).unwrap();
        assert_eq!(opts.max_payload, 4096);
    }
}
