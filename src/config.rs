use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Idle period used when none (or zero) is configured
pub const DEFAULT_IDLE_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Top-level configuration file
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Address the proxy listens on (default: 0.0.0.0:25565)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Connection tracking and idle shutdown settings
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Which launcher manages the backend, and its settings
    pub launcher: LauncherConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProxyConfig {
    /// How long to keep retrying the backend dial (default: 0, single attempt)
    #[serde(default, deserialize_with = "duration::deserialize")]
    pub connect_timeout: Duration,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ControllerConfig {
    /// Time without connections before the backend is shut down.
    /// Integer nanoseconds or a duration string such as "5m".
    #[serde(default, deserialize_with = "duration::deserialize")]
    pub idle_period: Duration,
}

impl ControllerConfig {
    pub fn with_idle_period(idle_period: Duration) -> Self {
        Self { idle_period }
    }

    /// Configured idle period, falling back to the default when unset or zero
    pub fn idle_period(&self) -> Duration {
        if self.idle_period.is_zero() {
            DEFAULT_IDLE_PERIOD
        } else {
            self.idle_period
        }
    }
}

/// Launcher variant selector
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum LauncherKind {
    /// Fixed target that is always considered running
    #[serde(rename = "simple-proxy", alias = "simple_proxy", alias = "static")]
    SimpleProxy,
    /// Child process started on demand
    #[serde(rename = "executable")]
    Executable,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LauncherConfig {
    /// Launcher to use: "simple-proxy" or "executable"
    pub selected: LauncherKind,

    pub simple_proxy: Option<SimpleProxyConfig>,

    pub executable: Option<ExecutableConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SimpleProxyConfig {
    /// Address every connection is forwarded to
    pub target_address: String,
}

/// Settings for a backend started as a child process
///
/// # Security Warning
///
/// `path` and `args` are executed as given. Configuration files must only be
/// writable by trusted users.
#[derive(Debug, Deserialize, Clone)]
pub struct ExecutableConfig {
    /// Executable to run
    pub path: String,

    /// Arguments passed to the executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the process
    pub cwd: Option<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Address the backend binds once started
    pub address: String,
}

impl ExecutableConfig {
    pub fn new(path: &str, address: &str) -> Self {
        Self {
            path: path.to_string(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            address: address.to_string(),
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set working directory (builder pattern)
    pub fn with_cwd(mut self, dir: &str) -> Self {
        self.cwd = Some(dir.to_string());
        self
    }

    /// Add an environment variable (builder pattern)
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    fn validate(&self) -> Result<(), String> {
        if self.path.trim().is_empty() {
            return Err("launcher.executable: 'path' must not be empty".to_string());
        }
        if self.address.trim().is_empty() {
            return Err("launcher.executable: 'address' must not be empty".to_string());
        }
        Ok(())
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:25565".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Listen address as `host:port`. The host may be a name, an IP or
    /// empty (all interfaces); it is resolved when the listener binds.
    pub fn bind_addr(&self) -> anyhow::Result<String> {
        let invalid = |reason: &str| {
            anyhow::anyhow!("Invalid bind address '{}': {}", self.bind_address, reason)
        };
        let (host, port) = self
            .bind_address
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        port.parse::<u16>().map_err(|_| invalid("invalid port"))?;

        // Bare ":port" listens on every interface
        if host.is_empty() {
            return Ok(format!("0.0.0.0:{}", port));
        }
        Ok(self.bind_address.clone())
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.bind_addr() {
            errors.push(e.to_string());
        }

        match self.launcher.selected {
            LauncherKind::SimpleProxy => match &self.launcher.simple_proxy {
                Some(cfg) if cfg.target_address.trim().is_empty() => {
                    errors.push(
                        "launcher.simple_proxy: 'target_address' must not be empty".to_string(),
                    );
                }
                Some(_) => {}
                None => errors.push(
                    "launcher 'simple-proxy' selected but [launcher.simple_proxy] is missing"
                        .to_string(),
                ),
            },
            LauncherKind::Executable => match &self.launcher.executable {
                Some(cfg) => {
                    if let Err(e) = cfg.validate() {
                        errors.push(e);
                    }
                }
                None => errors.push(
                    "launcher 'executable' selected but [launcher.executable] is missing"
                        .to_string(),
                ),
            },
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

/// Durations given either as integer nanoseconds or as a human readable string
pub mod duration {
    use serde::de::{self, Deserializer, Visitor};
    use std::fmt;
    use std::time::Duration;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an integer number of nanoseconds or a duration string")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Duration, E> {
            Ok(Duration::from_nanos(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Duration, E> {
            u64::try_from(value)
                .map(Duration::from_nanos)
                .map_err(|_| E::custom(format!("duration must not be negative: {}", value)))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
            humantime::parse_duration(value.trim())
                .map_err(|e| E::custom(format!("failed to parse duration string '{}': {}", value, e)))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DurationVisitor)
    }
}
