use anyhow::{anyhow, Result};
use config::Config;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Engine-wide hub options.
///
/// Every hub served by a [`HubConnectionHandler`](crate::hub::HubConnectionHandler)
/// resolves its effective options from these, optionally narrowed by a
/// [`HubOptionsOverride`].
#[derive(Debug, Clone, PartialEq)]
pub struct HubOptions {
    /// Largest accepted inbound message in bytes (`None` = unlimited)
    pub maximum_receive_message_size: Option<usize>,

    /// Send a ping when nothing else was written within this interval
    pub keep_alive_interval: Duration,

    /// Close the connection when nothing was received within this interval
    pub client_timeout_interval: Duration,

    /// Time allowed for the client to complete the handshake
    pub handshake_timeout: Duration,

    /// Concurrent hub method executions per connection
    pub maximum_parallel_invocations_per_client: usize,

    /// Echo error details to clients
    pub enable_detailed_errors: bool,

    /// Capacity of each upload stream channel
    pub stream_buffer_capacity: usize,

    /// Bytes of unacknowledged messages kept for stateful reconnect
    pub stateful_reconnect_buffer_size: usize,

    /// Protocol names accepted during the handshake
    pub supported_protocols: Vec<String>,

    /// Tick period driving keep-alive and timeout checks
    pub heartbeat_interval: Duration,
}

const EMPTY_CONFIG: &str = r#"### hubwire configuration file

### largest accepted inbound message in bytes ("unlimited" to disable)
# maximum_receive_message_size = 32768

### timers (humantime durations)
# keep_alive_interval = "15s"
# client_timeout_interval = "30s"
# handshake_timeout = "15s"
# heartbeat_interval = "1s"

### invocation handling
# maximum_parallel_invocations_per_client = 1
# enable_detailed_errors = false
# stream_buffer_capacity = 10

### stateful reconnect buffer in bytes
# stateful_reconnect_buffer_size = 100000

### comma separated protocol names
# supported_protocols = "json"
"#;

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            maximum_receive_message_size: Some(32 * 1024),
            keep_alive_interval: Duration::from_secs(15),
            client_timeout_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
            maximum_parallel_invocations_per_client: 1,
            enable_detailed_errors: false,
            stream_buffer_capacity: 10,
            stateful_reconnect_buffer_size: 100_000,
            supported_protocols: vec!["json".to_string()],
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

impl HubOptions {
    /// Load options from an optional TOML file and `HUBWIRE_*` environment variables.
    ///
    /// A missing file is created with a commented template, the same way a
    /// fresh install gets one.
    pub fn load(path: Option<&Path>) -> Result<HubOptions> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if path.exists() {
                builder = builder.add_source(config::File::from(path));
            } else {
                std::fs::write(path, EMPTY_CONFIG)
                    .map_err(|e| anyhow!("Unable to create config file: {}", e))?;
            }
        }

        // E.g., `HUBWIRE_ENABLE_DETAILED_ERRORS=true hubwire serve`
        builder = builder.add_source(config::Environment::with_prefix("HUBWIRE"));

        let settings = builder
            .build()
            .map_err(|e| anyhow!("Failed to build configuration: {}", e))?;

        let config = settings
            .try_deserialize::<HashMap<String, String>>()
            .map_err(|e| anyhow!("Failed to deserialize configuration: {}", e))?;

        Self::from_map(&config)
    }

    /// Build options from flat string key/value pairs, falling back to defaults.
    pub fn from_map(config: &HashMap<String, String>) -> Result<HubOptions> {
        let defaults = HubOptions::default();

        let maximum_receive_message_size = match config.get("maximum_receive_message_size") {
            Some(v) if v.eq_ignore_ascii_case("unlimited") || v.is_empty() => None,
            Some(v) => Some(
                v.parse()
                    .map_err(|e| anyhow!("Invalid maximum_receive_message_size '{}': {}", v, e))?,
            ),
            None => defaults.maximum_receive_message_size,
        };

        let supported_protocols = match config.get("supported_protocols") {
            Some(v) => v
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            None => defaults.supported_protocols.clone(),
        };

        let options = HubOptions {
            maximum_receive_message_size,
            keep_alive_interval: duration(config, "keep_alive_interval", defaults.keep_alive_interval)?,
            client_timeout_interval: duration(
                config,
                "client_timeout_interval",
                defaults.client_timeout_interval,
            )?,
            handshake_timeout: duration(config, "handshake_timeout", defaults.handshake_timeout)?,
            maximum_parallel_invocations_per_client: number(
                config,
                "maximum_parallel_invocations_per_client",
                defaults.maximum_parallel_invocations_per_client,
            )?,
            enable_detailed_errors: match config.get("enable_detailed_errors") {
                Some(v) => v
                    .parse()
                    .map_err(|e| anyhow!("Invalid enable_detailed_errors '{}': {}", v, e))?,
                None => defaults.enable_detailed_errors,
            },
            stream_buffer_capacity: number(
                config,
                "stream_buffer_capacity",
                defaults.stream_buffer_capacity,
            )?,
            stateful_reconnect_buffer_size: number(
                config,
                "stateful_reconnect_buffer_size",
                defaults.stateful_reconnect_buffer_size,
            )?,
            supported_protocols,
            heartbeat_interval: duration(config, "heartbeat_interval", defaults.heartbeat_interval)?,
        };

        options.validate()?;
        Ok(options)
    }

    /// Reject option combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.supported_protocols.is_empty() {
            return Err(anyhow!("supported_protocols must contain at least one protocol"));
        }
        if self.maximum_parallel_invocations_per_client == 0 {
            return Err(anyhow!(
                "maximum_parallel_invocations_per_client must be greater than zero"
            ));
        }
        if self.stream_buffer_capacity == 0 {
            return Err(anyhow!("stream_buffer_capacity must be greater than zero"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(anyhow!("heartbeat_interval must be greater than zero"));
        }
        Ok(())
    }

    /// Display configuration summary
    pub fn summary(&self) -> String {
        let max_size = match self.maximum_receive_message_size {
            Some(n) => format!("{} bytes", n),
            None => "unlimited".to_string(),
        };
        [
            format!("Max Message Size:     {}", max_size),
            format!(
                "Keep-alive Interval:  {}",
                humantime::format_duration(self.keep_alive_interval)
            ),
            format!(
                "Client Timeout:       {}",
                humantime::format_duration(self.client_timeout_interval)
            ),
            format!(
                "Handshake Timeout:    {}",
                humantime::format_duration(self.handshake_timeout)
            ),
            format!(
                "Parallel Invocations: {}",
                self.maximum_parallel_invocations_per_client
            ),
            format!("Detailed Errors:      {}", self.enable_detailed_errors),
            format!("Stream Buffer:        {}", self.stream_buffer_capacity),
            format!(
                "Reconnect Buffer:     {} bytes",
                self.stateful_reconnect_buffer_size
            ),
            format!("Protocols:            {}", self.supported_protocols.join(", ")),
        ]
        .join("\n")
    }
}

fn duration(config: &HashMap<String, String>, key: &str, default: Duration) -> Result<Duration> {
    match config.get(key) {
        Some(v) => humantime::parse_duration(v).map_err(|e| anyhow!("Invalid {} '{}': {}", key, v, e)),
        None => Ok(default),
    }
}

fn number(config: &HashMap<String, String>, key: &str, default: usize) -> Result<usize> {
    match config.get(key) {
        Some(v) => v.parse().map_err(|e| anyhow!("Invalid {} '{}': {}", key, v, e)),
        None => Ok(default),
    }
}

// =============================================================================
// Per-hub overrides
// =============================================================================

/// Per-hub options. Unset fields inherit the global [`HubOptions`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HubOptionsOverride {
    pub maximum_receive_message_size: Option<Option<usize>>,
    pub keep_alive_interval: Option<Duration>,
    pub client_timeout_interval: Option<Duration>,
    pub handshake_timeout: Option<Duration>,
    pub maximum_parallel_invocations_per_client: Option<usize>,
    pub enable_detailed_errors: Option<bool>,
    pub stream_buffer_capacity: Option<usize>,
    pub stateful_reconnect_buffer_size: Option<usize>,
    pub supported_protocols: Option<Vec<String>>,
}

impl HubOptionsOverride {
    /// Effective options for one hub
    pub fn resolve(&self, global: &HubOptions) -> HubOptions {
        HubOptions {
            maximum_receive_message_size: self
                .maximum_receive_message_size
                .unwrap_or(global.maximum_receive_message_size),
            keep_alive_interval: self.keep_alive_interval.unwrap_or(global.keep_alive_interval),
            client_timeout_interval: self
                .client_timeout_interval
                .unwrap_or(global.client_timeout_interval),
            handshake_timeout: self.handshake_timeout.unwrap_or(global.handshake_timeout),
            maximum_parallel_invocations_per_client: self
                .maximum_parallel_invocations_per_client
                .unwrap_or(global.maximum_parallel_invocations_per_client),
            enable_detailed_errors: self
                .enable_detailed_errors
                .unwrap_or(global.enable_detailed_errors),
            stream_buffer_capacity: self
                .stream_buffer_capacity
                .unwrap_or(global.stream_buffer_capacity),
            stateful_reconnect_buffer_size: self
                .stateful_reconnect_buffer_size
                .unwrap_or(global.stateful_reconnect_buffer_size),
            supported_protocols: self
                .supported_protocols
                .clone()
                .unwrap_or_else(|| global.supported_protocols.clone()),
            heartbeat_interval: global.heartbeat_interval,
        }
    }
}
