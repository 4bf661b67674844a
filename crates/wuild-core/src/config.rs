//! Configuration loading.
//!
//! One TOML table per component, with the historical key names
//! (`invocationAttempts`, `queueTimeoutMS`, ...). Any key can be
//! overridden on the command line with `--wuild-<group>-<key>=<value>`;
//! overrides are applied onto the parsed TOML tree before
//! deserialization, so they behave exactly like file values.

use std::path::Path;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::error::{WuildError, WuildResult};
use crate::types::compression::{CompressionInfo, CompressionType};
use crate::types::tool::{ToolVersion, ToolchainKind};

/// Accepts either `"a,b,c"` or `["a", "b", "c"]`.
fn string_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        OneOrMany::Many(list) => list,
    })
}

/// One configured tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolDefinition {
    pub id: String,
    pub executables: Vec<String>,
    pub kind: ToolchainKind,
    pub version: ToolVersion,
    pub remote_alias: String,
    pub append_remote: Vec<String>,
    pub remove_remote: String,
}

impl ToolDefinition {
    /// The id this tool is advertised under to the fleet.
    pub fn remote_id(&self) -> &str {
        if self.remote_alias.is_empty() {
            &self.id
        } else {
            &self.remote_alias
        }
    }
}

/// The `[tools]` table. Keys are dynamic (`<id>`, `<id>_type`, ...), so
/// this table is extracted by hand rather than through serde.
#[derive(Debug, Clone, Default)]
pub struct ToolsConfig {
    pub tools: Vec<ToolDefinition>,
    pub disable_version_checks: bool,
}

impl ToolsConfig {
    pub fn by_id(&self, tool_id: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.id == tool_id)
    }

    pub fn tool_ids(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.id.clone()).collect()
    }

    fn from_table(table: &toml::value::Table) -> WuildResult<Self> {
        let get_str = |key: &str| -> String {
            table
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        };
        let disable_version_checks = table
            .get("disableVersionChecks")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let tool_ids: Vec<String> = match table.get("toolIds") {
            Some(toml::Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Some(toml::Value::Array(a)) => a
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        let mut tools = Vec::with_capacity(tool_ids.len());
        for id in tool_ids {
            let executables: Vec<String> = match table.get(&id) {
                Some(toml::Value::String(s)) => s
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
                Some(toml::Value::Array(a)) => a
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => {
                    return Err(WuildError::config(format!(
                        "[tools] lists '{id}' in toolIds but has no '{id}' key"
                    )))
                }
            };
            if executables.is_empty() {
                return Err(WuildError::config(format!(
                    "[tools] '{id}' names no executables"
                )));
            }

            let kind = match get_str(&format!("{id}_type")).as_str() {
                "gcc" => ToolchainKind::Gcc,
                "clang" => ToolchainKind::Clang,
                "msvc" => ToolchainKind::Msvc,
                "" | "auto" => ToolchainKind::guess(&executables[0]),
                other => {
                    return Err(WuildError::config(format!(
                        "[tools] unknown {id}_type '{other}'"
                    )))
                }
            };

            let version = if disable_version_checks {
                ToolVersion::no_check()
            } else {
                ToolVersion(get_str(&format!("{id}_version")))
            };

            let append_remote = get_str(&format!("{id}_appendRemote"))
                .split_whitespace()
                .map(str::to_string)
                .collect();

            tools.push(ToolDefinition {
                remote_alias: get_str(&format!("{id}_remoteAlias")),
                remove_remote: get_str(&format!("{id}_removeRemote")),
                id,
                executables,
                kind,
                version,
                append_remote,
            });
        }

        Ok(Self {
            tools,
            disable_version_checks,
        })
    }
}

/// Settings shared by every component that talks to coordinators.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorClientSettings {
    pub hosts: Vec<String>,
    pub port: u16,
    pub enabled: bool,
    pub send_info_interval: Duration,
}

fn default_true() -> bool {
    true
}

fn default_send_info_interval_ms() -> u64 {
    15_000
}

fn default_compression_type() -> String {
    "Gzip".to_string()
}

fn default_compression_level() -> u32 {
    3
}

/// `[toolClient]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolClientConfig {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "invocationAttempts")]
    pub invocation_attempts: u32,
    #[serde(rename = "minimalRemoteTasks")]
    pub minimal_remote_tasks: u32,
    #[serde(rename = "queueTimeoutMS")]
    pub queue_timeout_ms: u64,
    #[serde(rename = "requestTimeoutMS")]
    pub request_timeout_ms: u64,
    #[serde(rename = "maxLoadAverage")]
    pub max_load_average: f64,
    #[serde(rename = "coordinatorHost", deserialize_with = "string_list")]
    pub coordinator_host: Vec<String>,
    #[serde(rename = "coordinatorPort")]
    pub coordinator_port: u16,
    #[serde(rename = "coordinatorEnabled", default = "default_true")]
    pub coordinator_enabled: bool,
    #[serde(rename = "sendInfoIntervalMS", default = "default_send_info_interval_ms")]
    pub send_info_interval_ms: u64,
    #[serde(rename = "compressionType", default = "default_compression_type")]
    pub compression_type: String,
    #[serde(rename = "compressionLevel", default = "default_compression_level")]
    pub compression_level: u32,
    #[serde(rename = "toolserverHosts", deserialize_with = "string_list")]
    pub toolserver_hosts: Vec<String>,
    #[serde(rename = "toolserverPort")]
    pub toolserver_port: u16,
    #[serde(rename = "toolserverIds", deserialize_with = "string_list")]
    pub toolserver_ids: Vec<String>,
}

impl Default for ToolClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            invocation_attempts: 2,
            minimal_remote_tasks: 1,
            queue_timeout_ms: 600_000,
            request_timeout_ms: 240_000,
            max_load_average: 0.0,
            coordinator_host: Vec::new(),
            coordinator_port: 0,
            coordinator_enabled: true,
            send_info_interval_ms: default_send_info_interval_ms(),
            compression_type: default_compression_type(),
            compression_level: default_compression_level(),
            toolserver_hosts: Vec::new(),
            toolserver_port: 0,
            toolserver_ids: Vec::new(),
        }
    }
}

impl ToolClientConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Resolved client id: configured, or a generated stable-per-process
    /// one.
    pub fn resolved_client_id(&self) -> String {
        if self.client_id.is_empty() {
            format!("client-{}", uuid::Uuid::new_v4().simple())
        } else {
            self.client_id.clone()
        }
    }

    pub fn compression(&self) -> WuildResult<CompressionInfo> {
        compression_from(&self.compression_type, self.compression_level)
    }

    pub fn coordinator(&self) -> CoordinatorClientSettings {
        CoordinatorClientSettings {
            hosts: self.coordinator_host.clone(),
            port: self.coordinator_port,
            enabled: self.coordinator_enabled,
            send_info_interval: Duration::from_millis(self.send_info_interval_ms),
        }
    }

    pub fn validate(&self) -> WuildResult<()> {
        let has_coordinator = self.coordinator_enabled
            && !self.coordinator_host.is_empty()
            && self.coordinator_port != 0;
        let has_static = !self.toolserver_hosts.is_empty() && self.toolserver_port != 0;
        if !has_coordinator && !has_static {
            return Err(WuildError::config(
                "[toolClient] needs coordinatorHost+coordinatorPort or toolserverHosts+toolserverPort",
            ));
        }
        self.compression()?;
        Ok(())
    }
}

/// `[toolServer]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolServerConfig {
    #[serde(rename = "listenHost")]
    pub listen_host: String,
    #[serde(rename = "listenPort")]
    pub listen_port: u16,
    #[serde(rename = "threadCount")]
    pub thread_count: u16,
    #[serde(rename = "serverName")]
    pub server_name: String,
    #[serde(rename = "hostsWhiteList", deserialize_with = "string_list")]
    pub hosts_white_list: Vec<String>,
    #[serde(rename = "useClientCompression")]
    pub use_client_compression: bool,
    #[serde(rename = "coordinatorHost", deserialize_with = "string_list")]
    pub coordinator_host: Vec<String>,
    #[serde(rename = "coordinatorPort")]
    pub coordinator_port: u16,
    #[serde(rename = "coordinatorEnabled", default = "default_true")]
    pub coordinator_enabled: bool,
    #[serde(rename = "sendInfoIntervalMS", default = "default_send_info_interval_ms")]
    pub send_info_interval_ms: u64,
    #[serde(rename = "compressionType", default = "default_compression_type")]
    pub compression_type: String,
    #[serde(rename = "compressionLevel", default = "default_compression_level")]
    pub compression_level: u32,
}

impl Default for ToolServerConfig {
    fn default() -> Self {
        Self {
            listen_host: String::new(),
            listen_port: 0,
            thread_count: 0,
            server_name: String::new(),
            hosts_white_list: Vec::new(),
            use_client_compression: false,
            coordinator_host: Vec::new(),
            coordinator_port: 0,
            coordinator_enabled: true,
            send_info_interval_ms: default_send_info_interval_ms(),
            compression_type: default_compression_type(),
            compression_level: default_compression_level(),
        }
    }
}

impl ToolServerConfig {
    pub fn compression(&self) -> WuildResult<CompressionInfo> {
        compression_from(&self.compression_type, self.compression_level)
    }

    pub fn coordinator(&self) -> CoordinatorClientSettings {
        CoordinatorClientSettings {
            hosts: self.coordinator_host.clone(),
            port: self.coordinator_port,
            enabled: self.coordinator_enabled,
            send_info_interval: Duration::from_millis(self.send_info_interval_ms),
        }
    }

    /// Thread count with 0 meaning "size to the CPU count".
    pub fn resolved_thread_count(&self) -> u16 {
        if self.thread_count != 0 {
            return self.thread_count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get().min(u16::MAX as usize) as u16)
            .unwrap_or(1)
    }

    pub fn validate(&self) -> WuildResult<()> {
        if self.listen_port == 0 {
            return Err(WuildError::config("[toolServer] listenPort is required"));
        }
        if self.server_name.is_empty() {
            return Err(WuildError::config("[toolServer] serverName is required"));
        }
        self.compression()?;
        Ok(())
    }
}

/// `[coordinator]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    #[serde(rename = "listenPort")]
    pub listen_port: u16,
}

impl CoordinatorConfig {
    pub fn validate(&self) -> WuildResult<()> {
        if self.listen_port == 0 {
            return Err(WuildError::config("[coordinator] listenPort is required"));
        }
        Ok(())
    }
}

/// `[proxy]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    #[serde(rename = "listenPort")]
    pub listen_port: u16,
    #[serde(rename = "toolId")]
    pub tool_id: String,
    #[serde(rename = "threadCount")]
    pub thread_count: u16,
    #[serde(rename = "proxyClientTimeoutMS")]
    pub proxy_client_timeout_ms: u64,
    #[serde(rename = "inactiveTimeoutMS")]
    pub inactive_timeout_ms: u64,
    #[serde(rename = "startCommand")]
    pub start_command: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            tool_id: String::new(),
            thread_count: 2,
            proxy_client_timeout_ms: 600_000,
            inactive_timeout_ms: 900_000,
            start_command: String::new(),
        }
    }
}

impl ProxyConfig {
    pub fn proxy_client_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_client_timeout_ms)
    }

    pub fn inactive_timeout(&self) -> Duration {
        Duration::from_millis(self.inactive_timeout_ms)
    }

    pub fn validate(&self) -> WuildResult<()> {
        if self.listen_port == 0 {
            return Err(WuildError::config("[proxy] listenPort is required"));
        }
        Ok(())
    }
}

/// `[logging]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    #[serde(rename = "logLevel")]
    pub log_level: String,
    #[serde(rename = "logToFile")]
    pub log_to_file: bool,
    #[serde(rename = "logToCerr")]
    pub log_to_cerr: bool,
    #[serde(rename = "logDir")]
    pub log_dir: String,
    #[serde(rename = "outputTimestamp")]
    pub output_timestamp: bool,
    #[serde(rename = "outputTimeoffsets")]
    pub output_timeoffsets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
            log_to_cerr: true,
            log_dir: String::new(),
            output_timestamp: true,
            output_timeoffsets: false,
        }
    }
}

fn compression_from(type_name: &str, level: u32) -> WuildResult<CompressionInfo> {
    let compression_type = CompressionType::parse(type_name)
        .ok_or_else(|| WuildError::config(format!("invalid compressionType '{type_name}'")))?;
    Ok(CompressionInfo {
        compression_type,
        level,
    })
}

/// The whole configuration tree.
#[derive(Debug, Clone, Default)]
pub struct WuildConfig {
    pub tools: ToolsConfig,
    pub tool_client: ToolClientConfig,
    pub tool_server: ToolServerConfig,
    pub coordinator: CoordinatorConfig,
    pub proxy: ProxyConfig,
    pub logging: LoggingConfig,
}

impl WuildConfig {
    /// Parse from TOML text with `--wuild-*` CLI overrides already split
    /// out by [`split_cli_overrides`].
    pub fn from_toml(text: &str, overrides: &[CliOverride]) -> WuildResult<Self> {
        let mut root: toml::Value = text
            .parse()
            .map_err(|e| WuildError::config(format!("config parse error: {e}")))?;

        for over in overrides {
            apply_override(&mut root, over)?;
        }

        let table = root
            .as_table()
            .ok_or_else(|| WuildError::config("config root must be a table"))?;

        let section = |name: &str| -> Option<toml::Value> { table.get(name).cloned() };
        fn parse_section<T: Default + for<'de> Deserialize<'de>>(
            name: &str,
            value: Option<toml::Value>,
        ) -> WuildResult<T> {
            match value {
                None => Ok(T::default()),
                Some(v) => v
                    .try_into()
                    .map_err(|e| WuildError::config(format!("[{name}]: {e}"))),
            }
        }

        let tools = match table.get("tools") {
            Some(toml::Value::Table(t)) => ToolsConfig::from_table(t)?,
            Some(_) => return Err(WuildError::config("[tools] must be a table")),
            None => ToolsConfig::default(),
        };

        Ok(Self {
            tools,
            tool_client: parse_section("toolClient", section("toolClient"))?,
            tool_server: parse_section("toolServer", section("toolServer"))?,
            coordinator: parse_section("coordinator", section("coordinator"))?,
            proxy: parse_section("proxy", section("proxy"))?,
            logging: parse_section("logging", section("logging"))?,
        })
    }

    /// Load a config file, applying CLI overrides. A missing file with at
    /// least one override still yields a usable config.
    pub fn load(path: Option<&Path>, overrides: &[CliOverride]) -> WuildResult<Self> {
        let text = match path {
            Some(p) => std::fs::read_to_string(p).map_err(|e| {
                WuildError::config(format!("cannot read config {}: {e}", p.display()))
            })?,
            None => String::new(),
        };
        Self::from_toml(&text, overrides)
    }
}

/// One parsed `--wuild-<group>-<key>=<value>` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOverride {
    pub group: String,
    pub key: String,
    pub value: String,
}

/// Split `--wuild-*` overrides out of an argument list; everything else is
/// returned untouched, in order.
pub fn split_cli_overrides(args: &[String]) -> WuildResult<(Vec<CliOverride>, Vec<String>)> {
    let mut overrides = Vec::new();
    let mut rest = Vec::new();
    for arg in args {
        let Some(stripped) = arg.strip_prefix("--wuild-") else {
            rest.push(arg.clone());
            continue;
        };
        let Some((path, value)) = stripped.split_once('=') else {
            return Err(WuildError::config(format!(
                "malformed override '{arg}': expected --wuild-<group>-<key>=<value>"
            )));
        };
        let Some((group, key)) = path.split_once('-') else {
            return Err(WuildError::config(format!(
                "malformed override '{arg}': missing key after group"
            )));
        };
        overrides.push(CliOverride {
            group: group.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok((overrides, rest))
}

fn coerce_scalar(value: &str) -> toml::Value {
    if let Ok(i) = value.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = value.parse::<f64>() {
        return toml::Value::Float(f);
    }
    if let Ok(b) = value.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    toml::Value::String(value.to_string())
}

fn apply_override(root: &mut toml::Value, over: &CliOverride) -> WuildResult<()> {
    let table = root
        .as_table_mut()
        .ok_or_else(|| WuildError::config("config root must be a table"))?;
    let group = table
        .entry(over.group.clone())
        .or_insert_with(|| toml::Value::Table(toml::value::Table::new()));
    let group_table = group.as_table_mut().ok_or_else(|| {
        WuildError::config(format!("config group '{}' is not a table", over.group))
    })?;
    group_table.insert(over.key.clone(), coerce_scalar(&over.value));
    Ok(())
}
