use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::punchgate::net;

pub const CONFIG_FILE_NAME: &str = "punchgate.toml";

/// Where the config file was found, for the startup log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// `--config` or `PUNCHGATE_CONFIG`.
    Explicit,
    WorkingDir,
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConfigSource::Explicit => "explicit",
            ConfigSource::WorkingDir => "cwd",
            ConfigSource::Default => "default",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConfigLocation {
    pub path: PathBuf,
    pub source: ConfigSource,
}

pub fn resolve_config_path(explicit: Option<PathBuf>) -> anyhow::Result<ConfigLocation> {
    resolve_config_path_in(explicit, Path::new("."))
}

/// An explicit path wins (a directory means `<dir>/punchgate.toml`), then
/// `punchgate.toml` in `cwd`, then the OS default location.
fn resolve_config_path_in(explicit: Option<PathBuf>, cwd: &Path) -> anyhow::Result<ConfigLocation> {
    if let Some(p) = explicit {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        let path = if p.is_dir() { p.join(CONFIG_FILE_NAME) } else { p };
        return Ok(ConfigLocation {
            path,
            source: ConfigSource::Explicit,
        });
    }

    let local = cwd.join(CONFIG_FILE_NAME);
    if local.is_file() {
        return Ok(ConfigLocation {
            path: local,
            source: ConfigSource::WorkingDir,
        });
    }

    Ok(ConfigLocation {
        path: default_config_path()?,
        source: ConfigSource::Default,
    })
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/punchgate").join(CONFIG_FILE_NAME));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("dev", "punchgate", "punchgate")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join(CONFIG_FILE_NAME))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Yaml,
}

fn format_of(path: &Path) -> anyhow::Result<Format> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(Format::Toml),
        "yaml" | "yml" => Ok(Format::Yaml),
        _ => anyhow::bail!(
            "config: {} must end in .toml, .yaml or .yml",
            path.display()
        ),
    }
}

/// Writes the commented TOML template when `path` does not exist yet.
///
/// Returns `true` when a file was created. YAML configs are never generated.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.is_file() {
        return Ok(false);
    }
    if path.exists() {
        anyhow::bail!("config: {} exists but is not a regular file", path.display());
    }
    if format_of(path)? != Format::Toml {
        anyhow::bail!("config: {} not found", path.display());
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("config: mkdir {}", parent.display()))?;
    }
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .and_then(|mut f| f.write_all(DEFAULT_CONFIG_TEMPLATE.as_bytes()))
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let fc: FileConfig = match format_of(path)? {
        Format::Toml => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        Format::Yaml => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
    };
    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub bootstrap: BootstrapConfig,
    pub backend_bind_ip: String,
    pub backend_port: u16,
    /// Server-role forwarding target. Empty means "the Backend Listener address".
    pub forward_addr: String,
    pub utp_bind_ip: String,
    pub rendezvous_port: u16,
    pub refresh_peer_list: Duration,
    pub punch: PunchConfig,
    pub tunnel: TunnelConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub urls: Vec<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PunchConfig {
    pub attempts: u32,
    pub interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub domain_suffix: String,
    pub max_prelude_bytes: usize,
    pub backend_retry_delay: Duration,
}

impl Config {
    pub fn backend_listen_addr(&self) -> String {
        net::join_host_port(&self.backend_bind_ip, self.backend_port)
    }

    pub fn forward_target(&self) -> String {
        if self.forward_addr.is_empty() {
            self.backend_listen_addr()
        } else {
            self.forward_addr.clone()
        }
    }

    pub fn rendezvous_bind_addr(&self) -> String {
        net::join_host_port(&self.utp_bind_ip, self.rendezvous_port)
    }

    pub fn node_bind_addr(&self) -> String {
        net::join_host_port(&self.utp_bind_ip, 0)
    }
}

impl Default for Config {
    fn default() -> Self {
        // An empty file config only triggers defaults, which are all valid.
        Config::from_file_config(FileConfig::default()).unwrap_or_else(|_| unreachable!())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,

    logging: Option<FileLogging>,
    bootstrap: Option<FileBootstrap>,

    backend_bind_ip: Option<String>,
    backend_port: Option<u16>,
    forward_addr: Option<String>,
    utp_bind_ip: Option<String>,
    rendezvous_port: Option<u16>,
    refresh_peer_list_ms: Option<i64>,
    punch_attempts: Option<i64>,

    punch: Option<FilePunch>,
    tunnel: Option<FileTunnel>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileBootstrap {
    urls: Option<StringOrVec>,
    request_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePunch {
    interval_ms: Option<i64>,
    timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    domain_suffix: Option<String>,
    max_prelude_bytes: Option<i64>,
    backend_retry_ms: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    One(String),
    Many(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::One(s) => vec![s],
            StringOrVec::Many(v) => v,
        }
    }
}

fn millis_or(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default_ms),
    }
}

fn trimmed_or(v: Option<&String>, default: &str) -> String {
    match v.map(|s| s.trim()) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => default.to_string(),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
            bootstrap: BootstrapConfig {
                urls: vec![],
                request_timeout: millis_or(
                    fc.bootstrap.as_ref().and_then(|b| b.request_timeout_ms),
                    10_000,
                ),
            },
            backend_bind_ip: trimmed_or(fc.backend_bind_ip.as_ref(), "127.0.0.1"),
            backend_port: fc.backend_port.unwrap_or(8900),
            forward_addr: fc
                .forward_addr
                .as_deref()
                .unwrap_or_default()
                .trim()
                .to_string(),
            utp_bind_ip: trimmed_or(fc.utp_bind_ip.as_ref(), "0.0.0.0"),
            rendezvous_port: fc.rendezvous_port.unwrap_or(0),
            refresh_peer_list: millis_or(fc.refresh_peer_list_ms, 60_000),
            punch: PunchConfig {
                attempts: match fc.punch_attempts {
                    Some(n) if n > 0 => n.min(u32::MAX as i64) as u32,
                    _ => 20,
                },
                interval: millis_or(fc.punch.as_ref().and_then(|p| p.interval_ms), 100),
                timeout: millis_or(fc.punch.as_ref().and_then(|p| p.timeout_ms), 10_000),
            },
            tunnel: TunnelConfig {
                domain_suffix: "peer".into(),
                max_prelude_bytes: match fc.tunnel.as_ref().and_then(|t| t.max_prelude_bytes) {
                    Some(n) if n > 0 => n as usize,
                    _ => 64 * 1024,
                },
                backend_retry_delay: millis_or(
                    fc.tunnel.as_ref().and_then(|t| t.backend_retry_ms),
                    500,
                ),
            },
        };

        // --- Bootstrap ---
        if let Some(urls) = fc.bootstrap.and_then(|b| b.urls) {
            cfg.bootstrap.urls = urls
                .into_vec()
                .into_iter()
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .collect();
        }
        for (i, u) in cfg.bootstrap.urls.iter().enumerate() {
            if !(u.starts_with("http://") || u.starts_with("https://")) {
                anyhow::bail!("config: bootstrap.urls[{}] must be an http(s) URL: {:?}", i, u);
            }
        }

        // --- Tunnel ---
        if let Some(t) = &fc.tunnel {
            let suffix = t
                .domain_suffix
                .as_deref()
                .unwrap_or_default()
                .trim()
                .trim_start_matches('.')
                .to_ascii_lowercase();
            if !suffix.is_empty() {
                cfg.tunnel.domain_suffix = suffix;
            }
        }

        // --- Logging ---
        if let Some(l) = &fc.logging {
            cfg.logging.level = trimmed_or(l.level.as_ref(), &cfg.logging.level);
            cfg.logging.format = trimmed_or(l.format.as_ref(), &cfg.logging.format);
            cfg.logging.output = trimmed_or(l.output.as_ref(), &cfg.logging.output);
            cfg.logging.add_source = l.add_source;
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# punchgate configuration (auto-generated)
#
# This file was created because punchgate could not find a configuration file
# at the resolved config path. Point bootstrap.urls at one or more peer
# directories before starting.

admin_addr = ":8081"

# Local TCP listener whose connections are tunnelled to peers.
backend_bind_ip = "127.0.0.1"
backend_port = 8900

# Where peers' requests are forwarded to. Empty: the backend listener address.
forward_addr = ""

utp_bind_ip = "0.0.0.0"
refresh_peer_list_ms = 60000
punch_attempts = 20

[bootstrap]
urls = ["https://bootstrap.example.invalid/directory.json"]
request_timeout_ms = 10000

[punch]
interval_ms = 100
timeout_ms = 10000

[tunnel]
domain_suffix = "peer"
max_prelude_bytes = 65536
backend_retry_ms = 500

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false
"#;
