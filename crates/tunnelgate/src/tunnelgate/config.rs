use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use rand::{RngExt, rng};
use serde::Deserialize;

use crate::tunnelgate::net;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already maps TUNNELGATE_CONFIG into the flag value; this covers
    // callers that bypass the CLI.
    if let Some(p) = std::env::var_os("TUNNELGATE_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("tunnelgate.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["tunnelgate.toml", "tunnelgate.yaml", "tunnelgate.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no tunnelgate.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/tunnelgate/tunnelgate.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("io", "tunnelgate", "tunnelgate")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("tunnelgate.toml"))
    }
}

/// Writes the default template to `path` unless a file is already there.
/// Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    let mut f = opts
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub server: Option<ServerConfig>,
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Domain the public URLs are built on (`<id>.<public_host>`).
    pub public_host: String,
    pub public_port: u16,
    pub static_dir: Option<PathBuf>,
    pub max_header_bytes: usize,
    pub header_timeout: Duration,
    pub pools: PoolsConfig,
}

#[derive(Debug, Clone)]
pub struct PoolsConfig {
    pub bind_addr: String,
    pub port_min: u16,
    pub port_max: u16,
    pub max_pools: usize,
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub socket_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub pool_id: String,
    pub local_address: String,
    pub local_port: u16,
    pub max_connections: usize,
    pub local_retry_delay: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,

    logging: Option<FileLogging>,

    server: Option<FileServer>,

    client: Option<FileClient>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    listen_addr: Option<String>,
    public_host: Option<String>,
    public_port: Option<i64>,
    static_dir: Option<String>,
    #[serde(default)]
    max_header_bytes: i64,
    header_timeout_ms: Option<i64>,
    pools: Option<FilePools>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePools {
    bind_addr: Option<String>,
    port_min: Option<i64>,
    port_max: Option<i64>,
    max_pools: Option<i64>,
    max_connections: Option<i64>,
    idle_timeout_ms: Option<i64>,
    socket_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server_addr: Option<String>,
    pool_id: Option<String>,
    local_address: Option<String>,
    local_port: Option<i64>,
    max_connections: Option<i64>,
    local_retry_delay_ms: Option<i64>,
}

fn trimmed_or(v: &Option<String>, default: &str) -> String {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn millis(v: Option<i64>, default: i64) -> Duration {
    Duration::from_millis(v.unwrap_or(default).max(0) as u64)
}

fn port(field: &str, v: i64) -> anyhow::Result<u16> {
    u16::try_from(v)
        .ok()
        .filter(|p| *p != 0)
        .with_context(|| format!("config: {field} must be within 1-65535 (got {v})"))
}

fn positive(field: &str, v: Option<i64>, default: usize) -> anyhow::Result<usize> {
    match v {
        None => Ok(default),
        Some(n) if n > 0 => Ok(n as usize),
        Some(n) => anyhow::bail!("config: {field} must be at least 1 (got {n})"),
    }
}

/// Random pool id: 12 lowercase hex characters.
pub fn random_pool_id() -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut r = rng();
    (0..12)
        .map(|_| HEX[r.random_range(0..HEX.len())] as char)
        .collect()
}

/// Pool ids end up as a DNS label in the public URL.
pub fn is_valid_pool_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 63
        && !id.starts_with('-')
        && !id.ends_with('-')
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
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
            server: None,
            client: None,
        };

        // --- Logging ---
        if let Some(l) = &fc.logging {
            cfg.logging.level = trimmed_or(&l.level, &cfg.logging.level);
            cfg.logging.format = trimmed_or(&l.format, &cfg.logging.format);
            cfg.logging.output = trimmed_or(&l.output, &cfg.logging.output);
            cfg.logging.add_source = l.add_source;
        }

        // --- Server ---
        if let Some(s) = &fc.server {
            let listen_addr = trimmed_or(&s.listen_addr, ":9000");
            let public_port = match s.public_port {
                Some(p) => port("server.public_port", p)?,
                None => net::port_of(&listen_addr).with_context(|| {
                    format!("config: server.listen_addr {listen_addr:?} has no port")
                })?,
            };

            let p = s.pools.as_ref();
            let port_min = port(
                "server.pools.port_min",
                p.and_then(|p| p.port_min).unwrap_or(12000),
            )?;
            let port_max = port(
                "server.pools.port_max",
                p.and_then(|p| p.port_max).unwrap_or(12023),
            )?;
            if port_min > port_max {
                anyhow::bail!(
                    "config: server.pools.port_min ({port_min}) is greater than port_max ({port_max})"
                );
            }

            let mut max_header_bytes = s.max_header_bytes.max(0) as usize;
            if max_header_bytes == 0 {
                max_header_bytes = 64 * 1024;
            }

            cfg.server = Some(ServerConfig {
                listen_addr,
                public_host: trimmed_or(&s.public_host, "localhost").to_ascii_lowercase(),
                public_port,
                static_dir: s
                    .static_dir
                    .as_deref()
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(PathBuf::from),
                max_header_bytes,
                header_timeout: millis(s.header_timeout_ms, 10_000),
                pools: PoolsConfig {
                    bind_addr: trimmed_or(&p.and_then(|p| p.bind_addr.clone()), "0.0.0.0"),
                    port_min,
                    port_max,
                    max_pools: positive("server.pools.max_pools", p.and_then(|p| p.max_pools), 24)?,
                    max_connections: positive(
                        "server.pools.max_connections",
                        p.and_then(|p| p.max_connections),
                        12,
                    )?,
                    idle_timeout: millis(p.and_then(|p| p.idle_timeout_ms), 5000),
                    socket_timeout: millis(p.and_then(|p| p.socket_timeout_ms), 5000),
                },
            });
        }

        // --- Client ---
        if let Some(c) = &fc.client {
            let pool_id = match c.pool_id.as_deref().map(str::trim) {
                Some(id) if !id.is_empty() => id.to_ascii_lowercase(),
                _ => random_pool_id(),
            };
            if !is_valid_pool_id(&pool_id) {
                anyhow::bail!(
                    "config: client.pool_id {pool_id:?} must be a DNS label (a-z, 0-9, '-')"
                );
            }

            cfg.client = Some(ClientConfig {
                server_addr: trimmed_or(&c.server_addr, "localhost:9000"),
                pool_id,
                local_address: trimmed_or(&c.local_address, "localhost"),
                local_port: port("client.local_port", c.local_port.unwrap_or(8080))?,
                max_connections: positive("client.max_connections", c.max_connections, 12)?,
                local_retry_delay: millis(c.local_retry_delay_ms, 1000),
            });
        }

        if cfg.server.is_none() && cfg.client.is_none() {
            anyhow::bail!("config: nothing to run (configure [server], [client] or both)");
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# tunnelgate configuration (auto-generated)
#
# This file was created because tunnelgate could not find a configuration file
# at the resolved config path.
#
# The default runs the tunnel server only. Add a [client] section to expose a
# local service through a server.

admin_addr = ":9100"

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

[server]
listen_addr = ":9000"
public_host = "localhost"
max_header_bytes = 65536
header_timeout_ms = 10000

[server.pools]
bind_addr = "0.0.0.0"
port_min = 12000
port_max = 12023
max_pools = 24
max_connections = 12
idle_timeout_ms = 5000
socket_timeout_ms = 5000

# [client]
# server_addr = "localhost:9000"
# pool_id = ""            # random when empty
# local_address = "localhost"
# local_port = 8080
# max_connections = 12
# local_retry_delay_ms = 1000
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# tunnelgate configuration (auto-generated)
#
# This file was created because tunnelgate could not find a configuration file
# at the resolved config path.
#
# The default runs the tunnel server only. Add a client section to expose a
# local service through a server.

admin_addr: ":9100"

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

server:
  listen_addr: ":9000"
  public_host: "localhost"
  max_header_bytes: 65536
  header_timeout_ms: 10000
  pools:
    bind_addr: "0.0.0.0"
    port_min: 12000
    port_max: 12023
    max_pools: 24
    max_connections: 12
    idle_timeout_ms: 5000
    socket_timeout_ms: 5000

# client:
#   server_addr: "localhost:9000"
#   pool_id: ""            # random when empty
#   local_address: "localhost"
#   local_port: 8080
#   max_connections: 12
#   local_retry_delay_ms: 1000
"#;
