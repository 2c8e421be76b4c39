use std::{collections::BTreeMap, fs, path::PathBuf, time::Duration};

use anyhow::Context;
use serde::Deserialize;

use crate::lodestone::net;

pub const DEFAULT_PORT: u16 = 25565;

const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_DIAL_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

// Splice buffers must be at least 8 KiB per direction.
const MIN_BUFFER_SIZE: usize = 8 * 1024;
const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// The parsed CLI surface. Flags override config-file values.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub config_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub api_binding: Option<String>,
    pub default_route: Option<String>,
    /// Raw `host=endpoint` pairs from `--mapping`.
    pub mappings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    /// Empty disables the management API.
    pub api_binding: String,
    /// Empty means no default route.
    pub default_route: String,
    pub mappings: Vec<(String, String)>,
    pub logging: LoggingConfig,
    pub timeouts: Timeouts,
    pub buffer_size: usize,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub handshake: Duration,
    pub dial: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    port: Option<u16>,
    listen_addr: Option<String>,
    api_binding: Option<String>,
    default_route: Option<String>,
    #[serde(default)]
    mappings: BTreeMap<String, String>,
    logging: Option<FileLogging>,
    timeouts: Option<FileTimeouts>,
    buffer_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Default, Deserialize)]
struct FileTimeouts {
    handshake_timeout_ms: Option<u64>,
    dial_timeout_ms: Option<u64>,
    shutdown_grace_ms: Option<u64>,
}

pub fn load(opts: &Options) -> anyhow::Result<Config> {
    let fc = match &opts.config_path {
        Some(path) => {
            let data = fs::read_to_string(path)
                .with_context(|| format!("config: read {}", path.display()))?;
            parse_file_config(&data)
                .with_context(|| format!("config: parse {}", path.display()))?
        }
        None => FileConfig::default(),
    };
    merge(opts, fc)
}

fn parse_file_config(data: &str) -> anyhow::Result<FileConfig> {
    Ok(toml::from_str(data)?)
}

fn merge(opts: &Options, fc: FileConfig) -> anyhow::Result<Config> {
    let listen_addr = match (opts.port, &fc.listen_addr) {
        (Some(port), _) => format!("0.0.0.0:{port}"),
        (None, Some(addr)) => net::normalize_bind_addr(addr).into_owned(),
        (None, None) => format!("0.0.0.0:{}", fc.port.unwrap_or(DEFAULT_PORT)),
    };

    let mut mappings: BTreeMap<String, String> = fc.mappings;
    for (host, endpoint) in parse_mappings(&opts.mappings)? {
        mappings.insert(host, endpoint);
    }

    let fl = fc.logging.unwrap_or_default();
    let ft = fc.timeouts.unwrap_or_default();

    Ok(Config {
        listen_addr,
        api_binding: opts
            .api_binding
            .clone()
            .or(fc.api_binding)
            .unwrap_or_default()
            .trim()
            .to_string(),
        default_route: opts
            .default_route
            .clone()
            .or(fc.default_route)
            .unwrap_or_default()
            .trim()
            .to_string(),
        mappings: mappings.into_iter().collect(),
        logging: LoggingConfig {
            level: fl.level.unwrap_or_else(|| "info".into()),
            format: fl.format.unwrap_or_else(|| "text".into()),
            output: fl.output.unwrap_or_else(|| "stderr".into()),
            add_source: fl.add_source,
        },
        timeouts: Timeouts {
            handshake: Duration::from_millis(
                ft.handshake_timeout_ms.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            ),
            dial: Duration::from_millis(ft.dial_timeout_ms.unwrap_or(DEFAULT_DIAL_TIMEOUT_MS)),
            shutdown_grace: Duration::from_millis(
                ft.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
            ),
        },
        buffer_size: fc.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE).max(MIN_BUFFER_SIZE),
    })
}

/// Parses `host=endpoint` pairs. Commas are already split by the CLI, but a
/// single value may still carry several pairs when it comes from a file or
/// env var.
pub fn parse_mappings(raw: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for chunk in raw.iter().flat_map(|v| v.split(',')) {
        let chunk = chunk.trim();
        if chunk.is_empty() {
            continue;
        }
        let (host, endpoint) = chunk
            .split_once('=')
            .with_context(|| format!("config: mapping {chunk:?} is not host=endpoint"))?;
        let host = host.trim();
        let endpoint = endpoint.trim();
        if host.is_empty() || endpoint.is_empty() {
            anyhow::bail!("config: mapping {chunk:?} has an empty side");
        }
        out.push((host.to_string(), endpoint.to_string()));
    }
    Ok(out)
}
