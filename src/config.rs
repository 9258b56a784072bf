use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use crate::tls::TlsFiles;

/// Server settings, read from `FIELDBOOK_*` environment variables.
/// Unset or unparseable values fall back to the defaults; a half-configured
/// TLS pair is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last rewrite before the compactor runs.
    pub compact_threshold: u64,
    pub tls: Option<TlsFiles>,
    pub metrics_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "fieldbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls: None,
            metrics_port: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            bind: get("FIELDBOOK_BIND").unwrap_or(defaults.bind),
            port: parsed(&get, "FIELDBOOK_PORT").unwrap_or(defaults.port),
            data_dir: get("FIELDBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: get("FIELDBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&get, "FIELDBOOK_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&get, "FIELDBOOK_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            tls: TlsFiles::from_pair(get("FIELDBOOK_TLS_CERT"), get("FIELDBOOK_TLS_KEY"))?,
            metrics_port: parsed(&get, "FIELDBOOK_METRICS_PORT"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse().ok())
}
