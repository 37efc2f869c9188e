//! Configuration: the read-only-after-start [`Config`] and its address
//! parsing grammar. The JSON-file + CLI wiring lives in `main.rs`; this
//! module only owns the data and the pure parsing functions so they can
//! be unit-tested without touching the filesystem.

use std::path::PathBuf;

use serde::Deserialize;

/// Exit code used when a forked worker raises before `booted` flips true.
pub const WORKER_BOOT_ERROR: i32 = 3;
/// Exit code used when the application locator fails to resolve.
pub const APP_LOAD_ERROR: i32 = 4;

/// One configured listening endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Tcp6 { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "http://{host}:{port}"),
            Endpoint::Tcp6 { host, port } => write!(f, "http://[{host}]:{port}"),
            Endpoint::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Parse one configured endpoint string.
///
/// Ported directly from the original `util.parse_address`, extended to
/// tag the TCP variant as v4 or v6 based on whether the host contains a
/// colon (bracketed literal).
pub fn parse_address(s: &str, default_port: u16) -> Result<Endpoint, String> {
    if let Some(rest) = s.strip_prefix("unix://") {
        return Ok(Endpoint::Unix {
            path: PathBuf::from(rest),
        });
    }
    if let Some(rest) = s.strip_prefix("unix:") {
        return Ok(Endpoint::Unix {
            path: PathBuf::from(rest),
        });
    }

    let s = s.strip_prefix("tcp://").unwrap_or(s);

    let (host, is_v6, tail) = if let Some(open) = s.find('[') {
        let close = s.find(']').ok_or_else(|| format!("{s:?}: unterminated [ in address"))?;
        let host = s[open + 1..close].to_ascii_lowercase();
        (host, true, &s[close + 1..])
    } else if let Some(colon) = s.find(':') {
        (s[..colon].to_ascii_lowercase(), false, &s[colon..])
    } else if s.is_empty() {
        ("0.0.0.0".to_string(), false, s)
    } else {
        (s.to_ascii_lowercase(), false, "")
    };

    let port = if let Some(rest) = tail.strip_prefix(':') {
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("{rest:?} is not a valid port number"));
        }
        rest.parse::<u16>()
            .map_err(|_| format!("{rest:?} is not a valid port number"))?
    } else {
        default_port
    };

    if is_v6 {
        Ok(Endpoint::Tcp6 { host, port })
    } else {
        Ok(Endpoint::Tcp { host, port })
    }
}

/// Worker process flavor. Only the cooperative-task flavor is built in;
/// see `worker::spawn_flavor` for the name → constructor mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerClass {
    Cooperative,
}

impl Default for WorkerClass {
    fn default() -> Self {
        WorkerClass::Cooperative
    }
}

/// Immutable, read-only-after-start master configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub worker_class: WorkerClass,
    pub workers: u32,
    pub listeners: Vec<Endpoint>,
    pub backlog: i32,
    pub timeout_secs: u64,
    pub graceful_timeout_secs: u64,
    pub worker_connections: usize,
    pub chdir: Option<PathBuf>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub umask: u32,
    pub initgroups: bool,
    pub env: std::collections::BTreeMap<String, String>,
    pub pid_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: "TUNICORN".to_string(),
            worker_class: WorkerClass::default(),
            workers: 1,
            listeners: vec![Endpoint::Tcp {
                host: "localhost".to_string(),
                port: 8080,
            }],
            backlog: 2048,
            timeout_secs: 30,
            graceful_timeout_secs: 5,
            worker_connections: 1000,
            chdir: None,
            uid: None,
            gid: None,
            umask: 0,
            initgroups: false,
            env: Default::default(),
            pid_file: None,
        }
    }
}

/// Shape of the JSON configuration file, merged over [`Config::default`],
/// our redesign of the original's `from_pyfile`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct RawConfig {
    pub name: Option<String>,
    pub worker_class: Option<WorkerClass>,
    pub workers: Option<u32>,
    pub bind: Option<Vec<String>>,
    pub backlog: Option<i32>,
    pub timeout: Option<u64>,
    pub graceful_timeout: Option<u64>,
    pub worker_connections: Option<usize>,
    pub chdir: Option<PathBuf>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub umask: Option<u32>,
    pub initgroups: Option<bool>,
    pub env: Option<std::collections::BTreeMap<String, String>>,
    pub pid_file: Option<PathBuf>,
}

impl RawConfig {
    /// Merge this file's values over the built-in defaults, parsing
    /// each `BIND` string via [`parse_address`].
    pub fn into_config(self) -> Result<Config, String> {
        let mut cfg = Config::default();
        if let Some(v) = self.name {
            cfg.name = v;
        }
        if let Some(v) = self.worker_class {
            cfg.worker_class = v;
        }
        if let Some(v) = self.workers {
            if v == 0 {
                return Err("WORKERS must be >= 1".to_string());
            }
            cfg.workers = v;
        }
        if let Some(binds) = self.bind {
            cfg.listeners = binds
                .iter()
                .map(|s| parse_address(s, 8000))
                .collect::<Result<Vec<_>, _>>()?;
        }
        if let Some(v) = self.backlog {
            cfg.backlog = v;
        }
        if let Some(v) = self.timeout {
            if v == 0 {
                return Err("TIMEOUT must be > 0".to_string());
            }
            cfg.timeout_secs = v;
        }
        if let Some(v) = self.graceful_timeout {
            if v == 0 {
                return Err("GRACEFUL_TIMEOUT must be > 0".to_string());
            }
            cfg.graceful_timeout_secs = v;
        }
        if let Some(v) = self.worker_connections {
            cfg.worker_connections = v;
        }
        if self.chdir.is_some() {
            cfg.chdir = self.chdir;
        }
        if self.uid.is_some() {
            cfg.uid = self.uid;
        }
        if self.gid.is_some() {
            cfg.gid = self.gid;
        }
        if let Some(v) = self.umask {
            cfg.umask = v;
        }
        if let Some(v) = self.initgroups {
            cfg.initgroups = v;
        }
        if let Some(v) = self.env {
            cfg.env = v;
        }
        if self.pid_file.is_some() {
            cfg.pid_file = self.pid_file;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_address_defaults_host() {
        assert_eq!(
            parse_address("", 8000).unwrap(),
            Endpoint::Tcp {
                host: "0.0.0.0".to_string(),
                port: 8000
            }
        );
    }

    #[test]
    fn unix_prefix_forms() {
        assert_eq!(
            parse_address("unix:/tmp/s.sock", 8000).unwrap(),
            Endpoint::Unix {
                path: PathBuf::from("/tmp/s.sock")
            }
        );
        assert_eq!(
            parse_address("unix:///tmp/s.sock", 8000).unwrap(),
            Endpoint::Unix {
                path: PathBuf::from("/tmp/s.sock")
            }
        );
    }

    #[test]
    fn bracketed_ipv6() {
        assert_eq!(
            parse_address("[::1]:9000", 8000).unwrap(),
            Endpoint::Tcp6 {
                host: "::1".to_string(),
                port: 9000
            }
        );
    }

    #[test]
    fn host_only_uses_default_port() {
        assert_eq!(
            parse_address("example.com", 8000).unwrap(),
            Endpoint::Tcp {
                host: "example.com".to_string(),
                port: 8000
            }
        );
    }

    #[test]
    fn host_with_port() {
        assert_eq!(
            parse_address("localhost:9999", 8000).unwrap(),
            Endpoint::Tcp {
                host: "localhost".to_string(),
                port: 9999
            }
        );
    }

    #[test]
    fn non_numeric_port_is_an_error() {
        assert!(parse_address("host:abc", 8000).is_err());
    }

    #[test]
    fn tcp_scheme_prefix_is_stripped() {
        assert_eq!(
            parse_address("tcp://0.0.0.0:1234", 8000).unwrap(),
            Endpoint::Tcp {
                host: "0.0.0.0".to_string(),
                port: 1234
            }
        );
    }

    #[test]
    fn round_trip_canonical_forms() {
        for s in ["unix:/tmp/a.sock", "localhost:1234"] {
            let parsed = parse_address(s, 8000).unwrap();
            let rendered = match &parsed {
                Endpoint::Unix { path } => format!("unix:{}", path.display()),
                Endpoint::Tcp { host, port } => format!("{host}:{port}"),
                Endpoint::Tcp6 { host, port } => format!("[{host}]:{port}"),
            };
            assert_eq!(parse_address(&rendered, 8000).unwrap(), parsed);
        }
    }
}
