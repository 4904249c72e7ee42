//! Resolved job configuration.
//!
//! These structs are what the engine consumes. They are built by the
//! `loader` module from TOML files, or directly by library callers, and are
//! passed by reference into every component; nothing here is global.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::EngineError;

/// Default FTP port.
pub const FTP_PORT: u16 = 21;
/// Default SSH/SFTP port.
pub const SSH_PORT: u16 = 22;

/// Remote protocol of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Ftp,
    Ftps,
    Sftp,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Ftp | Protocol::Ftps => FTP_PORT,
            Protocol::Sftp => SSH_PORT,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ftp => write!(f, "FTP"),
            Protocol::Ftps => write!(f, "FTPS"),
            Protocol::Sftp => write!(f, "SFTP"),
        }
    }
}

/// Private key type for SFTP public key authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa,
    Dsa,
    Ecdsa,
    Ed25519,
}

impl KeyType {
    /// Lowercase name used in application config keys (`key_<name>_file`).
    pub fn config_name(self) -> &'static str {
        match self {
            KeyType::Rsa => "rsa",
            KeyType::Dsa => "dsa",
            KeyType::Ecdsa => "ecdsa",
            KeyType::Ed25519 => "ed25519",
        }
    }
}

impl FromStr for KeyType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RSA" => Ok(KeyType::Rsa),
            "DSA" => Ok(KeyType::Dsa),
            "ECDSA" => Ok(KeyType::Ecdsa),
            "ED25519" => Ok(KeyType::Ed25519),
            _ => Err(EngineError::config(format!("Unknown key type: {}", s))),
        }
    }
}

/// Credentials for SFTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SftpAuth {
    Password(String),
    PrivateKey {
        key_type: KeyType,
        key_file: PathBuf,
        passphrase: Option<String>,
    },
}

/// Connection parameters of a remote endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Connect and I/O timeout; `None` blocks indefinitely
    pub timeout: Option<Duration>,
    /// FTP/FTPS only
    pub passive_mode: bool,
    /// FTPS only: protect the data channel
    pub encrypt_data: bool,
    /// FTP/FTPS only: NOOP heartbeat interval
    pub keepalive: Option<Duration>,
    /// SFTP only
    pub known_hosts: Option<PathBuf>,
    /// SFTP only: key authentication instead of the password
    pub key: Option<SftpAuth>,
}

impl ServerConfig {
    pub fn new(protocol: Protocol, host: impl Into<String>, user: impl Into<String>) -> Self {
        ServerConfig {
            protocol,
            host: host.into(),
            port: protocol.default_port(),
            user: user.into(),
            password: String::new(),
            timeout: None,
            passive_mode: true,
            encrypt_data: true,
            keepalive: None,
            known_hosts: None,
            key: None,
        }
    }

    /// `host:port` label used in logs and connect errors.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// SFTP authentication method resolved from password and key settings.
    pub fn sftp_auth(&self) -> SftpAuth {
        self.key
            .clone()
            .unwrap_or_else(|| SftpAuth::Password(self.password.clone()))
    }
}

/// Where an endpoint lives: a base path, optionally on a remote server.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub path: String,
    /// `None` selects the local filesystem
    pub server: Option<ServerConfig>,
}

impl Location {
    pub fn local(path: impl Into<String>) -> Self {
        Location {
            path: path.into(),
            server: None,
        }
    }

    pub fn remote(path: impl Into<String>, server: ServerConfig) -> Self {
        Location {
            path: path.into(),
            server: Some(server),
        }
    }

    /// Human readable URL-like description, e.g. `sftp://host:22/data`.
    pub fn describe(&self) -> String {
        match &self.server {
            None => format!("local:{}", self.path),
            Some(server) => format!(
                "{}://{}{}{}",
                server.protocol.to_string().to_lowercase(),
                server.address(),
                if self.path.starts_with('/') { "" } else { "/" },
                self.path
            ),
        }
    }
}

/// Source side settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub location: Location,
    /// Include patterns (shell glob)
    pub files: Vec<String>,
    /// Exclude patterns (shell glob)
    pub ignore: Vec<String>,
    pub recursive: bool,
    /// Remove each source file once it has been stored
    pub delete: bool,
}

impl SourceConfig {
    pub fn new(location: Location, files: Vec<String>) -> Self {
        SourceConfig {
            location,
            files,
            ignore: vec![".*".to_string()],
            recursive: false,
            delete: false,
        }
    }
}

/// Temporary file policy of the atomic store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TempPolicy {
    /// Write straight to the final path
    #[default]
    None,
    /// `.name` in the same directory
    DotPrefix,
    /// `name<ext>` in the same directory
    Extension(String),
    /// `<target base>/<dir>/name`
    Subdirectory(String),
}

impl FromStr for TempPolicy {
    type Err = EngineError;

    /// Accepts `dot`, `ext:<suffix>` and `dir:<name>` plus the long forms
    /// `none`, `dot-prefix`, `extension:<suffix>` and `subdirectory:<name>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (kind, arg) = match s.split_once(':') {
            Some((kind, arg)) => (kind.trim(), Some(arg.trim())),
            None => (s, None),
        };
        let invalid = || EngineError::config(format!("Wrong value for \"target.temp\": {}", s));
        match (kind, arg) {
            ("" | "none", None) => Ok(TempPolicy::None),
            ("dot" | "dot-prefix", None) => Ok(TempPolicy::DotPrefix),
            ("ext" | "extension", Some(ext)) if !ext.is_empty() => {
                Ok(TempPolicy::Extension(ext.to_string()))
            }
            ("dir" | "subdirectory", Some(dir))
                if !dir.is_empty() && !dir.contains(['/', '\\']) && dir != ".." =>
            {
                Ok(TempPolicy::Subdirectory(dir.to_string()))
            }
            _ => Err(invalid()),
        }
    }
}

/// Target side settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetConfig {
    pub location: Location,
    pub temp: TempPolicy,
}

impl TargetConfig {
    pub fn new(location: Location) -> Self {
        TargetConfig {
            location,
            temp: TempPolicy::None,
        }
    }
}

/// Retry bound and exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Additional attempts after the first one
    pub retries: u32,
    pub base: f64,
    pub factor: f64,
    /// Upper bound of a single backoff interval, in seconds
    pub max_interval: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            retries: 0,
            base: 2.0,
            factor: 1.0,
            max_interval: 60.0,
        }
    }
}

/// Single-instance lock settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    pub locks_dir: PathBuf,
    /// Lock name; the job id is used when absent
    pub name: Option<String>,
}

/// Complete, resolved configuration of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    pub job_id: String,
    pub name: Option<String>,
    pub info: Option<String>,
    pub source: SourceConfig,
    pub target: TargetConfig,
    pub retry: RetryConfig,
    /// `Some` enables single-instance mode
    pub single_instance: Option<LockConfig>,
    /// Marker file directly under the source base path
    pub ready_file: Option<String>,
    /// Collect the per-file list into the job result
    pub collect_data: bool,
}

impl JobConfig {
    pub fn new(job_id: impl Into<String>, source: SourceConfig, target: TargetConfig) -> Self {
        JobConfig {
            job_id: job_id.into(),
            name: None,
            info: None,
            source,
            target,
            retry: RetryConfig::default(),
            single_instance: None,
            ready_file: None,
            collect_data: false,
        }
    }

    /// Check invariants that the loader cannot express in types.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.job_id.trim().is_empty() {
            return Err(EngineError::config("job id must not be empty"));
        }
        if self.source.location.path.is_empty() {
            return Err(EngineError::config("\"source.path\" is required"));
        }
        if self.target.location.path.is_empty() {
            return Err(EngineError::config("\"target.path\" is required"));
        }
        if self.source.files.is_empty() {
            return Err(EngineError::config("\"source.files\" is required"));
        }
        if let Some(ready) = &self.ready_file {
            if ready.is_empty() || ready.contains('/') {
                return Err(EngineError::config(format!(
                    "\"job.ready_file\" must be a plain file name: {}",
                    ready
                )));
            }
        }
        let retry = &self.retry;
        if !(retry.base >= 1.0 && retry.factor >= 0.0 && retry.max_interval >= 0.0) {
            return Err(EngineError::config("invalid backoff settings"));
        }
        for server in [&self.source.location.server, &self.target.location.server]
            .into_iter()
            .flatten()
        {
            if server.host.is_empty() {
                return Err(EngineError::config("server host must not be empty"));
            }
            if server.port == 0 {
                return Err(EngineError::config("Port must be between 1 and 65535"));
            }
        }
        Ok(())
    }

    /// Name of the single-instance lock, if single-instance mode is on.
    pub fn lock_name(&self) -> Option<&str> {
        self.single_instance
            .as_ref()
            .map(|lock| lock.name.as_deref().unwrap_or(&self.job_id))
    }
}

/// Split `host[:port]`, falling back to `default_port`.
pub fn split_host_port(s: &str, default_port: u16) -> Result<(String, u16), EngineError> {
    match s.split_once(':') {
        None => Ok((s.to_string(), default_port)),
        Some((host, port)) => {
            let port = parse_port(port)
                .map_err(|e| EngineError::config(format!("{} in \"{}\"", e, s)))?;
            Ok((host.to_string(), port))
        }
    }
}

/// Parse a TCP port in the range 1..=65535.
pub fn parse_port(s: &str) -> Result<u16, String> {
    let port: i64 = s
        .trim()
        .parse()
        .map_err(|_| "Port must be integer".to_string())?;
    if (1..=65535).contains(&port) {
        Ok(port as u16)
    } else {
        Err("Port must be between 1 and 65535".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_job() -> JobConfig {
        JobConfig::new(
            "job1",
            SourceConfig::new(Location::local("/data/in"), vec!["*.txt".into()]),
            TargetConfig::new(Location::local("/data/out")),
        )
    }

    #[test]
    fn test_temp_policy_parsing() {
        assert_eq!("".parse::<TempPolicy>().unwrap(), TempPolicy::None);
        assert_eq!("dot".parse::<TempPolicy>().unwrap(), TempPolicy::DotPrefix);
        assert_eq!("dot-prefix".parse::<TempPolicy>().unwrap(), TempPolicy::DotPrefix);
        assert_eq!(
            "ext:.tmp".parse::<TempPolicy>().unwrap(),
            TempPolicy::Extension(".tmp".into())
        );
        assert_eq!(
            "subdirectory:staging".parse::<TempPolicy>().unwrap(),
            TempPolicy::Subdirectory("staging".into())
        );
    }

    #[test]
    fn test_temp_policy_rejects_bad_values() {
        for bad in ["dot:x", "ext", "ext:", "dir:a/b", "zip:1", "dir:.."] {
            assert!(bad.parse::<TempPolicy>().is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com", 22).unwrap(), ("example.com".into(), 22));
        assert_eq!(split_host_port("example.com:2121", 21).unwrap(), ("example.com".into(), 2121));
        assert!(split_host_port("example.com:0", 21).is_err());
        assert!(split_host_port("example.com:ftp", 21).is_err());
        assert!(split_host_port("example.com:70000", 21).is_err());
    }

    #[test]
    fn test_validate_rejects_missing_patterns() {
        let mut job = local_job();
        job.source.files.clear();
        assert!(matches!(job.validate(), Err(EngineError::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_nested_ready_file() {
        let mut job = local_job();
        job.ready_file = Some("sub/READY".into());
        assert!(job.validate().is_err());
        job.ready_file = Some("READY".into());
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_lock_name_defaults_to_job_id() {
        let mut job = local_job();
        assert_eq!(job.lock_name(), None);
        job.single_instance = Some(LockConfig {
            locks_dir: PathBuf::from("/tmp"),
            name: None,
        });
        assert_eq!(job.lock_name(), Some("job1"));
    }

    #[test]
    fn test_location_describe() {
        let server = ServerConfig::new(Protocol::Sftp, "example.com", "bob");
        assert_eq!(
            Location::remote("/upload", server).describe(),
            "sftp://example.com:22/upload"
        );
        assert_eq!(Location::local("/in").describe(), "local:/in");
    }
}
