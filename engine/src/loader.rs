//! Loading of application, job and hosts configuration files (TOML).
//!
//! Layout:
//! - application config: `[global]`, `[logging]`, `[sftp]`
//! - job config `<jobs_dir>/<job_id>.toml`: `[job]`, `[source]`, `[target]`
//! - hosts config: one table per host id, referenced via `host_id`

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::config::{
    split_host_port, JobConfig, KeyType, Location, LockConfig, Protocol, RetryConfig,
    ServerConfig, SftpAuth, SourceConfig, TargetConfig, TempPolicy,
};
use crate::error::EngineError;

/// Logging section of the application config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingSettings {
    /// `None` logs to stderr
    pub log_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    /// One subdirectory per job id
    #[serde(default = "default_true")]
    pub use_subdirs: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            log_dir: None,
            log_level: None,
            use_subdirs: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub jobs_dir: PathBuf,
    pub locks_dir: Option<PathBuf>,
    pub hosts_cfg: Option<PathBuf>,
    pub logging: LoggingSettings,
    /// Raw `[sftp]` defaults: `known_hosts`, `key_<type>_file`, `key_<type>_pass`
    pub sftp: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAppConfig {
    #[serde(default)]
    global: RawGlobal,
    #[serde(default)]
    logging: LoggingSettings,
    #[serde(default)]
    sftp: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGlobal {
    jobs_dir: Option<String>,
    locks_dir: Option<String>,
    hosts_cfg: Option<String>,
}

impl AppConfig {
    /// Read the application config file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = read_config_file(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, EngineError> {
        let raw: RawAppConfig = toml::from_str(text)
            .map_err(|e| EngineError::config(format!("application config: {}", e)))?;
        let jobs_dir = raw
            .global
            .jobs_dir
            .ok_or_else(|| EngineError::config("\"jobs_dir\" is required"))?;
        let mut logging = raw.logging;
        logging.log_dir = logging.log_dir.map(|p| expand_home(&p.to_string_lossy()));
        Ok(AppConfig {
            jobs_dir: expand_home(&jobs_dir),
            locks_dir: raw.global.locks_dir.as_deref().map(expand_home),
            hosts_cfg: raw.global.hosts_cfg.as_deref().map(expand_home),
            logging,
            sftp: raw.sftp,
        })
    }

    /// Path of the job config file for `job_id`.
    pub fn job_file(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(format!("{}.toml", job_id))
    }

    /// Load and resolve the configuration of `job_id`.
    pub fn load_job(&self, job_id: &str) -> Result<JobConfig, EngineError> {
        let path = self.job_file(job_id);
        debug!(path = %path.display(), "loading job config");
        let text = read_config_file(&path)?;
        self.parse_job(job_id, &text)
    }

    /// Resolve a job config from its TOML text.
    pub fn parse_job(&self, job_id: &str, text: &str) -> Result<JobConfig, EngineError> {
        let raw: RawJobFile = toml::from_str(text)
            .map_err(|e| EngineError::config(format!("job config \"{}\": {}", job_id, e)))?;
        let mut hosts = HostsCache::new(self.hosts_cfg.clone());

        let source_server = self.resolve_server("source", &raw.source, &mut hosts)?;
        let target_server = self.resolve_server("target", &raw.target, &mut hosts)?;

        let files = raw
            .source
            .files
            .map(PatternList::into_vec)
            .unwrap_or_default();
        let ignore = raw
            .source
            .ignore
            .map(PatternList::into_vec)
            .unwrap_or_else(|| vec![".*".to_string()]);

        let source = SourceConfig {
            location: Location {
                path: required_path("source", raw.source.path)?,
                server: source_server,
            },
            files,
            ignore,
            recursive: raw.source.recursive,
            delete: raw.source.delete,
        };
        let target = TargetConfig {
            location: Location {
                path: required_path("target", raw.target.path)?,
                server: target_server,
            },
            temp: raw
                .target
                .temp
                .as_deref()
                .map(str::parse::<TempPolicy>)
                .transpose()?
                .unwrap_or(TempPolicy::None),
        };

        let job = raw.job;
        let defaults = RetryConfig::default();
        let single_instance = if job.single_instance {
            let locks_dir = self
                .locks_dir
                .clone()
                .ok_or_else(|| EngineError::config("\"locks_dir\" is required for single_instance"))?;
            Some(LockConfig {
                locks_dir,
                name: job.lock_name,
            })
        } else {
            None
        };

        let config = JobConfig {
            job_id: job_id.to_string(),
            name: job.name,
            info: job.info,
            source,
            target,
            retry: RetryConfig {
                retries: job.retries,
                base: job.backoff_base.unwrap_or(defaults.base),
                factor: job.backoff_factor.unwrap_or(defaults.factor),
                max_interval: job.backoff_max.unwrap_or(defaults.max_interval),
            },
            single_instance,
            ready_file: job.ready_file,
            collect_data: job.collect_data,
        };
        config.validate()?;
        Ok(config)
    }

    fn resolve_server(
        &self,
        section: &str,
        raw: &RawEndpoint,
        hosts: &mut HostsCache,
    ) -> Result<Option<ServerConfig>, EngineError> {
        let server = match &raw.host_id {
            Some(host_id) => {
                if raw.server.is_set() {
                    return Err(EngineError::config(format!(
                        "Host configuration setting(s) in \"{}\" but host_id used",
                        section
                    )));
                }
                hosts.get(host_id)?
            }
            None if raw.server.is_set() => raw.server.clone(),
            None => return Ok(None),
        };
        self.build_server(section, server).map(Some)
    }

    fn build_server(&self, section: &str, raw: RawServer) -> Result<ServerConfig, EngineError> {
        let missing = |key: &str| EngineError::config(format!("\"{}.{}\" is required", section, key));
        let protocol = raw.kind.ok_or_else(|| missing("type"))?;
        let (host, port) = split_host_port(
            raw.host.as_deref().ok_or_else(|| missing("host"))?,
            protocol.default_port(),
        )?;
        let user = raw.user.ok_or_else(|| missing("user"))?;

        let mut server = ServerConfig::new(protocol, host, user);
        server.port = port;
        server.password = raw.password.unwrap_or_default();
        server.timeout = seconds(section, "timeout", raw.timeout)?;
        server.keepalive = seconds(section, "keepalive", raw.keepalive)?;
        server.passive_mode = raw.passive_mode.unwrap_or(true);
        server.encrypt_data = raw.encrypt_data.unwrap_or(true);

        if protocol == Protocol::Sftp {
            let known_hosts = raw
                .known_hosts
                .or_else(|| self.sftp.get("known_hosts").cloned())
                .ok_or_else(|| missing("known_hosts"))?;
            server.known_hosts = Some(expand_home(&known_hosts));
            if let Some(key_type) = raw.key_type.as_deref() {
                server.key = Some(self.resolve_key(key_type.parse()?, raw.key_file, raw.key_pass)?);
            }
        }
        Ok(server)
    }

    fn resolve_key(
        &self,
        key_type: KeyType,
        key_file: Option<String>,
        key_pass: Option<String>,
    ) -> Result<SftpAuth, EngineError> {
        let (key_file, passphrase) = match key_file {
            Some(file) => (file, key_pass),
            None => {
                let file_key = format!("key_{}_file", key_type.config_name());
                let file = self.sftp.get(&file_key).cloned().ok_or_else(|| {
                    EngineError::config(format!(
                        "Missing \"{}\" in application configuration",
                        file_key
                    ))
                })?;
                let pass_key = format!("key_{}_pass", key_type.config_name());
                (file, self.sftp.get(&pass_key).cloned())
            }
        };
        Ok(SftpAuth::PrivateKey {
            key_type,
            key_file: expand_home(&key_file),
            passphrase: passphrase.filter(|p| !p.is_empty()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawJobFile {
    #[serde(default)]
    job: RawJob,
    source: RawEndpoint,
    target: RawEndpoint,
}

#[derive(Debug, Default, Deserialize)]
struct RawJob {
    name: Option<String>,
    info: Option<String>,
    #[serde(default)]
    single_instance: bool,
    lock_name: Option<String>,
    ready_file: Option<String>,
    #[serde(default)]
    collect_data: bool,
    #[serde(default)]
    retries: u32,
    backoff_base: Option<f64>,
    backoff_factor: Option<f64>,
    backoff_max: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawEndpoint {
    path: Option<String>,
    host_id: Option<String>,
    #[serde(flatten)]
    server: RawServer,
    files: Option<PatternList>,
    ignore: Option<PatternList>,
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    delete: bool,
    temp: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawServer {
    #[serde(rename = "type")]
    kind: Option<Protocol>,
    host: Option<String>,
    user: Option<String>,
    password: Option<String>,
    timeout: Option<f64>,
    passive_mode: Option<bool>,
    encrypt_data: Option<bool>,
    keepalive: Option<f64>,
    known_hosts: Option<String>,
    key_type: Option<String>,
    key_file: Option<String>,
    key_pass: Option<String>,
}

impl RawServer {
    fn is_set(&self) -> bool {
        self.kind.is_some()
            || self.host.is_some()
            || self.user.is_some()
            || self.password.is_some()
            || self.timeout.is_some()
            || self.passive_mode.is_some()
            || self.encrypt_data.is_some()
            || self.keepalive.is_some()
            || self.known_hosts.is_some()
            || self.key_type.is_some()
            || self.key_file.is_some()
            || self.key_pass.is_some()
    }
}

/// Pattern list written either as an array or as a comma separated string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PatternList {
    List(Vec<String>),
    Csv(String),
}

impl PatternList {
    fn into_vec(self) -> Vec<String> {
        let items = match self {
            PatternList::List(items) => items,
            PatternList::Csv(s) => s.split(',').map(str::to_string).collect(),
        };
        items
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }
}

/// Hosts file, read on first use of a `host_id`.
struct HostsCache {
    path: Option<PathBuf>,
    hosts: Option<BTreeMap<String, RawServer>>,
}

impl HostsCache {
    fn new(path: Option<PathBuf>) -> Self {
        HostsCache { path, hosts: None }
    }

    fn get(&mut self, host_id: &str) -> Result<RawServer, EngineError> {
        if self.hosts.is_none() {
            let path = self.path.as_ref().ok_or_else(|| {
                EngineError::config("Hosts configuration: hosts_cfg not set in application config")
            })?;
            let text = read_config_file(path)?;
            let hosts = toml::from_str(&text)
                .map_err(|e| EngineError::config(format!("Hosts configuration: {}", e)))?;
            self.hosts = Some(hosts);
        }
        self.hosts
            .as_ref()
            .and_then(|hosts| hosts.get(host_id))
            .cloned()
            .ok_or_else(|| EngineError::config(format!("Unknown host_id: {}", host_id)))
    }
}

fn read_config_file(path: &Path) -> Result<String, EngineError> {
    fs::read_to_string(path)
        .map_err(|e| EngineError::config(format!("cannot read {}: {}", path.display(), e)))
}

fn required_path(section: &str, path: Option<String>) -> Result<String, EngineError> {
    path.filter(|p| !p.is_empty())
        .ok_or_else(|| EngineError::config(format!("\"{}.path\" is required", section)))
}

fn seconds(section: &str, key: &str, value: Option<f64>) -> Result<Option<Duration>, EngineError> {
    match value {
        None => Ok(None),
        Some(secs) if secs == 0.0 => Ok(None),
        Some(secs) => Duration::try_from_secs_f64(secs).map(Some).map_err(|_| {
            EngineError::config(format!("Wrong value for \"{}.{}\": {}", section, key, secs))
        }),
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
