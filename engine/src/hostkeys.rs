//! Host key maintenance for SFTP servers.
//!
//! Fetches a server's host key, formats its fingerprints and adds, replaces
//! or deletes the matching line in an OpenSSH `known_hosts` file. Hashed
//! host names are left untouched.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::SSH_PORT;
use crate::endpoint::sftp::handshake;
use crate::error::EngineError;

/// A server host key as sent during the SSH handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    /// Algorithm name, e.g. `ssh-ed25519`
    pub key_type: String,
    /// Raw key blob
    pub key: Vec<u8>,
}

impl HostKey {
    /// Build from a raw key blob, reading the algorithm name it starts with.
    pub fn from_blob(key: Vec<u8>) -> io::Result<Self> {
        let invalid = || io::Error::new(io::ErrorKind::InvalidData, "malformed host key");
        let len_bytes: [u8; 4] = key.get(..4).ok_or_else(invalid)?.try_into().map_err(|_| invalid())?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        let name = key.get(4..4 + len).ok_or_else(invalid)?;
        let key_type = String::from_utf8(name.to_vec()).map_err(|_| invalid())?;
        Ok(HostKey { key_type, key })
    }

    /// MD5 fingerprint as colon separated hex.
    pub fn md5_fingerprint(&self) -> String {
        md5::compute(&self.key)
            .0
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// SHA256 fingerprint as base64 without padding.
    pub fn sha256_fingerprint(&self) -> String {
        STANDARD_NO_PAD.encode(Sha256::digest(&self.key))
    }

    /// Line for a `known_hosts` file.
    pub fn known_hosts_line(&self, host: &str, port: u16) -> String {
        format!(
            "{} {} {}",
            known_hosts_name(host, port),
            self.key_type,
            STANDARD.encode(&self.key)
        )
    }
}

/// Name under which a host is stored: `host` on port 22, `[host]:port` otherwise.
pub fn known_hosts_name(host: &str, port: u16) -> String {
    if port == SSH_PORT {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Connect to an SSH server and return its host key. No authentication is
/// attempted.
pub fn fetch(host: &str, port: u16, timeout: Option<Duration>) -> Result<HostKey, EngineError> {
    let address = format!("{}:{}", host, port);
    let fetch_key = || -> io::Result<HostKey> {
        let session = handshake(host, port, timeout)?;
        let (key, _) = session
            .host_key()
            .ok_or_else(|| io::Error::other("server sent no host key"))?;
        HostKey::from_blob(key.to_vec())
    };
    fetch_key().map_err(|e| EngineError::connect(address, e))
}

fn entry_matches(line: &str, name: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return false;
    }
    let hosts = match trimmed.split_whitespace().next() {
        Some(field) if field.starts_with('@') => trimmed.split_whitespace().nth(1),
        other => other,
    };
    hosts.is_some_and(|hosts| hosts.split(',').any(|h| h == name))
}

fn read_lines(file: &Path) -> io::Result<Vec<String>> {
    match fs::read_to_string(file) {
        Ok(text) => Ok(text.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn write_lines(file: &Path, lines: &[String]) -> io::Result<()> {
    if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    fs::write(file, text)
}

/// Add the key for `host:port`, replacing any existing entries for it.
///
/// # Returns
/// True if an existing entry was replaced.
pub fn add(file: &Path, host: &str, port: u16, key: &HostKey) -> io::Result<bool> {
    let name = known_hosts_name(host, port);
    let mut lines = read_lines(file)?;
    let before = lines.len();
    lines.retain(|line| !entry_matches(line, &name));
    let replaced = lines.len() != before;
    lines.push(key.known_hosts_line(host, port));
    write_lines(file, &lines)?;
    info!(host = %name, file = %file.display(), replaced, "host key saved");
    Ok(replaced)
}

/// Delete all entries for `host:port`.
///
/// # Returns
/// True if anything was removed.
pub fn delete(file: &Path, host: &str, port: u16) -> io::Result<bool> {
    let name = known_hosts_name(host, port);
    let mut lines = read_lines(file)?;
    let before = lines.len();
    lines.retain(|line| !entry_matches(line, &name));
    if lines.len() == before {
        return Ok(false);
    }
    write_lines(file, &lines)?;
    info!(host = %name, file = %file.display(), "host key deleted");
    Ok(true)
}
