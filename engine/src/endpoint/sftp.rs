//! SFTP endpoint built on `ssh2`.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ssh2::{CheckResult, KnownHostFileKind, Session, Sftp};
use tracing::{debug, info};

use super::{posix, Endpoint, ReadStream, WriteStream};
use crate::config::{ServerConfig, SftpAuth};
use crate::error::EngineError;

const DIR_MODE: i32 = 0o755;

/// Open a TCP connection and complete the SSH handshake.
pub(crate) fn handshake(host: &str, port: u16, timeout: Option<Duration>) -> io::Result<Session> {
    let tcp = match timeout {
        Some(timeout) => connect_with_timeout(host, port, timeout)?,
        None => TcpStream::connect((host, port))?,
    };
    let mut session = Session::new()?;
    if let Some(timeout) = timeout {
        session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    }
    session.set_tcp_stream(tcp);
    session.handshake()?;
    Ok(session)
}

fn connect_with_timeout(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host))
    }))
}

/// Default known-hosts file of the current user.
pub(crate) fn default_known_hosts() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
}

fn verify_host_key(session: &Session, server: &ServerConfig) -> io::Result<()> {
    let path = server
        .known_hosts
        .clone()
        .or_else(default_known_hosts)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no known_hosts file"))?;
    let mut known_hosts = session.known_hosts()?;
    known_hosts.read_file(&path, KnownHostFileKind::OpenSSH)?;
    let (key, _) = session
        .host_key()
        .ok_or_else(|| io::Error::other("server sent no host key"))?;
    match known_hosts.check_port(&server.host, server.port, key) {
        CheckResult::Match => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "incorrect hostkey",
        )),
    }
}

fn authenticate(session: &Session, server: &ServerConfig) -> io::Result<()> {
    match server.sftp_auth() {
        SftpAuth::Password(password) => session.userauth_password(&server.user, &password)?,
        SftpAuth::PrivateKey {
            key_type,
            key_file,
            passphrase,
        } => {
            debug!(?key_type, key_file = %key_file.display(), "private key authentication");
            session.userauth_pubkey_file(&server.user, None, &key_file, passphrase.as_deref())?
        }
    }
    if session.authenticated() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "authentication failed",
        ))
    }
}

/// Endpoint on an SFTP server.
pub struct SftpEndpoint {
    session: Session,
    sftp: Sftp,
    address: String,
}

impl SftpEndpoint {
    /// Connect, verify the host key against known hosts, authenticate and
    /// open the SFTP channel. Any failure is a `Connect` error.
    pub fn connect(server: &ServerConfig) -> Result<Self, EngineError> {
        let address = server.address();
        let open = || -> io::Result<(Session, Sftp)> {
            let session = handshake(&server.host, server.port, server.timeout)?;
            verify_host_key(&session, server)?;
            authenticate(&session, server)?;
            let sftp = session.sftp()?;
            Ok((session, sftp))
        };
        let (session, sftp) = open().map_err(|e| EngineError::connect(address.clone(), e))?;
        info!(server = %address, user = %server.user, "SFTP session established");
        Ok(SftpEndpoint {
            session,
            sftp,
            address,
        })
    }
}

impl Drop for SftpEndpoint {
    fn drop(&mut self) {
        if let Err(e) = self.session.disconnect(None, "closing", None) {
            debug!(server = %self.address, error = %e, "SFTP disconnect failed");
        }
    }
}

struct SftpWriter {
    file: ssh2::File,
}

impl Write for SftpWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl WriteStream for SftpWriter {
    fn commit(mut self: Box<Self>) -> io::Result<()> {
        self.file.flush()?;
        // Not every server implements fsync@openssh.com.
        self.file.fsync().ok();
        self.file.close()?;
        Ok(())
    }
}

struct SftpReader {
    file: ssh2::File,
}

impl Read for SftpReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Endpoint for SftpEndpoint {
    fn describe(&self) -> String {
        format!("SFTP {}", self.address)
    }

    fn open_read(&mut self, path: &str) -> io::Result<ReadStream> {
        let file = self.sftp.open(Path::new(path))?;
        Ok(Box::new(SftpReader { file }))
    }

    fn open_write(&mut self, path: &str) -> io::Result<Box<dyn WriteStream>> {
        let file = self.sftp.create(Path::new(path))?;
        Ok(Box::new(SftpWriter { file }))
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        Ok(self.sftp.unlink(Path::new(path))?)
    }

    fn list(&mut self, path: &str) -> io::Result<Vec<String>> {
        let entries = self.sftp.readdir(Path::new(path))?;
        Ok(entries
            .into_iter()
            .filter_map(|(p, _)| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .filter(|name| name != "." && name != "..")
            .collect())
    }

    fn is_dir(&mut self, path: &str) -> bool {
        self.sftp
            .lstat(Path::new(path))
            .is_ok_and(|stat| stat.is_dir())
    }

    fn is_file(&mut self, path: &str) -> bool {
        self.sftp
            .stat(Path::new(path))
            .is_ok_and(|stat| stat.is_file())
    }

    fn exists(&mut self, path: &str) -> bool {
        self.sftp.lstat(Path::new(path)).is_ok()
    }

    /// Walks the path component by component, creating each missing one.
    fn make_dirs(&mut self, path: &str) -> io::Result<()> {
        for dir in posix::prefixes(path) {
            if !self.exists(&dir) {
                self.sftp.mkdir(Path::new(&dir), DIR_MODE)?;
            }
        }
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        Ok(self.sftp.rename(Path::new(from), Path::new(to), None)?)
    }
}
