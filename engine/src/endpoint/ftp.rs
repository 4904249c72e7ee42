//! FTP and FTPS endpoint built on `suppaftp`.
//!
//! The control connection sits behind a mutex so an optional keepalive
//! thread can send `NOOP` while the transfer loop is busy with the other
//! endpoint. Ticks are skipped while a data transfer is open on this
//! connection, because the server answers the transfer on the same channel.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use suppaftp::native_tls::TlsConnector;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode, NativeTlsConnector, NativeTlsFtpStream, Status};
use tracing::{debug, info, warn};

use super::{posix, Endpoint, ReadStream, WriteStream};
use crate::config::ServerConfig;
use crate::error::{is_connection_lost, EngineError};

enum Control {
    Plain(FtpStream),
    Secure(NativeTlsFtpStream),
}

/// Run the same expression against either control stream type.
macro_rules! on_stream {
    ($control:expr, $stream:ident => $body:expr) => {
        match $control {
            Control::Plain($stream) => $body,
            Control::Secure($stream) => $body,
        }
    };
}

struct Session {
    control: Control,
    /// A data transfer is open; the control channel must stay quiet
    busy: bool,
}

type Shared = Arc<Mutex<Session>>;

fn lock(shared: &Mutex<Session>) -> io::Result<MutexGuard<'_, Session>> {
    shared
        .lock()
        .map_err(|_| io::Error::other("FTP control connection poisoned"))
}

/// Translate a client error into `io::Error`, keeping socket error kinds so
/// a dropped connection can be told apart from a refused command.
fn to_io(err: FtpError) -> io::Error {
    match err {
        FtpError::ConnectionError(e) => e,
        FtpError::UnexpectedResponse(resp) if resp.status == Status::NotAvailable => {
            io::Error::new(io::ErrorKind::ConnectionAborted, "421 service not available")
        }
        other => io::Error::other(other.to_string()),
    }
}

fn resolve(server: &ServerConfig) -> io::Result<SocketAddr> {
    (server.host.as_str(), server.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address for {}", server.host),
            )
        })
}

fn open_control(server: &ServerConfig, tls: bool) -> Result<Control, FtpError> {
    let addr = resolve(server).map_err(FtpError::ConnectionError)?;
    let mut control = if tls {
        let stream = match server.timeout {
            Some(timeout) => NativeTlsFtpStream::connect_timeout(addr, timeout)?,
            None => NativeTlsFtpStream::connect(addr)?,
        };
        let connector =
            TlsConnector::new().map_err(|e| FtpError::SecureError(e.to_string()))?;
        let stream = stream.into_secure(NativeTlsConnector::from(connector), &server.host)?;
        if !server.encrypt_data {
            warn!(
                server = %server.address(),
                "data channel encryption cannot be disabled, data connections stay protected"
            );
        }
        Control::Secure(stream)
    } else {
        match server.timeout {
            Some(timeout) => Control::Plain(FtpStream::connect_timeout(addr, timeout)?),
            None => Control::Plain(FtpStream::connect(addr)?),
        }
    };

    on_stream!(&mut control, stream => {
        if server.timeout.is_some() {
            let socket = stream.get_ref();
            socket.set_read_timeout(server.timeout).map_err(FtpError::ConnectionError)?;
            socket.set_write_timeout(server.timeout).map_err(FtpError::ConnectionError)?;
        }
        stream.login(server.user.as_str(), server.password.as_str())?;
        stream.set_mode(if server.passive_mode { Mode::Passive } else { Mode::Active });
        stream.transfer_type(FileType::Binary)?;
    });
    Ok(control)
}

/// Background `NOOP` sender, stopped and joined on drop.
struct Keepalive {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Keepalive {
    fn spawn(shared: Shared, interval: Duration, address: String) -> Self {
        let (stop, stopped) = bounded::<()>(1);
        let handle = thread::spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let Ok(mut session) = shared.lock() else {
                        break;
                    };
                    if session.busy {
                        continue;
                    }
                    if let Err(e) = on_stream!(&mut session.control, s => s.noop()) {
                        let e = to_io(e);
                        debug!(server = %address, error = %e, "keepalive NOOP failed");
                        if is_connection_lost(&e) {
                            break;
                        }
                    }
                }
                _ => break,
            }
        });
        Keepalive {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Endpoint on an FTP or FTPS server.
pub struct FtpEndpoint {
    shared: Shared,
    address: String,
    tls: bool,
    keepalive: Option<Keepalive>,
}

impl FtpEndpoint {
    /// Open the control connection, upgrade to TLS when `tls` is set, log in
    /// and switch to binary mode. Any failure is a `Connect` error.
    pub fn connect(server: &ServerConfig, tls: bool) -> Result<Self, EngineError> {
        let address = server.address();
        let control =
            open_control(server, tls).map_err(|e| EngineError::connect(address.clone(), to_io(e)))?;
        let shared = Arc::new(Mutex::new(Session {
            control,
            busy: false,
        }));
        let keepalive = server
            .keepalive
            .filter(|interval| !interval.is_zero())
            .map(|interval| Keepalive::spawn(Arc::clone(&shared), interval, address.clone()));
        info!(server = %address, user = %server.user, tls, "FTP session established");
        Ok(FtpEndpoint {
            shared,
            address,
            tls,
            keepalive,
        })
    }

    fn with_control<T>(
        &self,
        op: impl FnOnce(&mut Control) -> Result<T, FtpError>,
    ) -> io::Result<T> {
        let mut session = lock(&self.shared)?;
        op(&mut session.control).map_err(to_io)
    }
}

impl Drop for FtpEndpoint {
    fn drop(&mut self) {
        self.keepalive.take();
        if let Err(e) = self.with_control(|c| on_stream!(c, s => s.quit())) {
            debug!(server = %self.address, error = %e, "FTP quit failed");
        }
    }
}

struct FtpReader {
    data: Option<Box<dyn Read>>,
    shared: Shared,
}

impl FtpReader {
    fn finish(&mut self) -> io::Result<()> {
        let Some(data) = self.data.take() else {
            return Ok(());
        };
        let mut session = lock(&self.shared)?;
        session.busy = false;
        on_stream!(&mut session.control, s => s.finalize_retr_stream(data)).map_err(to_io)
    }
}

impl Read for FtpReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.data.as_mut() {
            Some(data) => data.read(buf),
            None => Ok(0),
        }
    }
}

impl Drop for FtpReader {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            debug!(error = %e, "closing FTP download failed");
        }
    }
}

struct FtpWriter {
    data: Option<Box<dyn Write>>,
    shared: Shared,
}

impl FtpWriter {
    fn finish(&mut self) -> io::Result<()> {
        let Some(mut data) = self.data.take() else {
            return Ok(());
        };
        let flushed = data.flush();
        let mut session = lock(&self.shared)?;
        session.busy = false;
        on_stream!(&mut session.control, s => s.finalize_put_stream(data)).map_err(to_io)?;
        flushed
    }
}

impl Write for FtpWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.data.as_mut() {
            Some(data) => data.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "upload closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.data.as_mut() {
            Some(data) => data.flush(),
            None => Ok(()),
        }
    }
}

impl WriteStream for FtpWriter {
    fn commit(mut self: Box<Self>) -> io::Result<()> {
        self.finish()
    }
}

impl Drop for FtpWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            debug!(error = %e, "closing FTP upload failed");
        }
    }
}

impl Endpoint for FtpEndpoint {
    fn describe(&self) -> String {
        format!("{} {}", if self.tls { "FTPS" } else { "FTP" }, self.address)
    }

    fn open_read(&mut self, path: &str) -> io::Result<ReadStream> {
        let mut session = lock(&self.shared)?;
        let data = on_stream!(&mut session.control, s => s
            .retr_as_stream(path)
            .map(|d| Box::new(d) as Box<dyn Read>))
        .map_err(to_io)?;
        session.busy = true;
        Ok(Box::new(FtpReader {
            data: Some(data),
            shared: Arc::clone(&self.shared),
        }))
    }

    fn open_write(&mut self, path: &str) -> io::Result<Box<dyn WriteStream>> {
        let mut session = lock(&self.shared)?;
        let data = on_stream!(&mut session.control, s => s
            .put_with_stream(path)
            .map(|d| Box::new(d) as Box<dyn Write>))
        .map_err(to_io)?;
        session.busy = true;
        Ok(Box::new(FtpWriter {
            data: Some(data),
            shared: Arc::clone(&self.shared),
        }))
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        self.with_control(|c| on_stream!(c, s => s.rm(path)))
    }

    /// Servers differ in whether `NLST` answers with names or paths, so only
    /// the last component is kept.
    fn list(&mut self, path: &str) -> io::Result<Vec<String>> {
        let entries = self.with_control(|c| on_stream!(c, s => s.nlst(Some(path))))?;
        Ok(entries
            .iter()
            .map(|entry| posix::basename(entry.trim_end_matches('/')).to_string())
            .filter(|name| !name.is_empty() && name != "." && name != "..")
            .collect())
    }

    /// `CWD` into the path and back; there is no portable stat command.
    fn is_dir(&mut self, path: &str) -> bool {
        self.with_control(|c| {
            on_stream!(c, s => {
                let cwd = s.pwd()?;
                if s.cwd(path).is_err() {
                    return Ok(false);
                }
                s.cwd(&cwd)?;
                Ok(true)
            })
        })
        .unwrap_or(false)
    }

    fn is_file(&mut self, path: &str) -> bool {
        self.with_control(|c| on_stream!(c, s => s.size(path))).is_ok()
    }

    fn make_dirs(&mut self, path: &str) -> io::Result<()> {
        for dir in posix::prefixes(path) {
            if !self.is_dir(&dir) {
                self.with_control(|c| on_stream!(c, s => s.mkdir(&dir)))?;
            }
        }
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        self.with_control(|c| on_stream!(c, s => s.rename(from, to)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    fn assert_send<T: Send>() {}

    #[test]
    fn test_session_is_send() {
        assert_send::<Session>();
        assert_send::<Shared>();
    }

    fn server_on(port: u16) -> ServerConfig {
        let mut server = ServerConfig::new(Protocol::Ftp, "127.0.0.1", "bob");
        server.port = port;
        server.password = "secret".into();
        server.timeout = Some(Duration::from_secs(5));
        server
    }

    #[test]
    fn test_connection_errors_keep_their_kind() {
        let err = to_io(FtpError::ConnectionError(io::Error::from(
            io::ErrorKind::ConnectionReset,
        )));
        assert!(is_connection_lost(&err));
        let err = to_io(FtpError::SecureError("handshake failed".into()));
        assert!(!is_connection_lost(&err));
    }

    #[test]
    fn test_refused_connection_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let port = listener.local_addr().expect("Failed to get addr").port();
        drop(listener);

        match FtpEndpoint::connect(&server_on(port), false) {
            Err(EngineError::Connect { endpoint, .. }) => {
                assert_eq!(endpoint, format!("127.0.0.1:{}", port));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connect should fail"),
        }
    }

    #[test]
    fn test_rejected_login_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let port = listener.local_addr().expect("Failed to get addr").port();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().expect("Failed to accept");
            socket.write_all(b"220 test server\r\n").expect("Failed to greet");
            let mut reader = BufReader::new(socket.try_clone().expect("Failed to clone"));
            let mut line = String::new();
            reader.read_line(&mut line).expect("Failed to read USER");
            socket
                .write_all(b"530 Login incorrect\r\n")
                .expect("Failed to reject");
            line
        });

        let result = FtpEndpoint::connect(&server_on(port), false);
        assert!(matches!(result, Err(EngineError::Connect { .. })));
        let command = server.join().expect("server thread panicked");
        assert!(command.starts_with("USER bob"));
    }
}
