//! The remote-server driver (spec §4.2): connects/authenticates/closes one
//! connection at a time, and can launch or terminate a backend process.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};

use tracing::{info, instrument, warn};

use crate::connection::Connection;
use crate::endpoint::ServerEndpoint;
use crate::error::DriverError;
use crate::wire::TcpConnection;

/// The seam over which the pool invokes connect/shutdown/validate/startup.
/// Production code uses [`RserveDriver`]; tests substitute an in-memory fake
/// (see `pool::tests`) so the pool's bookkeeping can be exercised without a
/// live backend.
pub trait Driver: Send + Sync + 'static {
    /// The connection type this driver produces.
    type Conn: Connection;

    /// Connects, logging in if the server demands it.
    fn open(&self, endpoint: &ServerEndpoint) -> Result<Self::Conn, DriverError>;

    /// Opens a temporary connection and issues the shutdown command.
    fn shutdown(&self, endpoint: &ServerEndpoint) -> Result<(), DriverError>;

    /// Opens, checks liveness, and closes; never panics or propagates.
    fn validate(&self, endpoint: &ServerEndpoint) -> bool;

    /// Launches (or arranges the launch of) the backend process for
    /// `endpoint`, running `command`. Returns a handle whose `wait` blocks
    /// the calling thread for the process exit code.
    fn startup(&self, endpoint: &ServerEndpoint, command: &str) -> Result<StartupHandle, DriverError>;
}

/// A running (or already-exited) backend process started by `startup`.
pub struct StartupHandle {
    child: Option<Child>,
    log_threads: Vec<JoinHandle<()>>,
    ssh: bool,
}

impl StartupHandle {
    /// Blocks the calling thread until the process exits, returning its
    /// exit status. This is the blocking-pool analogue of the source's
    /// "future that resolves to the process exit code" (spec §4.2).
    pub fn wait(mut self) -> std::io::Result<std::process::ExitStatus> {
        let status = self
            .child
            .as_mut()
            .expect("wait called once")
            .wait()?;
        for t in self.log_threads.drain(..) {
            let _ = t.join();
        }
        Ok(status)
    }

    /// Sends a termination signal without waiting for exit.
    pub fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
        }
    }
}

impl Drop for StartupHandle {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.try_wait();
        }
    }
}

/// `Driver` implementation speaking the [`crate::wire`] framing over TCP,
/// and spawning backend processes locally or over `ssh`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RserveDriver;

impl RserveDriver {
    /// Returns whether `host` resolves to this machine, per spec §4.2:
    /// "compares the hostname to localhost, 127.0.0.1, and the resolved
    /// local address."
    fn is_local(host: &str) -> bool {
        if matches!(host, "localhost" | "127.0.0.1" | "::1") {
            return true;
        }
        if let Some(local) = local_hostname() {
            if host.eq_ignore_ascii_case(&local) {
                return true;
            }
        }
        resolves_to_loopback(host)
    }
}

/// Calls `gethostname(2)` to get the machine's own hostname, the same name
/// a locally-launched process would see from its shell.
fn local_hostname() -> Option<String> {
    let mut buf = vec![0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..len].to_vec()).ok()
}

/// Resolves `host` (DNS or literal address) and reports whether any
/// resolved address is a loopback address, per SPEC_FULL.md §4.2's
/// `std::net::ToSocketAddrs`-against-the-loopback-set approach.
fn resolves_to_loopback(host: &str) -> bool {
    use std::net::ToSocketAddrs;
    match (host, 0u16).to_socket_addrs() {
        Ok(addrs) => addrs.map(|a| a.ip()).any(|ip| ip.is_loopback()),
        Err(_) => false,
    }
}

impl Driver for RserveDriver {
    type Conn = TcpConnection;

    #[instrument(skip(self), fields(endpoint = %endpoint))]
    fn open(&self, endpoint: &ServerEndpoint) -> Result<Self::Conn, DriverError> {
        let mut conn = TcpConnection::connect(endpoint.host(), endpoint.port(), endpoint.to_string())?;
        if conn.needs_login() {
            let (Some(user), Some(pass)) = (endpoint.username(), endpoint.password()) else {
                return Err(DriverError::Auth {
                    endpoint: endpoint.to_string(),
                });
            };
            conn.login(user, pass)?;
        }
        Ok(conn)
    }

    #[instrument(skip(self), fields(endpoint = %endpoint))]
    fn shutdown(&self, endpoint: &ServerEndpoint) -> Result<(), DriverError> {
        let mut conn = self.open(endpoint)?;
        conn.send_shutdown()
    }

    fn validate(&self, endpoint: &ServerEndpoint) -> bool {
        match self.open(endpoint) {
            Ok(mut conn) => {
                let ok = conn.is_connected();
                conn.close();
                ok
            }
            Err(_) => false,
        }
    }

    #[instrument(skip(self), fields(endpoint = %endpoint, command))]
    fn startup(&self, endpoint: &ServerEndpoint, command: &str) -> Result<StartupHandle, DriverError> {
        let local = Self::is_local(endpoint.host());

        let mut cmd = if local {
            Command::new(command)
        } else {
            let mut c = Command::new("ssh");
            c.arg(endpoint.host()).arg("--").arg(command);
            c
        };

        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DriverError::Startup {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;

        // stdout and stderr each get their own forwarding thread so lines
        // from one stream aren't held up behind the other; a long-running
        // backend's stdout doesn't close until exit, so a single
        // stdout-then-stderr thread would starve stderr the whole time.
        let stdout_thread = child.stdout.take().map(|stdout| {
            let endpoint_display = endpoint.to_string();
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                    info!(target: "rstat_pool::startup", endpoint = %endpoint_display, "{line}");
                }
            })
        });
        let stderr_thread = child.stderr.take().map(|stderr| {
            let endpoint_display = endpoint.to_string();
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    warn!(target: "rstat_pool::startup", endpoint = %endpoint_display, "{line}");
                }
            })
        });

        Ok(StartupHandle {
            child: Some(child),
            log_threads: [stdout_thread, stderr_thread].into_iter().flatten().collect(),
            ssh: !local,
        })
    }
}

/// Reachable purely for diagnostics (e.g. CLI output); not part of the
/// public `Driver` contract.
impl StartupHandle {
    /// Whether the process was launched over a remote shell transport.
    pub fn is_remote(&self) -> bool {
        self.ssh
    }
}
