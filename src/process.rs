//! Backend process launcher
//!
//! Each backend is the interpreter's built-in web server bound to a loopback
//! port. Ports are scanned upward from the configured base; a candidate is
//! accepted once the process has survived the startup grace period.

use crate::config::InterpreterConfig;
use crate::diagnostics::{self, Classifier, Diagnostics};
use crate::error::LaunchError;
use dashmap::DashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Loopback address every backend binds to.
///
/// 127.0.0.1 rather than localhost, otherwise the server may only listen on ::1.
pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Fixed runtime options: no ambient ini file, errors to the log stream only,
/// and no size or time limits that would cut off long uploads.
const SERVER_OPTIONS: &[&str] = &[
    "display_errors=Off",
    "log_errors=On",
    "error_reporting=E_ALL",
    "upload_max_filesize=1024G",
    "post_max_size=1024G",
    "max_execution_time=0",
];

/// Check if a loopback port is free by binding and immediately releasing it
pub fn is_port_available(port: u16) -> bool {
    match TcpListener::bind((LOOPBACK, port)) {
        Ok(listener) => listener.local_addr().is_ok(),
        Err(_) => false,
    }
}

/// Ports currently held by backends started from this process
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    reserved: Arc<DashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_reserve(&self, port: u16) -> Option<PortReservation> {
        if self.reserved.insert(port) {
            Some(PortReservation {
                port,
                reserved: Arc::clone(&self.reserved),
            })
        } else {
            None
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.contains(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }
}

/// Releases its port when dropped
#[derive(Debug)]
struct PortReservation {
    port: u16,
    reserved: Arc<DashSet<u16>>,
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.reserved.remove(&self.port);
    }
}

/// The backend exited before it was killed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarlyExit {
    status: Option<ExitStatus>,
}

impl EarlyExit {
    fn from_wait(result: std::io::Result<ExitStatus>) -> Self {
        Self {
            status: result.ok(),
        }
    }

    /// Exit status, if the process could be reaped
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }
}

impl fmt::Display for EarlyExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "process exited early ({})", status),
            None => write!(f, "process exited early"),
        }
    }
}

/// Starts interpreter processes on free loopback ports.
///
/// Clones share the same [`PortAllocator`], so backends started through any
/// clone never share a port while alive.
#[derive(Debug, Clone)]
pub struct Launcher {
    config: Arc<InterpreterConfig>,
    ports: PortAllocator,
}

enum Attempt {
    /// Try the next port
    Retry(String),
    /// Give up
    Fatal(LaunchError),
}

impl Launcher {
    pub fn new(config: InterpreterConfig) -> Self {
        Self {
            config: Arc::new(config),
            ports: PortAllocator::new(),
        }
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Full argument list passed after the program name
    pub fn command_args(&self, addr: SocketAddr) -> Vec<String> {
        let mut args = self.config.wrapper_args.clone();
        args.push("-n".to_string());
        args.push("-S".to_string());
        args.push(addr.to_string());
        args.push("-t".to_string());
        args.push(self.config.document_root.to_string_lossy().into_owned());
        for option in SERVER_OPTIONS {
            args.push("-d".to_string());
            args.push((*option).to_string());
        }
        args.extend(self.config.args.iter().cloned());
        if let Some(ref router) = self.config.router {
            args.push(router.to_string_lossy().into_owned());
        }
        args
    }

    /// Start a backend on the first usable port in the configured range
    pub async fn launch(&self) -> Result<BackendProcess, LaunchError> {
        let (from, to) = (self.config.base_port, self.config.max_port);

        for port in from..=to {
            let Some(reservation) = self.ports.try_reserve(port) else {
                continue;
            };
            if !is_port_available(port) {
                debug!(port, "Port unavailable on system, skipping");
                continue;
            }

            match self.launch_on(reservation).await {
                Ok(process) => return Ok(process),
                Err(Attempt::Retry(reason)) => {
                    debug!(port, reason = %reason, "Backend did not start, trying next port");
                }
                Err(Attempt::Fatal(e)) => return Err(e),
            }
        }

        Err(LaunchError::NoFreePorts { from, to })
    }

    async fn launch_on(&self, reservation: PortReservation) -> Result<BackendProcess, Attempt> {
        let port = reservation.port;
        let addr = SocketAddr::new(LOOPBACK, port);

        let mut cmd = Command::new(&self.config.program);
        cmd.args(self.command_args(addr));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| {
            Attempt::Fatal(LaunchError::Spawn {
                program: self.config.program.clone(),
                source,
            })
        })?;
        let pid = child.id();

        let stderr = child
            .stderr
            .take()
            .ok_or(Attempt::Fatal(LaunchError::MissingPipe("stderr")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(Attempt::Fatal(LaunchError::MissingPipe("stdout")))?;

        let (senders, mut diagnostics) = diagnostics::channels();
        diagnostics::spawn_diagnostic_reader(stderr, port, Classifier::new(LOOPBACK), senders);
        diagnostics::spawn_output_logger(stdout, port);

        let (exit_tx, mut exited) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(child, port, kill_rx, exit_tx));

        // Exiting inside the grace window is a failed start whatever the status
        match tokio::time::timeout(self.config.startup_grace(), &mut exited).await {
            Ok(Ok(exit)) => Err(Attempt::Retry(exit.to_string())),
            Ok(Err(_)) => Err(Attempt::Retry("supervisor stopped".to_string())),
            Err(_) => {
                let discarded = diagnostics.discard_pending(port);
                info!(port, pid, discarded, "Backend process started");
                Ok(BackendProcess {
                    addr,
                    pid,
                    diagnostics,
                    exited,
                    exit: None,
                    kill: Some(kill_tx),
                    supervisor: Some(supervisor),
                    _reservation: Some(reservation),
                })
            }
        }
    }
}

/// Owns the child: reports an unrequested exit, or kills it on request.
/// Dropping the kill sender counts as a request.
async fn supervise(
    mut child: Child,
    port: u16,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<EarlyExit>,
) {
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx => None,
    };

    match waited {
        Some(status) => {
            let exit = EarlyExit::from_wait(status);
            debug!(port, %exit, "Backend process exited");
            let _ = exit_tx.send(exit);
        }
        None => match child.kill().await {
            Ok(()) => debug!(port, "Backend process killed"),
            Err(e) => warn!(port, error = %e, "Failed to kill backend process"),
        },
    }
}

/// A live interpreter process bound to a loopback port.
///
/// Dropping it kills the process; [`BackendProcess::close`] does the same and
/// waits for the process to be reaped.
#[derive(Debug)]
pub struct BackendProcess {
    addr: SocketAddr,
    pid: Option<u32>,
    diagnostics: Diagnostics,
    exited: oneshot::Receiver<EarlyExit>,
    exit: Option<EarlyExit>,
    kill: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
    _reservation: Option<PortReservation>,
}

impl BackendProcess {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Check without waiting whether the process has already exited.
    ///
    /// Once an exit has been seen it is kept here and the signal is never
    /// polled again.
    pub fn try_exit(&mut self) -> Option<&EarlyExit> {
        if self.exit.is_none() {
            self.exit = match self.exited.try_recv() {
                Ok(exit) => Some(exit),
                Err(TryRecvError::Empty) => None,
                // Supervisor gone without reporting
                Err(TryRecvError::Closed) => Some(EarlyExit { status: None }),
            };
        }
        self.exit.as_ref()
    }

    /// Diagnostic channels and the early-exit signal, borrowed together.
    ///
    /// The signal may only be awaited while the flag is true.
    pub(crate) fn signals(
        &mut self,
    ) -> (&mut Diagnostics, &mut oneshot::Receiver<EarlyExit>, bool) {
        let pending = self.exit.is_none();
        (&mut self.diagnostics, &mut self.exited, pending)
    }

    /// Kill the process and wait until it has been reaped
    pub async fn close(mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                warn!(port = self.port(), error = %e, "Backend supervisor task failed");
            }
        }
    }
}

/// Hand-driven backend for tests: returns the producer sides of its signals
#[cfg(test)]
pub(crate) fn detached_backend(
    addr: SocketAddr,
) -> (
    BackendProcess,
    diagnostics::DiagnosticSenders,
    oneshot::Sender<EarlyExit>,
) {
    let (senders, diagnostics) = diagnostics::channels();
    let (exit_tx, exited) = oneshot::channel();
    let process = BackendProcess {
        addr,
        pid: None,
        diagnostics,
        exited,
        exit: None,
        kill: None,
        supervisor: None,
        _reservation: None,
    };
    (process, senders, exit_tx)
}

#[cfg(test)]
pub(crate) fn early_exit_for_tests() -> EarlyExit {
    EarlyExit { status: None }
}
