// src/runtime/connection.rs
//! Worker endpoints and connections
//!
//! The wire protocol spoken with a worker is not this crate's business: a
//! [`Connection`] only has to tell whether the worker listens yet, whether
//! the link is alive, and how to ask the worker to shut down. Tasks get the
//! connection and may downcast it to the concrete type they know.

use crate::utils::errors::Result;
use nix::errno::Errno;
use nix::sys::socket::{recv, MsgFlags};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Bound of a single connection attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Fixed local endpoint a worker listens on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerEndpoint {
    pub host: String,
    pub port: u16,
}

impl WorkerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Connection part, e.g. `socket,host=127.0.0.1,port=2002,tcpNoDelay=1`
    pub fn connect_string(&self) -> String {
        format!("socket,host={},port={},tcpNoDelay=1", self.host, self.port)
    }

    /// Full `--accept` argument given to the worker
    pub fn accept_string(&self) -> String {
        format!("{};urp;StarOffice.ServiceManager", self.connect_string())
    }

    /// Name of the profile directory dedicated to this endpoint
    pub fn profile_dir_name(&self) -> String {
        format!(
            ".docpool_{}",
            self.connect_string().replace(',', "_").replace('=', "-")
        )
    }

    fn socket_addr(&self) -> std::io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotFound, "no address for host"))
    }
}

impl fmt::Display for WorkerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Connection attempt failure
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The worker does not accept connections yet
    #[error("worker at {0} is not listening yet")]
    NotListening(String),

    #[error("cannot connect to worker: {0}")]
    Failed(#[source] std::io::Error),
}

/// Live channel to a worker
pub trait Connection: Send + Sync {
    fn endpoint(&self) -> &WorkerEndpoint;

    /// Try once to connect
    fn connect(&self) -> std::result::Result<(), ConnectError>;

    fn is_connected(&self) -> bool;

    /// Ask the worker to shut itself down. Returns `false` when the
    /// connection cannot carry such a request.
    fn terminate(&self) -> Result<bool> {
        Ok(false)
    }

    fn disconnect(&self);

    fn as_any(&self) -> &dyn Any;
}

/// Connection over a plain TCP socket
pub struct SocketConnection {
    endpoint: WorkerEndpoint,
    stream: Mutex<Option<TcpStream>>,
}

impl SocketConnection {
    pub fn new(endpoint: WorkerEndpoint) -> Self {
        Self {
            endpoint,
            stream: Mutex::new(None),
        }
    }

    /// Independent handle on the underlying socket, for tasks
    pub fn stream(&self) -> Option<TcpStream> {
        self.stream
            .lock()
            .as_ref()
            .and_then(|stream| stream.try_clone().ok())
    }
}

impl Connection for SocketConnection {
    fn endpoint(&self) -> &WorkerEndpoint {
        &self.endpoint
    }

    fn connect(&self) -> std::result::Result<(), ConnectError> {
        let addr = self.endpoint.socket_addr().map_err(ConnectError::Failed)?;

        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                debug!("Connected to worker at {}", self.endpoint);
                *self.stream.lock() = Some(stream);
                Ok(())
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionRefused | ErrorKind::TimedOut | ErrorKind::WouldBlock
                ) =>
            {
                trace!("Worker at {} not listening: {}", self.endpoint, e);
                Err(ConnectError::NotListening(self.endpoint.to_string()))
            }
            Err(e) => Err(ConnectError::Failed(e)),
        }
    }

    fn is_connected(&self) -> bool {
        let guard = self.stream.lock();
        let Some(stream) = guard.as_ref() else {
            return false;
        };

        // A closed peer reads as EOF; a live idle peer would block. The
        // socket is shared with task streams, so its flags stay untouched.
        let mut buf = [0u8; 1];
        match recv(
            stream.as_raw_fd(),
            &mut buf,
            MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT,
        ) {
            Ok(0) => false,
            Ok(_) => true,
            Err(errno) => matches!(errno, Errno::EAGAIN | Errno::EINTR),
        }
    }

    fn disconnect(&self) {
        if let Some(stream) = self.stream.lock().take() {
            debug!("Disconnecting from worker at {}", self.endpoint);
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
