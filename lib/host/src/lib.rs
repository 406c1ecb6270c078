//! Client library for the CPC daemon. Applications connect to the daemon's
//! control socket, open endpoints, and exchange discrete messages with the
//! secondary. The daemon raises SIGUSR1 on a link reset; subscribe with
//! [`on_reset`] and re-initialize from the callback.

use ingot::wire::{self, CtrlKind, CtrlMessage, EndpointStatus, WireError};
use socket2::{Domain, SockAddr, Socket, Type};
use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::Duration;

#[derive(Debug)]
pub enum HostError {
    Io(io::Error),
    /// The daemon speaks a different control protocol version.
    VersionMismatch { daemon: u8 },
    /// The daemon refused to open the endpoint; retriable once the secondary
    /// side (or the security session) comes up.
    Refused { endpoint: u8 },
    /// The payload exceeds the daemon's advertised write bound.
    TooLarge { size: usize, bound: usize },
    Protocol(WireError),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HostError::Io(err) => write!(f, "daemon i/o error: {}", err),
            HostError::VersionMismatch { daemon } => {
                write!(f, "daemon speaks protocol version {}", daemon)
            }
            HostError::Refused { endpoint } => {
                write!(f, "daemon refused to open endpoint {}", endpoint)
            }
            HostError::TooLarge { size, bound } => {
                write!(f, "payload of {} bytes exceeds bound {}", size, bound)
            }
            HostError::Protocol(err) => write!(f, "control protocol error: {}", err),
        }
    }
}

impl std::error::Error for HostError {}

impl From<io::Error> for HostError {
    fn from(err: io::Error) -> HostError {
        HostError::Io(err)
    }
}

impl From<WireError> for HostError {
    fn from(err: WireError) -> HostError {
        HostError::Protocol(err)
    }
}

fn connect_seqpacket(path: &Path) -> io::Result<Socket> {
    let socket = Socket::new(Domain::UNIX, Type::SEQPACKET, None)?;
    socket.connect(&SockAddr::unix(path)?)?;
    Ok(socket)
}

fn read_message(socket: &Socket) -> Result<CtrlMessage, HostError> {
    let mut buf = [0u8; ingot::MAX_PAYLOAD + 64];
    let count = (&mut (&*socket)).read(&mut buf)?;
    if count == 0 {
        return Err(HostError::Io(io::ErrorKind::ConnectionAborted.into()));
    }
    Ok(CtrlMessage::decode(&buf[..count])?)
}

/// A connection to one daemon instance.
pub struct Host {
    /// Serializes request/response pairs on the control socket.
    ctrl: Mutex<Socket>,
    run_dir: PathBuf,
    instance: String,
    max_write: usize,
}

impl Host {
    /// Connects to the daemon, verifies protocol compatibility, fetches the
    /// write bound and registers this process for reset notification.
    pub fn connect(run_dir: &Path, instance: &str) -> Result<Host, HostError> {
        let ctrl = connect_seqpacket(&wire::ctrl_socket_path(run_dir, instance))?;

        // Version check first; on mismatch nothing else is valid.
        (&ctrl).write_all(&CtrlMessage::version(ingot::PROTOCOL_VERSION).encode())?;
        let reply = read_message(&ctrl)?;
        let daemon_version = reply.payload_version()?;
        if daemon_version != ingot::PROTOCOL_VERSION {
            return Err(HostError::VersionMismatch {
                daemon: daemon_version,
            });
        }

        (&ctrl).write_all(&CtrlMessage::new(CtrlKind::MaxWriteSize, 0, Vec::new()).encode())?;
        let reply = read_message(&ctrl)?;
        let max_write = reply.payload_u32()? as usize;

        (&ctrl).write_all(&CtrlMessage::set_pid(std::process::id()).encode())?;

        Ok(Host {
            ctrl: Mutex::new(ctrl),
            run_dir: run_dir.to_path_buf(),
            instance: instance.to_string(),
            max_write,
        })
    }

    /// Largest payload accepted by a single write.
    #[inline]
    pub fn max_write_size(&self) -> usize {
        self.max_write
    }

    fn request(&self, message: &CtrlMessage) -> Result<CtrlMessage, HostError> {
        let ctrl = self.ctrl.lock().expect("control socket poisoned");
        (&*ctrl).write_all(&message.encode())?;
        read_message(&ctrl)
    }

    /// Opens an endpoint: asks the daemon (which confirms with the
    /// secondary), then attaches to the endpoint's data socket.
    pub fn open_endpoint(&self, endpoint: u8) -> Result<Endpoint, HostError> {
        let reply = self.request(&CtrlMessage::new(CtrlKind::OpenEndpoint, endpoint, Vec::new()))?;

        if !reply.payload_bool()? {
            return Err(HostError::Refused { endpoint });
        }

        let socket = connect_seqpacket(&wire::endpoint_socket_path(
            &self.run_dir,
            &self.instance,
            endpoint,
        ))?;

        // The daemon confirms the attach with an OpenEndpoint ack.
        let ack = read_message(&socket)?;
        if ack.kind != CtrlKind::OpenEndpoint {
            return Err(HostError::Protocol(WireError::UnknownKind(ack.kind as u8)));
        }

        Ok(Endpoint {
            id: endpoint,
            socket,
            max_write: self.max_write,
            options: Mutex::new(()),
        })
    }

    /// Asks the daemon to close an endpoint. Closing an endpoint that is
    /// already closed succeeds.
    pub fn close_endpoint(&self, endpoint: u8) -> Result<(), HostError> {
        self.request(&CtrlMessage::new(CtrlKind::CloseEndpoint, endpoint, Vec::new()))?;
        Ok(())
    }

    /// Queries the daemon-side state of an endpoint.
    pub fn endpoint_status(&self, endpoint: u8) -> Result<EndpointStatus, HostError> {
        let reply =
            self.request(&CtrlMessage::new(CtrlKind::EndpointStatus, endpoint, Vec::new()))?;
        Ok(reply.payload_status()?)
    }
}

/// An open endpoint. Reads and writes are discrete messages and may be used
/// concurrently; option changes are serialized against each other.
pub struct Endpoint {
    id: u8,
    socket: Socket,
    max_write: usize,
    options: Mutex<()>,
}

impl Endpoint {
    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Sends one message to the secondary.
    pub fn write(&self, payload: &[u8]) -> Result<(), HostError> {
        if payload.len() > self.max_write {
            return Err(HostError::TooLarge {
                size: payload.len(),
                bound: self.max_write,
            });
        }

        (&self.socket).write_all(payload)?;
        Ok(())
    }

    /// Receives one message. Returns `Ok(0)` once the daemon closed the
    /// endpoint (remote close, reset, or fault).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, HostError> {
        Ok((&mut (&self.socket)).read(buf)?)
    }

    /// Bounds how long a read blocks; `None` blocks forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), HostError> {
        let _guard = self.options.lock().expect("option lock poisoned");
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }
}

type ResetCallback = Box<dyn FnMut() + Send>;

static RESET_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

fn reset_callbacks() -> &'static Mutex<Vec<ResetCallback>> {
    static CALLBACKS: OnceLock<Mutex<Vec<ResetCallback>>> = OnceLock::new();
    CALLBACKS.get_or_init(|| Mutex::new(Vec::new()))
}

extern "C" fn on_sigusr1(_signo: libc::c_int) {
    let fd = RESET_PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [0u8; 1];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// Subscribes to link-reset notifications. The daemon signals SIGUSR1 when
/// the link to the secondary resets; callbacks run on a library-owned
/// background thread, never in signal context.
pub fn on_reset<F: FnMut() + Send + 'static>(callback: F) -> io::Result<()> {
    reset_callbacks()
        .lock()
        .expect("callback lock poisoned")
        .push(Box::new(callback));

    static INSTALL: OnceLock<io::Result<()>> = OnceLock::new();
    let installed = INSTALL.get_or_init(|| {
        let mut fds = [0 as libc::c_int; 2];
        let result = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }

        RESET_PIPE_WR.store(fds[1], Ordering::Relaxed);

        unsafe {
            libc::signal(libc::SIGUSR1, on_sigusr1 as usize);
        }

        let read_fd = fds[0];
        thread::Builder::new()
            .name("cpc-reset".into())
            .spawn(move || {
                let mut byte = [0u8; 1];
                loop {
                    let count = unsafe {
                        libc::read(read_fd, byte.as_mut_ptr() as *mut libc::c_void, 1)
                    };
                    if count <= 0 {
                        break;
                    }
                    for callback in reset_callbacks()
                        .lock()
                        .expect("callback lock poisoned")
                        .iter_mut()
                    {
                        callback();
                    }
                }
            })?;

        Ok(())
    });

    match installed {
        Ok(()) => Ok(()),
        Err(err) => Err(io::Error::new(err.kind(), err.to_string())),
    }
}
