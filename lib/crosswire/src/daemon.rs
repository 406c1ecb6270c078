//! The daemon reactor: wires driver, framer, link core, security, system
//! endpoint and server core onto one event loop and routes everything
//! between them. All protocol state lives in the components; this module
//! only moves data and dispatches readiness.

use crate::driver::{Driver, SpiDriver, UartDriver};
use crate::endpoint::{
    ErrorReason, State, RESERVED_ENDPOINT, SECURITY_ENDPOINT, SYSTEM_ENDPOINT,
};
use crate::event_loop::{EventLoop, TimerId};
use crate::framer::{self, Decoder};
use crate::link::{
    CloseReason, EndpointTimer, LinkConfig, LinkCore, LinkEvent, WriteError,
};
use crate::security::{Handshake, HandshakeProgress, PlainLink, SessionCipher, SessionClient};
use crate::server::{ServerCore, ServerEvent};
use crate::system::{QueryContext, RemoteEndpointState, SystemEndpoint, SystemEvent, property};
use ingot::config::{Config, Transport};
use ingot::keys::BindingKey;
use ingot::logging::{self, Logger};
use ingot::wire::{self, EndpointStatus};
use mio::unix::SourceFd;
use mio::{Interest, Token};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

const DRIVER_TOKEN: Token = Token(0);
const DRIVER_IRQ_TOKEN: Token = Token(1);
const SECURITY_TOKEN: Token = Token(2);
const SIGNAL_TOKEN: Token = Token(3);

const READ_CHUNK: usize = 4096;

/// How long shutdown waits for the secondary to acknowledge the U-Resets.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
enum TimerKey {
    Endpoint { id: u8, timer: EndpointTimer },
}

static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(_signo: libc::c_int) {
    let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [0u8; 1];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// Installs SIGINT/SIGTERM handlers that write into a self-pipe; returns the
/// readable end for the event loop.
pub fn install_signal_handlers() -> io::Result<RawFd> {
    let mut fds = [0 as libc::c_int; 2];
    let result = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }

    SIGNAL_WRITE_FD.store(fds[1], Ordering::Relaxed);

    unsafe {
        libc::signal(libc::SIGINT, forward_signal as usize);
        libc::signal(libc::SIGTERM, forward_signal as usize);
    }

    Ok(fds[0])
}

pub struct Daemon {
    cfg: Config,
    event_loop: EventLoop<TimerKey>,
    driver: Box<dyn Driver>,
    decoder: Decoder,
    link: LinkCore,
    system: SystemEndpoint,
    handshake: Option<Handshake>,
    server: ServerCore,
    /// Encoded frames the driver could not take yet; the head may be
    /// partially written.
    tx_queue: VecDeque<Vec<u8>>,
    tx_offset: usize,
    timer_ids: HashMap<(u8, EndpointTimer), TimerId>,
    /// Open requests waiting for the secondary's endpoint-state reply.
    pending_opens: Vec<(u8, usize)>,
    /// Writes refused while the security session was not up.
    parked: HashMap<u8, VecDeque<Vec<u8>>>,
    signal_fd: Option<RawFd>,
    shutting_down: bool,
    log: Logger,
}

impl Daemon {
    /// Opens the configured transport and assembles the daemon.
    pub fn new(cfg: Config, signal_fd: Option<RawFd>, log: Logger) -> io::Result<Daemon> {
        let driver: Box<dyn Driver> = match &cfg.transport {
            Transport::Uart {
                device,
                baud,
                hardware_flow_control,
            } => Box::new(UartDriver::open(device, *baud, *hardware_flow_control)?),
            Transport::Spi { device, irq_gpio } => Box::new(SpiDriver::open(device, irq_gpio)?),
        };

        Self::with_driver(cfg, driver, signal_fd, log)
    }

    /// Assembles the daemon around an already-open driver.
    pub fn with_driver(
        cfg: Config,
        driver: Box<dyn Driver>,
        signal_fd: Option<RawFd>,
        log: Logger,
    ) -> io::Result<Daemon> {
        let mut event_loop = EventLoop::new()?;

        let session: Box<dyn SessionCipher> = if cfg.security.enabled {
            let path = cfg.security.binding_key_file.as_ref().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "security enabled but no binding key file configured",
                )
            })?;
            let binding = BindingKey::load(path)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
            Box::new(SessionClient::spawn(binding, log.clone())?)
        } else {
            Box::new(PlainLink)
        };

        let link_cfg = LinkConfig::from_settings(&cfg.link, cfg.security.enabled);
        let decoder = Decoder::new(link_cfg.frame_mtu());
        let handshake = if cfg.security.enabled {
            Some(Handshake::new(&log))
        } else {
            None
        };

        let link = LinkCore::new(link_cfg, session, &log);
        let system = SystemEndpoint::new(&log);

        event_loop.register(
            &mut SourceFd(&driver.raw_fd()),
            DRIVER_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        if let Some(irq) = driver.irq_fd() {
            event_loop.register(&mut SourceFd(&irq), DRIVER_IRQ_TOKEN, Interest::READABLE)?;
        }

        if let Some(fd) = link.session_notify_fd() {
            event_loop.register(&mut SourceFd(&fd), SECURITY_TOKEN, Interest::READABLE)?;
        }

        if let Some(fd) = signal_fd {
            event_loop.register(&mut SourceFd(&fd), SIGNAL_TOKEN, Interest::READABLE)?;
        }

        let server = ServerCore::new(
            &cfg.run_dir,
            &cfg.instance,
            link.config().mtu,
            event_loop.registry(),
            &log,
        )?;

        Ok(Daemon {
            cfg,
            event_loop,
            driver,
            decoder,
            link,
            system,
            handshake,
            server,
            tx_queue: VecDeque::new(),
            tx_offset: 0,
            timer_ids: HashMap::new(),
            pending_opens: Vec::new(),
            parked: HashMap::new(),
            signal_fd,
            shutting_down: false,
            log: log.new(logging::o!("unit" => "daemon")),
        })
    }

    /// Runs until a shutdown signal arrives, then drains and releases.
    pub fn run(&mut self) -> io::Result<()> {
        logging::info!(self.log, "daemon running"; "instance" => self.cfg.instance.clone());

        let now = Instant::now();
        self.link.start(now);
        self.pump(now);

        while !self.shutting_down {
            self.turn()?;
        }

        self.drain_shutdown()
    }

    /// One poll-dispatch cycle: sweep ready descriptors, then expired timers,
    /// then pump the components.
    fn turn(&mut self) -> io::Result<()> {
        let ready = self.event_loop.poll_io(Instant::now())?;
        let now = Instant::now();

        for readiness in ready {
            match readiness.token {
                DRIVER_TOKEN => {
                    if readiness.readable {
                        self.on_driver_readable(now);
                    }
                    if readiness.writable {
                        self.flush_driver();
                    }
                }
                DRIVER_IRQ_TOKEN => {
                    // The secondary asserted its IRQ line: clock data out.
                    self.on_driver_readable(now);
                }
                SECURITY_TOKEN => self.link.session().drain_notifications(),
                SIGNAL_TOKEN => {
                    self.drain_signal_pipe();
                    logging::info!(self.log, "shutdown signal received");
                    self.shutting_down = true;
                }
                token if ServerCore::owns_token(token) => {
                    let events = self.server.handle_token(token, self.event_loop.registry());
                    for event in events {
                        self.on_server_event(event, now);
                    }
                }
                token => {
                    logging::warn!(self.log, "readiness for unknown token"; "token" => token.0);
                }
            }
        }

        for (id, key) in self.event_loop.expired(now) {
            match key {
                TimerKey::Endpoint { id: endpoint, timer } => {
                    // A replaced timer id is stale; only the latest fires.
                    if self.timer_ids.get(&(endpoint, timer)) == Some(&id) {
                        self.timer_ids.remove(&(endpoint, timer));
                        self.link.on_timer(endpoint, timer, now);
                    }
                }
            }
        }

        self.pump(now);
        Ok(())
    }

    /// Moves data between components until everything settles.
    fn pump(&mut self, now: Instant) {
        loop {
            let mut progressed = false;

            while let Some(event) = self.link.poll_event() {
                progressed = true;
                self.on_link_event(event, now);
            }

            while let Some(frame) = self.link.poll_transmit() {
                progressed = true;
                match framer::encode(&frame, self.link.config().frame_mtu()) {
                    Ok(bytes) => self.tx_queue.push_back(bytes),
                    Err(err) => {
                        logging::error!(self.log, "frame exceeds mtu, dropped"; "error" => %err)
                    }
                }
            }

            if self.link.session().take_rekey_due() {
                progressed = true;
                self.begin_rekey(now);
            }

            if !progressed {
                break;
            }
        }

        self.flush_driver();
        self.server.flush();
    }

    // ------------------------------------------------------------------
    // Driver I/O
    // ------------------------------------------------------------------

    fn on_driver_readable(&mut self, now: Instant) {
        let mut buf = [0u8; READ_CHUNK];

        loop {
            match self.driver.recv(&mut buf) {
                Ok(0) => {
                    logging::error!(self.log, "transport closed by peer");
                    self.shutting_down = true;
                    return;
                }
                Ok(count) => {
                    self.decoder.push(&buf[..count]);
                    while let Some(event) = self.decoder.next_event() {
                        self.link.on_decode_event(event, now);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::error!(self.log, "transport read failed"; "error" => %err);
                    self.shutting_down = true;
                    return;
                }
            }
        }
    }

    fn flush_driver(&mut self) {
        while let Some(front) = self.tx_queue.front() {
            match self.driver.send(&front[self.tx_offset..]) {
                Ok(count) => {
                    self.tx_offset += count;
                    if self.tx_offset >= front.len() {
                        self.tx_queue.pop_front();
                        self.tx_offset = 0;
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::error!(self.log, "transport write failed"; "error" => %err);
                    self.shutting_down = true;
                    return;
                }
            }
        }
    }

    fn drain_signal_pipe(&mut self) {
        if let Some(fd) = self.signal_fd {
            let mut sink = [0u8; 16];
            loop {
                let count =
                    unsafe { libc::read(fd, sink.as_mut_ptr() as *mut libc::c_void, sink.len()) };
                if count <= 0 {
                    break;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Link events
    // ------------------------------------------------------------------

    fn on_link_event(&mut self, event: LinkEvent, now: Instant) {
        match event {
            LinkEvent::SetTimer {
                endpoint,
                timer,
                delay,
            } => {
                if let Some(old) = self.timer_ids.remove(&(endpoint, timer)) {
                    self.event_loop.cancel_timer(old);
                }
                let id = self.event_loop.arm_timer(
                    TimerKey::Endpoint {
                        id: endpoint,
                        timer,
                    },
                    delay,
                    now,
                );
                self.timer_ids.insert((endpoint, timer), id);
            }
            LinkEvent::ClearTimer { endpoint, timer } => {
                if let Some(id) = self.timer_ids.remove(&(endpoint, timer)) {
                    self.event_loop.cancel_timer(id);
                }
            }
            LinkEvent::Opened(endpoint) => self.on_endpoint_opened(endpoint, now),
            LinkEvent::Closed { endpoint, reason } => self.on_endpoint_closed(endpoint, reason),
            LinkEvent::PeerReset(endpoint) => {
                // In-flight traffic is gone; the attached client must re-init.
                self.server
                    .drop_endpoint_client(endpoint, self.event_loop.registry());
                self.signal_clients();
            }
            LinkEvent::Delivered(endpoint) => self.drain_endpoint_rx(endpoint, now),
            LinkEvent::Writable(endpoint) => self.flush_parked(endpoint, now),
            LinkEvent::SecurityIncident(endpoint) => {
                logging::error!(self.log, "security incident, forcing re-handshake";
                                "endpoint" => endpoint);
                self.link.session().reset();
                if self.handshake.is_some() {
                    self.start_handshake(now);
                }
            }
            LinkEvent::LinkDown => self.on_link_down(now),
        }
    }

    fn on_endpoint_opened(&mut self, endpoint: u8, now: Instant) {
        match endpoint {
            SYSTEM_ENDPOINT => {
                // Control plane is up: announce ourselves and discover the
                // secondary.
                let announce = self.system.announce_reset();
                self.link.write_unnumbered(announce);

                for prop in &[
                    property::PROTOCOL_VERSION,
                    property::CAPABILITIES,
                    property::RX_CAPABILITY,
                    property::LAST_RESET_CAUSE,
                ] {
                    let query = self.system.query_property(*prop);
                    let _ = self.link.write(SYSTEM_ENDPOINT, query, now);
                }
            }
            SECURITY_ENDPOINT => self.start_handshake(now),
            endpoint => {
                // A user endpoint finished opening: answer the waiting
                // clients.
                let waiting: Vec<usize> = self
                    .pending_opens
                    .iter()
                    .filter(|(ep, _)| *ep == endpoint)
                    .map(|(_, conn)| *conn)
                    .collect();
                self.pending_opens.retain(|(ep, _)| *ep != endpoint);

                for conn in waiting {
                    self.server
                        .open_reply(conn, endpoint, true, self.event_loop.registry());
                }
            }
        }
    }

    fn on_endpoint_closed(&mut self, endpoint: u8, reason: CloseReason) {
        logging::info!(self.log, "endpoint closed"; "endpoint" => endpoint,
                       "reason" => format!("{:?}", reason));

        self.parked.remove(&endpoint);
        self.server
            .drop_endpoint_client(endpoint, self.event_loop.registry());

        // Anyone still waiting to open this endpoint is out of luck.
        let waiting: Vec<usize> = self
            .pending_opens
            .iter()
            .filter(|(ep, _)| *ep == endpoint)
            .map(|(_, conn)| *conn)
            .collect();
        self.pending_opens.retain(|(ep, _)| *ep != endpoint);
        for conn in waiting {
            self.server
                .open_reply(conn, endpoint, false, self.event_loop.registry());
        }
    }

    fn on_link_down(&mut self, now: Instant) {
        logging::warn!(self.log, "link went down");

        self.signal_clients();
        self.system.clear();
        self.parked.clear();
        self.pending_opens.clear();

        for (_, id) in self.timer_ids.drain() {
            self.event_loop.cancel_timer(id);
        }

        self.link.session().reset();

        if !self.shutting_down {
            // Re-run discovery from scratch.
            self.link.start(now);
        }
    }

    fn drain_endpoint_rx(&mut self, endpoint: u8, now: Instant) {
        match endpoint {
            SYSTEM_ENDPOINT => {
                while let Some(payload) = self.link.read(SYSTEM_ENDPOINT) {
                    if let Some(event) = self.system.on_payload(&payload) {
                        self.on_system_event(event, now);
                    }
                }
            }
            SECURITY_ENDPOINT => {
                while let Some(payload) = self.link.read(SECURITY_ENDPOINT) {
                    self.on_handshake_payload(&payload, now);
                }
            }
            endpoint => {
                while let Some(payload) = self.link.read(endpoint) {
                    self.server
                        .deliver(endpoint, payload, self.event_loop.registry());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Security handshake
    // ------------------------------------------------------------------

    fn start_handshake(&mut self, now: Instant) {
        let first = match self.handshake.as_mut() {
            Some(handshake) => handshake.start(),
            None => return,
        };

        if let Err(err) = self.link.write(SECURITY_ENDPOINT, first, now) {
            logging::error!(self.log, "cannot start key exchange"; "error" => format!("{:?}", err));
        }
    }

    fn begin_rekey(&mut self, now: Instant) {
        let message = {
            let handshake = match self.handshake.as_mut() {
                Some(handshake) => handshake,
                None => return,
            };
            logging::info!(self.log, "nonce space low, rekeying");
            handshake.start_rekey(self.link.session())
        };

        if let Err(err) = self.link.write(SECURITY_ENDPOINT, message, now) {
            logging::error!(self.log, "cannot start rekey"; "error" => format!("{:?}", err));
        }
    }

    fn on_handshake_payload(&mut self, payload: &[u8], now: Instant) {
        let progress = {
            let handshake = match self.handshake.as_mut() {
                Some(handshake) => handshake,
                None => return,
            };
            handshake.on_message(payload, self.link.session())
        };

        match progress {
            Ok(HandshakeProgress::Send(message)) => {
                if let Err(err) = self.link.write(SECURITY_ENDPOINT, message, now) {
                    logging::error!(self.log, "key exchange write failed";
                                    "error" => format!("{:?}", err));
                }
            }
            Ok(HandshakeProgress::Established { session_id }) => {
                logging::info!(self.log, "security session up";
                               "session_id" => format!("{:016x}", session_id));
                self.write_state_file(session_id);

                // Writes that arrived before the session was up can go now.
                let endpoints: Vec<u8> = self.parked.keys().copied().collect();
                for endpoint in endpoints {
                    self.flush_parked(endpoint, now);
                }
            }
            Err(err) => {
                logging::error!(self.log, "key exchange failed"; "error" => %err);
            }
        }
    }

    /// Diagnostics only: remembers the last session id across restarts.
    fn write_state_file(&self, session_id: u64) {
        let path = wire::instance_dir(&self.cfg.run_dir, &self.cfg.instance).join("state");
        let content = format!(
            "session_id = \"{:016x}\"\nestablished_at = {}\n",
            session_id,
            ingot::time::timestamp_secs()
        );
        if let Err(err) = fs::write(&path, content) {
            logging::debug!(self.log, "state file write failed"; "error" => %err);
        }
    }

    // ------------------------------------------------------------------
    // System endpoint events
    // ------------------------------------------------------------------

    fn on_system_event(&mut self, event: SystemEvent, now: Instant) {
        match event {
            SystemEvent::EndpointState {
                endpoint,
                state,
                context: QueryContext::ClientOpen,
            } => {
                if state == RemoteEndpointState::Open {
                    match self.link.open(endpoint, now) {
                        Ok(()) => (), // completion resolves pending_opens
                        Err(_) => self.refuse_pending_opens(endpoint),
                    }
                } else {
                    logging::info!(self.log, "peer endpoint not open";
                                   "endpoint" => endpoint, "state" => format!("{:?}", state));
                    self.refuse_pending_opens(endpoint);
                }
            }
            SystemEvent::EndpointState {
                endpoint, state, ..
            } => {
                logging::debug!(self.log, "peer endpoint state";
                                "endpoint" => endpoint, "state" => format!("{:?}", state));
            }
            SystemEvent::ProtocolVersion(version) => {
                logging::info!(self.log, "secondary protocol version"; "version" => version);
            }
            SystemEvent::Capabilities(caps) => {
                logging::info!(self.log, "secondary capabilities"; "capabilities" => caps);
            }
            SystemEvent::RxCapability(size) => {
                logging::info!(self.log, "secondary rx capability"; "bytes" => size);
            }
            SystemEvent::LastResetCause(cause) => {
                logging::info!(self.log, "secondary last reset cause"; "cause" => cause);
            }
            SystemEvent::BootloaderInfo(info) => {
                logging::info!(self.log, "secondary bootloader info"; "bytes" => info.len());
            }
            SystemEvent::PeerEndpointOpened(endpoint) => {
                logging::debug!(self.log, "peer opened endpoint"; "endpoint" => endpoint);
            }
            SystemEvent::PeerEndpointClosed(endpoint) => {
                // Remote close: tear down our half; the client sees EOF.
                if self.link.is_operational(endpoint) {
                    self.link.close(endpoint, now);
                }
            }
            SystemEvent::PeerReset { cause } => {
                logging::warn!(self.log, "secondary reset"; "cause" => cause);
                self.link.reset_link(now);
            }
        }
    }

    fn refuse_pending_opens(&mut self, endpoint: u8) {
        let waiting: Vec<usize> = self
            .pending_opens
            .iter()
            .filter(|(ep, _)| *ep == endpoint)
            .map(|(_, conn)| *conn)
            .collect();
        self.pending_opens.retain(|(ep, _)| *ep != endpoint);

        for conn in waiting {
            self.server
                .open_reply(conn, endpoint, false, self.event_loop.registry());
        }
    }

    // ------------------------------------------------------------------
    // Server events
    // ------------------------------------------------------------------

    fn on_server_event(&mut self, event: ServerEvent, now: Instant) {
        match event {
            ServerEvent::OpenRequest { endpoint, conn } => {
                self.on_open_request(endpoint, conn, now)
            }
            ServerEvent::CloseRequest { endpoint, conn } => {
                self.link.close(endpoint, now);
                self.server.close_reply(conn, endpoint);
            }
            ServerEvent::StatusRequest { endpoint, conn } => {
                let status = map_status(self.link.state(endpoint));
                self.server.status_reply(conn, endpoint, status);
            }
            ServerEvent::Payload { endpoint, data } => self.on_client_payload(endpoint, data, now),
            ServerEvent::ClientAttached { endpoint } => {
                logging::debug!(self.log, "client attached"; "endpoint" => endpoint);
            }
            ServerEvent::ClientClosed { endpoint } => {
                self.parked.remove(&endpoint);
                self.link.close(endpoint, now);
            }
        }
    }

    fn on_open_request(&mut self, endpoint: u8, conn: usize, now: Instant) {
        // The control plane endpoints are not for clients, and an endpoint
        // locked out after a security incident stays closed.
        let refused = endpoint == SYSTEM_ENDPOINT
            || endpoint == SECURITY_ENDPOINT
            || endpoint == RESERVED_ENDPOINT
            || matches!(self.link.state(endpoint), State::Error(ErrorReason::SecurityIncident));

        if refused {
            self.server
                .open_reply(conn, endpoint, false, self.event_loop.registry());
            return;
        }

        if self.link.is_operational(endpoint) {
            self.server
                .open_reply(conn, endpoint, true, self.event_loop.registry());
            return;
        }

        if !self.link.is_operational(SYSTEM_ENDPOINT) {
            // Cannot confirm anything while the control plane is down.
            self.server
                .open_reply(conn, endpoint, false, self.event_loop.registry());
            return;
        }

        // Confirm with the secondary before accepting the client.
        self.pending_opens.push((endpoint, conn));
        let query = self.system.query_endpoint_state(endpoint, QueryContext::ClientOpen);
        if self.link.write(SYSTEM_ENDPOINT, query, now).is_err() {
            self.refuse_pending_opens(endpoint);
        }
    }

    fn on_client_payload(&mut self, endpoint: u8, data: Vec<u8>, now: Instant) {
        // Retriable refusal: hold writes that race the key exchange and
        // flush them once the session reports ready.
        let encrypted = self.cfg.security.enabled
            && endpoint != SYSTEM_ENDPOINT
            && endpoint != SECURITY_ENDPOINT;
        if encrypted && !self.link.session().ready() {
            self.parked.entry(endpoint).or_default().push_back(data);
            return;
        }

        match self.link.write(endpoint, data, now) {
            Ok(()) => (),
            Err(err) => {
                logging::warn!(self.log, "client write rejected";
                               "endpoint" => endpoint, "error" => format!("{:?}", err));
            }
        }
    }

    fn flush_parked(&mut self, endpoint: u8, now: Instant) {
        let mut queue = match self.parked.remove(&endpoint) {
            Some(queue) => queue,
            None => return,
        };

        while let Some(payload) = queue.pop_front() {
            match self.link.write(endpoint, payload.clone(), now) {
                Ok(()) => (),
                Err(WriteError::SecurityNotReady) => {
                    queue.push_front(payload);
                    self.parked.insert(endpoint, queue);
                    return;
                }
                Err(err) => {
                    logging::warn!(self.log, "parked write dropped";
                                   "endpoint" => endpoint, "error" => format!("{:?}", err));
                }
            }
        }
    }

    fn signal_clients(&self) {
        for &pid in self.server.client_pids() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGUSR1);
            }
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Sends U-Resets on every open endpoint, waits (bounded) for the acks,
    /// then releases resources in reverse registration order.
    fn drain_shutdown(&mut self) -> io::Result<()> {
        logging::info!(self.log, "shutting down");

        let now = Instant::now();
        self.link.shutdown(now);
        self.pump(now);

        let deadline = now + SHUTDOWN_DRAIN;
        while !self.link.all_closed() && Instant::now() < deadline {
            self.turn()?;
        }

        // Reverse registration order: server sockets, security pipe, signal
        // pipe, driver.
        self.server.shutdown(self.event_loop.registry());

        if let Some(fd) = self.link.session_notify_fd() {
            let _ = self.event_loop.deregister(&mut SourceFd(&fd));
        }
        if let Some(fd) = self.signal_fd {
            let _ = self.event_loop.deregister(&mut SourceFd(&fd));
        }
        if let Some(irq) = self.driver.irq_fd() {
            let _ = self.event_loop.deregister(&mut SourceFd(&irq));
        }
        let _ = self.event_loop.deregister(&mut SourceFd(&self.driver.raw_fd()));

        logging::info!(self.log, "daemon stopped");
        Ok(())
    }
}

fn map_status(state: State) -> EndpointStatus {
    match state {
        State::Closed => EndpointStatus::Closed,
        State::Open => EndpointStatus::Open,
        State::Closing => EndpointStatus::Closing,
        State::ConnectionLost => EndpointStatus::ConnectionLost,
        State::Error(_) => EndpointStatus::Error,
    }
}
