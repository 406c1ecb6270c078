//! Host-facing socket surface: one message-preserving (SOCK_SEQPACKET)
//! control socket per daemon instance plus one lazily created data socket
//! per endpoint. The server owns socket mechanics only; protocol decisions
//! (may this endpoint open? where does a payload go?) are surfaced as events
//! for the daemon to act on.

use ingot::logging::{self, Logger};
use ingot::wire::{self, CtrlKind, CtrlMessage, EndpointStatus};
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use socket2::{Domain, SockAddr, Socket, Type};
use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

pub const CTRL_LISTENER_TOKEN: Token = Token(4);
const SOCKET_TOKEN_BASE: usize = 16;
const LISTEN_BACKLOG: i32 = 8;

/// Outbound messages a slow client may have queued before it is dropped.
const OUTBOUND_LIMIT: usize = 256;

/// Requests and observations surfaced to the daemon.
#[derive(Debug, Eq, PartialEq)]
pub enum ServerEvent {
    /// A client asks to open an endpoint; answer via [`ServerCore::open_reply`].
    OpenRequest { endpoint: u8, conn: usize },
    CloseRequest { endpoint: u8, conn: usize },
    StatusRequest { endpoint: u8, conn: usize },
    /// A payload arrived on an endpoint data socket.
    Payload { endpoint: u8, data: Vec<u8> },
    /// A client connected to an endpoint data socket.
    ClientAttached { endpoint: u8 },
    /// The endpoint client went away (close or death).
    ClientClosed { endpoint: u8 },
}

#[derive(Copy, Clone)]
enum SocketKind {
    CtrlConn,
    EndpointListener(u8),
    EndpointConn(u8),
}

struct SocketEntry {
    kind: SocketKind,
    socket: Socket,
    outbound: VecDeque<Vec<u8>>,
}

pub struct ServerCore {
    dir: PathBuf,
    ctrl_listener: Socket,
    slots: Vec<Option<SocketEntry>>,
    free: Vec<usize>,
    /// Slot of the single data connection per endpoint.
    endpoint_conn: Vec<Option<usize>>,
    endpoint_listener: Vec<Option<usize>>,
    client_pids: Vec<u32>,
    max_write: usize,
    log: Logger,
}

impl ServerCore {
    /// Binds the control socket under `<run_dir>/cpcd/<instance>/` and
    /// registers it on the supplied registry.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        run_dir: &Path,
        instance: &str,
        max_write: usize,
        registry: &Registry,
        log: L,
    ) -> io::Result<ServerCore> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("unit" => "server")),
            None => logging::discard(),
        };

        let dir = wire::instance_dir(run_dir, instance);
        fs::create_dir_all(&dir)?;

        let path = wire::ctrl_socket_path(run_dir, instance);
        let ctrl_listener = Self::bind_listener(&path)?;

        registry.register(
            &mut SourceFd(&ctrl_listener.as_raw_fd()),
            CTRL_LISTENER_TOKEN,
            Interest::READABLE,
        )?;

        logging::info!(log, "control socket ready"; "path" => path.display().to_string());

        Ok(ServerCore {
            dir,
            ctrl_listener,
            slots: Vec::new(),
            free: Vec::new(),
            endpoint_conn: vec![None; 256],
            endpoint_listener: vec![None; 256],
            client_pids: Vec::new(),
            max_write,
            log,
        })
    }

    fn bind_listener(path: &Path) -> io::Result<Socket> {
        // A stale socket from a previous run would make bind fail.
        let _ = fs::remove_file(path);

        let socket = Socket::new(Domain::UNIX, Type::SEQPACKET, None)?;
        socket.bind(&SockAddr::unix(path)?)?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    #[inline]
    fn token_for(slot: usize) -> Token {
        Token(SOCKET_TOKEN_BASE + slot)
    }

    #[inline]
    fn slot_for(token: Token) -> Option<usize> {
        token.0.checked_sub(SOCKET_TOKEN_BASE)
    }

    /// True if the token belongs to this server (listener or connection).
    #[inline]
    pub fn owns_token(token: Token) -> bool {
        token == CTRL_LISTENER_TOKEN || token.0 >= SOCKET_TOKEN_BASE
    }

    #[inline]
    pub fn client_pids(&self) -> &[u32] {
        &self.client_pids
    }

    #[inline]
    pub fn has_client(&self, endpoint: u8) -> bool {
        self.endpoint_conn[endpoint as usize].is_some()
    }

    fn allocate(&mut self, entry: SocketEntry) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize, registry: &Registry) {
        if let Some(entry) = self.slots[slot].take() {
            let _ = registry.deregister(&mut SourceFd(&entry.socket.as_raw_fd()));

            match entry.kind {
                SocketKind::EndpointConn(endpoint) => {
                    self.endpoint_conn[endpoint as usize] = None;
                }
                SocketKind::EndpointListener(endpoint) => {
                    self.endpoint_listener[endpoint as usize] = None;
                }
                SocketKind::CtrlConn => (),
            }

            self.free.push(slot);
        }
    }

    /// Dispatches a readiness token. Returns what the daemon must act on.
    pub fn handle_token(&mut self, token: Token, registry: &Registry) -> Vec<ServerEvent> {
        if token == CTRL_LISTENER_TOKEN {
            self.accept_ctrl(registry);
            return Vec::new();
        }

        let slot = match Self::slot_for(token) {
            Some(slot) if slot < self.slots.len() && self.slots[slot].is_some() => slot,
            _ => return Vec::new(), // already released
        };

        match self.slots[slot].as_ref().expect("checked above").kind {
            SocketKind::CtrlConn => self.handle_ctrl_conn(slot, registry),
            SocketKind::EndpointListener(endpoint) => self.accept_endpoint(endpoint, registry),
            SocketKind::EndpointConn(endpoint) => self.handle_endpoint_conn(slot, endpoint, registry),
        }
    }

    fn accept_ctrl(&mut self, registry: &Registry) {
        loop {
            match self.ctrl_listener.accept() {
                Ok((socket, _)) => {
                    if socket.set_nonblocking(true).is_err() {
                        continue;
                    }

                    let slot = self.allocate(SocketEntry {
                        kind: SocketKind::CtrlConn,
                        socket,
                        outbound: VecDeque::new(),
                    });

                    let entry = self.slots[slot].as_ref().expect("just allocated");
                    if registry
                        .register(
                            &mut SourceFd(&entry.socket.as_raw_fd()),
                            Self::token_for(slot),
                            Interest::READABLE,
                        )
                        .is_err()
                    {
                        self.release(slot, registry);
                        continue;
                    }

                    logging::debug!(self.log, "control client connected"; "slot" => slot);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "control accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn handle_ctrl_conn(&mut self, slot: usize, registry: &Registry) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        let mut buf = vec![0u8; self.max_write + 64];

        loop {
            let count = {
                let entry = match self.slots[slot].as_mut() {
                    Some(entry) => entry,
                    None => return events,
                };
                match entry.socket.read(&mut buf) {
                    Ok(count) => count,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return events,
                    Err(_) => 0,
                }
            };

            if count == 0 {
                logging::debug!(self.log, "control client disconnected"; "slot" => slot);
                self.release(slot, registry);
                return events;
            }

            let message = match CtrlMessage::decode(&buf[..count]) {
                Ok(message) => message,
                Err(err) => {
                    logging::warn!(self.log, "bad control message"; "error" => %err);
                    continue;
                }
            };

            match message.kind {
                // Answered in place: the server knows both values.
                CtrlKind::Version => {
                    self.send_to_slot(slot, &CtrlMessage::version(ingot::PROTOCOL_VERSION));
                }
                CtrlKind::MaxWriteSize => {
                    self.send_to_slot(slot, &CtrlMessage::max_write_size(self.max_write as u32));
                }
                CtrlKind::SetPid => {
                    if let Ok(pid) = message.payload_u32() {
                        if !self.client_pids.contains(&pid) {
                            self.client_pids.push(pid);
                        }
                        logging::debug!(self.log, "client registered"; "pid" => pid);
                    }
                }
                CtrlKind::OpenEndpoint => events.push(ServerEvent::OpenRequest {
                    endpoint: message.endpoint,
                    conn: slot,
                }),
                CtrlKind::CloseEndpoint => events.push(ServerEvent::CloseRequest {
                    endpoint: message.endpoint,
                    conn: slot,
                }),
                CtrlKind::EndpointStatus => events.push(ServerEvent::StatusRequest {
                    endpoint: message.endpoint,
                    conn: slot,
                }),
            }
        }
    }

    fn accept_endpoint(&mut self, endpoint: u8, registry: &Registry) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        let listener_slot = match self.endpoint_listener[endpoint as usize] {
            Some(slot) => slot,
            None => return events,
        };

        loop {
            let accepted = {
                let entry = match self.slots[listener_slot].as_ref() {
                    Some(entry) => entry,
                    None => return events,
                };
                entry.socket.accept()
            };

            match accepted {
                Ok((socket, _)) => {
                    if self.endpoint_conn[endpoint as usize].is_some() {
                        // One client per endpoint; the socket drops on close.
                        logging::warn!(self.log, "endpoint busy, rejecting client";
                                       "endpoint" => endpoint);
                        continue;
                    }

                    if socket.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let _ = socket.set_send_buffer_size(self.max_write);

                    let slot = self.allocate(SocketEntry {
                        kind: SocketKind::EndpointConn(endpoint),
                        socket,
                        outbound: VecDeque::new(),
                    });

                    {
                        let entry = self.slots[slot].as_ref().expect("just allocated");
                        if registry
                            .register(
                                &mut SourceFd(&entry.socket.as_raw_fd()),
                                Self::token_for(slot),
                                Interest::READABLE,
                            )
                            .is_err()
                        {
                            self.release(slot, registry);
                            continue;
                        }
                    }

                    self.endpoint_conn[endpoint as usize] = Some(slot);

                    // Accept handshake: an OpenEndpoint ack with no payload.
                    self.send_to_slot(
                        slot,
                        &CtrlMessage::new(CtrlKind::OpenEndpoint, endpoint, Vec::new()),
                    );

                    logging::info!(self.log, "endpoint client attached"; "endpoint" => endpoint);
                    events.push(ServerEvent::ClientAttached { endpoint });
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "endpoint accept failed";
                                   "endpoint" => endpoint, "error" => %err);
                    break;
                }
            }
        }

        events
    }

    fn handle_endpoint_conn(
        &mut self,
        slot: usize,
        endpoint: u8,
        registry: &Registry,
    ) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        let mut buf = vec![0u8; self.max_write + 1];

        loop {
            let count = {
                let entry = match self.slots[slot].as_mut() {
                    Some(entry) => entry,
                    None => return events,
                };
                match entry.socket.read(&mut buf) {
                    Ok(count) => count,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return events,
                    Err(_) => 0,
                }
            };

            if count == 0 {
                logging::info!(self.log, "endpoint client closed"; "endpoint" => endpoint);
                self.release(slot, registry);
                events.push(ServerEvent::ClientClosed { endpoint });
                return events;
            }

            if count > self.max_write {
                logging::warn!(self.log, "oversized client payload dropped";
                               "endpoint" => endpoint, "size" => count);
                continue;
            }

            events.push(ServerEvent::Payload {
                endpoint,
                data: buf[..count].to_vec(),
            });
        }
    }

    /// Creates (if needed) and registers the listening socket of an endpoint.
    pub fn ensure_endpoint_listener(
        &mut self,
        endpoint: u8,
        registry: &Registry,
    ) -> io::Result<()> {
        if self.endpoint_listener[endpoint as usize].is_some() {
            return Ok(());
        }

        let path = self.dir.join(format!("ep{}.cpcd.sock", endpoint));
        let socket = Self::bind_listener(&path)?;

        let slot = self.allocate(SocketEntry {
            kind: SocketKind::EndpointListener(endpoint),
            socket,
            outbound: VecDeque::new(),
        });

        {
            let entry = self.slots[slot].as_ref().expect("just allocated");
            registry.register(
                &mut SourceFd(&entry.socket.as_raw_fd()),
                Self::token_for(slot),
                Interest::READABLE,
            )?;
        }

        self.endpoint_listener[endpoint as usize] = Some(slot);

        logging::info!(self.log, "endpoint socket ready";
                       "endpoint" => endpoint, "path" => path.display().to_string());
        Ok(())
    }

    /// Answers a pending open request on a control connection.
    pub fn open_reply(
        &mut self,
        conn: usize,
        endpoint: u8,
        can_open: bool,
        registry: &Registry,
    ) {
        if can_open {
            if let Err(err) = self.ensure_endpoint_listener(endpoint, registry) {
                logging::warn!(self.log, "failed to create endpoint socket";
                               "endpoint" => endpoint, "error" => %err);
                self.send_to_slot(conn, &CtrlMessage::open_reply(endpoint, false));
                return;
            }
        }

        self.send_to_slot(conn, &CtrlMessage::open_reply(endpoint, can_open));
    }

    pub fn status_reply(&mut self, conn: usize, endpoint: u8, status: EndpointStatus) {
        self.send_to_slot(conn, &CtrlMessage::status_reply(endpoint, status));
    }

    pub fn close_reply(&mut self, conn: usize, endpoint: u8) {
        self.send_to_slot(conn, &CtrlMessage::new(CtrlKind::CloseEndpoint, endpoint, Vec::new()));
    }

    /// Sends one endpoint payload to its attached client, queueing on
    /// backpressure. Returns false if the client had to be dropped.
    pub fn deliver(&mut self, endpoint: u8, data: Vec<u8>, registry: &Registry) -> bool {
        let slot = match self.endpoint_conn[endpoint as usize] {
            Some(slot) => slot,
            None => return true, // nobody attached; payload is dropped
        };

        {
            let entry = match self.slots[slot].as_mut() {
                Some(entry) => entry,
                None => return true,
            };

            entry.outbound.push_back(data);
            if entry.outbound.len() > OUTBOUND_LIMIT {
                logging::warn!(self.log, "client too slow, dropping";
                               "endpoint" => endpoint);
                self.release(slot, registry);
                return false;
            }
        }

        self.flush_conn(slot);
        true
    }

    /// Retries queued outbound messages on every connection.
    pub fn flush(&mut self) {
        for slot in 0..self.slots.len() {
            if self.slots[slot].is_some() {
                self.flush_conn(slot);
            }
        }
    }

    fn flush_conn(&mut self, slot: usize) {
        let entry = match self.slots[slot].as_mut() {
            Some(entry) => entry,
            None => return,
        };

        while let Some(front) = entry.outbound.front() {
            match entry.socket.write(front) {
                Ok(_) => {
                    entry.outbound.pop_front();
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::debug!(self.log, "socket write failed"; "error" => %err);
                    entry.outbound.clear();
                    break;
                }
            }
        }
    }

    fn send_to_slot(&mut self, slot: usize, message: &CtrlMessage) {
        let entry = match self.slots.get_mut(slot).and_then(Option::as_mut) {
            Some(entry) => entry,
            None => return,
        };

        entry.outbound.push_back(message.encode());
        self.flush_conn(slot);
    }

    /// Drops the data client of an endpoint (remote close, reset, fault).
    /// The client observes EOF on its socket.
    pub fn drop_endpoint_client(&mut self, endpoint: u8, registry: &Registry) {
        if let Some(slot) = self.endpoint_conn[endpoint as usize] {
            logging::debug!(self.log, "dropping endpoint client"; "endpoint" => endpoint);
            self.release(slot, registry);
        }
    }

    /// Closes every socket and removes the instance directory.
    pub fn shutdown(&mut self, registry: &Registry) {
        for slot in 0..self.slots.len() {
            self.release(slot, registry);
        }

        let _ = registry.deregister(&mut SourceFd(&self.ctrl_listener.as_raw_fd()));
        let _ = fs::remove_dir_all(&self.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};
    use std::time::Duration;

    struct Harness {
        poll: Poll,
        server: ServerCore,
        dir: PathBuf,
    }

    impl Harness {
        fn new(name: &str) -> Harness {
            let run_dir = std::env::temp_dir().join(format!(
                "crosswire-server-{}-{}",
                std::process::id(),
                name
            ));
            let poll = Poll::new().unwrap();
            let server = ServerCore::new(
                &run_dir,
                "test",
                ingot::MAX_PAYLOAD,
                poll.registry(),
                None,
            )
            .unwrap();
            Harness {
                poll,
                server,
                dir: run_dir,
            }
        }

        fn connect_ctrl(&self) -> Socket {
            let socket = Socket::new(Domain::UNIX, Type::SEQPACKET, None).unwrap();
            socket
                .connect(&SockAddr::unix(wire::ctrl_socket_path(&self.dir, "test")).unwrap())
                .unwrap();
            socket
        }

        /// Polls once and routes every server token, collecting events.
        fn turn(&mut self) -> Vec<ServerEvent> {
            let mut events = Events::with_capacity(64);
            self.poll
                .poll(&mut events, Some(Duration::from_millis(200)))
                .unwrap();

            let mut out = Vec::new();
            for event in &events {
                if ServerCore::owns_token(event.token()) {
                    out.extend(self.server.handle_token(event.token(), self.poll.registry()));
                }
            }
            out
        }

        fn turn_until<F: Fn(&[ServerEvent]) -> bool>(&mut self, accept: F) -> Vec<ServerEvent> {
            let mut all = Vec::new();
            for _ in 0..50 {
                all.extend(self.turn());
                if accept(&all) {
                    return all;
                }
            }
            panic!("expected events never arrived: {:?}", all);
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn read_message(socket: &Socket) -> CtrlMessage {
        let mut buf = [0u8; 8192];
        for _ in 0..100 {
            match (&mut (&*socket)).read(&mut buf) {
                Ok(count) => return CtrlMessage::decode(&buf[..count]).unwrap(),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(err) => panic!("read failed: {}", err),
            }
        }
        panic!("no reply from server");
    }

    #[test]
    fn test_version_and_max_write_answered_inline() {
        let mut harness = Harness::new("version");
        let client = harness.connect_ctrl();

        harness.turn(); // accept

        (&client).write_all(&CtrlMessage::version(0).encode()).unwrap();
        harness.turn_until(|_| true);

        let reply = read_message(&client);
        assert_eq!(reply.kind, CtrlKind::Version);
        assert_eq!(reply.payload_version().unwrap(), ingot::PROTOCOL_VERSION);

        (&client)
            .write_all(&CtrlMessage::new(CtrlKind::MaxWriteSize, 0, Vec::new()).encode())
            .unwrap();
        harness.turn_until(|_| true);

        let reply = read_message(&client);
        assert_eq!(reply.payload_u32().unwrap() as usize, ingot::MAX_PAYLOAD);
    }

    #[test]
    fn test_open_request_surfaces_and_listener_appears() {
        let mut harness = Harness::new("open");
        let client = harness.connect_ctrl();

        harness.turn(); // accept

        (&client)
            .write_all(&CtrlMessage::new(CtrlKind::OpenEndpoint, 5, Vec::new()).encode())
            .unwrap();

        let events = harness.turn_until(|events| !events.is_empty());
        let conn = match events[0] {
            ServerEvent::OpenRequest { endpoint: 5, conn } => conn,
            ref other => panic!("Unexpected event {:?}", other),
        };

        harness
            .server
            .open_reply(conn, 5, true, harness.poll.registry());

        let reply = read_message(&client);
        assert_eq!(reply.kind, CtrlKind::OpenEndpoint);
        assert!(reply.payload_bool().unwrap());

        assert!(harness.dir.join("cpcd/test/ep5.cpcd.sock").exists());
    }

    #[test]
    fn test_endpoint_payload_roundtrip() {
        let mut harness = Harness::new("payload");

        harness
            .server
            .ensure_endpoint_listener(3, harness.poll.registry())
            .unwrap();

        let data_socket = Socket::new(Domain::UNIX, Type::SEQPACKET, None).unwrap();
        data_socket
            .connect(
                &SockAddr::unix(wire::endpoint_socket_path(&harness.dir, "test", 3)).unwrap(),
            )
            .unwrap();

        let events = harness.turn_until(|events| {
            events.contains(&ServerEvent::ClientAttached { endpoint: 3 })
        });
        assert!(events.contains(&ServerEvent::ClientAttached { endpoint: 3 }));

        // The accept handshake arrives first.
        let ack = read_message(&data_socket);
        assert_eq!(ack.kind, CtrlKind::OpenEndpoint);
        assert_eq!(ack.endpoint, 3);

        // Client → daemon payload.
        (&data_socket).write_all(b"to the radio").unwrap();
        let events = harness.turn_until(|events| !events.is_empty());
        assert!(events.contains(&ServerEvent::Payload {
            endpoint: 3,
            data: b"to the radio".to_vec(),
        }));

        // Daemon → client payload.
        assert!(harness
            .server
            .deliver(3, b"from the radio".to_vec(), harness.poll.registry()));

        let mut buf = [0u8; 64];
        for _ in 0..100 {
            match (&data_socket).read(&mut buf) {
                Ok(count) => {
                    assert_eq!(&buf[..count], b"from the radio");
                    return;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(err) => panic!("read failed: {}", err),
            }
        }
        panic!("payload never delivered");
    }

    #[test]
    fn test_client_eof_surfaces_close() {
        let mut harness = Harness::new("eof");

        harness
            .server
            .ensure_endpoint_listener(7, harness.poll.registry())
            .unwrap();

        let data_socket = Socket::new(Domain::UNIX, Type::SEQPACKET, None).unwrap();
        data_socket
            .connect(
                &SockAddr::unix(wire::endpoint_socket_path(&harness.dir, "test", 7)).unwrap(),
            )
            .unwrap();

        harness.turn_until(|events| {
            events.contains(&ServerEvent::ClientAttached { endpoint: 7 })
        });

        drop(data_socket);

        let events =
            harness.turn_until(|events| events.contains(&ServerEvent::ClientClosed { endpoint: 7 }));
        assert!(events.contains(&ServerEvent::ClientClosed { endpoint: 7 }));
        assert!(!harness.server.has_client(7));
    }

    #[test]
    fn test_pid_registration() {
        let mut harness = Harness::new("pid");
        let client = harness.connect_ctrl();

        harness.turn(); // accept

        (&client)
            .write_all(&CtrlMessage::set_pid(4242).encode())
            .unwrap();
        harness.turn_until(|_| true);

        // Wait for the pid to be recorded.
        for _ in 0..50 {
            if harness.server.client_pids().contains(&4242) {
                return;
            }
            harness.turn();
        }
        panic!("pid never registered");
    }
}
