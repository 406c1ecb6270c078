//! Authenticated encryption of endpoint payloads.
//!
//! Key material lives on a dedicated worker thread and never crosses back;
//! the link talks to it through a single-slot command channel with
//! synchronous replies. A self-pipe is written after every reply so the
//! event loop always has a readable fd to wake on.
//!
//! Nonces are the 12-byte IETF layout: `endpoint | direction | reserved(2) |
//! counter_le(8)`. Counters are kept per endpoint and direction: a
//! retransmitted frame must reuse the nonce it was first encrypted under,
//! and frames of different endpoints may arrive interleaved with
//! retransmissions, so a single link-wide counter cannot stay in step.
//! The low 29 bits count frames, the top 3 bits of the counter are reserved.

use ingot::crypto;
use ingot::keys::BindingKey;
use ingot::logging::{self, Logger};
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;

/// A rekey is scheduled once a frame counter reaches this value.
pub const REKEY_THRESHOLD: u64 = (1 << 29) - 8;
/// Hard ceiling; encryption refuses rather than reuse counter space.
pub const COUNTER_LIMIT: u64 = (1 << 29) - 1;

const DIR_HOST_TO_SECONDARY: u8 = 0;
const DIR_SECONDARY_TO_HOST: u8 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    NotReady,
    Initializing,
    Initialized,
    Resetting,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CipherError {
    /// The session cannot encrypt right now (handshake or rekey in flight,
    /// counter exhausted). Retriable.
    NotReady,
    /// Authentication tag mismatch: a security incident.
    AuthFailed,
}

impl fmt::Display for CipherError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CipherError::NotReady => write!(f, "security session not ready"),
            CipherError::AuthFailed => write!(f, "authentication failed"),
        }
    }
}

impl std::error::Error for CipherError {}

/// Session surface the link core and the handshake driver program against.
/// `SessionClient` implements it over the worker thread; `PlainLink` stands
/// in when security is disabled.
pub trait SessionCipher: Send {
    fn state(&self) -> SessionState;

    fn ready(&self) -> bool {
        self.state() == SessionState::Initialized
    }

    fn encrypt(&mut self, endpoint: u8, ad: &[u8], plain: &[u8]) -> Result<Vec<u8>, CipherError>;
    fn decrypt(&mut self, endpoint: u8, ad: &[u8], cipher: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// True once a counter crossed the rekey threshold; clears on read.
    fn take_rekey_due(&mut self) -> bool;

    fn binding_key_id(&self) -> [u8; 8];

    /// Generates a fresh ephemeral pair, returns the public half.
    fn begin_handshake(&mut self) -> [u8; 32];

    /// Completes the key exchange; returns the 64-bit session identifier.
    fn complete_handshake(&mut self, their_public: [u8; 32]) -> Result<u64, CipherError>;

    /// Starts a rekey: a fresh ephemeral exchange while the old key keeps
    /// decrypting inbound traffic.
    fn begin_rekey(&mut self) -> [u8; 32];

    /// Tears the session down to `NotReady`.
    fn reset(&mut self);

    /// Readable end of the worker's completion pipe, if the implementation
    /// has a worker. The event loop registers it and calls
    /// [`SessionCipher::drain_notifications`] on readiness.
    fn notify_fd(&self) -> Option<RawFd> {
        None
    }

    fn drain_notifications(&self) {}
}

/// No-op cipher used when security is disabled.
pub struct PlainLink;

impl SessionCipher for PlainLink {
    fn state(&self) -> SessionState {
        SessionState::Initialized
    }

    fn encrypt(&mut self, _endpoint: u8, _ad: &[u8], plain: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(plain.to_vec())
    }

    fn decrypt(&mut self, _endpoint: u8, _ad: &[u8], cipher: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(cipher.to_vec())
    }

    fn take_rekey_due(&mut self) -> bool {
        false
    }

    fn binding_key_id(&self) -> [u8; 8] {
        [0; 8]
    }

    fn begin_handshake(&mut self) -> [u8; 32] {
        [0; 32]
    }

    fn complete_handshake(&mut self, _their_public: [u8; 32]) -> Result<u64, CipherError> {
        Ok(0)
    }

    fn begin_rekey(&mut self) -> [u8; 32] {
        [0; 32]
    }

    fn reset(&mut self) {}
}

enum Command {
    InitSession,
    Rekey,
    DeriveKey { their_public: [u8; 32] },
    Encrypt { endpoint: u8, direction: u8, ad: Vec<u8>, plain: Vec<u8> },
    Decrypt { endpoint: u8, direction: u8, ad: Vec<u8>, cipher: Vec<u8> },
    ResetSession,
    /// Test support: jump the frame counters of one endpoint.
    ForceCounters { endpoint: u8, tx: u64, rx: u64 },
    Shutdown,
}

enum Reply {
    Done,
    EphemeralPublic([u8; 32]),
    SessionId(u64),
    Bytes { data: Vec<u8>, rekey_due: bool },
    Failed(CipherError),
}

/// Key material and counters. Lives exclusively on the worker thread.
struct Session {
    binding: BindingKey,
    state: SessionState,
    key: [u8; crypto::KEY_SIZE],
    session_id: u64,
    ephemeral: Option<[u8; crypto::SCALAR_SIZE]>,
    tx_counters: Vec<u64>,
    rx_counters: Vec<u64>,
    log: Logger,
}

impl Session {
    fn new(binding: BindingKey, log: Logger) -> Session {
        Session {
            binding,
            state: SessionState::NotReady,
            key: [0; crypto::KEY_SIZE],
            session_id: 0,
            ephemeral: None,
            tx_counters: vec![0; 256],
            rx_counters: vec![0; 256],
            log,
        }
    }

    fn nonce(endpoint: u8, direction: u8, counter: u64) -> [u8; crypto::NONCE_SIZE] {
        let mut nonce = [0u8; crypto::NONCE_SIZE];
        nonce[0] = endpoint;
        nonce[1] = direction;
        nonce[4..12].copy_from_slice(&counter.to_le_bytes());
        nonce
    }

    fn fresh_ephemeral(&mut self) -> [u8; 32] {
        let (secret, public) = crypto::x25519_keypair();
        self.ephemeral = Some(secret);
        public
    }

    fn handle(&mut self, command: Command) -> Reply {
        match command {
            Command::InitSession => {
                self.state = SessionState::Initializing;
                Reply::EphemeralPublic(self.fresh_ephemeral())
            }
            Command::Rekey => {
                self.state = SessionState::Resetting;
                Reply::EphemeralPublic(self.fresh_ephemeral())
            }
            Command::DeriveKey { their_public } => {
                let secret = match self.ephemeral.take() {
                    Some(secret) => secret,
                    None => return Reply::Failed(CipherError::NotReady),
                };

                let shared = match crypto::x25519_shared(&secret, &their_public) {
                    Some(shared) => shared,
                    None => return Reply::Failed(CipherError::AuthFailed),
                };

                let (key, session_id) = crypto::derive_session(&shared, &self.binding.public());
                self.key = key;
                self.session_id = session_id;
                self.state = SessionState::Initialized;

                // Fresh key, fresh counter space.
                self.tx_counters.iter_mut().for_each(|c| *c = 0);
                self.rx_counters.iter_mut().for_each(|c| *c = 0);

                logging::info!(self.log, "session established";
                               "session_id" => format!("{:016x}", session_id));

                Reply::SessionId(session_id)
            }
            Command::Encrypt {
                endpoint,
                direction,
                ad,
                plain,
            } => {
                if self.state != SessionState::Initialized {
                    return Reply::Failed(CipherError::NotReady);
                }

                let counter = self.tx_counters[endpoint as usize];
                if counter >= COUNTER_LIMIT {
                    return Reply::Failed(CipherError::NotReady);
                }

                let nonce = Self::nonce(endpoint, direction, counter);
                let mut cipher = vec![0u8; plain.len() + crypto::MAC_SIZE];

                if !crypto::encrypt(&mut cipher, &plain, &ad, &nonce, &self.key) {
                    return Reply::Failed(CipherError::AuthFailed);
                }

                self.tx_counters[endpoint as usize] = counter + 1;

                Reply::Bytes {
                    data: cipher,
                    rekey_due: counter + 1 >= REKEY_THRESHOLD,
                }
            }
            Command::Decrypt {
                endpoint,
                direction,
                ad,
                cipher,
            } => {
                if self.state == SessionState::NotReady || self.state == SessionState::Initializing
                {
                    return Reply::Failed(CipherError::NotReady);
                }

                if cipher.len() < crypto::MAC_SIZE {
                    return Reply::Failed(CipherError::AuthFailed);
                }

                let counter = self.rx_counters[endpoint as usize];
                let nonce = Self::nonce(endpoint, direction, counter);
                let mut plain = vec![0u8; cipher.len() - crypto::MAC_SIZE];

                if !crypto::decrypt(&mut plain, &cipher, &ad, &nonce, &self.key) {
                    return Reply::Failed(CipherError::AuthFailed);
                }

                // Only a successful decrypt advances the counter; a dropped or
                // retransmitted frame arrives under the same nonce again.
                self.rx_counters[endpoint as usize] = counter + 1;

                Reply::Bytes {
                    data: plain,
                    rekey_due: counter + 1 >= REKEY_THRESHOLD,
                }
            }
            Command::ResetSession => {
                self.state = SessionState::NotReady;
                self.key = [0; crypto::KEY_SIZE];
                self.ephemeral = None;
                self.tx_counters.iter_mut().for_each(|c| *c = 0);
                self.rx_counters.iter_mut().for_each(|c| *c = 0);
                Reply::Done
            }
            Command::ForceCounters { endpoint, tx, rx } => {
                self.tx_counters[endpoint as usize] = tx;
                self.rx_counters[endpoint as usize] = rx;
                Reply::Done
            }
            Command::Shutdown => Reply::Done,
        }
    }
}

struct PipeWriter(RawFd);

impl PipeWriter {
    fn notify(&self) {
        let byte = [0u8; 1];
        unsafe {
            // A full pipe just means the loop has wakeups queued already.
            libc::write(self.0, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

unsafe impl Send for PipeWriter {}

/// Handle owned by the event-loop side. Implements `SessionCipher` by
/// round-tripping through the worker.
pub struct SessionClient {
    cmd_tx: SyncSender<Command>,
    reply_rx: Receiver<Reply>,
    notify_fd: RawFd,
    state: SessionState,
    key_id: [u8; 8],
    session_id: Option<u64>,
    rekey_due: bool,
    direction_tx: u8,
    direction_rx: u8,
}

impl SessionClient {
    /// Spawns the security worker for the host side of the link.
    pub fn spawn(binding: BindingKey, log: Logger) -> std::io::Result<SessionClient> {
        Self::spawn_with_directions(binding, log, DIR_HOST_TO_SECONDARY, DIR_SECONDARY_TO_HOST)
    }

    /// Spawns a worker with swapped nonce directions. Used by test harnesses
    /// that stand in for the secondary.
    pub fn spawn_secondary(binding: BindingKey, log: Logger) -> std::io::Result<SessionClient> {
        Self::spawn_with_directions(binding, log, DIR_SECONDARY_TO_HOST, DIR_HOST_TO_SECONDARY)
    }

    fn spawn_with_directions(
        binding: BindingKey,
        log: Logger,
        direction_tx: u8,
        direction_rx: u8,
    ) -> std::io::Result<SessionClient> {
        let mut fds = [0 as libc::c_int; 2];
        let result = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }

        let key_id = binding.id();

        let (cmd_tx, cmd_rx) = sync_channel::<Command>(1);
        let (reply_tx, reply_rx) = sync_channel::<Reply>(1);
        let pipe = PipeWriter(fds[1]);

        thread::Builder::new()
            .name("cpc-security".into())
            .spawn(move || {
                let mut session = Session::new(binding, log);

                while let Ok(command) = cmd_rx.recv() {
                    let stop = matches!(command, Command::Shutdown);
                    let reply = session.handle(command);

                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                    pipe.notify();

                    if stop {
                        break;
                    }
                }
            })?;

        Ok(SessionClient {
            cmd_tx,
            reply_rx,
            notify_fd: fds[0],
            state: SessionState::NotReady,
            key_id,
            session_id: None,
            rekey_due: false,
            direction_tx,
            direction_rx,
        })
    }

    #[inline]
    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    /// Test support: jump the frame counters of one endpoint, e.g. to
    /// exercise rekey scheduling near the counter ceiling.
    #[doc(hidden)]
    pub fn force_counters(&mut self, endpoint: u8, tx: u64, rx: u64) {
        match self.call(Command::ForceCounters { endpoint, tx, rx }) {
            Reply::Done => (),
            _ => panic!("unexpected security reply"),
        }
    }

    fn call(&mut self, command: Command) -> Reply {
        self.cmd_tx
            .send(command)
            .expect("security worker terminated");
        self.reply_rx
            .recv()
            .expect("security worker terminated")
    }
}

impl SessionCipher for SessionClient {
    fn state(&self) -> SessionState {
        self.state
    }

    fn encrypt(&mut self, endpoint: u8, ad: &[u8], plain: &[u8]) -> Result<Vec<u8>, CipherError> {
        if self.state != SessionState::Initialized {
            return Err(CipherError::NotReady);
        }

        let direction = self.direction_tx;
        match self.call(Command::Encrypt {
            endpoint,
            direction,
            ad: ad.to_vec(),
            plain: plain.to_vec(),
        }) {
            Reply::Bytes { data, rekey_due } => {
                self.rekey_due |= rekey_due;
                Ok(data)
            }
            Reply::Failed(err) => Err(err),
            _ => panic!("unexpected security reply"),
        }
    }

    fn decrypt(&mut self, endpoint: u8, ad: &[u8], cipher: &[u8]) -> Result<Vec<u8>, CipherError> {
        let direction = self.direction_rx;
        match self.call(Command::Decrypt {
            endpoint,
            direction,
            ad: ad.to_vec(),
            cipher: cipher.to_vec(),
        }) {
            Reply::Bytes { data, rekey_due } => {
                self.rekey_due |= rekey_due;
                Ok(data)
            }
            Reply::Failed(err) => Err(err),
            _ => panic!("unexpected security reply"),
        }
    }

    fn take_rekey_due(&mut self) -> bool {
        let due = self.rekey_due;
        self.rekey_due = false;
        due
    }

    fn binding_key_id(&self) -> [u8; 8] {
        self.key_id
    }

    fn begin_handshake(&mut self) -> [u8; 32] {
        self.state = SessionState::Initializing;
        match self.call(Command::InitSession) {
            Reply::EphemeralPublic(public) => public,
            _ => panic!("unexpected security reply"),
        }
    }

    fn complete_handshake(&mut self, their_public: [u8; 32]) -> Result<u64, CipherError> {
        match self.call(Command::DeriveKey { their_public }) {
            Reply::SessionId(id) => {
                self.state = SessionState::Initialized;
                self.session_id = Some(id);
                self.rekey_due = false;
                Ok(id)
            }
            Reply::Failed(err) => {
                self.state = SessionState::NotReady;
                Err(err)
            }
            _ => panic!("unexpected security reply"),
        }
    }

    fn begin_rekey(&mut self) -> [u8; 32] {
        self.state = SessionState::Resetting;
        match self.call(Command::Rekey) {
            Reply::EphemeralPublic(public) => public,
            _ => panic!("unexpected security reply"),
        }
    }

    fn reset(&mut self) {
        self.state = SessionState::NotReady;
        self.session_id = None;
        self.rekey_due = false;
        match self.call(Command::ResetSession) {
            Reply::Done => (),
            _ => panic!("unexpected security reply"),
        }
    }

    fn notify_fd(&self) -> Option<RawFd> {
        Some(self.notify_fd)
    }

    fn drain_notifications(&self) {
        let mut sink = [0u8; 64];
        loop {
            let count = unsafe {
                libc::read(
                    self.notify_fd,
                    sink.as_mut_ptr() as *mut libc::c_void,
                    sink.len(),
                )
            };
            if count <= 0 {
                break;
            }
        }
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        // Best effort; the worker may already be gone.
        let _ = self.cmd_tx.send(Command::Shutdown);
        unsafe {
            libc::close(self.notify_fd);
        }
    }
}

/// Handshake messages carried as payloads on the security endpoint.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HandshakeMessage {
    RequestId,
    IdResponse { key_id: [u8; 8] },
    EphemeralPublic { public: [u8; 32] },
}

const MSG_REQUEST_ID: u8 = 0x01;
const MSG_ID_RESPONSE: u8 = 0x02;
const MSG_EPHEMERAL_PUBLIC: u8 = 0x03;

impl HandshakeMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            HandshakeMessage::RequestId => vec![MSG_REQUEST_ID],
            HandshakeMessage::IdResponse { key_id } => {
                let mut out = Vec::with_capacity(9);
                out.push(MSG_ID_RESPONSE);
                out.extend_from_slice(key_id);
                out
            }
            HandshakeMessage::EphemeralPublic { public } => {
                let mut out = Vec::with_capacity(33);
                out.push(MSG_EPHEMERAL_PUBLIC);
                out.extend_from_slice(public);
                out
            }
        }
    }

    pub fn decode(raw: &[u8]) -> Option<HandshakeMessage> {
        match raw.split_first()? {
            (&MSG_REQUEST_ID, []) => Some(HandshakeMessage::RequestId),
            (&MSG_ID_RESPONSE, rest) if rest.len() == 8 => {
                let mut key_id = [0u8; 8];
                key_id.copy_from_slice(rest);
                Some(HandshakeMessage::IdResponse { key_id })
            }
            (&MSG_EPHEMERAL_PUBLIC, rest) if rest.len() == 32 => {
                let mut public = [0u8; 32];
                public.copy_from_slice(rest);
                Some(HandshakeMessage::EphemeralPublic { public })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum HandshakeError {
    /// The secondary is bound to a different key.
    UnknownBindingKey,
    UnexpectedMessage,
    Malformed,
    KeyExchangeFailed,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HandshakeError::UnknownBindingKey => write!(f, "secondary bound to a different key"),
            HandshakeError::UnexpectedMessage => write!(f, "handshake message out of order"),
            HandshakeError::Malformed => write!(f, "malformed handshake message"),
            HandshakeError::KeyExchangeFailed => write!(f, "key exchange failed"),
        }
    }
}

impl std::error::Error for HandshakeError {}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum HandshakePhase {
    Idle,
    AwaitingId,
    AwaitingPeerKey,
    Done,
}

/// What the daemon should do after feeding a handshake message in.
#[derive(Debug, Eq, PartialEq)]
pub enum HandshakeProgress {
    /// Write this payload on the security endpoint.
    Send(Vec<u8>),
    /// The session is up.
    Established { session_id: u64 },
}

/// Drives the host side of the key exchange over the security endpoint.
pub struct Handshake {
    phase: HandshakePhase,
    log: Logger,
}

impl Handshake {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Handshake {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("unit" => "handshake")),
            None => logging::discard(),
        };

        Handshake { phase: HandshakePhase::Idle, log }
    }

    #[inline]
    pub fn established(&self) -> bool {
        self.phase == HandshakePhase::Done
    }

    /// Begins a fresh key exchange; returns the first message to send.
    pub fn start(&mut self) -> Vec<u8> {
        logging::debug!(self.log, "starting key exchange");
        self.phase = HandshakePhase::AwaitingId;
        HandshakeMessage::RequestId.encode()
    }

    /// Begins a rekey: the binding key id is already verified, so the
    /// exchange skips straight to the ephemeral keys.
    pub fn start_rekey(&mut self, session: &mut dyn SessionCipher) -> Vec<u8> {
        logging::debug!(self.log, "starting rekey");
        self.phase = HandshakePhase::AwaitingPeerKey;
        let public = session.begin_rekey();
        HandshakeMessage::EphemeralPublic { public }.encode()
    }

    /// Feeds in a payload received on the security endpoint.
    pub fn on_message(
        &mut self,
        raw: &[u8],
        session: &mut dyn SessionCipher,
    ) -> Result<HandshakeProgress, HandshakeError> {
        let message = HandshakeMessage::decode(raw).ok_or(HandshakeError::Malformed)?;

        match (self.phase, message) {
            (HandshakePhase::AwaitingId, HandshakeMessage::IdResponse { key_id }) => {
                if key_id != session.binding_key_id() {
                    self.phase = HandshakePhase::Idle;
                    return Err(HandshakeError::UnknownBindingKey);
                }

                self.phase = HandshakePhase::AwaitingPeerKey;
                let public = session.begin_handshake();
                Ok(HandshakeProgress::Send(
                    HandshakeMessage::EphemeralPublic { public }.encode(),
                ))
            }
            (HandshakePhase::AwaitingPeerKey, HandshakeMessage::EphemeralPublic { public }) => {
                match session.complete_handshake(public) {
                    Ok(session_id) => {
                        self.phase = HandshakePhase::Done;
                        logging::info!(self.log, "key exchange complete";
                                       "session_id" => format!("{:016x}", session_id));
                        Ok(HandshakeProgress::Established { session_id })
                    }
                    Err(_) => {
                        self.phase = HandshakePhase::Idle;
                        Err(HandshakeError::KeyExchangeFailed)
                    }
                }
            }
            _ => Err(HandshakeError::UnexpectedMessage),
        }
    }
}
