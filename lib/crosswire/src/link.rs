//! The link core: owns the dense endpoint table and runs the ARQ protocol.
//! Sliding windows, acknowledgements, rejects, retransmission backoff and the
//! U-Reset open/close handshakes all live here.
//!
//! The core is a pure state machine. I/O readiness and clocks stay outside:
//! callers feed in decoded frames and timer expiries with an explicit `now`,
//! then drain outbound frames with [`LinkCore::poll_transmit`] and state
//! changes with [`LinkCore::poll_event`].

use crate::endpoint::{
    Endpoint, ErrorReason, PendingFrame, State, MAX_WINDOW, PENDING_LIMIT, RESERVED_ENDPOINT,
    SECURITY_ENDPOINT, SYSTEM_ENDPOINT,
};
use crate::frame::{encode_header, Control, Frame, SupervisoryKind, UnnumberedKind};
use crate::framer::DecodeEvent;
use crate::security::{CipherError, SessionCipher};
use ingot::crypto;
use ingot::logging::{self, Logger};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Protocol violations tolerated within [`VIOLATION_WINDOW`] before the link
/// resets itself.
const VIOLATION_LIMIT: usize = 10;
const VIOLATION_WINDOW: Duration = Duration::from_secs(1);

/// Security incidents tolerated within [`INCIDENT_WINDOW`] before an endpoint
/// is shut down for good.
const INCIDENT_LIMIT: usize = 3;
const INCIDENT_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Largest plaintext payload accepted from a client.
    pub mtu: usize,
    pub tx_window: u8,
    pub rto: Duration,
    pub max_rto: Duration,
    pub max_retries: u8,
    pub ack_delay: Duration,
    /// Payloads on non-system endpoints are AEAD protected.
    pub security: bool,
}

impl Default for LinkConfig {
    fn default() -> LinkConfig {
        LinkConfig {
            mtu: ingot::MAX_PAYLOAD,
            tx_window: 4,
            rto: Duration::from_millis(100),
            max_rto: Duration::from_secs(5),
            max_retries: 5,
            ack_delay: Duration::from_millis(50),
            security: false,
        }
    }
}

impl LinkConfig {
    pub fn from_settings(settings: &ingot::config::Link, security: bool) -> LinkConfig {
        LinkConfig {
            mtu: settings.mtu,
            tx_window: settings.tx_window.max(1).min(MAX_WINDOW),
            rto: Duration::from_millis(settings.rto_ms),
            max_rto: Duration::from_millis(settings.max_rto_ms),
            max_retries: settings.max_retries,
            ack_delay: Duration::from_millis(settings.ack_delay_ms),
            security,
        }
    }

    /// Frame payloads may exceed the client MTU by the authentication tag.
    #[inline]
    pub fn frame_mtu(&self) -> usize {
        self.mtu + crypto::MAC_SIZE
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EndpointTimer {
    Retransmit,
    DelayedAck,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseReason {
    Local,
    Remote,
    ConnectionLost,
    Fault(ErrorReason),
}

/// State changes surfaced to the daemon after feeding the core.
#[derive(Debug, Eq, PartialEq)]
pub enum LinkEvent {
    SetTimer {
        endpoint: u8,
        timer: EndpointTimer,
        delay: Duration,
    },
    ClearTimer {
        endpoint: u8,
        timer: EndpointTimer,
    },
    /// Open handshake completed; the endpoint accepts traffic.
    Opened(u8),
    Closed {
        endpoint: u8,
        reason: CloseReason,
    },
    /// The peer reset an open endpoint; sequencing restarted, the attached
    /// client must re-initialize.
    PeerReset(u8),
    /// The rx queue has payloads to deliver.
    Delivered(u8),
    /// Window space freed and nothing is queued behind it.
    Writable(u8),
    /// Repeated authentication failures; the endpoint is locked out and a
    /// new key exchange is required.
    SecurityIncident(u8),
    /// Peer reset the whole link; every endpoint was torn down.
    LinkDown,
}

#[derive(Debug, Eq, PartialEq)]
pub enum WriteError {
    NotOpen,
    TooLarge,
    /// Retriable: the security session is not up (yet).
    SecurityNotReady,
    QueueFull,
}

#[derive(Debug, Eq, PartialEq)]
pub enum OpenError {
    ReservedEndpoint,
    /// The endpoint was closed after a security incident and stays closed.
    SecurityLockout,
}

#[derive(Debug, Default)]
pub struct LinkCounters {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub retransmits: u64,
    pub rejects_sent: u64,
    pub rejects_received: u64,
    pub crc_drops: u64,
    pub garbage_bytes: u64,
    pub spurious_acks: u64,
    pub violations: u64,
}

pub struct LinkCore {
    cfg: LinkConfig,
    endpoints: Vec<Endpoint>,
    session: Box<dyn SessionCipher>,
    egress: VecDeque<Frame>,
    events: VecDeque<LinkEvent>,
    violations: VecDeque<Instant>,
    counters: LinkCounters,
    log: Logger,
}

impl LinkCore {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        cfg: LinkConfig,
        session: Box<dyn SessionCipher>,
        log: L,
    ) -> LinkCore {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("unit" => "link")),
            None => logging::discard(),
        };

        let endpoints = (0..=255u8).map(|id| Endpoint::new(id, cfg.rto)).collect();

        LinkCore {
            cfg,
            endpoints,
            session,
            egress: VecDeque::new(),
            events: VecDeque::new(),
            violations: VecDeque::new(),
            counters: LinkCounters::default(),
            log,
        }
    }

    #[inline]
    pub fn config(&self) -> &LinkConfig {
        &self.cfg
    }

    #[inline]
    pub fn session(&mut self) -> &mut dyn SessionCipher {
        &mut *self.session
    }

    /// Completion-pipe descriptor of the security worker, when there is one.
    #[inline]
    pub fn session_notify_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.session.notify_fd()
    }

    #[inline]
    pub fn counters(&self) -> &LinkCounters {
        &self.counters
    }

    #[inline]
    pub fn state(&self, id: u8) -> State {
        self.endpoints[id as usize].state
    }

    /// True once an open handshake completed and traffic may flow.
    #[inline]
    pub fn is_operational(&self, id: u8) -> bool {
        let ep = &self.endpoints[id as usize];
        ep.state == State::Open && !ep.awaiting_uack
    }

    #[inline]
    fn encrypted(&self, id: u8) -> bool {
        self.cfg.security && id != SYSTEM_ENDPOINT && id != SECURITY_ENDPOINT
    }

    /// Begins the reset handshakes of the control-plane endpoints.
    pub fn start(&mut self, now: Instant) {
        self.open(SYSTEM_ENDPOINT, now)
            .expect("system endpoint is always openable");
        if self.cfg.security {
            self.open(SECURITY_ENDPOINT, now)
                .expect("security endpoint is always openable");
        }
    }

    /// Requests an endpoint open. Completion is reported with
    /// [`LinkEvent::Opened`] once the peer acknowledged the reset.
    pub fn open(&mut self, id: u8, _now: Instant) -> Result<(), OpenError> {
        if id == RESERVED_ENDPOINT {
            return Err(OpenError::ReservedEndpoint);
        }

        let base_rto = self.cfg.rto;
        let ep = &mut self.endpoints[id as usize];

        match ep.state {
            State::Open if !ep.awaiting_uack => {
                // Idempotent: already open.
                self.events.push_back(LinkEvent::Opened(id));
                return Ok(());
            }
            State::Open => return Ok(()), // handshake already in flight
            State::Error(ErrorReason::SecurityIncident) => {
                return Err(OpenError::SecurityLockout);
            }
            _ => (),
        }

        ep.clear(base_rto);
        ep.state = State::Open;
        ep.awaiting_uack = true;
        let delay = ep.rto;

        logging::debug!(self.log, "opening endpoint"; "endpoint" => id);

        self.push_unnumbered(id, UnnumberedKind::Reset);
        self.events.push_back(LinkEvent::SetTimer {
            endpoint: id,
            timer: EndpointTimer::Retransmit,
            delay,
        });

        Ok(())
    }

    /// Local close. A no-op on an endpoint that is already closed.
    pub fn close(&mut self, id: u8, _now: Instant) {
        let base_rto = self.cfg.rto;
        let ep = &mut self.endpoints[id as usize];

        match ep.state {
            State::Closed | State::Closing => (),
            State::Open if !ep.awaiting_uack => {
                ep.state = State::Closing;
                ep.awaiting_uack = true;
                ep.handshake_retries = 0;
                ep.pending_tx.clear();
                let delay = ep.rto;

                logging::debug!(self.log, "closing endpoint"; "endpoint" => id);

                self.push_unnumbered(id, UnnumberedKind::Reset);
                self.events.push_back(LinkEvent::SetTimer {
                    endpoint: id,
                    timer: EndpointTimer::Retransmit,
                    delay,
                });
            }
            // Open handshake in flight, or the link already knows the peer
            // is unreachable: release locally without another round trip.
            _ => {
                ep.state = State::Closed;
                ep.clear(base_rto);
                self.clear_endpoint_timers(id);
                self.events.push_back(LinkEvent::Closed {
                    endpoint: id,
                    reason: CloseReason::Local,
                });
            }
        }
    }

    /// Submits one client payload for reliable delivery.
    pub fn write(&mut self, id: u8, payload: Vec<u8>, now: Instant) -> Result<(), WriteError> {
        if payload.len() > self.cfg.mtu {
            return Err(WriteError::TooLarge);
        }

        if !self.is_operational(id) {
            return Err(WriteError::NotOpen);
        }

        if self.encrypted(id) && !self.session.ready() {
            return Err(WriteError::SecurityNotReady);
        }

        // Queue behind earlier writes: submission order is delivery order.
        {
            let ep = &mut self.endpoints[id as usize];
            if ep.outstanding() >= self.cfg.tx_window || !ep.pending_tx.is_empty() {
                if ep.pending_tx.len() >= PENDING_LIMIT {
                    return Err(WriteError::QueueFull);
                }
                ep.pending_tx.push_back(payload);
                return Ok(());
            }
        }

        match self.transmit_information(id, payload, now) {
            Ok(()) => Ok(()),
            Err((err, payload)) => {
                if err == WriteError::SecurityNotReady {
                    // Rekey in flight: park the write instead of losing it.
                    let ep = &mut self.endpoints[id as usize];
                    if ep.pending_tx.len() >= PENDING_LIMIT {
                        return Err(WriteError::QueueFull);
                    }
                    ep.pending_tx.push_back(payload);
                    return Ok(());
                }
                Err(err)
            }
        }
    }

    /// One-shot payload outside the ARQ window. System endpoint only.
    pub fn write_unnumbered(&mut self, payload: Vec<u8>) {
        self.counters.frames_sent += 1;
        self.egress.push_back(Frame::new(
            SYSTEM_ENDPOINT,
            Control::Unnumbered {
                kind: UnnumberedKind::Information,
            },
            payload,
        ));
    }

    /// Pops the next in-order payload delivered on an endpoint.
    #[inline]
    pub fn read(&mut self, id: u8) -> Option<Vec<u8>> {
        self.endpoints[id as usize].rx_queue.pop_front()
    }

    #[inline]
    pub fn has_rx(&self, id: u8) -> bool {
        !self.endpoints[id as usize].rx_queue.is_empty()
    }

    #[inline]
    pub fn poll_transmit(&mut self) -> Option<Frame> {
        self.egress.pop_front()
    }

    #[inline]
    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    /// True once every endpoint finished closing; used on shutdown.
    pub fn all_closed(&self) -> bool {
        self.endpoints
            .iter()
            .all(|ep| !matches!(ep.state, State::Open | State::Closing))
    }

    /// Begins an orderly shutdown: every open endpoint gets a U-Reset.
    pub fn shutdown(&mut self, now: Instant) {
        let open: Vec<u8> = self
            .endpoints
            .iter()
            .filter(|ep| ep.state == State::Open)
            .map(|ep| ep.id)
            .collect();

        for id in open {
            self.close(id, now);
        }
    }

    /// Resets the whole link: requests a peer reset and tears every endpoint
    /// down. The daemon re-runs discovery afterwards.
    pub fn reset_link(&mut self, now: Instant) {
        logging::warn!(self.log, "resetting link");
        self.push_unnumbered(SYSTEM_ENDPOINT, UnnumberedKind::Reset);
        self.teardown(now);
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    /// Feeds one framer event into the protocol machine.
    pub fn on_decode_event(&mut self, event: DecodeEvent, now: Instant) {
        match event {
            DecodeEvent::Frame(frame) => self.on_frame(frame, now),
            DecodeEvent::CorruptPayload { address, .. } => {
                self.counters.crc_drops += 1;
                if self.is_operational(address) {
                    let ack = self.endpoints[address as usize].expected_rx;
                    logging::debug!(self.log, "payload crc mismatch, rejecting";
                                    "endpoint" => address, "ack" => ack);
                    self.push_supervisory(address, SupervisoryKind::Reject, ack);
                }
            }
            DecodeEvent::InvalidControl { address, raw } => {
                logging::warn!(self.log, "invalid control byte";
                               "endpoint" => address, "control" => raw);
                self.violation(now);
            }
            DecodeEvent::Garbage(count) => {
                self.counters.garbage_bytes += count as u64;
            }
        }
    }

    fn on_frame(&mut self, frame: Frame, now: Instant) {
        let id = frame.address;

        if id == RESERVED_ENDPOINT {
            self.violation(now);
            return;
        }

        self.counters.frames_received += 1;

        match frame.control {
            Control::Information { seq, ack, .. } => {
                self.on_information(id, frame.control, seq, ack, frame.payload, now)
            }
            Control::Supervisory { kind, ack, .. } => match kind {
                SupervisoryKind::ReceiveReady => self.process_ack(id, ack, now),
                SupervisoryKind::Reject => self.on_reject(id, ack, now),
            },
            Control::Unnumbered { kind } => match kind {
                UnnumberedKind::Reset => self.on_peer_reset(id, now),
                UnnumberedKind::Ack => self.on_unnumbered_ack(id, now),
                UnnumberedKind::Information => self.on_unnumbered_information(id, frame.payload, now),
                UnnumberedKind::PollFinal => {
                    // Liveness poll: answer with the current receive state.
                    if self.is_operational(id) {
                        let ack = self.endpoints[id as usize].expected_rx;
                        self.push_supervisory(id, SupervisoryKind::ReceiveReady, ack);
                    }
                }
            },
        }
    }

    fn on_information(
        &mut self,
        id: u8,
        control: Control,
        seq: u8,
        ack: u8,
        payload: Vec<u8>,
        now: Instant,
    ) {
        let state = self.endpoints[id as usize].state;

        if !matches!(state, State::Open | State::Closing) {
            logging::debug!(self.log, "I-frame for inactive endpoint dropped";
                            "endpoint" => id, "seq" => seq);
            return;
        }

        self.process_ack(id, ack, now);

        if state != State::Open || self.endpoints[id as usize].awaiting_uack {
            // Closing endpoints still ack but deliver nothing new.
            return;
        }

        let expected = self.endpoints[id as usize].expected_rx;

        if seq != expected {
            let behind = Endpoint::seq_distance(seq, expected);
            if behind != 0 && behind <= self.cfg.tx_window {
                // Duplicate: our ack got lost, repeat it right away.
                logging::debug!(self.log, "duplicate I-frame";
                                "endpoint" => id, "seq" => seq, "expected" => expected);
                self.push_supervisory(id, SupervisoryKind::ReceiveReady, expected);
            } else {
                // Gap: ask for the missing frame; nothing is buffered out of
                // order.
                logging::debug!(self.log, "out-of-order I-frame";
                                "endpoint" => id, "seq" => seq, "expected" => expected);
                self.push_supervisory(id, SupervisoryKind::Reject, expected);
            }
            return;
        }

        let plain = if self.encrypted(id) {
            let ad = encode_header(id, control, payload.len() as u16);
            match self.session.decrypt(id, &ad, &payload) {
                Ok(plain) => plain,
                Err(CipherError::AuthFailed) => {
                    self.on_security_incident(id, now);
                    return;
                }
                Err(CipherError::NotReady) => {
                    // Session tearing down; the peer will retransmit once a
                    // fresh key is in place.
                    return;
                }
            }
        } else {
            payload
        };

        let ack_delay = self.cfg.ack_delay;
        let ep = &mut self.endpoints[id as usize];
        ep.expected_rx = Endpoint::next_in_seq(expected);
        ep.frames_received += 1;
        ep.rx_queue.push_back(plain);

        let arm_ack = !ep.ack_pending;
        ep.ack_pending = true;

        self.events.push_back(LinkEvent::Delivered(id));
        if arm_ack {
            self.events.push_back(LinkEvent::SetTimer {
                endpoint: id,
                timer: EndpointTimer::DelayedAck,
                delay: ack_delay,
            });
        }
    }

    /// Removes every frame acknowledged by `ack` from the retransmit queue.
    fn process_ack(&mut self, id: u8, ack: u8, now: Instant) {
        self.absorb_ack(id, ack);
        self.drain_pending(id, now);
    }

    fn absorb_ack(&mut self, id: u8, ack: u8) {
        let base_rto = self.cfg.rto;
        let drained;
        {
            let ep = &mut self.endpoints[id as usize];
            let oldest = match ep.retransmit.front() {
                Some(frame) => frame.seq,
                None => return,
            };

            let count = Endpoint::seq_distance(oldest, ack);
            if count == 0 {
                return;
            }
            if count as usize > ep.retransmit.len() {
                // Stale ack from before a reset.
                self.counters.spurious_acks += 1;
                return;
            }

            for _ in 0..count {
                ep.retransmit.pop_front();
            }

            // Forward progress: backoff starts over.
            ep.rto = base_rto;
            drained = ep.retransmit.is_empty();
        }

        if drained {
            self.events.push_back(LinkEvent::ClearTimer {
                endpoint: id,
                timer: EndpointTimer::Retransmit,
            });
        } else {
            self.events.push_back(LinkEvent::SetTimer {
                endpoint: id,
                timer: EndpointTimer::Retransmit,
                delay: base_rto,
            });
        }
    }

    fn on_reject(&mut self, id: u8, ack: u8, now: Instant) {
        self.counters.rejects_received += 1;

        // Retransmissions must precede any newly released frames on the
        // wire, so the pending queue drains only afterwards.
        self.absorb_ack(id, ack);

        let frames: Vec<Frame> = {
            let ep = &self.endpoints[id as usize];
            match ep.retransmit.front() {
                // Rejecting a sequence that is already acknowledged (or an
                // empty window) is stale information.
                Some(front) if front.seq == ack => {
                    ep.retransmit.iter().map(|p| p.frame.clone()).collect()
                }
                _ => Vec::new(),
            }
        };

        if frames.is_empty() {
            self.drain_pending(id, now);
            return;
        }

        logging::debug!(self.log, "reject received, retransmitting";
                        "endpoint" => id, "from_seq" => ack, "frames" => frames.len());

        let count = frames.len() as u64;
        self.endpoints[id as usize].retransmits += count;
        self.counters.retransmits += count;

        for frame in frames {
            self.egress.push_back(frame);
        }

        let delay = self.endpoints[id as usize].rto;
        self.events.push_back(LinkEvent::SetTimer {
            endpoint: id,
            timer: EndpointTimer::Retransmit,
            delay,
        });

        self.drain_pending(id, now);
    }

    fn on_peer_reset(&mut self, id: u8, now: Instant) {
        // A reset is always acknowledged, whatever our local state.
        self.push_unnumbered(id, UnnumberedKind::Ack);

        if id == SYSTEM_ENDPOINT {
            let ep = &self.endpoints[id as usize];
            if ep.awaiting_uack && ep.state == State::Open {
                // Simultaneous link bring-up: the peer's reset completes our
                // own request, no U-Ack is expected anymore.
                self.finish_open(id);
                return;
            }

            logging::warn!(self.log, "peer requested link reset");
            self.teardown(now);
            return;
        }

        let base_rto = self.cfg.rto;
        let ep = &mut self.endpoints[id as usize];

        match ep.state {
            State::Open if ep.awaiting_uack => {
                // Simultaneous reset: treat the peer's as authoritative and
                // finish the local open without waiting for our U-Ack.
                self.finish_open(id);
            }
            State::Open => {
                logging::info!(self.log, "peer reset endpoint"; "endpoint" => id);
                ep.reset_sequencing(base_rto);
                ep.pending_tx.clear();
                ep.rx_queue.clear();
                self.clear_endpoint_timers(id);
                self.events.push_back(LinkEvent::PeerReset(id));
            }
            State::Closing => {
                // The peer reset while we were closing: that completes it.
                self.finish_close(id, CloseReason::Remote);
            }
            _ => (),
        }
    }

    fn on_unnumbered_ack(&mut self, id: u8, _now: Instant) {
        let ep = &mut self.endpoints[id as usize];

        if !ep.awaiting_uack {
            logging::debug!(self.log, "stray U-Ack"; "endpoint" => id);
            return;
        }

        ep.awaiting_uack = false;
        ep.handshake_retries = 0;

        match ep.state {
            State::Closing => self.finish_close(id, CloseReason::Local),
            State::Open => self.finish_open(id),
            _ => (),
        }
    }

    fn on_unnumbered_information(&mut self, id: u8, payload: Vec<u8>, now: Instant) {
        if id != SYSTEM_ENDPOINT {
            self.violation(now);
            return;
        }

        self.endpoints[id as usize].rx_queue.push_back(payload);
        self.events.push_back(LinkEvent::Delivered(id));
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    pub fn on_timer(&mut self, id: u8, timer: EndpointTimer, now: Instant) {
        match timer {
            EndpointTimer::DelayedAck => {
                let ep = &mut self.endpoints[id as usize];
                if ep.ack_pending {
                    ep.ack_pending = false;
                    let ack = ep.expected_rx;
                    self.push_supervisory(id, SupervisoryKind::ReceiveReady, ack);
                }
            }
            EndpointTimer::Retransmit => self.on_retransmit_timer(id, now),
        }
    }

    fn on_retransmit_timer(&mut self, id: u8, _now: Instant) {
        let max_retries = self.cfg.max_retries;
        let max_rto = self.cfg.max_rto;

        // Handshake retry path: the U-Reset itself is unacknowledged.
        if self.endpoints[id as usize].awaiting_uack {
            let (give_up, delay) = {
                let ep = &mut self.endpoints[id as usize];
                ep.handshake_retries += 1;
                if ep.handshake_retries > max_retries {
                    (true, Duration::from_millis(0))
                } else {
                    ep.rto = (ep.rto * 2).min(max_rto);
                    (false, ep.rto)
                }
            };

            if give_up {
                let closing = self.endpoints[id as usize].state == State::Closing;
                if closing {
                    // Peer never confirmed the close; release locally.
                    self.finish_close(id, CloseReason::Local);
                } else {
                    self.fail_endpoint(id, ErrorReason::DestUnreach);
                }
                return;
            }

            self.push_unnumbered(id, UnnumberedKind::Reset);
            self.events.push_back(LinkEvent::SetTimer {
                endpoint: id,
                timer: EndpointTimer::Retransmit,
                delay,
            });
            return;
        }

        let (frame, delay) = {
            let ep = &mut self.endpoints[id as usize];
            let front = match ep.retransmit.front_mut() {
                Some(front) => front,
                None => return, // timer raced the final ack
            };

            front.retries += 1;
            if front.retries > max_retries {
                (None, Duration::from_millis(0))
            } else {
                let frame = front.frame.clone();
                ep.rto = (ep.rto * 2).min(max_rto);
                ep.retransmits += 1;
                (Some(frame), ep.rto)
            }
        };

        match frame {
            None => {
                logging::warn!(self.log, "retry budget exhausted"; "endpoint" => id);
                self.fail_endpoint(id, ErrorReason::FaultNoAck);
            }
            Some(frame) => {
                logging::debug!(self.log, "retransmitting"; "endpoint" => id,
                                "next_delay_ms" => delay.as_millis() as u64);
                self.counters.retransmits += 1;
                self.egress.push_back(frame);
                self.events.push_back(LinkEvent::SetTimer {
                    endpoint: id,
                    timer: EndpointTimer::Retransmit,
                    delay,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Send path internals
    // ------------------------------------------------------------------

    /// Builds, optionally encrypts and queues one I-frame. On failure the
    /// payload is handed back so callers can park it.
    fn transmit_information(
        &mut self,
        id: u8,
        plain: Vec<u8>,
        _now: Instant,
    ) -> Result<(), (WriteError, Vec<u8>)> {
        let (seq, ack) = {
            let ep = &self.endpoints[id as usize];
            (ep.next_seq, ep.expected_rx)
        };

        let control = Control::Information {
            seq,
            ack,
            poll: true,
        };

        let payload = if self.encrypted(id) {
            let ad = encode_header(id, control, (plain.len() + crypto::MAC_SIZE) as u16);
            match self.session.encrypt(id, &ad, &plain) {
                Ok(cipher) => cipher,
                Err(_) => return Err((WriteError::SecurityNotReady, plain)),
            }
        } else {
            plain
        };

        let frame = Frame::new(id, control, payload);

        let (arm, delay) = {
            let ep = &mut self.endpoints[id as usize];
            ep.retransmit.push_back(PendingFrame {
                frame: frame.clone(),
                seq,
                retries: 0,
            });
            ep.next_seq = Endpoint::next_in_seq(seq);
            ep.frames_sent += 1;

            // The frame piggybacks the current ack.
            if ep.ack_pending {
                ep.ack_pending = false;
                self.events.push_back(LinkEvent::ClearTimer {
                    endpoint: id,
                    timer: EndpointTimer::DelayedAck,
                });
            }

            (ep.retransmit.len() == 1, ep.rto)
        };

        self.counters.frames_sent += 1;
        self.egress.push_back(frame);

        if arm {
            self.events.push_back(LinkEvent::SetTimer {
                endpoint: id,
                timer: EndpointTimer::Retransmit,
                delay,
            });
        }

        Ok(())
    }

    /// Moves parked writes into the window while there is room.
    fn drain_pending(&mut self, id: u8, now: Instant) {
        let mut sent = false;

        loop {
            if !self.is_operational(id) {
                return;
            }

            let ep = &mut self.endpoints[id as usize];
            if ep.outstanding() >= self.cfg.tx_window {
                return;
            }

            let payload = match ep.pending_tx.pop_front() {
                Some(payload) => payload,
                None => break,
            };

            match self.transmit_information(id, payload, now) {
                Ok(()) => sent = true,
                Err((_, payload)) => {
                    self.endpoints[id as usize].pending_tx.push_front(payload);
                    return;
                }
            }
        }

        if sent {
            self.events.push_back(LinkEvent::Writable(id));
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle internals
    // ------------------------------------------------------------------

    fn finish_open(&mut self, id: u8) {
        let base_rto = self.cfg.rto;
        let ep = &mut self.endpoints[id as usize];
        ep.awaiting_uack = false;
        ep.handshake_retries = 0;
        ep.reset_sequencing(base_rto);

        logging::info!(self.log, "endpoint open"; "endpoint" => id);

        self.clear_endpoint_timers(id);
        self.events.push_back(LinkEvent::Opened(id));
    }

    fn finish_close(&mut self, id: u8, reason: CloseReason) {
        let base_rto = self.cfg.rto;
        let ep = &mut self.endpoints[id as usize];
        ep.state = State::Closed;
        ep.clear(base_rto);

        logging::info!(self.log, "endpoint closed"; "endpoint" => id);

        self.clear_endpoint_timers(id);
        self.events.push_back(LinkEvent::Closed {
            endpoint: id,
            reason,
        });
    }

    fn fail_endpoint(&mut self, id: u8, reason: ErrorReason) {
        let base_rto = self.cfg.rto;
        let ep = &mut self.endpoints[id as usize];
        // Retry exhaustion means the peer stopped answering: the connection
        // is lost, and the endpoint may reopen later. Other faults latch the
        // error state.
        ep.state = match reason {
            ErrorReason::FaultNoAck => State::ConnectionLost,
            reason => State::Error(reason),
        };
        let incidents = std::mem::take(&mut ep.incidents);
        ep.clear(base_rto);
        ep.incidents = incidents;

        logging::warn!(self.log, "endpoint failed"; "endpoint" => id,
                       "reason" => format!("{:?}", reason));

        self.clear_endpoint_timers(id);
        self.events.push_back(LinkEvent::Closed {
            endpoint: id,
            reason: CloseReason::Fault(reason),
        });
    }

    /// Tears down every endpoint after a link-level reset.
    fn teardown(&mut self, _now: Instant) {
        let base_rto = self.cfg.rto;

        for id in 0..=255u8 {
            let ep = &mut self.endpoints[id as usize];
            if matches!(ep.state, State::Closed) {
                continue;
            }

            ep.state = State::Closed;
            ep.clear(base_rto);
            self.clear_endpoint_timers(id);

            if id != SYSTEM_ENDPOINT && id != SECURITY_ENDPOINT {
                self.events.push_back(LinkEvent::Closed {
                    endpoint: id,
                    reason: CloseReason::ConnectionLost,
                });
            }
        }

        self.events.push_back(LinkEvent::LinkDown);
    }

    fn on_security_incident(&mut self, id: u8, now: Instant) {
        // The peer (or an attacker) sent an unauthentic payload: ask for a
        // retransmission and keep score.
        let ack = self.endpoints[id as usize].expected_rx;
        self.push_supervisory(id, SupervisoryKind::Reject, ack);

        let escalate = {
            let ep = &mut self.endpoints[id as usize];
            ep.incidents.push_back(now);
            while let Some(&first) = ep.incidents.front() {
                if now.duration_since(first) > INCIDENT_WINDOW {
                    ep.incidents.pop_front();
                } else {
                    break;
                }
            }
            ep.incidents.len() >= INCIDENT_LIMIT
        };

        logging::warn!(self.log, "authentication failure"; "endpoint" => id);

        if escalate {
            self.fail_endpoint(id, ErrorReason::SecurityIncident);
            self.events.push_back(LinkEvent::SecurityIncident(id));
        }
    }

    fn violation(&mut self, now: Instant) {
        self.counters.violations += 1;
        self.violations.push_back(now);

        while let Some(&first) = self.violations.front() {
            if now.duration_since(first) > VIOLATION_WINDOW {
                self.violations.pop_front();
            } else {
                break;
            }
        }

        if self.violations.len() >= VIOLATION_LIMIT {
            logging::warn!(self.log, "protocol violation threshold exceeded");
            self.violations.clear();
            self.reset_link(now);
        }
    }

    // ------------------------------------------------------------------
    // Frame emission helpers
    // ------------------------------------------------------------------

    fn push_supervisory(&mut self, id: u8, kind: SupervisoryKind, ack: u8) {
        if kind == SupervisoryKind::Reject {
            self.counters.rejects_sent += 1;
        }
        self.counters.frames_sent += 1;
        self.egress.push_back(Frame::control_only(
            id,
            Control::Supervisory {
                kind,
                ack,
                fin: false,
            },
        ));
    }

    fn push_unnumbered(&mut self, id: u8, kind: UnnumberedKind) {
        self.counters.frames_sent += 1;
        self.egress
            .push_back(Frame::control_only(id, Control::Unnumbered { kind }));
    }

    fn clear_endpoint_timers(&mut self, id: u8) {
        self.events.push_back(LinkEvent::ClearTimer {
            endpoint: id,
            timer: EndpointTimer::Retransmit,
        });
        self.events.push_back(LinkEvent::ClearTimer {
            endpoint: id,
            timer: EndpointTimer::DelayedAck,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::PlainLink;

    fn link() -> LinkCore {
        LinkCore::new(LinkConfig::default(), Box::new(PlainLink), None)
    }

    fn now() -> Instant {
        Instant::now()
    }

    fn drain_frames(link: &mut LinkCore) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = link.poll_transmit() {
            frames.push(frame);
        }
        frames
    }

    fn drain_events(link: &mut LinkCore) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        while let Some(event) = link.poll_event() {
            events.push(event);
        }
        events
    }

    fn uack(id: u8) -> Frame {
        Frame::control_only(
            id,
            Control::Unnumbered {
                kind: UnnumberedKind::Ack,
            },
        )
    }

    fn open_endpoint(link: &mut LinkCore, id: u8, at: Instant) {
        link.open(id, at).unwrap();
        let frames = drain_frames(link);
        assert!(frames.iter().any(|f| matches!(
            f.control,
            Control::Unnumbered {
                kind: UnnumberedKind::Reset
            }
        )));
        link.on_frame(uack(id), at);
        let events = drain_events(link);
        assert!(events.contains(&LinkEvent::Opened(id)));
        assert!(link.is_operational(id));
    }

    fn information(id: u8, seq: u8, ack: u8, payload: &[u8]) -> Frame {
        Frame::new(
            id,
            Control::Information {
                seq,
                ack,
                poll: true,
            },
            payload.to_vec(),
        )
    }

    #[test]
    fn test_open_handshake() {
        let mut link = link();
        open_endpoint(&mut link, 3, now());
        assert_eq!(link.state(3), State::Open);
    }

    #[test]
    fn test_write_requires_open_endpoint() {
        let mut link = link();
        assert_eq!(
            link.write(3, b"data".to_vec(), now()),
            Err(WriteError::NotOpen)
        );
    }

    #[test]
    fn test_first_frame_after_open_has_zero_seq_and_ack() {
        let mut link = link();
        let at = now();
        open_endpoint(&mut link, 3, at);

        link.write(3, b"ping".to_vec(), at).unwrap();
        let frames = drain_frames(&mut link);

        assert_eq!(frames.len(), 1);
        match frames[0].control {
            Control::Information { seq, ack, poll } => {
                assert_eq!(seq, 0);
                assert_eq!(ack, 0);
                assert!(poll);
            }
            other => panic!("Unexpected control {:?}", other),
        }
    }

    #[test]
    fn test_window_backpressure() {
        let mut link = link();
        let at = now();
        open_endpoint(&mut link, 3, at);

        // Window is 4: four frames go on the wire, the fifth is parked.
        for i in 0..5u8 {
            link.write(3, vec![i], at).unwrap();
        }

        let frames = drain_frames(&mut link);
        assert_eq!(frames.len(), 4);

        // Acking the first frame releases the parked one.
        link.on_frame(
            Frame::control_only(
                3,
                Control::Supervisory {
                    kind: SupervisoryKind::ReceiveReady,
                    ack: 1,
                    fin: false,
                },
            ),
            at,
        );

        let frames = drain_frames(&mut link);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, vec![4]);

        let events = drain_events(&mut link);
        assert!(events.contains(&LinkEvent::Writable(3)));
    }

    #[test]
    fn test_in_order_delivery_and_duplicate_absorption() {
        let mut link = link();
        let at = now();
        open_endpoint(&mut link, 3, at);

        link.on_frame(information(3, 0, 0, b"one"), at);
        assert_eq!(link.read(3), Some(b"one".to_vec()));

        // The retransmitted duplicate is absorbed and re-acked.
        link.on_frame(information(3, 0, 0, b"one"), at);
        assert_eq!(link.read(3), None);

        let frames = drain_frames(&mut link);
        let rr: Vec<_> = frames
            .iter()
            .filter(|f| {
                matches!(
                    f.control,
                    Control::Supervisory {
                        kind: SupervisoryKind::ReceiveReady,
                        ack: 1,
                        ..
                    }
                )
            })
            .collect();
        assert_eq!(rr.len(), 1);
    }

    #[test]
    fn test_gap_triggers_reject() {
        let mut link = link();
        let at = now();
        open_endpoint(&mut link, 3, at);

        link.on_frame(information(3, 2, 0, b"ahead"), at);
        assert_eq!(link.read(3), None);

        let frames = drain_frames(&mut link);
        assert!(frames.iter().any(|f| matches!(
            f.control,
            Control::Supervisory {
                kind: SupervisoryKind::Reject,
                ack: 0,
                ..
            }
        )));
        assert_eq!(link.counters().rejects_sent, 1);
    }

    #[test]
    fn test_reject_retransmits_from_requested_seq() {
        let mut link = link();
        let at = now();
        open_endpoint(&mut link, 3, at);

        link.write(3, b"a".to_vec(), at).unwrap();
        link.write(3, b"b".to_vec(), at).unwrap();
        drain_frames(&mut link);

        link.on_frame(
            Frame::control_only(
                3,
                Control::Supervisory {
                    kind: SupervisoryKind::Reject,
                    ack: 0,
                    fin: false,
                },
            ),
            at,
        );

        let frames = drain_frames(&mut link);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, b"a".to_vec());
        assert_eq!(frames[1].payload, b"b".to_vec());
        assert_eq!(link.counters().retransmits, 2);
    }

    #[test]
    fn test_stale_reject_is_ignored() {
        let mut link = link();
        let at = now();
        open_endpoint(&mut link, 3, at);

        link.write(3, b"a".to_vec(), at).unwrap();
        drain_frames(&mut link);

        // Frame 0 gets acked…
        link.on_frame(
            Frame::control_only(
                3,
                Control::Supervisory {
                    kind: SupervisoryKind::ReceiveReady,
                    ack: 1,
                    fin: false,
                },
            ),
            at,
        );

        // …then a stale REJ(0) arrives.
        link.on_frame(
            Frame::control_only(
                3,
                Control::Supervisory {
                    kind: SupervisoryKind::Reject,
                    ack: 0,
                    fin: false,
                },
            ),
            at,
        );

        assert!(drain_frames(&mut link).is_empty());
        assert_eq!(link.counters().retransmits, 0);
    }

    #[test]
    fn test_retransmit_backoff_then_connection_lost() {
        let mut link = link();
        let at = now();
        open_endpoint(&mut link, 3, at);
        drain_events(&mut link);

        link.write(3, b"lost".to_vec(), at).unwrap();
        drain_frames(&mut link);

        let mut delays = Vec::new();
        for _ in 0..5 {
            link.on_timer(3, EndpointTimer::Retransmit, at);
            let frames = drain_frames(&mut link);
            assert_eq!(frames.len(), 1, "each expiry resends the frame once");
            for event in drain_events(&mut link) {
                if let LinkEvent::SetTimer {
                    timer: EndpointTimer::Retransmit,
                    delay,
                    ..
                } = event
                {
                    delays.push(delay.as_millis() as u64);
                }
            }
        }

        assert_eq!(delays, vec![200, 400, 800, 1600, 3200]);

        // The sixth expiry exhausts the budget.
        link.on_timer(3, EndpointTimer::Retransmit, at);
        assert_eq!(link.state(3), State::ConnectionLost);
        assert!(drain_events(&mut link).contains(&LinkEvent::Closed {
            endpoint: 3,
            reason: CloseReason::Fault(ErrorReason::FaultNoAck),
        }));
    }

    #[test]
    fn test_delayed_ack_fires_rr() {
        let mut link = link();
        let at = now();
        open_endpoint(&mut link, 3, at);
        drain_events(&mut link);

        link.on_frame(information(3, 0, 0, b"data"), at);

        let events = drain_events(&mut link);
        assert!(events.iter().any(|e| matches!(
            e,
            LinkEvent::SetTimer {
                timer: EndpointTimer::DelayedAck,
                ..
            }
        )));

        drain_frames(&mut link);
        link.on_timer(3, EndpointTimer::DelayedAck, at);

        let frames = drain_frames(&mut link);
        assert!(frames.iter().any(|f| matches!(
            f.control,
            Control::Supervisory {
                kind: SupervisoryKind::ReceiveReady,
                ack: 1,
                ..
            }
        )));
    }

    #[test]
    fn test_outgoing_frame_piggybacks_ack_and_cancels_timer() {
        let mut link = link();
        let at = now();
        open_endpoint(&mut link, 3, at);
        drain_events(&mut link);

        link.on_frame(information(3, 0, 0, b"in"), at);
        drain_frames(&mut link);
        drain_events(&mut link);

        link.write(3, b"out".to_vec(), at).unwrap();

        let frames = drain_frames(&mut link);
        match frames[0].control {
            Control::Information { ack, .. } => assert_eq!(ack, 1),
            other => panic!("Unexpected control {:?}", other),
        }

        let events = drain_events(&mut link);
        assert!(events.contains(&LinkEvent::ClearTimer {
            endpoint: 3,
            timer: EndpointTimer::DelayedAck,
        }));
    }

    #[test]
    fn test_peer_reset_restarts_sequencing() {
        let mut link = link();
        let at = now();
        open_endpoint(&mut link, 4, at);

        link.write(4, b"a".to_vec(), at).unwrap();
        link.write(4, b"b".to_vec(), at).unwrap();
        drain_frames(&mut link);
        drain_events(&mut link);

        link.on_frame(
            Frame::control_only(
                4,
                Control::Unnumbered {
                    kind: UnnumberedKind::Reset,
                },
            ),
            at,
        );

        // The reset is acknowledged and the endpoint restarts at seq 0.
        let frames = drain_frames(&mut link);
        assert!(frames.iter().any(|f| matches!(
            f.control,
            Control::Unnumbered {
                kind: UnnumberedKind::Ack
            }
        )));
        assert!(drain_events(&mut link).contains(&LinkEvent::PeerReset(4)));

        link.write(4, b"fresh".to_vec(), at).unwrap();
        let frames = drain_frames(&mut link);
        match frames[0].control {
            Control::Information { seq, ack, .. } => {
                assert_eq!(seq, 0);
                assert_eq!(ack, 0);
            }
            other => panic!("Unexpected control {:?}", other),
        }
    }

    #[test]
    fn test_simultaneous_reset_tiebreak() {
        let mut link = link();
        let at = now();

        // Local open request in flight…
        link.open(6, at).unwrap();
        drain_frames(&mut link);
        drain_events(&mut link);

        // …and the peer's own reset crosses it on the wire.
        link.on_frame(
            Frame::control_only(
                6,
                Control::Unnumbered {
                    kind: UnnumberedKind::Reset,
                },
            ),
            at,
        );

        let events = drain_events(&mut link);
        assert!(events.contains(&LinkEvent::Opened(6)));
        assert!(link.is_operational(6));

        // The peer's reset was acknowledged.
        let frames = drain_frames(&mut link);
        assert!(frames.iter().any(|f| matches!(
            f.control,
            Control::Unnumbered {
                kind: UnnumberedKind::Ack
            }
        )));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut link = link();
        let at = now();
        link.close(9, at);
        assert_eq!(link.state(9), State::Closed);
        assert!(drain_frames(&mut link).is_empty());
    }

    #[test]
    fn test_close_handshake() {
        let mut link = link();
        let at = now();
        open_endpoint(&mut link, 3, at);
        drain_events(&mut link);

        link.close(3, at);
        assert_eq!(link.state(3), State::Closing);
        assert_eq!(
            link.write(3, b"late".to_vec(), at),
            Err(WriteError::NotOpen)
        );

        link.on_frame(uack(3), at);
        assert_eq!(link.state(3), State::Closed);
        assert!(drain_events(&mut link).contains(&LinkEvent::Closed {
            endpoint: 3,
            reason: CloseReason::Local,
        }));
    }

    #[test]
    fn test_link_reset_tears_down_endpoints() {
        let mut link = link();
        let at = now();
        open_endpoint(&mut link, 3, at);
        open_endpoint(&mut link, 4, at);
        drain_events(&mut link);

        link.on_frame(
            Frame::control_only(
                SYSTEM_ENDPOINT,
                Control::Unnumbered {
                    kind: UnnumberedKind::Reset,
                },
            ),
            at,
        );

        let events = drain_events(&mut link);
        assert!(events.contains(&LinkEvent::LinkDown));
        assert!(events.contains(&LinkEvent::Closed {
            endpoint: 3,
            reason: CloseReason::ConnectionLost,
        }));
        assert_eq!(link.state(3), State::Closed);
        assert_eq!(link.state(4), State::Closed);
    }

    #[test]
    fn test_violation_threshold_resets_link() {
        let mut link = link();
        let at = now();
        open_endpoint(&mut link, 3, at);
        drain_events(&mut link);
        drain_frames(&mut link);

        for _ in 0..VIOLATION_LIMIT {
            link.on_decode_event(
                DecodeEvent::InvalidControl {
                    address: 3,
                    raw: 0xff,
                },
                at,
            );
        }

        let events = drain_events(&mut link);
        assert!(events.contains(&LinkEvent::LinkDown));

        // The reset request went to the peer.
        let frames = drain_frames(&mut link);
        assert!(frames.iter().any(|f| f.address == SYSTEM_ENDPOINT
            && matches!(
                f.control,
                Control::Unnumbered {
                    kind: UnnumberedKind::Reset
                }
            )));
    }

    #[test]
    fn test_corrupt_payload_triggers_reject() {
        let mut link = link();
        let at = now();
        open_endpoint(&mut link, 3, at);
        drain_frames(&mut link);

        link.on_decode_event(
            DecodeEvent::CorruptPayload {
                address: 3,
                control: Control::Information {
                    seq: 2,
                    ack: 0,
                    poll: true,
                },
            },
            at,
        );

        let frames = drain_frames(&mut link);
        assert!(frames.iter().any(|f| matches!(
            f.control,
            Control::Supervisory {
                kind: SupervisoryKind::Reject,
                ack: 0,
                ..
            }
        )));
        assert_eq!(link.counters().crc_drops, 1);
    }

    #[test]
    fn test_reserved_endpoint_is_rejected() {
        let mut link = link();
        assert_eq!(
            link.open(RESERVED_ENDPOINT, now()),
            Err(OpenError::ReservedEndpoint)
        );
    }

    #[test]
    fn test_outstanding_never_exceeds_window() {
        let mut link = link();
        let at = now();
        open_endpoint(&mut link, 3, at);

        for i in 0..20u8 {
            let _ = link.write(3, vec![i], at);
        }

        assert!(drain_frames(&mut link).len() <= 4);
    }
}
