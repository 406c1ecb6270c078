//! Per-endpoint ARQ and lifecycle state. All fields are owned by the link
//! core; nothing here touches I/O or timers directly.

use crate::frame::Frame;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const SYSTEM_ENDPOINT: u8 = 0;
pub const SECURITY_ENDPOINT: u8 = 14;
pub const RESERVED_ENDPOINT: u8 = 15;

/// Sequence numbers are modulo 8; the window must stay below the modulus so
/// duplicates and gaps remain distinguishable.
pub const SEQ_MOD: u8 = 8;
pub const MAX_WINDOW: u8 = 7;

/// Writes queued beyond the open window before the daemon pushes back.
pub(crate) const PENDING_LIMIT: usize = 64;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorReason {
    RemoteError,
    SecurityIncident,
    FaultNoAck,
    DestUnreach,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    Closed,
    Open,
    Closing,
    ConnectionLost,
    Error(ErrorReason),
}

/// An I-frame waiting for its acknowledgement. The frame is kept exactly as
/// first emitted: an encrypted payload authenticates its header, so a
/// retransmission must be byte-identical to the original.
#[derive(Debug)]
pub(crate) struct PendingFrame {
    pub frame: Frame,
    pub seq: u8,
    pub retries: u8,
}

#[derive(Debug)]
pub(crate) struct Endpoint {
    pub id: u8,
    pub state: State,
    /// Next sequence number to allocate for an outgoing I-frame.
    pub next_seq: u8,
    /// Next in-order sequence number expected from the peer; doubles as the
    /// ack number we advertise.
    pub expected_rx: u8,
    pub retransmit: VecDeque<PendingFrame>,
    /// Writes accepted but not yet inside the window.
    pub pending_tx: VecDeque<Vec<u8>>,
    /// In-order payloads awaiting delivery to the local client.
    pub rx_queue: VecDeque<Vec<u8>>,
    /// Current retransmission timeout; doubles on every expiry.
    pub rto: Duration,
    /// A delayed-ack timer is armed and no ack has been piggybacked yet.
    pub ack_pending: bool,
    /// An open or close handshake is waiting for the peer's U-Ack.
    pub awaiting_uack: bool,
    pub handshake_retries: u8,
    /// AEAD tag failures within the incident window.
    pub incidents: VecDeque<Instant>,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub retransmits: u64,
}

impl Endpoint {
    pub fn new(id: u8, base_rto: Duration) -> Endpoint {
        Endpoint {
            id,
            state: State::Closed,
            next_seq: 0,
            expected_rx: 0,
            retransmit: VecDeque::new(),
            pending_tx: VecDeque::new(),
            rx_queue: VecDeque::new(),
            rto: base_rto,
            ack_pending: false,
            awaiting_uack: false,
            handshake_retries: 0,
            incidents: VecDeque::new(),
            frames_sent: 0,
            frames_received: 0,
            retransmits: 0,
        }
    }

    #[inline]
    pub fn outstanding(&self) -> u8 {
        self.retransmit.len() as u8
    }

    /// Sequence numbers always restart from zero when an endpoint (re)opens.
    pub fn reset_sequencing(&mut self, base_rto: Duration) {
        self.next_seq = 0;
        self.expected_rx = 0;
        self.retransmit.clear();
        self.rto = base_rto;
        self.ack_pending = false;
    }

    /// Drops every queue and handshake flag; used on close and link reset.
    pub fn clear(&mut self, base_rto: Duration) {
        self.reset_sequencing(base_rto);
        self.pending_tx.clear();
        self.rx_queue.clear();
        self.awaiting_uack = false;
        self.handshake_retries = 0;
        self.incidents.clear();
    }

    /// Distance from `from` up to `to` in sequence space.
    #[inline]
    pub fn seq_distance(from: u8, to: u8) -> u8 {
        to.wrapping_sub(from) % SEQ_MOD
    }

    #[inline]
    pub fn next_in_seq(seq: u8) -> u8 {
        (seq + 1) % SEQ_MOD
    }
}
