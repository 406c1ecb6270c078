//! Control plane carried on the system endpoint (id 0): a property get/set
//! protocol for interrogating the secondary, plus unsolicited notifications
//! the secondary fires outside the ARQ window (U-Information frames).
//!
//! Message layout, little-endian: `command(u8) | tid(u8) | property(u32) |
//! value...`. Replies echo the transaction id of the query they answer;
//! unsolicited notifications carry tid 0.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ingot::logging::{self, Logger};
use std::io::Cursor;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SystemCommand {
    NoOp = 0,
    Reset = 1,
    PropertyGet = 2,
    PropertySet = 3,
    /// Carries a property value, either answering a get/set or unsolicited.
    PropertyIs = 4,
}

impl SystemCommand {
    fn from_u8(value: u8) -> Option<SystemCommand> {
        Some(match value {
            0 => SystemCommand::NoOp,
            1 => SystemCommand::Reset,
            2 => SystemCommand::PropertyGet,
            3 => SystemCommand::PropertySet,
            4 => SystemCommand::PropertyIs,
            _ => return None,
        })
    }
}

pub mod property {
    pub const PROTOCOL_VERSION: u32 = 0x01;
    pub const CAPABILITIES: u32 = 0x02;
    pub const BOOTLOADER_INFO: u32 = 0x03;
    pub const RX_CAPABILITY: u32 = 0x04;
    pub const LAST_RESET_CAUSE: u32 = 0x05;

    const ENDPOINT_STATE_BASE: u32 = 0x1000;

    /// Property id of the remote state of one endpoint.
    #[inline]
    pub fn endpoint_state(endpoint: u8) -> u32 {
        ENDPOINT_STATE_BASE | endpoint as u32
    }

    /// Inverse of [`endpoint_state`].
    #[inline]
    pub fn as_endpoint_state(property: u32) -> Option<u8> {
        if property & !0xff == ENDPOINT_STATE_BASE {
            Some((property & 0xff) as u8)
        } else {
            None
        }
    }
}

/// Endpoint state as reported by the secondary.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RemoteEndpointState {
    Closed = 0,
    Open = 1,
    Error = 2,
}

impl RemoteEndpointState {
    fn from_u8(value: u8) -> Option<RemoteEndpointState> {
        Some(match value {
            0 => RemoteEndpointState::Closed,
            1 => RemoteEndpointState::Open,
            2 => RemoteEndpointState::Error,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SystemMessage {
    pub command: SystemCommand,
    pub tid: u8,
    pub property: u32,
    pub value: Vec<u8>,
}

impl SystemMessage {
    pub fn new(command: SystemCommand, tid: u8, property: u32, value: Vec<u8>) -> SystemMessage {
        SystemMessage {
            command,
            tid,
            property,
            value,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.value.len());
        out.push(self.command as u8);
        out.push(self.tid);
        out.write_u32::<LittleEndian>(self.property)
            .expect("writing to a Vec cannot fail");
        out.extend_from_slice(&self.value);
        out
    }

    pub fn decode(raw: &[u8]) -> Option<SystemMessage> {
        if raw.len() < 6 {
            return None;
        }

        let command = SystemCommand::from_u8(raw[0])?;
        let tid = raw[1];
        let property = Cursor::new(&raw[2..6]).read_u32::<LittleEndian>().ok()?;

        Some(SystemMessage {
            command,
            tid,
            property,
            value: raw[6..].to_vec(),
        })
    }
}

/// Why a query was issued; echoed back so the daemon knows what to resume.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum QueryContext {
    /// A local client wants the endpoint; accept it once the peer side is open.
    ClientOpen,
    /// Startup discovery or an operator status request.
    Diagnostic,
}

#[derive(Debug, Eq, PartialEq)]
pub enum SystemEvent {
    EndpointState {
        endpoint: u8,
        state: RemoteEndpointState,
        context: QueryContext,
    },
    ProtocolVersion(u8),
    Capabilities(u32),
    RxCapability(u16),
    LastResetCause(u32),
    BootloaderInfo(Vec<u8>),
    /// Unsolicited: the secondary opened one of its endpoints.
    PeerEndpointOpened(u8),
    /// Unsolicited: the secondary closed one of its endpoints.
    PeerEndpointClosed(u8),
    /// Unsolicited: the secondary reset and reports the cause.
    PeerReset { cause: u32 },
}

struct PendingQuery {
    tid: u8,
    property: u32,
    context: QueryContext,
}

/// Host half of the system endpoint. Produces encoded queries for the link
/// and turns inbound payloads into typed events.
pub struct SystemEndpoint {
    next_tid: u8,
    pending: Vec<PendingQuery>,
    log: Logger,
}

impl SystemEndpoint {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> SystemEndpoint {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("unit" => "system")),
            None => logging::discard(),
        };

        SystemEndpoint {
            next_tid: 1,
            pending: Vec::new(),
            log,
        }
    }

    fn allocate_tid(&mut self) -> u8 {
        let tid = self.next_tid;
        // tid 0 is reserved for unsolicited notifications.
        self.next_tid = match self.next_tid.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        tid
    }

    /// Encoded query for the remote state of an endpoint.
    pub fn query_endpoint_state(&mut self, endpoint: u8, context: QueryContext) -> Vec<u8> {
        self.query(property::endpoint_state(endpoint), context)
    }

    /// Encoded query for an arbitrary property.
    pub fn query_property(&mut self, property: u32) -> Vec<u8> {
        self.query(property, QueryContext::Diagnostic)
    }

    fn query(&mut self, property: u32, context: QueryContext) -> Vec<u8> {
        let tid = self.allocate_tid();
        self.pending.push(PendingQuery {
            tid,
            property,
            context,
        });

        SystemMessage::new(SystemCommand::PropertyGet, tid, property, Vec::new()).encode()
    }

    /// Fire-and-forget reset announcement, sent as a U-Information frame at
    /// link bring-up so the secondary drops any stale state.
    pub fn announce_reset(&self) -> Vec<u8> {
        SystemMessage::new(SystemCommand::Reset, 0, 0, Vec::new()).encode()
    }

    /// Number of queries still waiting for a reply.
    #[inline]
    pub fn pending_queries(&self) -> usize {
        self.pending.len()
    }

    /// Drops in-flight queries; used on link reset.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Feeds in one payload received on the system endpoint.
    pub fn on_payload(&mut self, raw: &[u8]) -> Option<SystemEvent> {
        let message = match SystemMessage::decode(raw) {
            Some(message) => message,
            None => {
                logging::warn!(self.log, "malformed system message"; "len" => raw.len());
                return None;
            }
        };

        match message.command {
            SystemCommand::PropertyIs => self.on_property_is(message),
            SystemCommand::Reset => {
                let cause = Cursor::new(&message.value[..])
                    .read_u32::<LittleEndian>()
                    .unwrap_or(0);
                Some(SystemEvent::PeerReset { cause })
            }
            SystemCommand::NoOp => None,
            SystemCommand::PropertyGet | SystemCommand::PropertySet => {
                // The secondary does not interrogate the host.
                logging::debug!(self.log, "ignoring property request from peer";
                                "property" => message.property);
                None
            }
        }
    }

    fn on_property_is(&mut self, message: SystemMessage) -> Option<SystemEvent> {
        let context = match self
            .pending
            .iter()
            .position(|p| p.tid == message.tid && p.property == message.property)
        {
            Some(index) => Some(self.pending.swap_remove(index).context),
            None => None,
        };

        if let Some(endpoint) = property::as_endpoint_state(message.property) {
            let state = RemoteEndpointState::from_u8(*message.value.first()?)?;

            return match context {
                Some(context) => Some(SystemEvent::EndpointState {
                    endpoint,
                    state,
                    context,
                }),
                // Unsolicited endpoint state changes.
                None => match state {
                    RemoteEndpointState::Open => Some(SystemEvent::PeerEndpointOpened(endpoint)),
                    _ => Some(SystemEvent::PeerEndpointClosed(endpoint)),
                },
            };
        }

        let mut value = Cursor::new(&message.value[..]);
        match message.property {
            property::PROTOCOL_VERSION => {
                Some(SystemEvent::ProtocolVersion(*message.value.first()?))
            }
            property::CAPABILITIES => {
                Some(SystemEvent::Capabilities(value.read_u32::<LittleEndian>().ok()?))
            }
            property::RX_CAPABILITY => {
                Some(SystemEvent::RxCapability(value.read_u16::<LittleEndian>().ok()?))
            }
            property::LAST_RESET_CAUSE => {
                Some(SystemEvent::LastResetCause(value.read_u32::<LittleEndian>().ok()?))
            }
            property::BOOTLOADER_INFO => Some(SystemEvent::BootloaderInfo(message.value)),
            other => {
                logging::debug!(self.log, "unknown property in reply"; "property" => other);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(tid: u8, property: u32, value: Vec<u8>) -> Vec<u8> {
        SystemMessage::new(SystemCommand::PropertyIs, tid, property, value).encode()
    }

    #[test]
    fn test_message_roundtrip() {
        let message = SystemMessage::new(
            SystemCommand::PropertyGet,
            7,
            property::endpoint_state(3),
            vec![1, 2, 3],
        );
        assert_eq!(SystemMessage::decode(&message.encode()), Some(message));
    }

    #[test]
    fn test_decode_rejects_short_message() {
        assert_eq!(SystemMessage::decode(&[4, 0, 1]), None);
    }

    #[test]
    fn test_endpoint_state_query_reply() {
        let mut system = SystemEndpoint::new(None);

        let query = system.query_endpoint_state(3, QueryContext::ClientOpen);
        let decoded = SystemMessage::decode(&query).unwrap();
        assert_eq!(decoded.command, SystemCommand::PropertyGet);
        assert_eq!(decoded.property, property::endpoint_state(3));
        assert_eq!(system.pending_queries(), 1);

        let event = system.on_payload(&reply(
            decoded.tid,
            property::endpoint_state(3),
            vec![RemoteEndpointState::Open as u8],
        ));

        assert_eq!(
            event,
            Some(SystemEvent::EndpointState {
                endpoint: 3,
                state: RemoteEndpointState::Open,
                context: QueryContext::ClientOpen,
            })
        );
        assert_eq!(system.pending_queries(), 0);
    }

    #[test]
    fn test_unsolicited_endpoint_open_notification() {
        let mut system = SystemEndpoint::new(None);

        let event = system.on_payload(&reply(
            0,
            property::endpoint_state(9),
            vec![RemoteEndpointState::Open as u8],
        ));

        assert_eq!(event, Some(SystemEvent::PeerEndpointOpened(9)));
    }

    #[test]
    fn test_peer_reset_notification() {
        let mut system = SystemEndpoint::new(None);

        let mut value = Vec::new();
        value.write_u32::<LittleEndian>(0x42).unwrap();
        let raw = SystemMessage::new(SystemCommand::Reset, 0, 0, value).encode();

        assert_eq!(
            system.on_payload(&raw),
            Some(SystemEvent::PeerReset { cause: 0x42 })
        );
    }

    #[test]
    fn test_scalar_property_replies() {
        let mut system = SystemEndpoint::new(None);

        let query = system.query_property(property::PROTOCOL_VERSION);
        let tid = SystemMessage::decode(&query).unwrap().tid;
        assert_eq!(
            system.on_payload(&reply(tid, property::PROTOCOL_VERSION, vec![4])),
            Some(SystemEvent::ProtocolVersion(4))
        );

        let query = system.query_property(property::CAPABILITIES);
        let tid = SystemMessage::decode(&query).unwrap().tid;
        let mut caps = Vec::new();
        caps.write_u32::<LittleEndian>(0xA5).unwrap();
        assert_eq!(
            system.on_payload(&reply(tid, property::CAPABILITIES, caps)),
            Some(SystemEvent::Capabilities(0xA5))
        );
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        let mut system = SystemEndpoint::new(None);
        assert_eq!(system.on_payload(&[9, 9]), None);
        assert_eq!(system.on_payload(&[]), None);
    }

    #[test]
    fn test_tid_skips_zero_on_wrap() {
        let mut system = SystemEndpoint::new(None);
        system.next_tid = 255;

        let query = system.query_property(property::CAPABILITIES);
        assert_eq!(SystemMessage::decode(&query).unwrap().tid, 255);

        let query = system.query_property(property::CAPABILITIES);
        assert_eq!(SystemMessage::decode(&query).unwrap().tid, 1);
    }
}
