//! Messages exchanged on the library <-> daemon control socket, and the
//! well-known socket locations. Both the daemon and the host library link
//! against this module so the two sides cannot drift apart.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

pub const CTRL_SOCKET_NAME: &str = "ctrl.cpcd.sock";

/// Directory holding the sockets of one daemon instance.
#[inline]
pub fn instance_dir(run_dir: &Path, instance: &str) -> PathBuf {
    run_dir.join("cpcd").join(instance)
}

#[inline]
pub fn ctrl_socket_path(run_dir: &Path, instance: &str) -> PathBuf {
    instance_dir(run_dir, instance).join(CTRL_SOCKET_NAME)
}

#[inline]
pub fn endpoint_socket_path(run_dir: &Path, instance: &str, endpoint: u8) -> PathBuf {
    instance_dir(run_dir, instance).join(format!("ep{}.cpcd.sock", endpoint))
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CtrlKind {
    Version = 0,
    MaxWriteSize = 1,
    SetPid = 2,
    OpenEndpoint = 3,
    CloseEndpoint = 4,
    EndpointStatus = 5,
}

impl CtrlKind {
    #[inline]
    fn from_u8(value: u8) -> Option<CtrlKind> {
        Some(match value {
            0 => CtrlKind::Version,
            1 => CtrlKind::MaxWriteSize,
            2 => CtrlKind::SetPid,
            3 => CtrlKind::OpenEndpoint,
            4 => CtrlKind::CloseEndpoint,
            5 => CtrlKind::EndpointStatus,
            _ => return None,
        })
    }
}

/// State of an endpoint as reported over the control socket.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EndpointStatus {
    Closed = 0,
    Open = 1,
    Closing = 2,
    ConnectionLost = 3,
    Error = 4,
}

impl EndpointStatus {
    #[inline]
    pub fn from_u8(value: u8) -> Option<EndpointStatus> {
        Some(match value {
            0 => EndpointStatus::Closed,
            1 => EndpointStatus::Open,
            2 => EndpointStatus::Closing,
            3 => EndpointStatus::ConnectionLost,
            4 => EndpointStatus::Error,
            _ => return None,
        })
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum WireError {
    Truncated,
    UnknownKind(u8),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireError::Truncated => write!(f, "control message truncated"),
            WireError::UnknownKind(kind) => write!(f, "unknown control message kind {}", kind),
        }
    }
}

impl std::error::Error for WireError {}

/// One control-socket message: `{type, endpoint, payload}`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CtrlMessage {
    pub kind: CtrlKind,
    pub endpoint: u8,
    pub payload: Vec<u8>,
}

impl CtrlMessage {
    #[inline]
    pub fn new(kind: CtrlKind, endpoint: u8, payload: Vec<u8>) -> CtrlMessage {
        CtrlMessage {
            kind,
            endpoint,
            payload,
        }
    }

    /// Version query/reply carrying the protocol version byte.
    #[inline]
    pub fn version(version: u8) -> CtrlMessage {
        CtrlMessage::new(CtrlKind::Version, 0, vec![version])
    }

    /// Registration of the client pid, so the daemon can signal link resets.
    #[inline]
    pub fn set_pid(pid: u32) -> CtrlMessage {
        let mut payload = Vec::with_capacity(4);
        payload
            .write_u32::<LittleEndian>(pid)
            .expect("writing to a Vec cannot fail");
        CtrlMessage::new(CtrlKind::SetPid, 0, payload)
    }

    /// Reply to a max-write-size query.
    #[inline]
    pub fn max_write_size(size: u32) -> CtrlMessage {
        let mut payload = Vec::with_capacity(4);
        payload
            .write_u32::<LittleEndian>(size)
            .expect("writing to a Vec cannot fail");
        CtrlMessage::new(CtrlKind::MaxWriteSize, 0, payload)
    }

    /// Reply to an open-endpoint query.
    #[inline]
    pub fn open_reply(endpoint: u8, can_open: bool) -> CtrlMessage {
        CtrlMessage::new(CtrlKind::OpenEndpoint, endpoint, vec![can_open as u8])
    }

    /// Reply to an endpoint-status query.
    #[inline]
    pub fn status_reply(endpoint: u8, status: EndpointStatus) -> CtrlMessage {
        CtrlMessage::new(CtrlKind::EndpointStatus, endpoint, vec![status as u8])
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.payload.len());
        out.push(self.kind as u8);
        out.push(self.endpoint);
        out.write_all(&self.payload)
            .expect("writing to a Vec cannot fail");
        out
    }

    pub fn decode(raw: &[u8]) -> Result<CtrlMessage, WireError> {
        if raw.len() < 2 {
            return Err(WireError::Truncated);
        }

        let kind = CtrlKind::from_u8(raw[0]).ok_or(WireError::UnknownKind(raw[0]))?;

        Ok(CtrlMessage {
            kind,
            endpoint: raw[1],
            payload: raw[2..].to_vec(),
        })
    }

    /// Payload interpreted as a single version byte.
    #[inline]
    pub fn payload_version(&self) -> Result<u8, WireError> {
        self.payload.first().copied().ok_or(WireError::Truncated)
    }

    /// Payload interpreted as a little-endian u32.
    #[inline]
    pub fn payload_u32(&self) -> Result<u32, WireError> {
        Cursor::new(&self.payload[..])
            .read_u32::<LittleEndian>()
            .map_err(|_| WireError::Truncated)
    }

    /// Payload interpreted as a boolean flag.
    #[inline]
    pub fn payload_bool(&self) -> Result<bool, WireError> {
        self.payload
            .first()
            .map(|&b| b != 0)
            .ok_or(WireError::Truncated)
    }

    /// Payload interpreted as an endpoint status byte.
    #[inline]
    pub fn payload_status(&self) -> Result<EndpointStatus, WireError> {
        let raw = *self.payload.first().ok_or(WireError::Truncated)?;
        EndpointStatus::from_u8(raw).ok_or(WireError::UnknownKind(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = CtrlMessage::new(CtrlKind::OpenEndpoint, 12, vec![1, 2, 3]);
        let decoded = CtrlMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_rejects_short_message() {
        assert_eq!(CtrlMessage::decode(&[0]), Err(WireError::Truncated));
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        assert_eq!(
            CtrlMessage::decode(&[200, 0]),
            Err(WireError::UnknownKind(200))
        );
    }

    #[test]
    fn test_pid_payload() {
        let msg = CtrlMessage::set_pid(0xDEAD_BEEF);
        assert_eq!(msg.payload_u32().unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_status_payload() {
        let msg = CtrlMessage::status_reply(4, EndpointStatus::Closing);
        assert_eq!(msg.payload_status().unwrap(), EndpointStatus::Closing);
    }

    #[test]
    fn test_socket_paths() {
        let dir = instance_dir(Path::new("/run"), "cpcd_0");
        assert_eq!(dir, PathBuf::from("/run/cpcd/cpcd_0"));
        assert_eq!(
            endpoint_socket_path(Path::new("/run"), "cpcd_0", 7),
            PathBuf::from("/run/cpcd/cpcd_0/ep7.cpcd.sock")
        );
    }
}
