//! RSKT wire protocols
//!
//! Two protocols share one framing:
//!
//! ## 1. Application protocol ([`AppMessage`])
//!
//! Library ↔ daemon over the local Unix socket. Applications number their
//! requests; the daemon echoes the number in the response. Daemon-initiated
//! requests (`ForceClose`) carry a daemon-assigned number.
//!
//! ## 2. Daemon protocol ([`PeerMessage`])
//!
//! Daemon ↔ daemon over the peer channel. The sender numbers requests, the
//! responder echoes the number unchanged.
//!
//! ```text
//! ┌────────────┬──────────────┬──────────────────────┐
//! │   Length   │  Sequence    │  Payload (bincode)   │
//! │  (4 bytes) │  (4 bytes)   │  (variable length)   │
//! └────────────┴──────────────┴──────────────────────┘
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Maximum frame payload (control messages are small)
const MAX_MESSAGE_SIZE: u32 = 64 * 1024;

/// Sequence number used for request/response correlation
pub type Seq = u32;

/// Memory space as reported to applications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MsInfo {
    /// Memory space name
    pub name: String,
    /// Usable size in bytes
    pub size: u32,
}

/// Fabric-wide socket address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SocketAddress {
    /// Component tag of the node
    pub ct: u32,
    /// Socket number on that node
    pub sn: u16,
}

/// Application ↔ daemon messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppMessage {
    /// Application registers itself
    Hello { name: String, pid: i32 },
    /// Daemon returns the component tag of this node
    HelloResp { ct: u32, err: i32 },
    Bind { sn: u16 },
    BindResp { sn: u16, err: i32 },
    Listen { sn: u16, backlog: u32 },
    ListenResp { sn: u16, err: i32 },
    /// Wait for one inbound connection on a listening socket
    Accept { sn: u16 },
    AcceptResp {
        /// Listening socket the accept was issued on
        sn: u16,
        /// Socket number of the accepted connection
        new_sn: u16,
        /// Remote end of the connection
        peer: SocketAddress,
        /// Memory space allocated on this node
        loc_ms: MsInfo,
        /// Memory space of the connecting side
        rem_ms: MsInfo,
        err: i32,
    },
    /// Connect to a remote listening socket
    Connect { dst: SocketAddress },
    ConnectResp {
        /// Local socket number of the new connection
        new_sn: u16,
        /// Socket number assigned by the accepting side
        rem_sn: u16,
        loc_ms: MsInfo,
        rem_ms: MsInfo,
        err: i32,
    },
    Close { sn: u16 },
    CloseResp { sn: u16, err: i32 },
    /// Daemon tells the application the remote side closed first
    ForceClose { sn: u16, err: i32 },
    /// Application acknowledges a `ForceClose`
    ForceCloseResp { sn: u16 },
}

impl AppMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            AppMessage::Hello { .. } => "HELLO",
            AppMessage::HelloResp { .. } => "HELLO_RESP",
            AppMessage::Bind { .. } => "BIND",
            AppMessage::BindResp { .. } => "BIND_RESP",
            AppMessage::Listen { .. } => "LISTEN",
            AppMessage::ListenResp { .. } => "LISTEN_RESP",
            AppMessage::Accept { .. } => "ACCEPT",
            AppMessage::AcceptResp { .. } => "ACCEPT_RESP",
            AppMessage::Connect { .. } => "CONNECT",
            AppMessage::ConnectResp { .. } => "CONNECT_RESP",
            AppMessage::Close { .. } => "CLOSE",
            AppMessage::CloseResp { .. } => "CLOSE_RESP",
            AppMessage::ForceClose { .. } => "FORCE_CLOSE",
            AppMessage::ForceCloseResp { .. } => "FORCE_CLOSE_RESP",
        }
    }
}

/// Identity exchanged in the peer HELLO handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PeerHello {
    /// Component tag of the sender
    pub ct: u32,
    /// Control channel number
    pub cm_skt: u16,
    /// Local mport number
    pub mport: u8,
    /// Process id of the sending daemon
    pub pid: u32,
}

/// Daemon ↔ daemon messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    HelloReq(PeerHello),
    HelloResp(PeerHello),
    ConnectReq {
        /// Listening socket on the receiving node
        dst_sn: u16,
        dst_ct: u32,
        /// Connecting socket on the sending node
        src_sn: u16,
        /// Owner handle of the sender's memory space
        src_mso: u64,
        /// Sender's memory space name
        src_ms: String,
        /// Sub-space placement inside the sender's memory space
        src_msub_o: u32,
        src_msub_s: u32,
    },
    ConnectResp {
        /// Listening socket the request targeted
        dst_sn: u16,
        /// Socket number of the accepted connection
        acc_sn: u16,
        dst_ct: u32,
        /// Accepting side's memory space name and sub-space size
        dst_ms: String,
        dst_msub_s: u32,
        err: i32,
    },
    CloseReq {
        /// Socket number on the receiving node
        rem_sn: u16,
        /// Socket number on the sending node
        loc_sn: u16,
        force: bool,
    },
    CloseResp { rem_sn: u16, loc_sn: u16, err: i32 },
}

impl PeerMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::HelloReq(_) => "HELLO_REQ",
            PeerMessage::HelloResp(_) => "HELLO_RESP",
            PeerMessage::ConnectReq { .. } => "CONNECT_REQ",
            PeerMessage::ConnectResp { .. } => "CONNECT_RESP",
            PeerMessage::CloseReq { .. } => "CLOSE_REQ",
            PeerMessage::CloseResp { .. } => "CLOSE_RESP",
        }
    }

    /// Responses are matched against the correlation table
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            PeerMessage::HelloResp(_) | PeerMessage::ConnectResp { .. } | PeerMessage::CloseResp { .. }
        )
    }
}

/// Encode a message into the wire format
///
/// Format: [4-byte length][4-byte sequence][bincode payload]
pub fn encode_message<M: Serialize>(message: &M, seq: Seq) -> io::Result<Vec<u8>> {
    let payload = bincode::serialize(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let payload_len = payload.len() as u32;
    if payload_len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", payload_len),
        ));
    }

    let mut buffer = Vec::with_capacity(8 + payload.len());
    // Length prefix covers sequence + payload
    buffer.extend_from_slice(&(payload_len + 4).to_le_bytes());
    buffer.extend_from_slice(&seq.to_le_bytes());
    buffer.extend_from_slice(&payload);

    Ok(buffer)
}

/// Read one raw frame: (sequence, undecoded payload)
///
/// Any error here means the stream itself is unusable.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<(Seq, Vec<u8>)> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let frame_len = u32::from_le_bytes(len_bytes);

    if frame_len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Message length too small",
        ));
    }
    if frame_len - 4 > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", frame_len),
        ));
    }

    let mut seq_bytes = [0u8; 4];
    reader.read_exact(&mut seq_bytes)?;
    let seq = u32::from_le_bytes(seq_bytes);

    let mut payload = vec![0u8; (frame_len - 4) as usize];
    reader.read_exact(&mut payload)?;

    Ok((seq, payload))
}

/// Decode a frame payload
///
/// Failure is a protocol violation, not a transport failure.
pub fn decode_payload<M: DeserializeOwned>(payload: &[u8]) -> io::Result<M> {
    bincode::deserialize(payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write a message to a stream
pub fn write_message<W: Write, M: Serialize>(writer: &mut W, message: &M, seq: Seq) -> io::Result<()> {
    let bytes = encode_message(message, seq)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read and decode one message from a stream
pub fn read_message<R: Read, M: DeserializeOwned>(reader: &mut R) -> io::Result<(M, Seq)> {
    let (seq, payload) = read_frame(reader)?;
    Ok((decode_payload(&payload)?, seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_decode_connect_req() {
        let message = PeerMessage::ConnectReq {
            dst_sn: 10,
            dst_ct: 0x10,
            src_sn: 0x1000,
            src_mso: 7,
            src_ms: "RSKT00000020.0001".to_string(),
            src_msub_o: 0,
            src_msub_s: 0x8000,
        };

        let encoded = encode_message(&message, 42).unwrap();
        assert_eq!(
            u32::from_le_bytes(encoded[0..4].try_into().unwrap()) as usize,
            encoded.len() - 4
        );

        let mut cursor = Cursor::new(encoded);
        let (decoded, seq): (PeerMessage, Seq) = read_message(&mut cursor).unwrap();
        assert_eq!(message, decoded);
        assert_eq!(seq, 42);
    }

    #[test]
    fn test_multiple_app_messages() {
        let messages = vec![
            (AppMessage::Hello { name: "app".to_string(), pid: 99 }, 1),
            (AppMessage::Bind { sn: 10 }, 2),
            (AppMessage::Listen { sn: 10, backlog: 5 }, 3),
            (AppMessage::ForceClose { sn: 0x1000, err: libc::ECONNRESET }, 900),
        ];

        let mut buffer = Vec::new();
        for (msg, seq) in &messages {
            write_message(&mut buffer, msg, *seq).unwrap();
        }

        let mut cursor = Cursor::new(buffer);
        for (expected_msg, expected_seq) in &messages {
            let (msg, seq): (AppMessage, Seq) = read_message(&mut cursor).unwrap();
            assert_eq!(*expected_msg, msg);
            assert_eq!(*expected_seq, seq);
        }
    }

    #[test]
    fn test_message_too_large() {
        let message = AppMessage::Hello { name: "x".repeat(70 * 1024), pid: 1 };
        assert!(encode_message(&message, 1).is_err());
    }

    #[test]
    fn test_undecodable_payload_keeps_stream_usable() {
        // A frame with garbage payload followed by a valid frame
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(4u32 + 3).to_le_bytes());
        buffer.extend_from_slice(&5u32.to_le_bytes());
        buffer.extend_from_slice(&[0xff, 0xff, 0xff]);
        write_message(&mut buffer, &AppMessage::Bind { sn: 3 }, 6).unwrap();

        let mut cursor = Cursor::new(buffer);
        let (seq, payload) = read_frame(&mut cursor).unwrap();
        assert_eq!(seq, 5);
        assert!(decode_payload::<AppMessage>(&payload).is_err());

        let (msg, seq): (AppMessage, Seq) = read_message(&mut cursor).unwrap();
        assert_eq!(msg, AppMessage::Bind { sn: 3 });
        assert_eq!(seq, 6);
    }

    #[test]
    fn test_short_length_rejected() {
        let mut cursor = Cursor::new(vec![2, 0, 0, 0, 0, 0]);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_response_classification() {
        assert!(PeerMessage::HelloResp(PeerHello::default()).is_response());
        assert!(!PeerMessage::CloseReq { rem_sn: 1, loc_sn: 2, force: false }.is_response());
        assert_eq!(AppMessage::ForceCloseResp { sn: 1 }.kind(), "FORCE_CLOSE_RESP");
    }
}
