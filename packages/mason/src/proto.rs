//! The distributed scheduler wire protocol.
//!
//! Length-prefixed, magic-prefixed, schema-versioned frames:
//!
//! ```not_rust
//! [len(4, BE) | magic(4) | version(4, BE) | payload(len - 8)]
//! ```
//!
//! Payloads are JSON-serialized [`Message`]s. Unknown optional fields are
//! skipped on decode (serde's default behavior for unknown keys), so newer
//! peers can add fields without breaking older ones; unknown message
//! *types* are a decode error, since the type set is the protocol.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

use crate::error::{BuildError, Result};

/// Frame magic.
pub const FRAME_MAGIC: [u8; 4] = *b"MSNP";

/// Protocol schema version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a frame's payload; anything larger is a protocol error,
/// not an allocation request.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Isolation and capacity a worker advertises.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerCapabilities {
    pub isolation: String,
    pub workers: usize,
    #[serde(default)]
    pub protocols: Vec<String>,
}

/// A peer's announced identity and load.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer: String,
    pub address: String,
    #[serde(default)]
    pub queue_depth: usize,
    #[serde(default)]
    pub load_factor: f64,
}

/// Protocol messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Capabilities(PeerCapabilities),
    WorkerRegistration {
        peer: String,
        address: String,
        capabilities: PeerCapabilities,
    },
    WorkRequest {
        /// Hex action fingerprint the requester wants executed remotely.
        fingerprint: String,
        argv: Vec<String>,
        #[serde(default)]
        env: std::collections::BTreeMap<String, String>,
    },
    PeerAnnounce(PeerInfo),
    PeerDiscoveryRequest {},
    PeerDiscoveryResponse {
        peers: Vec<PeerInfo>,
    },
    PeerMetricsUpdate {
        peer: String,
        queue_depth: usize,
        load_factor: f64,
    },
}

/// Encode a message into a complete frame.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(message)
        .map_err(|err| BuildError::internal(format!("serialize frame payload: {err}")))?;
    let len = (payload.len() + 8) as u32;
    if len > MAX_FRAME_LEN {
        return Err(BuildError::network(format!(
            "frame payload of {} bytes exceeds protocol maximum",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(4 + len as usize);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one frame.
#[instrument(skip_all)]
pub fn write_frame(writer: &mut impl Write, message: &Message) -> Result<()> {
    let frame = encode_frame(message)?;
    writer
        .write_all(&frame)
        .map_err(|err| BuildError::network(format!("write frame: {err}")))?;
    trace!(bytes = frame.len(), "wrote frame");
    Ok(())
}

/// Read one frame, verifying length bound, magic, and version.
#[instrument(skip_all)]
pub fn read_frame(reader: &mut impl Read) -> Result<Message> {
    let mut len = [0u8; 4];
    reader
        .read_exact(&mut len)
        .map_err(|err| BuildError::network(format!("read frame length: {err}")))?;
    let len = u32::from_be_bytes(len);
    if len < 8 || len > MAX_FRAME_LEN {
        return Err(BuildError::network(format!("invalid frame length {len}")));
    }

    let mut header = [0u8; 8];
    reader
        .read_exact(&mut header)
        .map_err(|err| BuildError::network(format!("read frame header: {err}")))?;
    if header[0..4] != FRAME_MAGIC {
        return Err(BuildError::network("frame magic mismatch"));
    }
    let version = u32::from_be_bytes(header[4..8].try_into().unwrap_or_default());
    if version != PROTOCOL_VERSION {
        return Err(BuildError::network(format!(
            "unsupported protocol version {version}"
        )));
    }

    let mut payload = vec![0u8; len as usize - 8];
    reader
        .read_exact(&mut payload)
        .map_err(|err| BuildError::network(format!("read frame payload: {err}")))?;
    serde_json::from_slice(&payload)
        .map_err(|err| BuildError::network(format!("decode frame payload: {err}")))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use super::*;

    fn round_trip(message: Message) {
        let frame = encode_frame(&message).unwrap();
        let decoded = read_frame(&mut Cursor::new(frame)).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn all_message_types_round_trip() {
        round_trip(Message::Capabilities(PeerCapabilities {
            isolation: "sandboxed".into(),
            workers: 8,
            protocols: vec!["steal/1".into()],
        }));
        round_trip(Message::WorkerRegistration {
            peer: "w1".into(),
            address: "10.0.0.5:7400".into(),
            capabilities: PeerCapabilities {
                isolation: "confined".into(),
                workers: 4,
                protocols: vec![],
            },
        });
        round_trip(Message::WorkRequest {
            fingerprint: "ab".repeat(32),
            argv: vec!["cc".into(), "-c".into(), "x.c".into()],
            env: [("PATH".to_string(), "/usr/bin".to_string())].into(),
        });
        round_trip(Message::PeerAnnounce(PeerInfo {
            peer: "w2".into(),
            address: "10.0.0.6:7400".into(),
            queue_depth: 3,
            load_factor: 0.75,
        }));
        round_trip(Message::PeerDiscoveryRequest {});
        round_trip(Message::PeerDiscoveryResponse {
            peers: vec![PeerInfo {
                peer: "w3".into(),
                address: "10.0.0.7:7400".into(),
                queue_depth: 0,
                load_factor: 0.0,
            }],
        });
        round_trip(Message::PeerMetricsUpdate {
            peer: "w1".into(),
            queue_depth: 9,
            load_factor: 1.0,
        });
    }

    #[test]
    fn multiple_frames_stream() {
        let mut stream = Vec::new();
        write_frame(
            &mut stream,
            &Message::PeerMetricsUpdate {
                peer: "a".into(),
                queue_depth: 1,
                load_factor: 0.1,
            },
        )
        .unwrap();
        write_frame(&mut stream, &Message::PeerDiscoveryRequest {}).unwrap();

        let mut cursor = Cursor::new(stream);
        assert!(matches!(
            read_frame(&mut cursor).unwrap(),
            Message::PeerMetricsUpdate { .. }
        ));
        assert!(matches!(
            read_frame(&mut cursor).unwrap(),
            Message::PeerDiscoveryRequest {}
        ));
    }

    #[test]
    fn unknown_optional_fields_are_skipped() {
        let payload = serde_json::json!({
            "type": "peer_metrics_update",
            "peer": "w9",
            "queue_depth": 2,
            "load_factor": 0.2,
            "future_field": {"nested": true},
        });
        let payload = serde_json::to_vec(&payload).unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        frame.extend_from_slice(&payload);

        let message = read_frame(&mut Cursor::new(frame)).unwrap();
        assert_eq!(
            message,
            Message::PeerMetricsUpdate {
                peer: "w9".into(),
                queue_depth: 2,
                load_factor: 0.2,
            },
        );
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut frame = encode_frame(&Message::PeerDiscoveryRequest {}).unwrap();
        frame[4] = b'X';
        let err = read_frame(&mut Cursor::new(frame)).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn oversized_length_is_rejected_without_allocation() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&u32::MAX.to_be_bytes());
        frame.extend_from_slice(&FRAME_MAGIC);
        let err = read_frame(&mut Cursor::new(frame)).unwrap_err();
        assert!(err.to_string().contains("invalid frame length"));
    }
}
