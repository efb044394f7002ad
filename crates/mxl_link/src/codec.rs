//! Wire protocol codec: the fixed message vocabulary and its byte framing.
//!
//! Every message is `[u32 BE tag][u32 BE payload length][payload]`. Numeric
//! payload fields are big-endian IEEE-754 doubles; free-form diagnostic
//! payloads are UTF-8 JSON maps riding the tail of an AMP frame.

use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::LinkError;
use crate::Vec3;

/// Upper bound on a single frame payload. Field and amplitude frames are a
/// few dozen bytes; only diagnostic maps can grow, and one megabyte is far
/// beyond any sane per-step record.
pub const MAX_PAYLOAD: u32 = 1 << 20;

/// Sentinel requested-id meaning "assign me any unclaimed molecule".
pub const ANY_MOLECULE: i32 = -1;

/// The six frame types of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameKind {
    /// driver→hub: open the handshake, naming a requested molecule id.
    Init = 1,
    /// hub→driver: handshake complete, carries the confirmed id and dt.
    Assign = 2,
    /// hub→driver: step input (simulation time + field 3-vector).
    Field = 3,
    /// driver→hub: step output (response 3-vector + optional diagnostics).
    Amp = 4,
    /// either direction: liveness keep-alive during long computations.
    Heartbeat = 5,
    /// either direction: graceful close, optional reason string.
    Disconnect = 6,
}

impl FrameKind {
    /// The on-wire tag value.
    pub fn tag(self) -> u32 {
        self as u32
    }

    /// Resolve an on-wire tag, if it names a known frame type.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::Init),
            2 => Some(Self::Assign),
            3 => Some(Self::Field),
            4 => Some(Self::Amp),
            5 => Some(Self::Heartbeat),
            6 => Some(Self::Disconnect),
            _ => None,
        }
    }

    /// Short name used in decode errors and logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Assign => "ASSIGN",
            Self::Field => "FIELD",
            Self::Amp => "AMP",
            Self::Heartbeat => "HEARTBEAT",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Init {
        /// Requested molecule id; [`ANY_MOLECULE`] claims the next unbound one.
        requested_id: i32,
        /// Free-form model name advertised by the driver.
        model: String,
    },
    Assign {
        molecule_id: u32,
        /// Time step in transport units, fixed for the connection lifetime.
        dt: f64,
    },
    Field {
        sim_time: f64,
        field: Vec3,
    },
    Amp {
        amplitude: Vec3,
        diagnostics: Option<Map<String, Value>>,
    },
    Heartbeat,
    Disconnect {
        reason: Option<String>,
    },
}

/// Why a received frame could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("unknown frame tag {0}")]
    UnknownTag(u32),

    #[error("declared payload length {0} exceeds the {MAX_PAYLOAD}-byte limit")]
    PayloadTooLarge(u32),

    #[error("truncated {kind} payload: need {expected} bytes, got {got}")]
    Truncated {
        kind: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{kind} payload is not valid UTF-8")]
    InvalidUtf8 { kind: &'static str },

    #[error("malformed diagnostics map: {0}")]
    InvalidDiagnostics(#[from] serde_json::Error),

    #[error("expected a {expected} frame, got {got}")]
    UnexpectedFrame {
        expected: &'static str,
        got: &'static str,
    },
}

impl Frame {
    /// The frame type of this message.
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Init { .. } => FrameKind::Init,
            Self::Assign { .. } => FrameKind::Assign,
            Self::Field { .. } => FrameKind::Field,
            Self::Amp { .. } => FrameKind::Amp,
            Self::Heartbeat => FrameKind::Heartbeat,
            Self::Disconnect { .. } => FrameKind::Disconnect,
        }
    }

    /// Serialize to a complete wire frame, header included.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let mut buf = Vec::with_capacity(8 + payload.len());
        buf.extend_from_slice(&self.kind().tag().to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        buf
    }

    fn encode_payload(&self) -> Vec<u8> {
        match self {
            Self::Init {
                requested_id,
                model,
            } => {
                let mut p = Vec::with_capacity(4 + model.len());
                p.extend_from_slice(&requested_id.to_be_bytes());
                p.extend_from_slice(model.as_bytes());
                p
            }
            Self::Assign { molecule_id, dt } => {
                let mut p = Vec::with_capacity(12);
                p.extend_from_slice(&molecule_id.to_be_bytes());
                p.extend_from_slice(&dt.to_be_bytes());
                p
            }
            Self::Field { sim_time, field } => {
                let mut p = Vec::with_capacity(32);
                p.extend_from_slice(&sim_time.to_be_bytes());
                for c in field {
                    p.extend_from_slice(&c.to_be_bytes());
                }
                p
            }
            Self::Amp {
                amplitude,
                diagnostics,
            } => {
                let mut p = Vec::with_capacity(24);
                for c in amplitude {
                    p.extend_from_slice(&c.to_be_bytes());
                }
                if let Some(map) = diagnostics {
                    // Serializing a Map cannot fail.
                    p.extend_from_slice(&serde_json::to_vec(map).unwrap_or_default());
                }
                p
            }
            Self::Heartbeat => Vec::new(),
            Self::Disconnect { reason } => {
                reason.as_deref().unwrap_or("").as_bytes().to_vec()
            }
        }
    }

    /// Decode a payload for the given on-wire tag.
    pub fn decode(tag: u32, payload: &[u8]) -> Result<Self, FrameDecodeError> {
        let kind = FrameKind::from_tag(tag).ok_or(FrameDecodeError::UnknownTag(tag))?;
        match kind {
            FrameKind::Init => {
                let id_bytes = take(payload, 0, 4, "INIT")?;
                let requested_id = i32::from_be_bytes(id_bytes.try_into().unwrap());
                let model = std::str::from_utf8(&payload[4..])
                    .map_err(|_| FrameDecodeError::InvalidUtf8 { kind: "INIT" })?
                    .to_string();
                Ok(Self::Init {
                    requested_id,
                    model,
                })
            }
            FrameKind::Assign => {
                let id_bytes = take(payload, 0, 4, "ASSIGN")?;
                let dt_bytes = take(payload, 4, 8, "ASSIGN")?;
                Ok(Self::Assign {
                    molecule_id: u32::from_be_bytes(id_bytes.try_into().unwrap()),
                    dt: f64::from_be_bytes(dt_bytes.try_into().unwrap()),
                })
            }
            FrameKind::Field => {
                let sim_time = read_f64(payload, 0, "FIELD")?;
                Ok(Self::Field {
                    sim_time,
                    field: read_vec3(payload, 8, "FIELD")?,
                })
            }
            FrameKind::Amp => {
                let amplitude = read_vec3(payload, 0, "AMP")?;
                let tail = &payload[24..];
                let diagnostics = if tail.is_empty() {
                    None
                } else {
                    Some(serde_json::from_slice::<Map<String, Value>>(tail)?)
                };
                Ok(Self::Amp {
                    amplitude,
                    diagnostics,
                })
            }
            FrameKind::Heartbeat => Ok(Self::Heartbeat),
            FrameKind::Disconnect => {
                let reason = std::str::from_utf8(payload)
                    .map_err(|_| FrameDecodeError::InvalidUtf8 { kind: "DISCONNECT" })?;
                Ok(Self::Disconnect {
                    reason: if reason.is_empty() {
                        None
                    } else {
                        Some(reason.to_string())
                    },
                })
            }
        }
    }
}

fn take<'a>(
    payload: &'a [u8],
    start: usize,
    len: usize,
    kind: &'static str,
) -> Result<&'a [u8], FrameDecodeError> {
    payload
        .get(start..start + len)
        .ok_or(FrameDecodeError::Truncated {
            kind,
            expected: start + len,
            got: payload.len(),
        })
}

fn read_f64(payload: &[u8], start: usize, kind: &'static str) -> Result<f64, FrameDecodeError> {
    let bytes = take(payload, start, 8, kind)?;
    Ok(f64::from_be_bytes(bytes.try_into().unwrap()))
}

fn read_vec3(payload: &[u8], start: usize, kind: &'static str) -> Result<Vec3, FrameDecodeError> {
    Ok([
        read_f64(payload, start, kind)?,
        read_f64(payload, start + 8, kind)?,
        read_f64(payload, start + 16, kind)?,
    ])
}

/// Read one complete frame from a stream.
///
/// An error here is fatal to the connection: either the peer vanished
/// (`LinkError::Io`) or it is speaking garbage (`LinkError::FrameDecode`).
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, LinkError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 8];
    reader.read_exact(&mut header).await?;
    let tag = u32::from_be_bytes(header[0..4].try_into().unwrap());
    let len = u32::from_be_bytes(header[4..8].try_into().unwrap());
    if len > MAX_PAYLOAD {
        return Err(FrameDecodeError::PayloadTooLarge(len).into());
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Frame::decode(tag, &payload)?)
}

/// Write one complete frame to a stream and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(frame: Frame) -> Frame {
        let bytes = frame.encode();
        let tag = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let len = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
        assert_eq!(bytes.len(), 8 + len);
        Frame::decode(tag, &bytes[8..]).unwrap()
    }

    #[test]
    fn test_tag_mapping() {
        for kind in [
            FrameKind::Init,
            FrameKind::Assign,
            FrameKind::Field,
            FrameKind::Amp,
            FrameKind::Heartbeat,
            FrameKind::Disconnect,
        ] {
            assert_eq!(FrameKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(FrameKind::from_tag(0), None);
        assert_eq!(FrameKind::from_tag(7), None);
    }

    #[test]
    fn test_init_roundtrip() {
        let frame = Frame::Init {
            requested_id: ANY_MOLECULE,
            model: "ehrenfest".to_string(),
        };
        assert_eq!(roundtrip(frame.clone()), frame);

        let explicit = Frame::Init {
            requested_id: 3,
            model: String::new(),
        };
        assert_eq!(roundtrip(explicit.clone()), explicit);
    }

    #[test]
    fn test_assign_roundtrip() {
        let frame = Frame::Assign {
            molecule_id: 7,
            dt: 0.05,
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_field_amp_bit_exact_roundtrip() {
        // Edge-value doubles must survive bit-for-bit: zeros, negative zero,
        // subnormals, and extremes.
        let edge = [
            0.0,
            -0.0,
            f64::MIN_POSITIVE,
            5e-324,
            -5e-324,
            f64::MAX,
            f64::MIN,
            -1.0e-4,
        ];
        for window in edge.windows(3) {
            let v: Vec3 = [window[0], window[1], window[2]];
            let field = Frame::Field {
                sim_time: -0.0,
                field: v,
            };
            match roundtrip(field) {
                Frame::Field { sim_time, field } => {
                    assert_eq!(sim_time.to_bits(), (-0.0f64).to_bits());
                    for (a, b) in field.iter().zip(v.iter()) {
                        assert_eq!(a.to_bits(), b.to_bits());
                    }
                }
                other => panic!("expected FIELD, got {other:?}"),
            }

            let amp = Frame::Amp {
                amplitude: v,
                diagnostics: None,
            };
            match roundtrip(amp) {
                Frame::Amp { amplitude, .. } => {
                    for (a, b) in amplitude.iter().zip(v.iter()) {
                        assert_eq!(a.to_bits(), b.to_bits());
                    }
                }
                other => panic!("expected AMP, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_amp_with_diagnostics() {
        let mut map = Map::new();
        map.insert("time_au".to_string(), json!(1.25));
        map.insert("population".to_string(), json!([0.9, 0.1]));
        let frame = Frame::Amp {
            amplitude: [0.0, 0.0, 2e-4],
            diagnostics: Some(map),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_heartbeat_and_disconnect_roundtrip() {
        assert_eq!(roundtrip(Frame::Heartbeat), Frame::Heartbeat);
        let silent = Frame::Disconnect { reason: None };
        assert_eq!(roundtrip(silent.clone()), silent);
        let spoken = Frame::Disconnect {
            reason: Some("hub closed".to_string()),
        };
        assert_eq!(roundtrip(spoken.clone()), spoken);
    }

    #[test]
    fn test_decode_unknown_tag() {
        match Frame::decode(99, &[]) {
            Err(FrameDecodeError::UnknownTag(99)) => {}
            other => panic!("expected UnknownTag, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_truncated_field() {
        match Frame::decode(FrameKind::Field.tag(), &[0u8; 16]) {
            Err(FrameDecodeError::Truncated { kind: "FIELD", .. }) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_bad_diagnostics() {
        let mut payload = vec![0u8; 24];
        payload.extend_from_slice(b"not json");
        match Frame::decode(FrameKind::Amp.tag(), &payload) {
            Err(FrameDecodeError::InvalidDiagnostics(_)) => {}
            other => panic!("expected InvalidDiagnostics, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let frame = Frame::Field {
            sim_time: 0.05,
            field: [1.0, -2.0, 3.5e-7],
        };
        write_frame(&mut a, &frame).await.unwrap();
        let decoded = read_frame(&mut b).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_stream_oversize_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            let mut header = Vec::new();
            header.extend_from_slice(&FrameKind::Amp.tag().to_be_bytes());
            header.extend_from_slice(&(MAX_PAYLOAD + 1).to_be_bytes());
            use tokio::io::AsyncWriteExt;
            let _ = a.write_all(&header).await;
        });
        match read_frame(&mut b).await {
            Err(LinkError::FrameDecode(FrameDecodeError::PayloadTooLarge(_))) => {}
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
        writer.await.unwrap();
    }
}
