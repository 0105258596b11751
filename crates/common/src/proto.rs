//! Wire protocol between the hub and its agents.
//!
//! One session is one long-lived duplex byte stream. Frames are JSON
//! envelopes prefixed with a big-endian u32 payload length. Within one
//! direction frames are totally ordered; across directions there is no
//! ordering guarantee. `command_id` is the only correlation key between a
//! command and its result.

use anyhow::{anyhow, Context};
use base64::{engine::general_purpose, Engine as _};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload. Anything larger is a protocol
/// error, not a retryable condition.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Mandatory first frame on a new stream, agent to hub.
    #[serde(rename = "handshake")]
    Handshake {
        node_id: String,
        #[serde(default)]
        machine_id: String,
        #[serde(default)]
        version: String,
    },
    /// Liveness signal in either direction; unix seconds.
    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: i64 },
    /// Hub to agent: run a command.
    #[serde(rename = "command")]
    Command {
        id: String,
        command_type: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Agent to hub: outcome of a previously pushed command.
    #[serde(rename = "command_result")]
    CommandResult {
        command_id: String,
        exit_code: i32,
        #[serde(default)]
        output_b64: String,
        #[serde(default)]
        error: String,
    },
    /// Catch-all for tags this build does not know. Receivers log and
    /// drop it instead of tearing the stream down.
    #[serde(other)]
    Unknown,
}

impl Frame {
    pub fn command_result(
        command_id: impl Into<String>,
        exit_code: i32,
        output: &[u8],
        error: impl Into<String>,
    ) -> Self {
        Frame::CommandResult {
            command_id: command_id.into(),
            exit_code,
            output_b64: general_purpose::STANDARD.encode(output),
            error: error.into(),
        }
    }
}

pub fn decode_output(output_b64: &str) -> anyhow::Result<Vec<u8>> {
    if output_b64.is_empty() {
        return Ok(Vec::new());
    }
    general_purpose::STANDARD
        .decode(output_b64)
        .map_err(|err| anyhow!("invalid base64 output: {}", err))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(frame).context("serialize frame")?;
    if payload.len() > MAX_FRAME_LEN {
        anyhow::bail!("frame exceeds maximum length: {} bytes", payload.len());
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    writer.write_all(&buf).await.context("write frame")?;
    writer.flush().await.context("flush frame")?;
    Ok(())
}

/// Read the next frame, buffering partial reads in `buffer`. Returns
/// `Ok(None)` on a clean end of stream; EOF mid-frame is an error.
pub async fn read_frame<R>(reader: &mut R, buffer: &mut BytesMut) -> anyhow::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = try_parse_frame(buffer)? {
            return Ok(Some(frame));
        }

        let read = reader.read_buf(buffer).await.context("read frame")?;
        if read == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(anyhow!("stream ended mid-frame"));
        }
    }
}

pub fn try_parse_frame(buffer: &mut BytesMut) -> anyhow::Result<Option<Frame>> {
    if buffer.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame length {} exceeds maximum", len);
    }
    if buffer.len() < 4 + len {
        return Ok(None);
    }

    buffer.advance(4);
    let payload = buffer.split_to(len);
    let frame = serde_json::from_slice(&payload).context("parse frame")?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed_payload(frame: &Frame) -> BytesMut {
        let payload = serde_json::to_vec(frame).expect("serialize frame");
        let mut buffer = BytesMut::with_capacity(4 + payload.len());
        buffer.put_u32(payload.len() as u32);
        buffer.extend_from_slice(&payload);
        buffer
    }

    #[test]
    fn try_parse_frame_returns_none_for_short_buffer() {
        let mut buffer = BytesMut::from(&[0x00, 0x01][..]);
        assert!(try_parse_frame(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn try_parse_frame_returns_none_for_partial_payload() {
        let mut buffer = BytesMut::from(&[0x00, 0x00, 0x00, 0x05][..]);
        assert!(try_parse_frame(&mut buffer).unwrap().is_none());
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn try_parse_frame_errors_on_invalid_json() {
        let payload = b"not-json";
        let mut buffer = BytesMut::with_capacity(4 + payload.len());
        buffer.put_u32(payload.len() as u32);
        buffer.extend_from_slice(payload);
        let err = try_parse_frame(&mut buffer).expect_err("should fail");
        let msg = err.to_string();
        assert!(msg.contains("parse frame"), "{msg}");
    }

    #[test]
    fn try_parse_frame_rejects_oversized_length() {
        let mut buffer = BytesMut::new();
        buffer.put_u32((MAX_FRAME_LEN + 1) as u32);
        let err = try_parse_frame(&mut buffer).expect_err("should fail");
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn try_parse_frame_parses_frame_and_leaves_extra_bytes() {
        let frame = Frame::Heartbeat { timestamp: 42 };
        let mut buffer = framed_payload(&frame);
        buffer.extend_from_slice(b"extra");

        let parsed = try_parse_frame(&mut buffer).expect("parse");
        assert!(matches!(parsed, Some(Frame::Heartbeat { timestamp: 42 })));
        assert_eq!(&buffer[..], b"extra");
    }

    #[test]
    fn unknown_frame_tags_decode_to_unknown() {
        let payload = br#"{"type":"telemetry_batch","samples":[]}"#;
        let mut buffer = BytesMut::with_capacity(4 + payload.len());
        buffer.put_u32(payload.len() as u32);
        buffer.extend_from_slice(&payload[..]);

        let parsed = try_parse_frame(&mut buffer).expect("parse");
        assert!(matches!(parsed, Some(Frame::Unknown)));
    }

    #[test]
    fn command_result_round_trips_binary_output() {
        let frame = Frame::command_result("cmd-1", 0, b"\x00\x01hello", "");
        let Frame::CommandResult { output_b64, .. } = &frame else {
            panic!("unexpected variant");
        };
        assert_eq!(decode_output(output_b64).expect("decode"), b"\x00\x01hello");
        assert!(decode_output("").expect("empty").is_empty());
        assert!(decode_output("not-base64!").is_err());
    }

    #[tokio::test]
    async fn frames_round_trip_over_a_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(
            &mut client,
            &Frame::Handshake {
                node_id: "n1".into(),
                machine_id: "m1".into(),
                version: "0.3.1".into(),
            },
        )
        .await
        .expect("write handshake");
        write_frame(&mut client, &Frame::Heartbeat { timestamp: 7 })
            .await
            .expect("write heartbeat");
        drop(client);

        let mut buffer = BytesMut::new();
        let first = read_frame(&mut server, &mut buffer)
            .await
            .expect("read")
            .expect("frame");
        assert!(matches!(first, Frame::Handshake { ref node_id, .. } if node_id == "n1"));

        let second = read_frame(&mut server, &mut buffer)
            .await
            .expect("read")
            .expect("frame");
        assert!(matches!(second, Frame::Heartbeat { timestamp: 7 }));

        let eof = read_frame(&mut server, &mut buffer).await.expect("read");
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn read_frame_errors_on_mid_frame_eof() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&[0, 0, 0, 5, b'a'])
            .await
            .expect("partial write");
        drop(client);

        let mut buffer = BytesMut::new();
        let err = read_frame(&mut server, &mut buffer)
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("ended mid-frame"));
    }
}
