use std::io::{Read, Write};

use super::protocol::Message;
use crate::error::{Error, Result};

/// Maximum frame payload. An oversized frame is a framing error, which is
/// always fatal for the connection that produced it.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Write one message: 4-byte big-endian payload length, then the JSON
/// payload.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    let payload = serde_json::to_vec(message).map_err(|e| Error::Framing(e.to_string()))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::Framing(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one message. A clean EOF at a frame boundary surfaces as
/// `Io(UnexpectedEof)` (the peer hung up); EOF inside a frame is a framing
/// error.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Framing(format!("frame too large: {} bytes", len)));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Framing("connection closed mid-frame".into())
        } else {
            Error::Io(e)
        }
    })?;
    serde_json::from_slice(&payload).map_err(|e| Error::Framing(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_binary_payloads() {
        let mut wire = Vec::new();
        let message = Message::OutputFrame {
            bytes: (0u8..=255).collect(),
        };
        write_message(&mut wire, &message).unwrap();
        write_message(&mut wire, &Message::ListRequest).unwrap();

        let mut cursor = Cursor::new(wire);
        match read_message(&mut cursor).unwrap() {
            Message::OutputFrame { bytes } => assert_eq!(bytes, (0u8..=255).collect::<Vec<u8>>()),
            other => panic!("unexpected message: {}", other.kind_name()),
        }
        assert!(matches!(
            read_message(&mut cursor).unwrap(),
            Message::ListRequest
        ));
    }

    #[test]
    fn length_prefix_is_big_endian() {
        let mut wire = Vec::new();
        write_message(&mut wire, &Message::ListRequest).unwrap();
        let len = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
        assert_eq!(len, wire.len() - 4);
    }

    #[test]
    fn oversized_header_is_a_framing_error() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());
        wire.extend_from_slice(b"xxxx");
        assert!(matches!(
            read_message(&mut Cursor::new(wire)),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn truncated_payload_is_a_framing_error() {
        let mut wire = Vec::new();
        write_message(&mut wire, &Message::ListRequest).unwrap();
        wire.truncate(wire.len() - 2);
        assert!(matches!(
            read_message(&mut Cursor::new(wire)),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn garbage_payload_is_a_framing_error() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&4u32.to_be_bytes());
        wire.extend_from_slice(b"!!!!");
        assert!(matches!(
            read_message(&mut Cursor::new(wire)),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn clean_eof_is_distinguishable() {
        let err = read_message(&mut Cursor::new(Vec::new())).unwrap_err();
        match err {
            Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {}", other),
        }
    }
}
