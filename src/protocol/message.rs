//! BitTorrent protocol messages
//!
//! Message ids, the [`Message`] enum and its payload codec. Framing (the
//! 4-byte length prefix) lives in the codec stack; `deserialize` takes the
//! payload that follows the prefix.

use bytes::{Buf, BufMut, BytesMut};
use anyhow::Result;
use tracing::{error, trace};

use crate::error::TorrentError;

/// Largest accepted message payload: a 1 MiB block plus the piece header
pub const MAX_MESSAGE_LENGTH: usize = 1024 * 1024 + 13;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            20 => Ok(MessageId::Extended),
            _ => {
                error!("Invalid message ID: {}", value);
                Err(TorrentError::protocol_error_with_source("Invalid message ID", format!("value: {}", value)).into())
            }
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
    /// BEP 10 message; id 0 is the extended handshake
    Extended { id: u8, payload: Vec<u8> },
}

fn expect_len(name: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        error!("{} message has wrong length: expected {}, got {}", name, expected, actual);
        return Err(TorrentError::protocol_error_with_source(
            format!("{} message has wrong length", name),
            format!("expected {} bytes, got {}", expected, actual),
        )
        .into());
    }
    Ok(())
}

impl Message {
    /// Get the message ID (returns None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::Extended { .. } => Some(MessageId::Extended),
            Message::KeepAlive => None,
        }
    }

    /// Payload length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
            Message::Extended { payload, .. } => 2 + payload.len() as u32,
        }
    }

    /// Append the payload (no length prefix)
    pub fn encode_payload(&self, buf: &mut BytesMut) {
        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            Message::Extended { id, payload } => {
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }
    }

    /// Serialize including the length prefix
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());
        self.encode_payload(&mut buf);
        trace!("Message serialized: {:?}, {} bytes", self.message_id(), buf.len());
        buf.to_vec()
    }

    /// Decode a payload; an empty payload is a keep-alive
    pub fn deserialize(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Ok(Message::KeepAlive);
        }
        if payload.len() > MAX_MESSAGE_LENGTH {
            return Err(TorrentError::protocol_error_with_source(
                "Message too long",
                format!("{} bytes", payload.len()),
            )
            .into());
        }

        let mut buf = payload;
        let message_id = MessageId::try_from(buf.get_u8())?;
        let body = buf.remaining();

        let message = match message_id {
            MessageId::Choke => {
                expect_len("Choke", body, 0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect_len("Unchoke", body, 0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect_len("Interested", body, 0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect_len("NotInterested", body, 0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect_len("Have", body, 4)?;
                Message::Have { piece_index: buf.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: buf.to_vec() },
            MessageId::Request => {
                expect_len("Request", body, 12)?;
                Message::Request {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                }
            }
            MessageId::Piece => {
                if body < 8 {
                    return Err(TorrentError::protocol_error_with_source(
                        "Piece message too short",
                        format!("expected at least 8 bytes, got {}", body),
                    )
                    .into());
                }
                Message::Piece {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    block: buf.to_vec(),
                }
            }
            MessageId::Cancel => {
                expect_len("Cancel", body, 12)?;
                Message::Cancel {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                }
            }
            MessageId::Port => {
                expect_len("Port", body, 2)?;
                Message::Port { listen_port: buf.get_u16() }
            }
            MessageId::Extended => {
                if body < 1 {
                    return Err(TorrentError::protocol_error("Extended message without id").into());
                }
                Message::Extended {
                    id: buf.get_u8(),
                    payload: buf.to_vec(),
                }
            }
        };
        trace!("Decoded {:?}", message.message_id());
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_framed(bytes: &[u8]) -> Message {
        let length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(length, bytes.len() - 4);
        Message::deserialize(&bytes[4..]).unwrap()
    }

    #[test]
    fn test_keepalive_wire_form() {
        assert_eq!(Message::KeepAlive.serialize(), vec![0, 0, 0, 0]);
        assert_eq!(Message::deserialize(&[]).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn test_request_and_piece_wire_form() {
        let request = Message::Request { index: 1, begin: 16384, length: 16384 };
        let bytes = request.serialize();
        assert_eq!(&bytes[..5], &[0, 0, 0, 13, 6]);
        assert_eq!(decode_framed(&bytes), request);

        let piece = Message::Piece { index: 10, begin: 0, block: vec![1, 2, 3, 4, 5] };
        assert_eq!(decode_framed(&piece.serialize()), piece);
    }

    #[test]
    fn test_extended_and_port() {
        let ext = Message::Extended { id: 0, payload: b"d1:md11:ut_metadatai1eee".to_vec() };
        assert_eq!(decode_framed(&ext.serialize()), ext);
        let port = Message::Port { listen_port: 6881 };
        assert_eq!(port.serialize(), vec![0, 0, 0, 3, 9, 0x1a, 0xe1]);
    }

    #[test]
    fn test_wrong_lengths_rejected() {
        assert!(Message::deserialize(&[4, 0, 0, 1]).is_err());
        assert!(Message::deserialize(&[0, 1]).is_err());
        assert!(Message::deserialize(&[6, 0, 0, 0, 1]).is_err());
        assert!(Message::deserialize(&[7, 0, 0]).is_err());
        assert!(Message::deserialize(&[20]).is_err());
    }

    #[test]
    fn test_message_length() {
        assert_eq!(Message::Choke.length(), 1);
        assert_eq!(Message::Have { piece_index: 0 }.length(), 5);
        assert_eq!(Message::Cancel { index: 0, begin: 0, length: 0 }.length(), 13);
        assert_eq!(Message::Piece { index: 0, begin: 0, block: vec![1, 2, 3] }.length(), 12);
        assert_eq!(Message::Extended { id: 1, payload: vec![0; 4] }.length(), 6);
    }

    #[test]
    fn test_message_id_from_u8() {
        assert_eq!(MessageId::try_from(0).unwrap(), MessageId::Choke);
        assert_eq!(MessageId::try_from(9).unwrap(), MessageId::Port);
        assert_eq!(MessageId::try_from(20).unwrap(), MessageId::Extended);
        assert!(MessageId::try_from(10).is_err());
    }
}
