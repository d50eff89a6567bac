//! Peer wire codec stack
//!
//! An explicit, ordered chain of stages. Decoding runs
//! crypto -> framing -> message dispatch; encoding runs the same stages in
//! reverse. Each stage keeps its own state flags so callers cannot
//! desynchronise the stream: the framing stage reads a fixed 68-byte
//! handshake until one has been seen and refuses to encode messages before
//! the handshake has gone out.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, trace};

use crate::error::TorrentError;
use crate::protocol::crypto::MseCipher;
use crate::protocol::handshake::{Handshake, HANDSHAKE_LENGTH};
use crate::protocol::message::{Message, MAX_MESSAGE_LENGTH};

/// Decoded unit handed to the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Handshake(Handshake),
    Message(Message),
}

/// Framed but not yet interpreted bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Handshake(Vec<u8>),
    Payload(Vec<u8>),
}

/// Stream cipher stage; passthrough when no cipher was negotiated
#[derive(Debug, Default)]
pub struct CryptoStage {
    cipher: Option<MseCipher>,
}

impl CryptoStage {
    pub fn new(cipher: Option<MseCipher>) -> Self {
        Self { cipher }
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn decode(&mut self, data: &mut [u8]) {
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.decrypt(data);
        }
    }

    pub fn encode(&mut self, data: &mut [u8]) {
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.encrypt(data);
        }
    }
}

/// Length-prefix framing with the handshake special case
#[derive(Debug)]
pub struct FramingStage {
    handshake_received: bool,
    handshake_sent: bool,
    max_length: usize,
}

impl FramingStage {
    pub fn new(max_length: usize) -> Self {
        Self {
            handshake_received: false,
            handshake_sent: false,
            max_length,
        }
    }

    /// Take one frame off `buf` if complete
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if !self.handshake_received {
            if buf.len() < HANDSHAKE_LENGTH {
                return Ok(None);
            }
            self.handshake_received = true;
            return Ok(Some(Frame::Handshake(buf.split_to(HANDSHAKE_LENGTH).to_vec())));
        }

        if buf.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length > self.max_length {
            error!("Declared message length {} exceeds limit {}", length, self.max_length);
            return Err(TorrentError::protocol_error_with_source(
                "Message length exceeds limit",
                format!("{} > {}", length, self.max_length),
            )
            .into());
        }
        if buf.len() < 4 + length {
            return Ok(None);
        }
        buf.advance(4);
        Ok(Some(Frame::Payload(buf.split_to(length).to_vec())))
    }

    pub fn encode(&mut self, frame: &Frame, out: &mut BytesMut) -> Result<()> {
        match frame {
            Frame::Handshake(bytes) => {
                if self.handshake_sent {
                    return Err(TorrentError::protocol_error("Handshake already sent").into());
                }
                self.handshake_sent = true;
                out.put_slice(bytes);
            }
            Frame::Payload(payload) => {
                if !self.handshake_sent {
                    return Err(TorrentError::protocol_error("Message encoded before handshake").into());
                }
                if payload.len() > self.max_length {
                    return Err(TorrentError::protocol_error("Outgoing message exceeds limit").into());
                }
                out.put_u32(payload.len() as u32);
                out.put_slice(payload);
            }
        }
        Ok(())
    }
}

/// Frame interpretation
#[derive(Debug, Default)]
pub struct MessageStage;

impl MessageStage {
    pub fn decode(&mut self, frame: Frame) -> Result<WireEvent> {
        match frame {
            Frame::Handshake(bytes) => Ok(WireEvent::Handshake(Handshake::deserialize(&bytes)?)),
            Frame::Payload(payload) => Ok(WireEvent::Message(Message::deserialize(&payload)?)),
        }
    }

    pub fn encode(&mut self, event: &WireEvent) -> Frame {
        match event {
            WireEvent::Handshake(handshake) => Frame::Handshake(handshake.serialize()),
            WireEvent::Message(message) => {
                let mut payload = BytesMut::with_capacity(message.length() as usize);
                message.encode_payload(&mut payload);
                Frame::Payload(payload.to_vec())
            }
        }
    }
}

/// Ordered stage chain for one connection
#[derive(Debug)]
pub struct CodecStack {
    crypto: CryptoStage,
    framing: FramingStage,
    messages: MessageStage,
    inbound: BytesMut,
}

impl CodecStack {
    pub fn new(cipher: Option<MseCipher>) -> Self {
        Self::with_max_length(cipher, MAX_MESSAGE_LENGTH)
    }

    pub fn with_max_length(cipher: Option<MseCipher>, max_length: usize) -> Self {
        Self {
            crypto: CryptoStage::new(cipher),
            framing: FramingStage::new(max_length),
            messages: MessageStage,
            inbound: BytesMut::with_capacity(32 * 1024),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypto.is_encrypted()
    }

    /// Wire bytes from the socket
    pub fn feed(&mut self, raw: &[u8]) {
        let start = self.inbound.len();
        self.inbound.extend_from_slice(raw);
        self.crypto.decode(&mut self.inbound[start..]);
    }

    /// Bytes that were already decrypted (MSE initial payload)
    pub fn feed_plaintext(&mut self, data: &[u8]) {
        self.inbound.extend_from_slice(data);
    }

    /// Next decoded event, if a full frame is buffered
    pub fn decode(&mut self) -> Result<Option<WireEvent>> {
        match self.framing.decode(&mut self.inbound)? {
            Some(frame) => self.messages.decode(frame).map(Some),
            None => Ok(None),
        }
    }

    /// Encode one event into wire bytes
    pub fn encode(&mut self, event: &WireEvent) -> Result<BytesMut> {
        let frame = self.messages.encode(event);
        let mut out = BytesMut::new();
        self.framing.encode(&frame, &mut out)?;
        self.crypto.encode(&mut out);
        Ok(out)
    }

    /// Read until one event is decoded
    pub async fn read_event<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<WireEvent> {
        let mut chunk = vec![0u8; 16 * 1024];
        loop {
            if let Some(event) = self.decode()? {
                return Ok(event);
            }
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(TorrentError::peer_error("Connection closed by peer").into());
            }
            trace!("Read {} bytes from peer", n);
            self.feed(&chunk[..n]);
        }
    }

    pub async fn write_event<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, event: &WireEvent) -> Result<()> {
        let bytes = self.encode(event)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn write_message<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, message: Message) -> Result<()> {
        self.write_event(writer, &WireEvent::Message(message)).await
    }
}
