//! Message Stream Encryption handshake
//!
//! Drives the MSE exchange over any async byte stream, for either side of
//! the connection. The receiver detects a plain `\x13BitTorrent protocol`
//! opening and steps aside; otherwise both sides walk
//! `AwaitPeerKey -> KeyExchanged -> CipherSelected -> Established`.
//!
//! Bytes read past the end of the handshake are handed back in
//! [`MseOutcome::remainder`] still in wire form, so the codec stack's crypto
//! stage sees them in order.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::error::TorrentError;
use crate::protocol::crypto::{
    mse_hash, CryptoMethod, CryptoPolicy, DhKeyPair, MseCipher, PADDING_MAX_LENGTH, PUBLIC_KEY_LENGTH, VC,
};
use crate::protocol::handshake::{PROTOCOL_LENGTH, PROTOCOL_STRING};
use crate::torrent::InfoHash;

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MseState {
    AwaitPeerKey,
    KeyExchanged,
    CipherSelected,
    Established,
    /// The peer opened with a plain BitTorrent handshake
    Plaintext,
}

/// Result of a completed handshake
#[derive(Debug)]
pub struct MseOutcome {
    pub method: CryptoMethod,
    /// Present when RC4 was selected
    pub cipher: Option<MseCipher>,
    /// Torrent identified during the exchange (None for a plaintext opening)
    pub info_hash: Option<InfoHash>,
    /// Already-decrypted stream bytes (plaintext opening or receiver IA)
    pub initial_payload: Vec<u8>,
    /// Unconsumed wire bytes
    pub remainder: BytesMut,
}

/// One side of an MSE handshake
#[derive(Debug)]
pub struct MseHandshake {
    state: MseState,
    policy: CryptoPolicy,
    buffer: BytesMut,
}

fn random_padding(zeroed: bool) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut padding = vec![0u8; rng.gen_range(0..=PADDING_MAX_LENGTH)];
    if !zeroed {
        rng.fill(&mut padding[..]);
    }
    padding
}

fn xor20(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

impl MseHandshake {
    pub fn new(policy: CryptoPolicy) -> Self {
        Self {
            state: MseState::AwaitPeerKey,
            policy,
            buffer: BytesMut::with_capacity(1024),
        }
    }

    pub fn state(&self) -> MseState {
        self.state
    }

    fn transition(&mut self, next: MseState) {
        trace!("MSE {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    async fn fill<S: AsyncRead + Unpin>(&mut self, stream: &mut S, needed: usize) -> Result<()> {
        while self.buffer.len() < needed {
            let read = stream.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return Err(TorrentError::protocol_error_with_source(
                    "Connection closed during MSE handshake",
                    format!("state {:?}", self.state),
                )
                .into());
            }
        }
        Ok(())
    }

    /// Consume bytes up to and including `pattern`, which must start within
    /// `max_skip` bytes.
    async fn sync<S: AsyncRead + Unpin>(&mut self, stream: &mut S, pattern: &[u8], max_skip: usize) -> Result<()> {
        loop {
            if let Some(pos) = self.buffer.windows(pattern.len()).position(|w| w == pattern) {
                if pos > max_skip {
                    break;
                }
                self.buffer.advance(pos + pattern.len());
                return Ok(());
            }
            if self.buffer.len() >= max_skip + pattern.len() {
                break;
            }
            let needed = self.buffer.len() + 1;
            self.fill(stream, needed).await?;
        }
        Err(TorrentError::protocol_error_with_source(
            "MSE synchronisation failed",
            format!("pattern not found within {} bytes", max_skip),
        )
        .into())
    }

    async fn take_decrypted<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        cipher: &mut MseCipher,
        length: usize,
    ) -> Result<Vec<u8>> {
        self.fill(stream, length).await?;
        let mut bytes = self.buffer.split_to(length).to_vec();
        cipher.decrypt(&mut bytes);
        Ok(bytes)
    }

    async fn generate_keys() -> Result<DhKeyPair> {
        tokio::task::spawn_blocking(DhKeyPair::generate)
            .await
            .map_err(|e| TorrentError::protocol_error_with_source("Key generation failed", e.to_string()).into())
    }

    async fn derive_secret(keys: DhKeyPair, peer_key: Vec<u8>) -> Result<(DhKeyPair, [u8; PUBLIC_KEY_LENGTH])> {
        tokio::task::spawn_blocking(move || keys.shared_secret(&peer_key).map(|s| (keys, s)))
            .await
            .map_err(|e| TorrentError::protocol_error_with_source("Key agreement failed", e.to_string()))?
    }

    /// Outbound side: the torrent is known up front
    pub async fn initiate<S>(mut self, stream: &mut S, info_hash: InfoHash) -> Result<MseOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("Starting MSE handshake (initiator, policy {}) for {}", self.policy, info_hash);
        let keys = Self::generate_keys().await?;

        let mut opening = BytesMut::with_capacity(PUBLIC_KEY_LENGTH + PADDING_MAX_LENGTH);
        opening.put_slice(keys.public_key());
        opening.put_slice(&random_padding(false));
        stream.write_all(&opening).await?;
        stream.flush().await?;

        self.fill(stream, PUBLIC_KEY_LENGTH).await?;
        let peer_key = self.buffer.split_to(PUBLIC_KEY_LENGTH).to_vec();
        let (_keys, secret) = Self::derive_secret(keys, peer_key).await?;
        self.transition(MseState::KeyExchanged);

        let mut cipher = MseCipher::initiator(&secret, &info_hash);
        let mut probe = MseCipher::initiator(&secret, &info_hash);

        let req1 = mse_hash(b"req1", &[&secret]);
        let req2 = mse_hash(b"req2", &[info_hash.as_bytes()]);
        let req3 = mse_hash(b"req3", &[&secret]);
        let pad_c = random_padding(true);

        let mut tail = BytesMut::with_capacity(16 + pad_c.len());
        tail.put_slice(&VC);
        tail.put_u32(self.policy.provide());
        tail.put_u16(pad_c.len() as u16);
        tail.put_slice(&pad_c);
        tail.put_u16(0);
        cipher.encrypt(&mut tail);

        let mut request = BytesMut::with_capacity(40 + tail.len());
        request.put_slice(&req1);
        request.put_slice(&xor20(&req2, &req3));
        request.put_slice(&tail);
        stream.write_all(&request).await?;
        stream.flush().await?;

        let mut encrypted_vc = VC;
        probe.decrypt(&mut encrypted_vc);
        self.sync(stream, &encrypted_vc, PADDING_MAX_LENGTH).await?;
        let mut vc = VC;
        cipher.decrypt(&mut vc);

        let header = self.take_decrypted(stream, &mut cipher, 6).await?;
        let select = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let pad_d = u16::from_be_bytes([header[4], header[5]]) as usize;
        if pad_d > PADDING_MAX_LENGTH {
            return Err(TorrentError::protocol_error_with_source("padD too long", pad_d.to_string()).into());
        }
        self.take_decrypted(stream, &mut cipher, pad_d).await?;

        let method = match select {
            s if s == CryptoMethod::Rc4.bits() && self.policy.provide() & s != 0 => CryptoMethod::Rc4,
            s if s == CryptoMethod::Plaintext.bits() && self.policy.provide() & s != 0 => CryptoMethod::Plaintext,
            other => {
                warn!("Peer selected unsupported crypto method 0x{:x}", other);
                return Err(TorrentError::policy_error_with_source(
                    "Peer selected a crypto method we did not offer",
                    format!("select=0x{:x}", other),
                )
                .into());
            }
        };
        self.transition(MseState::CipherSelected);
        self.transition(MseState::Established);
        debug!("MSE established (initiator): {:?}", method);

        Ok(MseOutcome {
            method,
            cipher: (method == CryptoMethod::Rc4).then_some(cipher),
            info_hash: Some(info_hash),
            initial_payload: Vec::new(),
            remainder: self.buffer,
        })
    }

    /// Inbound side: the torrent is identified from `known` info hashes
    pub async fn respond<S>(mut self, stream: &mut S, known: &[InfoHash]) -> Result<MseOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let opening_len = 1 + PROTOCOL_LENGTH as usize;
        self.fill(stream, opening_len).await?;
        if self.buffer[0] == PROTOCOL_LENGTH && &self.buffer[1..opening_len] == PROTOCOL_STRING.as_bytes() {
            if !self.policy.allows_plaintext() {
                warn!("Rejecting plaintext peer: encryption required");
                return Err(TorrentError::policy_error("Plaintext connection refused by crypto policy").into());
            }
            self.transition(MseState::Plaintext);
            debug!("Peer opened with plaintext handshake");
            let initial_payload = self.buffer.split().to_vec();
            return Ok(MseOutcome {
                method: CryptoMethod::Plaintext,
                cipher: None,
                info_hash: None,
                initial_payload,
                remainder: BytesMut::new(),
            });
        }
        if self.policy == CryptoPolicy::Plaintext {
            return Err(TorrentError::policy_error("Encrypted connection refused by crypto policy").into());
        }

        debug!("Starting MSE handshake (receiver, policy {})", self.policy);
        self.fill(stream, PUBLIC_KEY_LENGTH).await?;
        let peer_key = self.buffer.split_to(PUBLIC_KEY_LENGTH).to_vec();
        let keys = Self::generate_keys().await?;

        let mut opening = BytesMut::with_capacity(PUBLIC_KEY_LENGTH + PADDING_MAX_LENGTH);
        opening.put_slice(keys.public_key());
        opening.put_slice(&random_padding(false));
        stream.write_all(&opening).await?;
        stream.flush().await?;

        let (_keys, secret) = Self::derive_secret(keys, peer_key).await?;
        self.transition(MseState::KeyExchanged);

        let req1 = mse_hash(b"req1", &[&secret]);
        self.sync(stream, &req1, PADDING_MAX_LENGTH).await?;
        self.fill(stream, 20).await?;
        let mut obfuscated = [0u8; 20];
        obfuscated.copy_from_slice(&self.buffer.split_to(20));
        let req3 = mse_hash(b"req3", &[&secret]);
        let info_hash = known
            .iter()
            .copied()
            .find(|hash| xor20(&mse_hash(b"req2", &[hash.as_bytes()]), &req3) == obfuscated)
            .ok_or_else(|| TorrentError::protocol_error("MSE handshake for unknown torrent"))?;
        trace!("MSE peer requested torrent {}", info_hash);

        let mut cipher = MseCipher::receiver(&secret, &info_hash);
        let header = self.take_decrypted(stream, &mut cipher, 14).await?;
        if header[..8] != VC {
            return Err(TorrentError::protocol_error("MSE verification constant mismatch").into());
        }
        let provide = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        let pad_c = u16::from_be_bytes([header[12], header[13]]) as usize;
        if pad_c > PADDING_MAX_LENGTH {
            return Err(TorrentError::protocol_error_with_source("padC too long", pad_c.to_string()).into());
        }
        let rest = self.take_decrypted(stream, &mut cipher, pad_c + 2).await?;
        let ia_len = u16::from_be_bytes([rest[pad_c], rest[pad_c + 1]]) as usize;
        let initial_payload = self.take_decrypted(stream, &mut cipher, ia_len).await?;

        let method = self.policy.select(provide)?;
        self.transition(MseState::CipherSelected);

        let pad_d = random_padding(true);
        let mut reply = BytesMut::with_capacity(14 + pad_d.len());
        reply.put_slice(&VC);
        reply.put_u32(method.bits());
        reply.put_u16(pad_d.len() as u16);
        reply.put_slice(&pad_d);
        cipher.encrypt(&mut reply);
        stream.write_all(&reply).await?;
        stream.flush().await?;

        self.transition(MseState::Established);
        debug!("MSE established (receiver): {:?} for {}", method, info_hash);

        Ok(MseOutcome {
            method,
            cipher: (method == CryptoMethod::Rc4).then_some(cipher),
            info_hash: Some(info_hash),
            initial_payload,
            remainder: self.buffer,
        })
    }
}
