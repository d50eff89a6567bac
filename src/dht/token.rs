//! announce_peer tokens
//!
//! A token is SHA1(secret | requester ip). The secret rotates periodically
//! and the previous one is still honoured, so a token stays valid for one to
//! two rotation periods.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};
use tracing::debug;

const SECRET_LENGTH: usize = 16;
/// Bytes of the digest handed out as the token
const TOKEN_LENGTH: usize = 8;

#[derive(Debug)]
pub struct TokenManager {
    current: [u8; SECRET_LENGTH],
    previous: [u8; SECRET_LENGTH],
    rotated_at: Instant,
    rotation: Duration,
}

impl TokenManager {
    pub fn new(rotation: Duration) -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
            rotated_at: Instant::now(),
            rotation,
        }
    }

    fn token_with(secret: &[u8; SECRET_LENGTH], ip: &IpAddr) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(secret);
        match ip {
            IpAddr::V4(v4) => hasher.update(v4.octets()),
            IpAddr::V6(v6) => hasher.update(v6.octets()),
        }
        hasher.finalize()[..TOKEN_LENGTH].to_vec()
    }

    /// Token for `ip` under the current secret
    pub fn issue(&self, ip: &IpAddr) -> Vec<u8> {
        Self::token_with(&self.current, ip)
    }

    /// Accepts tokens issued under the current or the previous secret
    pub fn validate(&self, ip: &IpAddr, token: &[u8]) -> bool {
        token == Self::token_with(&self.current, ip).as_slice()
            || token == Self::token_with(&self.previous, ip).as_slice()
    }

    pub fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
        self.rotated_at = Instant::now();
        debug!("DHT token secret rotated");
    }

    /// Rotate if the period has elapsed; returns whether it did
    pub fn maybe_rotate(&mut self) -> bool {
        if self.rotated_at.elapsed() >= self.rotation {
            self.rotate();
            return true;
        }
        false
    }
}
