//! MSE cryptographic primitives
//!
//! Diffie-Hellman over the fixed 768-bit MSE prime, the RC4 stream cipher,
//! the paired per-direction ciphers derived from the shared secret, and the
//! local encryption policy.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use num_bigint::BigUint;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::trace;

use crate::error::TorrentError;
use crate::torrent::InfoHash;

/// Length of a DH public key / shared secret on the wire
pub const PUBLIC_KEY_LENGTH: usize = 96;
/// Length of the random private exponent
pub const PRIVATE_KEY_LENGTH: usize = 20;
/// Upper bound for every MSE padding field
pub const PADDING_MAX_LENGTH: usize = 512;
/// Verification constant
pub const VC: [u8; 8] = [0u8; 8];
/// `crypto_provide` bit for plaintext
pub const CRYPTO_PLAINTEXT: u32 = 0x01;
/// `crypto_provide` bit for RC4
pub const CRYPTO_RC4: u32 = 0x02;

const KEYSTREAM_DISCARD: usize = 1024;
const GENERATOR: u32 = 2;

const PRIME: [u8; PUBLIC_KEY_LENGTH] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2,
    0x21, 0x68, 0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1,
    0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6,
    0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45,
    0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
    0xA6, 0x3A, 0x36, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x09, 0x05, 0x63,
];

fn prime() -> BigUint {
    BigUint::from_bytes_be(&PRIME)
}

fn to_fixed(value: &BigUint) -> [u8; PUBLIC_KEY_LENGTH] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; PUBLIC_KEY_LENGTH];
    out[PUBLIC_KEY_LENGTH - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Ephemeral DH key pair
pub struct DhKeyPair {
    private: BigUint,
    public: [u8; PUBLIC_KEY_LENGTH],
}

impl DhKeyPair {
    /// Random 160-bit private exponent, public key `G^x mod P`
    pub fn generate() -> Self {
        let mut secret = [0u8; PRIVATE_KEY_LENGTH];
        rand::thread_rng().fill(&mut secret[..]);
        let private = BigUint::from_bytes_be(&secret);
        let public = BigUint::from(GENERATOR).modpow(&private, &prime());
        Self {
            private,
            public: to_fixed(&public),
        }
    }

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.public
    }

    /// `S = Y^x mod P`; rejects degenerate peer keys
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<[u8; PUBLIC_KEY_LENGTH]> {
        let p = prime();
        let y = BigUint::from_bytes_be(peer_public);
        let one = BigUint::from(1u32);
        if peer_public.len() != PUBLIC_KEY_LENGTH || y <= one || y >= &p - &one {
            return Err(TorrentError::protocol_error("Invalid MSE public key").into());
        }
        Ok(to_fixed(&y.modpow(&self.private, &p)))
    }
}

impl fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhKeyPair({}..)", hex::encode(&self.public[..8]))
    }
}

/// RC4 keystream
#[derive(Clone)]
pub struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Self {
        let mut state = [0u8; 256];
        for (i, val) in state.iter_mut().enumerate() {
            *val = i as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }
        Rc4 { state, i: 0, j: 0 }
    }

    /// XOR the keystream into `data`
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            *byte ^= self.next_byte();
        }
    }

    pub fn discard(&mut self, count: usize) {
        for _ in 0..count {
            self.next_byte();
        }
    }

    fn next_byte(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.state[self.i as usize]);
        self.state.swap(self.i as usize, self.j as usize);
        self.state[(self.state[self.i as usize].wrapping_add(self.state[self.j as usize])) as usize]
    }
}

impl fmt::Debug for Rc4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Rc4 { .. }")
    }
}

/// Direction-paired RC4 ciphers for one connection
#[derive(Debug, Clone)]
pub struct MseCipher {
    encryptor: Rc4,
    decryptor: Rc4,
}

impl MseCipher {
    /// Initiator encrypts with keyA and decrypts with keyB
    pub fn initiator(secret: &[u8], skey: &InfoHash) -> Self {
        Self {
            encryptor: Self::keystream(b"keyA", secret, skey),
            decryptor: Self::keystream(b"keyB", secret, skey),
        }
    }

    /// Receiver encrypts with keyB and decrypts with keyA
    pub fn receiver(secret: &[u8], skey: &InfoHash) -> Self {
        Self {
            encryptor: Self::keystream(b"keyB", secret, skey),
            decryptor: Self::keystream(b"keyA", secret, skey),
        }
    }

    fn keystream(label: &[u8], secret: &[u8], skey: &InfoHash) -> Rc4 {
        let mut hasher = Sha1::new();
        hasher.update(label);
        hasher.update(secret);
        hasher.update(skey.as_bytes());
        let mut rc4 = Rc4::new(&hasher.finalize());
        rc4.discard(KEYSTREAM_DISCARD);
        trace!("Derived {} keystream", String::from_utf8_lossy(label));
        rc4
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.encryptor.apply(data);
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.decryptor.apply(data);
    }
}

/// `HASH(label | parts...)`
pub fn mse_hash(label: &[u8], parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(label);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Negotiated stream method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoMethod {
    Plaintext,
    Rc4,
}

impl CryptoMethod {
    pub fn bits(self) -> u32 {
        match self {
            CryptoMethod::Plaintext => CRYPTO_PLAINTEXT,
            CryptoMethod::Rc4 => CRYPTO_RC4,
        }
    }
}

/// Local encryption policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CryptoPolicy {
    /// Only plaintext
    Plaintext,
    /// Plaintext when offered, RC4 otherwise
    PreferPlaintext,
    /// RC4 when offered, plaintext otherwise
    #[default]
    PreferEncrypt,
    /// Only RC4
    Encrypt,
}

impl CryptoPolicy {
    /// Bits offered in `crypto_provide`
    pub fn provide(self) -> u32 {
        match self {
            CryptoPolicy::Plaintext => CRYPTO_PLAINTEXT,
            CryptoPolicy::Encrypt => CRYPTO_RC4,
            CryptoPolicy::PreferPlaintext | CryptoPolicy::PreferEncrypt => CRYPTO_PLAINTEXT | CRYPTO_RC4,
        }
    }

    /// Whether outbound connections start with the encrypted handshake
    pub fn initiates_encrypted(self) -> bool {
        matches!(self, CryptoPolicy::PreferEncrypt | CryptoPolicy::Encrypt)
    }

    /// Whether a plaintext peer handshake may be accepted
    pub fn allows_plaintext(self) -> bool {
        self != CryptoPolicy::Encrypt
    }

    /// Choose a method from the bits a peer offered
    pub fn select(self, provide: u32) -> Result<CryptoMethod> {
        let plaintext = provide & CRYPTO_PLAINTEXT != 0;
        let rc4 = provide & CRYPTO_RC4 != 0;
        let selected = if !plaintext && !rc4 {
            None
        } else {
            match self {
                CryptoPolicy::Plaintext => plaintext.then_some(CryptoMethod::Plaintext),
                CryptoPolicy::PreferPlaintext => Some(if plaintext { CryptoMethod::Plaintext } else { CryptoMethod::Rc4 }),
                CryptoPolicy::PreferEncrypt => Some(if rc4 { CryptoMethod::Rc4 } else { CryptoMethod::Plaintext }),
                CryptoPolicy::Encrypt => rc4.then_some(CryptoMethod::Rc4),
            }
        };
        selected.ok_or_else(|| {
            TorrentError::policy_error_with_source(
                "No acceptable crypto method offered",
                format!("provide=0x{:x}, policy={}", provide, self),
            )
            .into()
        })
    }
}

impl fmt::Display for CryptoPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CryptoPolicy::Plaintext => "plaintext",
            CryptoPolicy::PreferPlaintext => "prefer-plaintext",
            CryptoPolicy::PreferEncrypt => "prefer-encrypt",
            CryptoPolicy::Encrypt => "encrypt",
        };
        f.write_str(name)
    }
}

impl FromStr for CryptoPolicy {
    type Err = TorrentError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "plaintext" => Ok(CryptoPolicy::Plaintext),
            "prefer-plaintext" => Ok(CryptoPolicy::PreferPlaintext),
            "prefer-encrypt" => Ok(CryptoPolicy::PreferEncrypt),
            "encrypt" => Ok(CryptoPolicy::Encrypt),
            other => Err(TorrentError::config_error_with_field(
                format!("Unknown crypto policy '{}'", other),
                "crypto",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rc4_known_vector() {
        let mut rc4 = Rc4::new(b"Key");
        let mut data = b"Plaintext".to_vec();
        rc4.apply(&mut data);
        assert_eq!(hex::encode(&data), "bbf316e8d940af0ad3");
    }

    #[test]
    fn test_rc4_discard_matches_apply() {
        let mut a = Rc4::new(b"TestKey123");
        a.discard(1024);
        let mut b = Rc4::new(b"TestKey123");
        b.apply(&mut [0u8; 1024]);
        let (mut x, mut y) = (*b"Test", *b"Test");
        a.apply(&mut x);
        b.apply(&mut y);
        assert_eq!(x, y);
    }

    #[test]
    fn test_dh_shared_secret_symmetry() {
        let a = DhKeyPair::generate();
        let b = DhKeyPair::generate();
        let s1 = a.shared_secret(b.public_key()).unwrap();
        let s2 = b.shared_secret(a.public_key()).unwrap();
        assert_eq!(s1, s2);
        assert!(a.shared_secret(&[0u8; PUBLIC_KEY_LENGTH]).is_err());
        assert!(a.shared_secret(&PRIME).is_err());
    }

    #[test]
    fn test_cipher_pairing() {
        let secret = [7u8; PUBLIC_KEY_LENGTH];
        let skey = InfoHash([3u8; 20]);
        let mut initiator = MseCipher::initiator(&secret, &skey);
        let mut receiver = MseCipher::receiver(&secret, &skey);

        let mut data = b"interested".to_vec();
        initiator.encrypt(&mut data);
        assert_ne!(&data, b"interested");
        receiver.decrypt(&mut data);
        assert_eq!(&data, b"interested");

        let mut reply = b"unchoke".to_vec();
        receiver.encrypt(&mut reply);
        initiator.decrypt(&mut reply);
        assert_eq!(&reply, b"unchoke");
    }

    #[test]
    fn test_policy_selection_table() {
        use CryptoMethod::*;
        let both = CRYPTO_PLAINTEXT | CRYPTO_RC4;
        assert_eq!(CryptoPolicy::Plaintext.select(both).unwrap(), Plaintext);
        assert!(CryptoPolicy::Plaintext.select(CRYPTO_RC4).is_err());
        assert_eq!(CryptoPolicy::PreferPlaintext.select(both).unwrap(), Plaintext);
        assert_eq!(CryptoPolicy::PreferPlaintext.select(CRYPTO_RC4).unwrap(), Rc4);
        assert_eq!(CryptoPolicy::PreferEncrypt.select(both).unwrap(), Rc4);
        assert_eq!(CryptoPolicy::PreferEncrypt.select(CRYPTO_PLAINTEXT).unwrap(), Plaintext);
        assert_eq!(CryptoPolicy::Encrypt.select(both).unwrap(), Rc4);
        assert!(CryptoPolicy::Encrypt.select(CRYPTO_PLAINTEXT).is_err());
        assert!(CryptoPolicy::PreferEncrypt.select(0).is_err());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("prefer-plaintext".parse::<CryptoPolicy>().unwrap(), CryptoPolicy::PreferPlaintext);
        assert!("sometimes".parse::<CryptoPolicy>().is_err());
        assert_eq!(CryptoPolicy::Encrypt.to_string(), "encrypt");
    }
}
