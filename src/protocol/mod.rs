//! BitTorrent peer wire protocol
//!
//! Handshake and message types, the layered codec stack, Message Stream
//! Encryption and the BEP 10 extensions.

pub mod codec;
pub mod compact;
pub mod crypto;
pub mod extension;
pub mod handshake;
pub mod message;
pub mod mse;

// Re-export main types
pub use codec::{CodecStack, CryptoStage, Frame, FramingStage, MessageStage, WireEvent};
pub use crypto::{CryptoMethod, CryptoPolicy, DhKeyPair, MseCipher, Rc4};
pub use extension::{
    ExtendedHandshake, ExtensionMessage, MetadataAssembler, MetadataMessage, PexMessage, METADATA_SLICE_LENGTH,
};
pub use handshake::{Handshake, HANDSHAKE_LENGTH, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId, MAX_MESSAGE_LENGTH};
pub use mse::{MseHandshake, MseOutcome, MseState};
