//! Tracker module
//!
//! HTTP and UDP tracker clients behind one manager that correlates
//! replies to launchers by transaction id.

pub mod client;
pub mod http;
pub mod launcher;
pub mod manager;
pub mod message;
pub mod udp;

pub use client::{TrackerClient, TrackerKind};
pub use launcher::TrackerLauncher;
pub use manager::TrackerManager;
pub use message::{AnnounceMessage, AnnounceRequest, ScrapeMessage, TrackerEvent, TrackerReply};
pub use udp::UdpResponse;
