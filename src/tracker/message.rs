//! Tracker request and reply types shared by the HTTP and UDP clients

use std::fmt;
use std::net::SocketAddr;

use crate::torrent::InfoHash;

/// Announce event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerEvent {
    #[default]
    None,
    Completed,
    Started,
    Stopped,
}

impl TrackerEvent {
    /// Value of the HTTP `event` parameter; empty for regular announces
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Completed => "completed",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
        }
    }

    pub fn udp_id(&self) -> u32 {
        match self {
            TrackerEvent::None => 0,
            TrackerEvent::Completed => 1,
            TrackerEvent::Started => 2,
            TrackerEvent::Stopped => 3,
        }
    }
}

impl fmt::Display for TrackerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerEvent::None => f.write_str("none"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Parameters of one announce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
    pub numwant: u32,
}

impl AnnounceRequest {
    pub fn new(info_hash: InfoHash, peer_id: [u8; 20], port: u16) -> Self {
        Self {
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: TrackerEvent::None,
            numwant: 50,
        }
    }
}

/// Announce reply, tagged with the launcher id it answers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnnounceMessage {
    pub id: u32,
    pub interval: u32,
    pub seeders: u32,
    pub leechers: u32,
    pub peers: Vec<SocketAddr>,
    pub warning: Option<String>,
}

/// Scrape reply for a single torrent
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScrapeMessage {
    pub id: u32,
    pub seeders: u32,
    pub completed: u32,
    pub leechers: u32,
}

/// What a pending launcher receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerReply {
    Announce(AnnounceMessage),
    Scrape(ScrapeMessage),
    /// Tracker-reported failure
    Failure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_encodings() {
        assert_eq!(TrackerEvent::None.udp_id(), 0);
        assert_eq!(TrackerEvent::Completed.udp_id(), 1);
        assert_eq!(TrackerEvent::Started.udp_id(), 2);
        assert_eq!(TrackerEvent::Stopped.udp_id(), 3);
        assert_eq!(TrackerEvent::None.as_str(), "");
        assert_eq!(TrackerEvent::Started.to_string(), "started");
    }
}
