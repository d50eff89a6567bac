//! One announce or scrape exchange between a client and a torrent

use std::sync::Arc;

use crate::torrent::InfoHash;
use crate::tracker::client::TrackerClient;
use crate::tracker::message::AnnounceRequest;

/// Short-lived exchange context. Its id is the transaction id of the
/// request, so replies are routed back to it.
#[derive(Debug, Clone)]
pub struct TrackerLauncher {
    id: u32,
    client: Arc<TrackerClient>,
    request: AnnounceRequest,
}

impl TrackerLauncher {
    pub(crate) fn new(id: u32, client: Arc<TrackerClient>, request: AnnounceRequest) -> Self {
        Self { id, client, request }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn client(&self) -> &Arc<TrackerClient> {
        &self.client
    }

    pub fn announce_url(&self) -> &str {
        self.client.announce_url()
    }

    pub fn request(&self) -> &AnnounceRequest {
        &self.request
    }

    pub fn info_hash(&self) -> InfoHash {
        self.request.info_hash
    }
}
