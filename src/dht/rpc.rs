//! Outstanding query table
//!
//! Every outbound query is registered under a fresh transaction id before
//! its datagram leaves. An entry is removed exactly once, either by the
//! matching reply or by the caller's timeout; whichever comes second finds
//! nothing and is a no-op.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace, warn};

use crate::dht::message::Response;
use crate::error::TorrentError;

/// Transaction ids are two bytes wide
const TRANSACTION_ID_SPACE: usize = 1 << 16;

/// How a query ended, as seen by the waiting caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcReply {
    Response(Response),
    Error { code: i64, message: String },
}

#[derive(Debug)]
struct PendingRpc {
    addr: SocketAddr,
    method: &'static str,
    sent_at: Instant,
    sender: oneshot::Sender<RpcReply>,
}

#[derive(Debug, Default)]
pub struct RpcTable {
    pending: Mutex<HashMap<Vec<u8>, PendingRpc>>,
    next_id: Mutex<u16>,
}

impl RpcTable {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: Mutex::new(rand::random()),
        }
    }

    /// Reserve a transaction id and the receiver its reply will arrive on.
    /// Fails when every id is taken by an outstanding query.
    pub async fn register(&self, addr: SocketAddr, method: &'static str) -> Result<(Vec<u8>, oneshot::Receiver<RpcReply>)> {
        let (sender, receiver) = oneshot::channel();
        let mut pending = self.pending.lock().await;
        let mut next = self.next_id.lock().await;
        let mut transaction_id = None;
        for _ in 0..TRANSACTION_ID_SPACE {
            let id = next.to_be_bytes().to_vec();
            *next = next.wrapping_add(1);
            if !pending.contains_key(&id) {
                transaction_id = Some(id);
                break;
            }
        }
        drop(next);
        let Some(transaction_id) = transaction_id else {
            warn!("No free transaction id for {} to {}", method, addr);
            return Err(TorrentError::dht_error_with_node("Too many outstanding queries", addr.to_string()).into());
        };
        trace!("Registered {} to {} as {}", method, addr, hex::encode(&transaction_id));
        pending.insert(
            transaction_id.clone(),
            PendingRpc {
                addr,
                method,
                sent_at: Instant::now(),
                sender,
            },
        );
        Ok((transaction_id, receiver))
    }

    /// Deliver a reply; false if nothing was waiting or the address differs
    pub async fn resolve(&self, transaction_id: &[u8], from: SocketAddr, reply: RpcReply) -> bool {
        let mut pending = self.pending.lock().await;
        match pending.get(transaction_id) {
            Some(entry) if entry.addr == from => {}
            Some(entry) => {
                debug!(
                    "Reply for {} came from {} instead of {}",
                    hex::encode(transaction_id),
                    from,
                    entry.addr
                );
                return false;
            }
            None => {
                trace!("No pending query for {}", hex::encode(transaction_id));
                return false;
            }
        }
        let Some(entry) = pending.remove(transaction_id) else {
            return false;
        };
        drop(pending);
        trace!(
            "{} to {} answered in {:?}",
            entry.method,
            entry.addr,
            entry.sent_at.elapsed()
        );
        // The caller may have stopped waiting already
        let _ = entry.sender.send(reply);
        true
    }

    /// Drop an entry after its timeout; false if it was already resolved
    pub async fn cancel(&self, transaction_id: &[u8]) -> bool {
        self.pending.lock().await.remove(transaction_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[tokio::test]
    async fn test_resolve_exactly_once() {
        let table = RpcTable::new();
        let (tid, receiver) = table.register(addr(), "ping").await.unwrap();
        let reply = RpcReply::Response(Response::default());
        assert!(table.resolve(&tid, addr(), reply.clone()).await);
        assert!(!table.resolve(&tid, addr(), reply.clone()).await);
        assert!(!table.cancel(&tid).await);
        assert_eq!(receiver.await.unwrap(), reply);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_cancel_then_late_reply() {
        let table = RpcTable::new();
        let (tid, receiver) = table.register(addr(), "find_node").await.unwrap();
        assert!(table.cancel(&tid).await);
        assert!(!table.resolve(&tid, addr(), RpcReply::Response(Response::default())).await);
        assert!(receiver.await.is_err());
    }

    #[tokio::test]
    async fn test_reply_from_wrong_address_ignored() {
        let table = RpcTable::new();
        let (tid, _receiver) = table.register(addr(), "ping").await.unwrap();
        let other: SocketAddr = "127.0.0.2:6881".parse().unwrap();
        assert!(!table.resolve(&tid, other, RpcReply::Response(Response::default())).await);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_transaction_ids_unique() {
        let table = RpcTable::new();
        let (a, _ra) = table.register(addr(), "ping").await.unwrap();
        let (b, _rb) = table.register(addr(), "ping").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_register_fails_when_ids_exhausted() {
        let table = RpcTable::new();
        let mut receivers = Vec::with_capacity(TRANSACTION_ID_SPACE);
        for _ in 0..TRANSACTION_ID_SPACE {
            receivers.push(table.register(addr(), "ping").await.unwrap());
        }
        assert_eq!(table.len().await, TRANSACTION_ID_SPACE);
        assert!(table.register(addr(), "ping").await.is_err());

        let (tid, _) = &receivers[0];
        assert!(table.cancel(tid).await);
        let (reused, _rx) = table.register(addr(), "ping").await.unwrap();
        assert_eq!(&reused, tid);
    }
}
