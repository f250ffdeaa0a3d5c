//! Loopback transport.
//!
//! Every message is encoded with the wire codec and delivered as bytes to the
//! destination's inbox. Receivers decode each sender's stream in small chunks, so
//! the resumable decoding path is exercised on every message.

use crate::atomic::context::Transport;
use crate::atomic::AtomicCache;
use crate::core::error::SendError;
use crate::core::types::NodeId;
use crate::wire::{CacheMessage, MessageDecoder, MessageEncoder};
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Encoded message together with its sender.
pub type Frame = (NodeId, Bytes);

/// Routes frames between the nodes of one process.
#[derive(Debug, Default)]
pub struct LoopbackRouter {
    routes: RwLock<HashMap<NodeId, mpsc::UnboundedSender<Frame>>>,
    /// Links (from, to) whose messages are silently dropped.
    blocked: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl LoopbackRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach `node` and return its inbox.
    pub fn register(&self, node: NodeId) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.write().insert(node, tx);
        rx
    }

    /// Detach `node`; sends to it fail with [`SendError::NodeLeft`].
    pub fn unregister(&self, node: NodeId) {
        self.routes.write().remove(&node);
    }

    /// Drop every message sent from `from` to `to`.
    pub fn block(&self, from: NodeId, to: NodeId) {
        self.blocked.write().insert((from, to));
    }

    pub fn unblock(&self, from: NodeId, to: NodeId) {
        self.blocked.write().remove(&(from, to));
    }

    /// Transport handle for `node`.
    pub fn transport(self: &Arc<Self>, node: NodeId) -> LoopbackTransport {
        LoopbackTransport {
            router: self.clone(),
            local: node,
        }
    }

    fn deliver(&self, from: NodeId, to: NodeId, message: &CacheMessage) -> Result<(), SendError> {
        if self.blocked.read().contains(&(from, to)) {
            tracing::debug!(from = %from, to = %to, kind = %message.kind(), "link blocked, dropping message");
            return Ok(());
        }

        let routes = self.routes.read();
        if !routes.contains_key(&from) {
            return Err(SendError::Failed {
                node: to,
                message: format!("{} is detached", from),
            });
        }
        let Some(tx) = routes.get(&to) else {
            return Err(SendError::NodeLeft(to));
        };
        let frame = MessageEncoder::encode_to_bytes(message);
        tx.send((from, frame)).map_err(|_| SendError::NodeLeft(to))
    }
}

/// Transport of one node attached to a [`LoopbackRouter`].
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    router: Arc<LoopbackRouter>,
    local: NodeId,
}

impl Transport for LoopbackTransport {
    fn send(&self, node: NodeId, message: CacheMessage) -> Result<(), SendError> {
        self.router.deliver(self.local, node, &message)
    }
}

/// Decode frames from `inbox` and dispatch them to `cache` until the inbox closes.
///
/// Each frame is fed to the sender's decoder `chunk_size` bytes at a time.
pub async fn run_inbox(
    cache: AtomicCache,
    mut inbox: mpsc::UnboundedReceiver<Frame>,
    chunk_size: usize,
) {
    let mut streams: HashMap<NodeId, (MessageDecoder, BytesMut)> = HashMap::new();
    let chunk_size = chunk_size.max(1);

    while let Some((from, frame)) = inbox.recv().await {
        let (decoder, buffer) = streams
            .entry(from)
            .or_insert_with(|| (MessageDecoder::new(), BytesMut::new()));

        for chunk in frame.chunks(chunk_size) {
            buffer.extend_from_slice(chunk);
            loop {
                match decoder.decode(buffer) {
                    Ok(Some(message)) => cache.on_message(from, message),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(node = %from, error = %e, "dropping malformed stream");
                        buffer.clear();
                        break;
                    }
                }
            }
        }
    }

    tracing::debug!(node = %cache.local_node(), "inbox closed");
}
