use std::sync::Mutex;
use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::debug;
use crate::datagram_stream::StreamHandle;
use crate::ids::{NodeId, StreamId};

/// All live streams, keyed by peer and stream id. Inbound packets are routed through this, and
///  a stream removes itself once it is fully torn down.
#[derive(Default)]
pub struct StreamRegistry {
    streams: Mutex<FxHashMap<(NodeId, StreamId), StreamHandle>>,
}

impl StreamRegistry {
    pub fn register(&self, peer: NodeId, stream_id: StreamId, handle: StreamHandle) -> anyhow::Result<()> {
        let mut streams = self.streams.lock().unwrap();
        if streams.contains_key(&(peer, stream_id)) {
            bail!("stream {} to peer {} is registered already", stream_id, peer);
        }
        debug!("registering stream {} to peer {}", stream_id, peer);
        streams.insert((peer, stream_id), handle);
        Ok(())
    }

    pub fn unregister(&self, peer: NodeId, stream_id: StreamId) -> anyhow::Result<StreamHandle> {
        match self.streams.lock().unwrap().remove(&(peer, stream_id)) {
            Some(handle) => {
                debug!("unregistered stream {} to peer {}", stream_id, peer);
                Ok(handle)
            }
            None => bail!("stream {} to peer {} is not registered", stream_id, peer),
        }
    }

    pub fn get(&self, peer: NodeId, stream_id: StreamId) -> Option<StreamHandle> {
        self.streams.lock().unwrap()
            .get(&(peer, stream_id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
