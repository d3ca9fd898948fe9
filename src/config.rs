use anyhow::bail;
use rustc_hash::FxHashMap;
use crate::ids::StreamId;

pub struct DatagramStreamConfig {
    pub default_stream_config: StreamConfig,
    /// Overrides for individual streams, e.g. a control stream that carries small messages only
    pub specific_stream_configs: FxHashMap<StreamId, StreamConfig>,
}

impl Default for DatagramStreamConfig {
    fn default() -> Self {
        DatagramStreamConfig {
            default_stream_config: StreamConfig::default(),
            specific_stream_configs: FxHashMap::default(),
        }
    }
}

impl DatagramStreamConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.default_stream_config.validate()?;
        for (stream_id, config) in &self.specific_stream_configs {
            if let Err(e) = config.validate() {
                bail!("invalid config for stream {}: {}", stream_id, e);
            }
        }
        Ok(())
    }

    pub fn get_effective_stream_config(&self, stream_id: StreamId) -> StreamConfig {
        self.specific_stream_configs.get(&stream_id)
            .unwrap_or(&self.default_stream_config)
            .clone()
    }
}

#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// This is the number of bytes a single incoming message may hold in its reassembly buffer
    ///  beyond what the consumer has read so far. A chunk reaching further than that is rejected,
    ///  which negatively acknowledges the packet carrying it. The sender's transport will
    ///  deliver it again later, by which time the consumer has hopefully caught up.
    ///
    /// NB: This bounds buffering per message, not per stream. With unordered streams, many
    ///  messages can be buffering concurrently.
    pub max_message_buffer: u64,

    /// The number of times sending the end-of-stream marker is retried after the transport
    ///  reported the peer as temporarily unavailable. After that, the stream is closed without
    ///  waiting for the peer.
    pub max_close_retries: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            max_message_buffer: 4*1024*1024,
            max_close_retries: 5,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_buffer == 0 {
            bail!("max message buffer must be positive");
        }
        if self.max_close_retries == 0 {
            bail!("max close retries must be positive");
        }
        Ok(())
    }
}
