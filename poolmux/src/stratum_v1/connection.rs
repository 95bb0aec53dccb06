//! Line-delimited JSON transport to a Stratum v1 pool.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_util::codec::{Framed, LinesCodec};

use super::error::{StratumError, StratumResult};
use super::messages::JsonRpcMessage;
use crate::tracing::prelude::*;

/// Longest line accepted from a pool. `mining.notify` with a long merkle
/// path stays far below this.
const MAX_LINE_LENGTH: usize = 64 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Connection {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Connection {
    /// Connect to `stratum+tcp://host:port` (the scheme is optional).
    pub async fn connect(url: &str) -> StratumResult<Self> {
        let address = url
            .strip_prefix("stratum+tcp://")
            .unwrap_or(url)
            .trim_end_matches('/');
        if address.rsplit_once(':').is_none() {
            return Err(StratumError::InvalidUrl(url.to_string()));
        }

        debug!(address, "Connecting");
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| StratumError::Timeout)??;
        stream.set_nodelay(true)?;

        Ok(Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
        })
    }

    /// Read the next message. Returns `None` when the pool closes the
    /// connection.
    pub async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        loop {
            let Some(line) = self.framed.next().await.transpose()? else {
                return Ok(None);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            trace!(rx = %line);
            return Ok(Some(serde_json::from_str(line)?));
        }
    }

    pub async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        let line = serde_json::to_string(msg)?;
        trace!(tx = %line);
        self.framed.send(line).await?;
        Ok(())
    }
}
