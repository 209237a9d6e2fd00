//! Framing for coordinator RPC.
//!
//! tarpc messages travel as length-delimited JSON frames over any
//! `AsyncRead + AsyncWrite` stream. The coordinator uses TCP; tests also use
//! tarpc's in-memory channel transport.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, RuntimeError};

/// Create a tarpc serde transport over a byte stream.
pub fn tarpc_transport<S, Item, SinkItem>(
    stream: S,
) -> tarpc::serde_transport::Transport<S, Item, SinkItem, tokio_serde::formats::Json<Item, SinkItem>>
where
    S: AsyncRead + AsyncWrite,
    Item: for<'de> serde::Deserialize<'de>,
    SinkItem: serde::Serialize,
{
    tarpc::serde_transport::new(
        tokio_util::codec::length_delimited::Builder::new().new_framed(stream),
        tokio_serde::formats::Json::default(),
    )
}

/// Connect to `addr`, retrying refused connections until `timeout` elapses.
pub async fn connect_with_retry(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) if Instant::now() < deadline => {
                debug!(%addr, attempts, error = %e, "coordinator not reachable yet");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => {
                return Err(RuntimeError::Rendezvous(format!(
                    "could not reach coordinator at {addr} after {attempts} attempts: {e}"
                )))
            }
        }
    }
}
