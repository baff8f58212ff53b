//! Best-effort `newHeads` subscription.
//!
//! Nudges the realtime loop the moment the node sees a new head instead of
//! waiting for the next poll tick. Correctness never depends on this
//! stream: if the socket dies and cannot be re-established the receiver
//! simply stops yielding and polling carries on alone.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::codec;

#[derive(Clone, Debug)]
pub struct WsConfig {
    pub url: Url,
    pub reconnect_delay: Duration,
    /// Consecutive failed connects before giving up for good.
    pub max_reconnects: u32,
}

impl WsConfig {
    pub fn new(url: Url) -> Self {
        Self { url, reconnect_delay: Duration::from_secs(5), max_reconnects: 10 }
    }
}

/// Streams head block numbers pushed by the node.
pub fn subscribe_new_heads(config: WsConfig) -> (mpsc::Receiver<u64>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);
    let task = tokio::spawn(run(config, tx));
    (rx, task)
}

async fn run(config: WsConfig, tx: mpsc::Sender<u64>) {
    let mut failures: u32 = 0;
    while failures < config.max_reconnects {
        match connect_and_stream(&config, &tx).await {
            Ok(()) => return, // receiver dropped, shutting down
            Err(err) => {
                failures += 1;
                warn!(%err, failures, "newHeads subscription lost");
                sleep(config.reconnect_delay).await;
            }
        }
    }
    warn!("giving up on newHeads subscription; realtime falls back to polling only");
}

async fn connect_and_stream(
    config: &WsConfig,
    tx: &mpsc::Sender<u64>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let (mut stream, _) = connect_async(config.url.as_str()).await?;
    stream
        .send(Message::Text(
            json!({
                "id": 1,
                "jsonrpc": "2.0",
                "method": "eth_subscribe",
                "params": ["newHeads"]
            })
            .to_string(),
        ))
        .await?;
    info!(url = %config.url, "subscribed to newHeads");

    while let Some(message) = stream.next().await {
        let Message::Text(text) = message? else { continue };
        let Some(number) = head_number(&text) else { continue };
        debug!(number, "newHeads nudge");
        if tx.send(number).await.is_err() {
            return Ok(());
        }
    }
    Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
}

fn head_number(text: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(text).ok()?;
    let number = value
        .get("params")?
        .get("result")?
        .get("number")?
        .as_str()?;
    codec::decode_quantity(number).ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_new_heads_notification() {
        let text = r#"{
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0x9ce59a13059e417087c02d3236a0b1cc",
                "result": {"number": "0x1b4", "hash": "0x00"}
            }
        }"#;
        assert_eq!(head_number(text), Some(436));
    }

    #[test]
    fn ignores_subscription_confirmations() {
        assert_eq!(head_number(r#"{"id":1,"jsonrpc":"2.0","result":"0x9ce5"}"#), None);
        assert_eq!(head_number("not json"), None);
    }
}
