use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use gantry_core::error::{GantryError, Result};

type WsTx = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsRx = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A live subscription to the server's push channel.
///
/// The server only pushes events to clients subscribed at emission time,
/// so the channel must be connected BEFORE the graph is queued — a
/// fast-completing graph emits its completion event immediately.
pub struct PushChannel {
    tx: WsTx,
    rx: WsRx,
}

/// Subscribe to the push channel for `client_id`.
pub async fn connect(ws_host: &str, client_id: &str) -> Result<PushChannel> {
    let url = format!("ws://{}/ws?clientId={}", ws_host, client_id);
    debug!(%url, "connecting to push channel");

    let (stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| GantryError::Stream(e.to_string()))?;
    let (tx, rx) = stream.split();
    Ok(PushChannel { tx, rx })
}

impl PushChannel {
    /// Consume the channel until the "execution complete" event for
    /// `prompt_id` arrives: an `executing` event whose current node is
    /// null. Binary frames are progress previews and are ignored.
    ///
    /// No timeout — a hung server stalls the caller, an accepted
    /// liveness dependency on the external collaborator.
    pub async fn await_completion(mut self, prompt_id: &str) -> Result<()> {
        while let Some(frame) = self.rx.next().await {
            let frame = frame.map_err(|e| GantryError::Stream(e.to_string()))?;
            let text = match frame {
                WsMessage::Text(t) => t.to_string(),
                WsMessage::Ping(data) => {
                    let _ = self.tx.send(WsMessage::Pong(data)).await;
                    continue;
                }
                WsMessage::Close(_) => {
                    return Err(GantryError::Stream(
                        "push channel closed before completion".into(),
                    ));
                }
                // Binary preview frames
                _ => continue,
            };

            let event: serde_json::Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "unparseable push frame, skipping");
                    continue;
                }
            };

            if event["type"] == "executing" {
                let data = &event["data"];
                if data["node"].is_null() && data["prompt_id"] == prompt_id {
                    debug!(prompt_id, "execution complete");
                    return Ok(());
                }
            }
        }

        Err(GantryError::Stream(
            "push channel ended before completion".into(),
        ))
    }
}
