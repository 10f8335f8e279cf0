//! One websocket connection attached to the shared bridge.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage, Utf8Bytes};
use tracing::{debug, info, warn};

use pipebridge_core::Message;

use crate::shutdown;
use crate::subprocess::{BridgeError, OutputSubscription, ProcessBridge, Pushed};

use super::types::{ChannelError, CloseReason};

/// Pass-through notice sent when a frame is refused by the `reject` policy.
pub const REJECTED_NOTICE: &str = "REJECTED: input queue full";

type PendingSubmit = Pin<Box<dyn Future<Output = Result<Pushed, BridgeError>> + Send>>;

/// What an inbound frame asks the channel to do.
enum Inbound {
    Submit(Vec<u8>),
    Close,
    Ignore,
}

/// Resolves with the pending submit's outcome. Never resolves when there is none.
async fn wait_pending(pending: &mut Option<PendingSubmit>) -> Result<Pushed, BridgeError> {
    match pending.as_mut() {
        Some(submit) => submit.await,
        None => std::future::pending().await,
    }
}

/// Adapter between one connection's frames and the bridge.
pub struct ConnectionChannel<S> {
    id: String,
    ws: S,
    bridge: Arc<ProcessBridge>,
    output: OutputSubscription,
    shutdown: watch::Receiver<bool>,
    frames_in: u64,
    frames_out: u64,
    input_closed: bool,
}

impl<S> ConnectionChannel<S>
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>>
        + Sink<WsMessage, Error = tungstenite::Error>
        + Unpin,
{
    /// Bind a connection to the bridge.
    ///
    /// The channel subscribes to the bridge output immediately, so in
    /// broadcast mode it sees everything emitted from here on.
    pub fn new(
        id: impl Into<String>,
        ws: S,
        bridge: Arc<ProcessBridge>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let output = bridge.subscribe();
        Self {
            id: id.into(),
            ws,
            bridge,
            output,
            shutdown,
            frames_in: 0,
            frames_out: 0,
            input_closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Drive the connection until it closes.
    ///
    /// Each iteration waits for whichever comes first: an inbound frame, the
    /// pending submit, a bridge message or the shutdown signal. While a
    /// submit is pending no further frames are read, but output keeps
    /// flowing, so a child blocked on its stdout can always make progress.
    pub async fn run(mut self) -> Result<CloseReason, ChannelError> {
        info!(connection_id = %self.id, "Connection attached to bridge");

        let mut pending: Option<PendingSubmit> = None;
        let reason = loop {
            tokio::select! {
                frame = self.ws.next(), if pending.is_none() => {
                    match frame {
                        Some(Ok(frame)) => match self.on_receive(frame) {
                            Inbound::Submit(payload) => pending = Some(self.submit(payload)),
                            Inbound::Close => break CloseReason::ClientClosed,
                            Inbound::Ignore => {}
                        },
                        Some(Err(e)) => return Err(e.into()),
                        None => break CloseReason::ClientClosed,
                    }
                }
                submitted = wait_pending(&mut pending), if pending.is_some() => {
                    pending = None;
                    self.on_submitted(submitted).await?;
                }
                message = self.output.recv() => {
                    if let Some(message) = message {
                        self.send_text(on_bridge_message(&message)).await?;
                    } else {
                        self.close("process exited").await;
                        break CloseReason::BridgeTerminated;
                    }
                }
                () = shutdown::requested(&mut self.shutdown) => {
                    self.close("server shutting down").await;
                    break CloseReason::ServerShutdown;
                }
            }
        };

        info!(
            connection_id = %self.id,
            ?reason,
            frames_in = self.frames_in,
            frames_out = self.frames_out,
            "Connection closed"
        );
        Ok(reason)
    }

    /// Classify one inbound frame; text and binary payloads go to the bridge.
    fn on_receive(&mut self, frame: WsMessage) -> Inbound {
        let payload = match frame {
            WsMessage::Text(text) => text.as_bytes().to_vec(),
            WsMessage::Binary(bytes) => bytes.to_vec(),
            WsMessage::Close(frame) => {
                debug!(connection_id = %self.id, ?frame, "Client sent close");
                return Inbound::Close;
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => return Inbound::Ignore,
        };
        self.frames_in += 1;
        if self.input_closed {
            return Inbound::Ignore;
        }
        Inbound::Submit(payload)
    }

    /// Start submitting one inbound payload to the bridge.
    fn submit(&self, payload: Vec<u8>) -> PendingSubmit {
        let bridge = Arc::clone(&self.bridge);
        Box::pin(async move { bridge.submit(payload).await })
    }

    async fn on_submitted(&mut self, submitted: Result<Pushed, BridgeError>) -> Result<(), ChannelError> {
        match submitted {
            Ok(_) => {}
            Err(BridgeError::QueueFull { capacity }) => {
                warn!(connection_id = %self.id, capacity, "Input rejected, queue full");
                self.send_text(REJECTED_NOTICE.to_string()).await?;
            }
            Err(e) => {
                // Output keeps flowing until the bridge finishes; the loop
                // closes the connection when it does.
                info!(connection_id = %self.id, error = %e, "Bridge no longer accepts input");
                self.input_closed = true;
            }
        }
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        self.ws.send(WsMessage::text(text)).await?;
        self.frames_out += 1;
        Ok(())
    }

    async fn close(&mut self, reason: &'static str) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Utf8Bytes::from_static(reason),
        };
        if let Err(e) = self.ws.send(WsMessage::Close(Some(frame))).await {
            debug!(connection_id = %self.id, error = %e, "Close frame not delivered");
        }
    }
}

/// Render a bridge message as the text frame sent to the client.
pub fn on_bridge_message(message: &Message) -> String {
    message.to_frame()
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn frames_follow_stream_tags() {
        assert_eq!(on_bridge_message(&Message::Info(b"tick".to_vec())), "INFO: tick");
        assert_eq!(on_bridge_message(&Message::Error(b"oops".to_vec())), "ERROR: oops");
        assert_eq!(on_bridge_message(&Message::Raw("EXIT: 0".into())), "EXIT: 0");
    }
}
