//! WebSocket implementation of [`SocketConnector`].

use agent_link_core::{
    TransportError,
    traits::{SocketCommand, SocketConnection, SocketConnector, SocketEvent},
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite};
use tokio_util::sync::CancellationToken;
use tungstenite::Message;

/// Opens sockets with `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn map_connect_error(e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::Http(response) => TransportError::Http {
            status: response.status().as_u16(),
            message: response
                .status()
                .canonical_reason()
                .unwrap_or("upgrade rejected")
                .to_string(),
        },
        other => TransportError::Connect(other.to_string()),
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<SocketConnection, TransportError> {
        let (stream, _response) = connect_async(url).await.map_err(map_connect_error)?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SocketCommand>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketEvent>();
        let cancel = CancellationToken::new();

        // Writer: forwards commands until told to close or the reader stops.
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let command = tokio::select! {
                    command = out_rx.recv() => command,
                    () = writer_cancel.cancelled() => break,
                };
                match command {
                    Some(SocketCommand::Text(text)) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            tracing::debug!("socket write failed: {e}");
                            break;
                        }
                    }
                    Some(SocketCommand::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = sink.close().await;
            writer_cancel.cancel();
            // Dropping the receiver marks the connection closed for senders.
            drop(out_rx);
        });

        // Reader: forwards text frames, always ends with `Closed`.
        tokio::spawn(async move {
            let closed = loop {
                let next = tokio::select! {
                    next = source.next() => next,
                    () = cancel.cancelled() => break SocketEvent::Closed {
                        code: None,
                        reason: "closed locally".to_string(),
                    },
                };
                match next {
                    Some(Ok(Message::Text(text))) => {
                        let _ = in_tx.send(SocketEvent::Text(text));
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            let _ = in_tx.send(SocketEvent::Text(text));
                        }
                        Err(_) => tracing::debug!("ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => SocketEvent::Closed {
                                code: Some(u16::from(frame.code)),
                                reason: frame.reason.into_owned(),
                            },
                            None => SocketEvent::Closed {
                                code: None,
                                reason: String::new(),
                            },
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("socket read failed: {e}");
                        break SocketEvent::Closed {
                            code: None,
                            reason: e.to_string(),
                        };
                    }
                    None => {
                        break SocketEvent::Closed {
                            code: None,
                            reason: "connection reset".to_string(),
                        };
                    }
                }
            };
            let _ = in_tx.send(closed);
            cancel.cancel();
        });

        Ok(SocketConnection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
