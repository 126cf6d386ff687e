#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens gateway sockets. Swappable so the connection state machine can run in memory.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
	async fn connect(&self, url: &Url) -> Result<Box<dyn GatewaySocket>, TransportError>;
}

/// What a socket read produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
	Text(String),
	/// Ping, pong or an ignored binary frame. Proves the peer is alive but carries no gateway frame.
	Control,
}

/// One open text-frame socket.
#[async_trait]
pub trait GatewaySocket: Send {
	async fn send(&mut self, text: String) -> Result<(), TransportError>;

	/// Next inbound message. Must be cancel-safe: it is polled inside `select!`.
	async fn recv(&mut self) -> Result<SocketMessage, TransportError>;

	async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransport;

#[async_trait]
impl GatewayTransport for TungsteniteTransport {
	async fn connect(&self, url: &Url) -> Result<Box<dyn GatewaySocket>, TransportError> {
		let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
			.await
			.map_err(|err| TransportError::Connect(err.to_string()))?;
		Ok(Box::new(TungsteniteSocket { ws }))
	}
}

struct TungsteniteSocket {
	ws: WsStream,
}

#[async_trait]
impl GatewaySocket for TungsteniteSocket {
	async fn send(&mut self, text: String) -> Result<(), TransportError> {
		self.ws
			.send(Message::Text(text.into()))
			.await
			.map_err(|err| TransportError::Send(err.to_string()))
	}

	async fn recv(&mut self) -> Result<SocketMessage, TransportError> {
		loop {
			let Some(msg) = self.ws.next().await else {
				return Err(TransportError::Closed);
			};

			match msg.map_err(|err| TransportError::Receive(err.to_string()))? {
				Message::Text(text) => return Ok(SocketMessage::Text(text.as_str().to_owned())),
				Message::Close(frame) => {
					debug!(?frame, "gateway sent close frame");
					return Err(TransportError::Closed);
				}
				// tungstenite queues the pong itself; it is flushed on the next read or write.
				Message::Ping(_) | Message::Pong(_) => return Ok(SocketMessage::Control),
				Message::Binary(data) => {
					warn!(len = data.len(), "binary gateway frame ignored");
					metrics::counter!("chatty_cosmetics_protocol_errors_total").increment(1);
					return Ok(SocketMessage::Control);
				}
				Message::Frame(_) => {}
			}
		}
	}

	async fn close(&mut self) {
		if let Err(err) = self.ws.close(None).await {
			debug!(error = %err, "gateway close failed");
		}
	}
}
