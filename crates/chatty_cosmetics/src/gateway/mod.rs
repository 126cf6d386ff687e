#![forbid(unsafe_code)]

pub mod dispatch;
pub mod frame;
pub mod transport;

#[cfg(test)]
mod gateway_tests;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, error, info, warn};
use url::Url;

use self::dispatch::DispatchRouter;
use self::frame::{GatewayFrame, HelloPayload};
use self::transport::{GatewaySocket, GatewayTransport, SocketMessage};
use crate::config::{CosmeticsConfig, MIN_DURATION};
use crate::error::TransportError;
use crate::subscriptions::{SubscriptionCommand, SubscriptionManager, SubscriptionTopic};

/// Valid from HELLO until the next reconnect or disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSession {
	pub session_id: String,
	pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionState {
	#[default]
	Disconnected,
	Connecting,
	Connected(ConnectionSession),
}

impl ConnectionState {
	pub fn session(&self) -> Option<&ConnectionSession> {
		match self {
			Self::Connected(session) => Some(session),
			_ => None,
		}
	}

	pub fn is_connected(&self) -> bool {
		matches!(self, Self::Connected(_))
	}
}

/// Owns the gateway session lifecycle. Frames are handled on one spawned task.
pub struct GatewayConnection {
	cfg: CosmeticsConfig,
	transport: Arc<dyn GatewayTransport>,
	router: Arc<DispatchRouter>,
	subscriptions: Arc<SubscriptionManager>,
	commands: Mutex<Option<mpsc::UnboundedReceiver<SubscriptionCommand>>>,
	state_tx: Arc<watch::Sender<ConnectionState>>,
	shutdown_tx: watch::Sender<bool>,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayConnection {
	pub fn new(
		cfg: CosmeticsConfig,
		transport: Arc<dyn GatewayTransport>,
		router: Arc<DispatchRouter>,
		subscriptions: Arc<SubscriptionManager>,
		commands: mpsc::UnboundedReceiver<SubscriptionCommand>,
	) -> Self {
		let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
		let (shutdown_tx, _) = watch::channel(false);
		Self {
			cfg: cfg.normalized(),
			transport,
			router,
			subscriptions,
			commands: Mutex::new(Some(commands)),
			state_tx: Arc::new(state_tx),
			shutdown_tx,
			task: Mutex::new(None),
		}
	}

	/// Start the receive task. Returns `false` if it already ran or `disconnect` was called.
	pub fn connect(&self) -> bool {
		if *self.shutdown_tx.borrow() {
			debug!("gateway disconnected; connect ignored");
			return false;
		}
		let Some(commands) = self.commands.lock().take() else {
			debug!("gateway already started");
			return false;
		};

		let runner = Runner {
			cfg: self.cfg.clone(),
			transport: Arc::clone(&self.transport),
			router: Arc::clone(&self.router),
			subscriptions: Arc::clone(&self.subscriptions),
			commands,
			state_tx: Arc::clone(&self.state_tx),
			shutdown_rx: self.shutdown_tx.subscribe(),
		};
		self.state_tx.send_replace(ConnectionState::Connecting);
		*self.task.lock() = Some(tokio::spawn(runner.run()));
		true
	}

	/// Terminal: closes the session and suppresses any further reconnect.
	pub async fn disconnect(&self) {
		self.shutdown_tx.send_replace(true);
		let task = self.task.lock().take();
		if let Some(task) = task
			&& let Err(err) = task.await
		{
			warn!(error = %err, "gateway task ended abnormally");
		}
		self.state_tx.send_replace(ConnectionState::Disconnected);
	}

	pub fn state(&self) -> ConnectionState {
		self.state_tx.borrow().clone()
	}

	pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
		self.state_tx.subscribe()
	}

	pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
		&self.subscriptions
	}
}

impl Drop for GatewayConnection {
	fn drop(&mut self) {
		self.shutdown_tx.send_replace(true);
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
	Shutdown,
	ServerReconnect,
	Failed { established: bool },
}

struct Runner {
	cfg: CosmeticsConfig,
	transport: Arc<dyn GatewayTransport>,
	router: Arc<DispatchRouter>,
	subscriptions: Arc<SubscriptionManager>,
	commands: mpsc::UnboundedReceiver<SubscriptionCommand>,
	state_tx: Arc<watch::Sender<ConnectionState>>,
	shutdown_rx: watch::Receiver<bool>,
}

impl Runner {
	async fn run(mut self) {
		let url = match self.cfg.event_api_url_with_query() {
			Ok(url) => url,
			Err(err) => {
				error!(url = %self.cfg.event_api_url, error = %err, "invalid gateway url");
				self.set_state(ConnectionState::Disconnected);
				return;
			}
		};

		let mut attempt: u32 = 0;
		let mut delay: Option<Duration> = None;

		loop {
			if let Some(delay) = delay.take() {
				self.set_state(ConnectionState::Connecting);
				debug!(?delay, attempt, "gateway reconnect scheduled");
				tokio::select! {
					_ = sleep(delay) => {}
					_ = self.shutdown_rx.changed() => {}
				}
			}
			if self.is_shutdown() {
				break;
			}

			self.set_state(ConnectionState::Connecting);
			let end = self.run_session(&url).await;
			metrics::gauge!("chatty_cosmetics_gateway_connected").set(0.0);

			match end {
				SessionEnd::Shutdown => break,
				SessionEnd::ServerReconnect => {
					attempt = 0;
					delay = Some(self.cfg.reconnect_min_delay);
				}
				SessionEnd::Failed { established } => {
					if established {
						attempt = 0;
					}
					delay = Some(self.cfg.backoff_delay(attempt));
					attempt = attempt.saturating_add(1);
				}
			}
			metrics::counter!("chatty_cosmetics_gateway_reconnects_total").increment(1);
		}

		self.set_state(ConnectionState::Disconnected);
		info!("gateway stopped");
	}

	async fn run_session(&mut self, url: &Url) -> SessionEnd {
		info!(url = %url, "connecting to cosmetics gateway");
		// One deadline covers the handshake and HELLO.
		let deadline = Instant::now() + self.cfg.hello_timeout;
		let connected = tokio::select! {
			res = timeout_at(deadline, self.transport.connect(url)) => res,
			_ = self.shutdown_rx.changed() => return SessionEnd::Shutdown,
		};
		let mut socket = match connected {
			Ok(Ok(socket)) => socket,
			Ok(Err(err)) => {
				warn!(error = %err, "gateway connect failed");
				return SessionEnd::Failed { established: false };
			}
			Err(_) => {
				warn!(timeout = ?self.cfg.hello_timeout, "gateway connect timed out");
				return SessionEnd::Failed { established: false };
			}
		};

		let hello = match self.await_hello(socket.as_mut(), deadline).await {
			Ok(hello) => hello,
			Err(end) => {
				socket.close().await;
				return end;
			}
		};

		let end = self.run_connected(socket.as_mut(), hello).await;
		socket.close().await;
		end
	}

	/// Wait until `deadline` for HELLO. Frames before it are answered or dropped.
	async fn await_hello(&mut self, socket: &mut dyn GatewaySocket, deadline: Instant) -> Result<HelloPayload, SessionEnd> {
		loop {
			let received = tokio::select! {
				res = timeout_at(deadline, socket.recv()) => res,
				_ = self.shutdown_rx.changed() => return Err(SessionEnd::Shutdown),
			};

			let text = match received {
				Ok(Ok(SocketMessage::Text(text))) => text,
				Ok(Ok(SocketMessage::Control)) => continue,
				Ok(Err(err)) => {
					warn!(error = %err, "gateway closed before hello");
					return Err(SessionEnd::Failed { established: false });
				}
				Err(_) => {
					warn!(timeout = ?self.cfg.hello_timeout, "gateway hello timed out");
					return Err(SessionEnd::Failed { established: false });
				}
			};

			metrics::counter!("chatty_cosmetics_gateway_frames_total").increment(1);
			match GatewayFrame::decode(&text) {
				Ok(GatewayFrame::Hello(hello)) => return Ok(hello),
				Ok(GatewayFrame::Heartbeat) => {
					if send_frame(socket, &GatewayFrame::Heartbeat).await.is_err() {
						return Err(SessionEnd::Failed { established: false });
					}
				}
				Ok(GatewayFrame::Reconnect) => {
					info!("gateway requested reconnect before hello");
					return Err(SessionEnd::ServerReconnect);
				}
				Ok(frame) => debug!(opcode = %frame.opcode(), "frame before hello dropped"),
				Err(err) => {
					warn!(error = %err, "invalid gateway frame");
					metrics::counter!("chatty_cosmetics_protocol_errors_total").increment(1);
				}
			}
		}
	}

	async fn run_connected(&mut self, socket: &mut dyn GatewaySocket, hello: HelloPayload) -> SessionEnd {
		let mut sent: HashSet<SubscriptionTopic> = HashSet::new();
		let mut heartbeat_interval = self.start_session(&hello);
		if self.replay(socket, &mut sent).await.is_err() {
			return SessionEnd::Failed { established: true };
		}

		let mut liveness = self.cfg.liveness_timeout(heartbeat_interval);
		let silence = sleep(liveness);
		tokio::pin!(silence);
		let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
		heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = self.shutdown_rx.changed() => {
					info!("gateway disconnect requested");
					return SessionEnd::Shutdown;
				}

				Some(cmd) = self.commands.recv() => {
					if apply_command(socket, &mut sent, cmd).await.is_err() {
						return SessionEnd::Failed { established: true };
					}
				}

				_ = heartbeat.tick() => {
					if send_frame(socket, &GatewayFrame::Heartbeat).await.is_err() {
						return SessionEnd::Failed { established: true };
					}
					metrics::counter!("chatty_cosmetics_gateway_heartbeats_sent_total").increment(1);
				}

				received = socket.recv() => {
					let text = match received {
						Ok(SocketMessage::Text(text)) => text,
						Ok(SocketMessage::Control) => {
							silence.as_mut().reset(Instant::now() + liveness);
							continue;
						}
						Err(err) => {
							warn!(error = %err, "gateway connection lost");
							return SessionEnd::Failed { established: true };
						}
					};
					silence.as_mut().reset(Instant::now() + liveness);
					metrics::counter!("chatty_cosmetics_gateway_frames_total").increment(1);

					let frame = match GatewayFrame::decode(&text) {
						Ok(frame) => frame,
						Err(err) => {
							warn!(error = %err, "invalid gateway frame");
							metrics::counter!("chatty_cosmetics_protocol_errors_total").increment(1);
							continue;
						}
					};

					match frame {
						GatewayFrame::Dispatch(payload) => {
							metrics::counter!("chatty_cosmetics_dispatches_total").increment(1);
							self.router.route(&payload);
						}
						GatewayFrame::Hello(hello) => {
							sent.clear();
							heartbeat_interval = self.start_session(&hello);
							liveness = self.cfg.liveness_timeout(heartbeat_interval);
							silence.as_mut().reset(Instant::now() + liveness);
							heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
							heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
							if self.replay(socket, &mut sent).await.is_err() {
								return SessionEnd::Failed { established: true };
							}
						}
						GatewayFrame::Heartbeat => {
							if send_frame(socket, &GatewayFrame::Heartbeat).await.is_err() {
								return SessionEnd::Failed { established: true };
							}
						}
						GatewayFrame::Reconnect => {
							info!("gateway requested reconnect");
							return SessionEnd::ServerReconnect;
						}
						GatewayFrame::Ack(data) => debug!(%data, "gateway ack"),
						GatewayFrame::Error(data) => warn!(%data, "gateway error frame"),
						other @ (GatewayFrame::Subscribe(_) | GatewayFrame::Unsubscribe(_)) => {
							debug!(opcode = %other.opcode(), "outbound-only opcode received; dropped");
						}
					}
				}

				_ = &mut silence => {
					warn!(timeout = ?liveness, "gateway went silent; reconnecting");
					return SessionEnd::Failed { established: true };
				}
			}
		}
	}

	fn start_session(&self, hello: &HelloPayload) -> Duration {
		let heartbeat_interval = hello
			.heartbeat_interval()
			.unwrap_or(self.cfg.default_heartbeat_interval)
			.max(MIN_DURATION);
		info!(session_id = %hello.session_id, ?heartbeat_interval, "gateway session established");
		self.set_state(ConnectionState::Connected(ConnectionSession {
			session_id: hello.session_id.clone(),
			heartbeat_interval,
		}));
		metrics::gauge!("chatty_cosmetics_gateway_connected").set(1.0);
		heartbeat_interval
	}

	async fn replay(&self, socket: &mut dyn GatewaySocket, sent: &mut HashSet<SubscriptionTopic>) -> Result<(), TransportError> {
		let topics = self.subscriptions.replay_topics();
		debug!(count = topics.len(), "replaying subscriptions");
		for topic in topics {
			apply_command(socket, sent, SubscriptionCommand::Subscribe(topic)).await?;
		}
		Ok(())
	}

	fn set_state(&self, state: ConnectionState) {
		self.state_tx.send_if_modified(|current| {
			if *current == state {
				return false;
			}
			*current = state;
			true
		});
	}

	fn is_shutdown(&self) -> bool {
		*self.shutdown_rx.borrow()
	}
}

/// Send a subscription change unless the session already reflects it.
async fn apply_command(
	socket: &mut dyn GatewaySocket,
	sent: &mut HashSet<SubscriptionTopic>,
	cmd: SubscriptionCommand,
) -> Result<(), TransportError> {
	match cmd {
		SubscriptionCommand::Subscribe(topic) => {
			if sent.contains(&topic) {
				return Ok(());
			}
			send_frame(socket, &GatewayFrame::Subscribe(topic.clone())).await?;
			debug!(event_type = %topic.event_type, "subscribed");
			sent.insert(topic);
		}
		SubscriptionCommand::Unsubscribe(topic) => {
			if !sent.remove(&topic) {
				return Ok(());
			}
			send_frame(socket, &GatewayFrame::Unsubscribe(topic.clone())).await?;
			debug!(event_type = %topic.event_type, "unsubscribed");
		}
	}
	Ok(())
}

async fn send_frame(socket: &mut dyn GatewaySocket, frame: &GatewayFrame) -> Result<(), TransportError> {
	let text = match frame.encode() {
		Ok(text) => text,
		Err(err) => {
			warn!(opcode = %frame.opcode(), error = %err, "failed to encode gateway frame");
			return Ok(());
		}
	};

	socket.send(text).await.inspect_err(|err| {
		warn!(opcode = %frame.opcode(), error = %err, "gateway send failed");
	})
}
