#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chatty_domain::{ChannelId, CosmeticId, Platform, PlatformUserId, ProviderUserId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use url::Url;

use super::dispatch::{CosmeticDispatchHandler, DispatchHandler, DispatchRouter};
use super::frame::{DispatchPayload, DispatchType, GatewayFrame};
use super::transport::{GatewaySocket, GatewayTransport, SocketMessage};
use super::{ConnectionState, GatewayConnection};
use crate::config::{CosmeticsConfig, MIN_DURATION};
use crate::error::{LookupError, TransportError};
use crate::fetcher::{CosmeticBadge, CosmeticDetails, CosmeticsApi, MetadataFetcher, UserCosmeticRefs};
use crate::presence::PresenceRequest;
use crate::registry::BadgeRegistry;
use crate::subscriptions::{SubscriptionManager, SubscriptionTopic};

/// Server half of one in-memory connection.
struct ServerEnd {
	to_client: mpsc::UnboundedSender<Result<SocketMessage, TransportError>>,
	from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
	fn send(&self, text: &str) {
		let _ = self.to_client.send(Ok(SocketMessage::Text(text.to_string())));
	}

	fn ping(&self) {
		let _ = self.to_client.send(Ok(SocketMessage::Control));
	}

	fn hello(&self, session_id: &str, heartbeat_ms: u64) {
		self.send(&format!(
			r#"{{"op":1,"d":{{"heartbeat_interval":{heartbeat_ms},"session_id":"{session_id}"}}}}"#
		));
	}

	async fn next_frame(&mut self) -> GatewayFrame {
		let text = timeout(Duration::from_secs(5), self.from_client.recv())
			.await
			.expect("expected client frame within timeout")
			.expect("client socket open");
		GatewayFrame::decode(&text).expect("client sent a valid frame")
	}

	/// Collect subscribe topics until `n` have arrived, skipping heartbeats.
	async fn subscriptions(&mut self, n: usize) -> Vec<SubscriptionTopic> {
		let mut topics = Vec::new();
		while topics.len() < n {
			match self.next_frame().await {
				GatewayFrame::Subscribe(topic) => topics.push(topic),
				GatewayFrame::Heartbeat => {}
				other => panic!("unexpected client frame: {other:?}"),
			}
		}
		topics
	}

	async fn assert_quiet(&mut self) {
		loop {
			match timeout(Duration::from_millis(50), self.from_client.recv()).await {
				Err(_) => return,
				Ok(None) => return,
				Ok(Some(text)) => match GatewayFrame::decode(&text) {
					Ok(GatewayFrame::Heartbeat) => {}
					other => panic!("expected no subscription traffic, got {other:?}"),
				},
			}
		}
	}
}

struct MemorySocket {
	inbound: mpsc::UnboundedReceiver<Result<SocketMessage, TransportError>>,
	outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl GatewaySocket for MemorySocket {
	async fn send(&mut self, text: String) -> Result<(), TransportError> {
		self.outbound.send(text).map_err(|_| TransportError::Closed)
	}

	async fn recv(&mut self) -> Result<SocketMessage, TransportError> {
		self.inbound.recv().await.unwrap_or(Err(TransportError::Closed))
	}

	async fn close(&mut self) {
		self.inbound.close();
	}
}

struct MemoryTransport {
	servers: mpsc::UnboundedSender<ServerEnd>,
	attempts: AtomicUsize,
	stall_first: usize,
	fail_first: usize,
	urls: Mutex<Vec<String>>,
}

#[async_trait]
impl GatewayTransport for MemoryTransport {
	async fn connect(&self, url: &Url) -> Result<Box<dyn GatewaySocket>, TransportError> {
		self.urls.lock().push(url.to_string());
		let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
		if attempt < self.stall_first {
			std::future::pending::<()>().await;
		}
		if attempt < self.fail_first {
			return Err(TransportError::Connect("refused".to_string()));
		}

		let (to_client, inbound) = mpsc::unbounded_channel();
		let (outbound, from_client) = mpsc::unbounded_channel();
		let _ = self.servers.send(ServerEnd { to_client, from_client });
		Ok(Box::new(MemorySocket { inbound, outbound }))
	}
}

#[derive(Default)]
struct RecordingHandler {
	seen: Mutex<Vec<DispatchType>>,
}

impl DispatchHandler for RecordingHandler {
	fn handle(&self, payload: &DispatchPayload) {
		self.seen.lock().push(payload.dispatch_type.clone());
	}
}

struct Harness {
	gateway: GatewayConnection,
	subscriptions: Arc<SubscriptionManager>,
	transport: Arc<MemoryTransport>,
	servers: mpsc::UnboundedReceiver<ServerEnd>,
	state: watch::Receiver<ConnectionState>,
}

impl Harness {
	fn new(fail_first: usize, router: DispatchRouter) -> Self {
		let cfg = CosmeticsConfig {
			app_version: "9.9.9".to_string(),
			..CosmeticsConfig::default()
		};
		Self::with_transport(cfg, 0, fail_first, router)
	}

	fn with_transport(cfg: CosmeticsConfig, stall_first: usize, fail_first: usize, router: DispatchRouter) -> Self {
		let (servers_tx, servers) = mpsc::unbounded_channel();
		let transport = Arc::new(MemoryTransport {
			servers: servers_tx,
			attempts: AtomicUsize::new(0),
			stall_first,
			fail_first,
			urls: Mutex::new(Vec::new()),
		});
		let (commands_tx, commands_rx) = mpsc::unbounded_channel();
		let subscriptions = Arc::new(SubscriptionManager::new(Platform::Twitch, commands_tx));
		let gateway = GatewayConnection::new(
			cfg,
			transport.clone(),
			Arc::new(router),
			Arc::clone(&subscriptions),
			commands_rx,
		);
		let state = gateway.state_watch();
		Self {
			gateway,
			subscriptions,
			transport,
			servers,
			state,
		}
	}

	async fn next_server(&mut self) -> ServerEnd {
		timeout(Duration::from_secs(120), self.servers.recv())
			.await
			.expect("expected a connection attempt")
			.expect("transport alive")
	}

	async fn wait_for_session(&mut self, session_id: &str) {
		let state = timeout(
			Duration::from_secs(5),
			self.state
				.wait_for(|s| s.session().is_some_and(|session| session.session_id == session_id)),
		)
		.await
		.expect("session within timeout")
		.expect("gateway alive")
		.clone();
		assert!(state.is_connected());
	}
}

fn channel(id: &str) -> ChannelId {
	ChannelId::new(id).expect("valid channel id")
}

#[tokio::test]
async fn hello_moves_to_connected_with_session() {
	let mut h = Harness::new(0, DispatchRouter::new());
	assert_eq!(h.gateway.state(), ConnectionState::Disconnected);

	assert!(h.gateway.connect());
	assert!(!h.gateway.connect());

	let server = h.next_server().await;
	server.hello("s-1", 45_000);
	h.wait_for_session("s-1").await;

	let session = h.gateway.state().session().cloned().expect("connected");
	assert_eq!(session.heartbeat_interval, Duration::from_secs(45));
	assert_eq!(
		h.transport.urls.lock()[0],
		"wss://events.7tv.io/v3?app=chatty&version=9.9.9"
	);

	h.gateway.disconnect().await;
}

#[tokio::test]
async fn tracked_topics_are_sent_after_hello() {
	let mut h = Harness::new(0, DispatchRouter::new());
	h.subscriptions.subscribe_channel(&channel("X"));
	h.subscriptions.subscribe_channel(&channel("X"));
	h.gateway.connect();

	let mut server = h.next_server().await;
	server.hello("s-1", 45_000);

	let topics = server.subscriptions(3).await;
	let types: Vec<_> = topics.iter().map(|t| t.event_type.as_str()).collect();
	assert_eq!(types, vec!["emote_set.*", "cosmetic.*", "entitlement.*"]);
	server.assert_quiet().await;

	h.gateway.disconnect().await;
}

#[tokio::test]
async fn live_subscribe_is_sent_once_per_session() {
	let mut h = Harness::new(0, DispatchRouter::new());
	h.gateway.connect();
	let mut server = h.next_server().await;
	server.hello("s-1", 45_000);
	h.wait_for_session("s-1").await;

	let user = ProviderUserId::new("01USER").unwrap();
	assert!(h.subscriptions.subscribe_user(&user));
	assert!(!h.subscriptions.subscribe_user(&user));

	let topics = server.subscriptions(1).await;
	assert_eq!(topics, vec![SubscriptionTopic::user_topic(&user)]);
	server.assert_quiet().await;

	assert!(h.subscriptions.unsubscribe_user(&user));
	match server.next_frame().await {
		GatewayFrame::Unsubscribe(topic) => assert_eq!(topic, SubscriptionTopic::user_topic(&user)),
		other => panic!("expected unsubscribe, got {other:?}"),
	}

	h.gateway.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_frame_resubscribes_under_new_session() {
	let mut h = Harness::new(0, DispatchRouter::new());
	h.subscriptions.subscribe_channel(&channel("A"));
	h.subscriptions.subscribe_channel(&channel("B"));
	h.gateway.connect();

	let mut first = h.next_server().await;
	first.hello("s-1", 45_000);
	assert_eq!(first.subscriptions(6).await.len(), 6);

	first.send(r#"{"op":4}"#);

	let mut second = h.next_server().await;
	second.hello("s-2", 45_000);
	h.wait_for_session("s-2").await;

	let mut topics = second.subscriptions(6).await;
	second.assert_quiet().await;
	topics.sort();
	topics.dedup();
	assert_eq!(topics.len(), 6);
	assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 2);

	h.gateway.disconnect().await;
}

#[tokio::test]
async fn inbound_heartbeat_gets_immediate_reply() {
	let mut h = Harness::new(0, DispatchRouter::new());
	h.gateway.connect();
	let mut server = h.next_server().await;
	server.hello("s-1", 45_000);
	h.wait_for_session("s-1").await;

	server.send(r#"{"op":2,"d":{"count":1}}"#);
	assert_eq!(server.next_frame().await, GatewayFrame::Heartbeat);

	h.gateway.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeats_are_sent_on_interval() {
	let mut h = Harness::new(0, DispatchRouter::new());
	h.gateway.connect();
	let mut server = h.next_server().await;
	server.hello("s-1", 1_000);
	h.wait_for_session("s-1").await;

	tokio::time::advance(Duration::from_millis(1_100)).await;
	assert_eq!(server.next_frame().await, GatewayFrame::Heartbeat);

	h.gateway.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn silence_forces_reconnect() {
	let mut h = Harness::new(0, DispatchRouter::new());
	h.gateway.connect();
	let first = h.next_server().await;
	first.hello("s-1", 1_000);
	h.wait_for_session("s-1").await;

	let second = h.next_server().await;
	second.hello("s-2", 1_000);
	h.wait_for_session("s-2").await;
	assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 2);
	drop(first);

	h.gateway.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn missing_hello_times_out_and_retries() {
	let mut h = Harness::new(0, DispatchRouter::new());
	h.gateway.connect();
	let _silent = h.next_server().await;

	let second = h.next_server().await;
	second.hello("s-2", 45_000);
	h.wait_for_session("s-2").await;

	h.gateway.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn connect_failures_back_off_then_recover() {
	let mut h = Harness::new(2, DispatchRouter::new());
	let started = tokio::time::Instant::now();
	h.gateway.connect();

	let server = h.next_server().await;
	server.hello("s-1", 45_000);
	h.wait_for_session("s-1").await;

	assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 3);
	// 500ms then 1s of backoff before the third attempt.
	assert!(started.elapsed() >= Duration::from_millis(1_500));

	h.gateway.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn stalled_connect_times_out_and_retries() {
	let mut h = Harness::with_transport(CosmeticsConfig::default(), 1, 0, DispatchRouter::new());
	let started = tokio::time::Instant::now();
	h.gateway.connect();

	let server = h.next_server().await;
	server.hello("s-1", 45_000);
	h.wait_for_session("s-1").await;

	assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 2);
	assert!(started.elapsed() >= CosmeticsConfig::default().hello_timeout);

	h.gateway.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn zero_default_heartbeat_is_floored() {
	let cfg = CosmeticsConfig {
		default_heartbeat_interval: Duration::ZERO,
		..CosmeticsConfig::default()
	};
	let mut h = Harness::with_transport(cfg, 0, 0, DispatchRouter::new());
	h.gateway.connect();

	let mut server = h.next_server().await;
	server.send(r#"{"op":1,"d":{"heartbeat_interval":0,"session_id":"s-1"}}"#);
	h.wait_for_session("s-1").await;

	let session = h.gateway.state().session().cloned().expect("connected");
	assert_eq!(session.heartbeat_interval, MIN_DURATION);
	assert_eq!(server.next_frame().await, GatewayFrame::Heartbeat);

	h.gateway.disconnect().await;
	assert_eq!(h.gateway.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn control_frames_keep_session_alive() {
	let mut h = Harness::new(0, DispatchRouter::new());
	h.gateway.connect();
	let server = h.next_server().await;
	server.hello("s-1", 1_000);
	h.wait_for_session("s-1").await;

	// Liveness is 2s; each ping lands before it runs out.
	for _ in 0..4 {
		tokio::time::sleep(Duration::from_millis(1_500)).await;
		server.ping();
	}

	assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 1);
	assert!(h.servers.try_recv().is_err());
	assert_eq!(
		h.gateway.state().session().map(|s| s.session_id.clone()),
		Some("s-1".to_string())
	);

	h.gateway.disconnect().await;
}

#[tokio::test]
async fn disconnect_is_terminal() {
	let mut h = Harness::new(0, DispatchRouter::new());
	h.gateway.connect();
	let server = h.next_server().await;
	server.hello("s-1", 45_000);
	h.wait_for_session("s-1").await;

	h.gateway.disconnect().await;
	assert_eq!(h.gateway.state(), ConnectionState::Disconnected);
	assert!(!h.gateway.connect());

	assert!(matches!(
		timeout(Duration::from_millis(100), h.servers.recv()).await,
		Err(_) | Ok(None)
	));
	assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn garbage_frames_keep_the_connection() {
	let handler = Arc::new(RecordingHandler::default());
	let mut router = DispatchRouter::new();
	router.register(DispatchType::CosmeticCreate, handler.clone());

	let mut h = Harness::new(0, router);
	h.gateway.connect();
	let server = h.next_server().await;
	server.hello("s-1", 45_000);
	h.wait_for_session("s-1").await;

	server.send("definitely not json");
	server.send(r#"{"op":77,"d":{}}"#);
	server.send(r#"{"op":6,"d":{"message":"nope"}}"#);
	server.send(r#"{"op":35,"d":{"type":"user.*","condition":{}}}"#);
	server.send(r#"{"op":0,"d":{"type":"emote_set.update","body":{"id":"x"}}}"#);
	server.send(r#"{"op":0,"d":{"type":"cosmetic.create","body":{"object":{"kind":"BADGE"}}}}"#);

	timeout(Duration::from_secs(5), async {
		while handler.seen.lock().is_empty() {
			tokio::task::yield_now().await;
		}
	})
	.await
	.expect("dispatch routed");

	assert_eq!(*handler.seen.lock(), vec![DispatchType::CosmeticCreate]);
	assert!(h.gateway.state().is_connected());
	assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 1);

	h.gateway.disconnect().await;
}

#[derive(Default)]
struct StubApi {
	badges: Vec<CosmeticBadge>,
	cosmetics_calls: AtomicUsize,
}

#[async_trait]
impl CosmeticsApi for StubApi {
	async fn user_by_connection(
		&self,
		_platform: Platform,
		_user_id: &PlatformUserId,
	) -> Result<Option<UserCosmeticRefs>, LookupError> {
		Ok(None)
	}

	async fn cosmetics(&self, _ids: &[CosmeticId]) -> Result<CosmeticDetails, LookupError> {
		self.cosmetics_calls.fetch_add(1, Ordering::SeqCst);
		Ok(CosmeticDetails {
			badges: self.badges.clone(),
			paints: Vec::new(),
		})
	}

	async fn send_presence(&self, _user_id: &ProviderUserId, _presence: &PresenceRequest) -> Result<(), LookupError> {
		Ok(())
	}
}

fn cosmetics_handler(api: Arc<StubApi>) -> (Arc<BadgeRegistry>, DispatchRouter) {
	let registry = Arc::new(BadgeRegistry::new("https://cdn.7tv.app/badge"));
	let fetcher = Arc::new(MetadataFetcher::new(api, Arc::clone(&registry), 2));
	let mut router = DispatchRouter::new();
	Arc::new(CosmeticDispatchHandler::new(Arc::clone(&registry), fetcher)).install(&mut router);
	(registry, router)
}

fn dispatch(json: &str) -> DispatchPayload {
	match GatewayFrame::decode(json).expect("valid dispatch frame") {
		GatewayFrame::Dispatch(payload) => payload,
		other => panic!("expected dispatch, got {other:?}"),
	}
}

fn entitlement(op: &str, badge: &str, connections: &str) -> DispatchPayload {
	dispatch(&format!(
		r#"{{"op":0,"d":{{"type":"entitlement.{op}","body":{{"object":{{"kind":"BADGE","ref_id":"{badge}","user":{{"connections":{connections}}}}}}}}}}}"#
	))
}

fn badge(id: &str) -> CosmeticId {
	CosmeticId::new(id).unwrap()
}

fn twitch_user(id: &str) -> PlatformUserId {
	PlatformUserId::new(id).unwrap()
}

#[tokio::test]
async fn cosmetic_create_registers_badge() {
	let (registry, router) = cosmetics_handler(Arc::new(StubApi::default()));

	let routed = router.route(&dispatch(
		r#"{"op":0,"d":{"type":"cosmetic.create","body":{"object":{"kind":"BADGE","data":{"id":"B1","name":"N","tooltip":"T"}}}}}"#,
	));
	assert_eq!(routed, 1);

	let icon = registry.get_icon(&badge("B1")).expect("badge registered");
	assert_eq!(icon.name, "N");
	assert!(icon.url_1x.ends_with("/badge/B1/1x.webp"));
}

#[tokio::test]
async fn non_badge_and_incomplete_cosmetics_are_ignored() {
	let (registry, router) = cosmetics_handler(Arc::new(StubApi::default()));

	router.route(&dispatch(
		r#"{"op":0,"d":{"type":"cosmetic.create","body":{"object":{"kind":"PAINT","data":{"id":"P1","name":"Paint"}}}}}"#,
	));
	router.route(&dispatch(
		r#"{"op":0,"d":{"type":"cosmetic.create","body":{"object":{"kind":"BADGE","data":{"id":"B2"}}}}}"#,
	));
	router.route(&dispatch(r#"{"op":0,"d":{"type":"cosmetic.create","body":{}}}"#));

	assert_eq!(registry.badge_count(), 0);
}

#[tokio::test]
async fn entitlement_targets_first_twitch_connection() {
	let (registry, router) = cosmetics_handler(Arc::new(StubApi::default()));
	registry.register_badge_json(&serde_json::json!({"id": "B1", "name": "N"})).unwrap();

	router.route(&entitlement(
		"create",
		"B1",
		r#"[{"platform":"YOUTUBE","id":"Y1"},{"platform":"TWITCH","id":"U1"},{"platform":"TWITCH","id":"U2"}]"#,
	));

	assert_eq!(registry.get_user_badges(&twitch_user("U1")), vec![badge("B1")]);
	assert!(registry.get_user_badges(&twitch_user("U2")).is_empty());
	assert!(registry.get_user_badges(&twitch_user("Y1")).is_empty());
}

#[tokio::test]
async fn entitlement_delete_removes_badge() {
	let (registry, router) = cosmetics_handler(Arc::new(StubApi::default()));
	registry.register_badge_json(&serde_json::json!({"id": "B1", "name": "N"})).unwrap();
	let twitch = r#"[{"platform":"TWITCH","id":"U1"}]"#;

	router.route(&entitlement("create", "B1", twitch));
	assert!(registry.user_has_badge(&twitch_user("U1"), &badge("B1")));

	router.route(&entitlement("delete", "B1", twitch));
	assert!(registry.get_user_badges(&twitch_user("U1")).is_empty());
	assert_eq!(registry.users_with_badges_count(), 0);
}

#[tokio::test]
async fn entitlement_for_unknown_badge_fetches_definition() {
	let api = Arc::new(StubApi {
		badges: vec![CosmeticBadge {
			id: Some("B9".to_string()),
			name: Some("Late".to_string()),
			tooltip: None,
			tag: None,
		}],
		..StubApi::default()
	});
	let (registry, router) = cosmetics_handler(Arc::clone(&api));

	router.route(&entitlement("create", "B9", r#"[{"platform":"TWITCH","id":"U1"}]"#));
	assert!(registry.user_has_badge(&twitch_user("U1"), &badge("B9")));

	timeout(Duration::from_secs(5), async {
		while !registry.has_badge(&badge("B9")) {
			tokio::task::yield_now().await;
		}
	})
	.await
	.expect("definition fetched");

	assert_eq!(api.cosmetics_calls.load(Ordering::SeqCst), 1);
	let icons = registry.get_user_icons(&twitch_user("U1"));
	assert_eq!(icons.len(), 1);
	assert_eq!(icons[0].tooltip, "Late");
}

#[tokio::test]
async fn burst_of_entitlements_fetches_unknown_badge_once() {
	let api = Arc::new(StubApi {
		badges: vec![CosmeticBadge {
			id: Some("B9".to_string()),
			name: Some("Late".to_string()),
			tooltip: None,
			tag: None,
		}],
		..StubApi::default()
	});
	let (registry, router) = cosmetics_handler(Arc::clone(&api));

	for i in 0..10 {
		let connections = format!(r#"[{{"platform":"TWITCH","id":"U{i}"}}]"#);
		router.route(&entitlement("create", "B9", &connections));
	}

	timeout(Duration::from_secs(5), async {
		while !registry.has_badge(&badge("B9")) {
			tokio::task::yield_now().await;
		}
	})
	.await
	.expect("definition fetched");

	assert_eq!(api.cosmetics_calls.load(Ordering::SeqCst), 1);
	for i in 0..10 {
		assert!(registry.user_has_badge(&twitch_user(&format!("U{i}")), &badge("B9")));
	}
}

#[tokio::test]
async fn entitlement_without_twitch_connection_is_ignored() {
	let (registry, router) = cosmetics_handler(Arc::new(StubApi::default()));

	router.route(&entitlement("create", "B1", r#"[{"platform":"KICK","id":"K1"}]"#));
	router.route(&dispatch(
		r#"{"op":0,"d":{"type":"entitlement.create","body":{"object":{"kind":"EMOTE_SET","ref_id":"E1","user":{"connections":[{"platform":"TWITCH","id":"U1"}]}}}}}"#,
	));

	assert_eq!(registry.users_with_badges_count(), 0);
}

#[test]
fn unregistered_types_are_not_routed() {
	let router = DispatchRouter::new();
	let payload = dispatch(r#"{"op":0,"d":{"type":"emote.update","body":{}}}"#);
	assert!(!router.handles(&payload.dispatch_type));
	assert_eq!(router.route(&payload), 0);
}
