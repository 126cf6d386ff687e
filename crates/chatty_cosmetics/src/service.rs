#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chatty_domain::{ChannelId, CosmeticId, Platform, PlatformUserId, ProviderUserId};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CosmeticsConfig;
use crate::error::LookupError;
use crate::fetcher::{CosmeticsApi, MetadataFetcher, SevenTvGqlClient};
use crate::gateway::dispatch::{CosmeticDispatchHandler, DispatchRouter};
use crate::gateway::transport::{GatewayTransport, TungsteniteTransport};
use crate::gateway::{ConnectionState, GatewayConnection};
use crate::presence::PresenceReporter;
use crate::registry::{BadgeIcon, BadgeRegistry};
use crate::subscriptions::SubscriptionManager;

/// Maps the signed-in account name to its platform user id.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
	async fn resolve_user_id(&self, username: &str) -> Result<Option<PlatformUserId>, LookupError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
	pub platform_id: PlatformUserId,
	pub provider_id: Option<ProviderUserId>,
}

/// Wires the registry, fetcher, subscriptions, gateway and presence reporter together.
pub struct CosmeticsService {
	registry: Arc<BadgeRegistry>,
	fetcher: Arc<MetadataFetcher>,
	subscriptions: Arc<SubscriptionManager>,
	gateway: GatewayConnection,
	presence: PresenceReporter,
	local_user: Arc<watch::Sender<Option<LocalUser>>>,
}

impl CosmeticsService {
	/// Production wiring: GraphQL over reqwest and a tungstenite gateway socket.
	pub fn new(cfg: CosmeticsConfig) -> Result<Self, LookupError> {
		let cfg = cfg.normalized();
		let api = Arc::new(SevenTvGqlClient::new(&cfg)?);
		Ok(Self::with_parts(cfg, api, Arc::new(TungsteniteTransport)))
	}

	pub fn with_parts(cfg: CosmeticsConfig, api: Arc<dyn CosmeticsApi>, transport: Arc<dyn GatewayTransport>) -> Self {
		let cfg = cfg.normalized();
		let platform = Platform::Twitch;
		let registry = Arc::new(BadgeRegistry::new(cfg.badge_cdn_base.clone()));
		let fetcher = Arc::new(MetadataFetcher::new(
			Arc::clone(&api),
			Arc::clone(&registry),
			cfg.max_concurrent_fetches,
		));

		let mut router = DispatchRouter::new();
		Arc::new(CosmeticDispatchHandler::new(Arc::clone(&registry), Arc::clone(&fetcher))).install(&mut router);

		let (commands_tx, commands_rx) = mpsc::unbounded_channel();
		let subscriptions = Arc::new(SubscriptionManager::new(platform, commands_tx));
		let presence_cooldown = cfg.presence_cooldown;
		let gateway = GatewayConnection::new(cfg, transport, Arc::new(router), Arc::clone(&subscriptions), commands_rx);
		let presence = PresenceReporter::new(api, platform, gateway.state_watch(), presence_cooldown);
		let (local_user, _) = watch::channel(None);

		Self {
			registry,
			fetcher,
			subscriptions,
			gateway,
			presence,
			local_user: Arc::new(local_user),
		}
	}

	/// Open the gateway. Returns `false` when already started or shut down.
	pub fn start(&self) -> bool {
		let started = self.gateway.connect();
		if started {
			info!("cosmetics service started");
		}
		started
	}

	/// Resolve the signed-in account, remember its ids and load its badge.
	pub fn start_with_identity(
		&self,
		resolver: Arc<dyn IdentityResolver>,
		username: impl Into<String>,
	) -> JoinHandle<Option<LocalUser>> {
		self.start();

		let username = username.into();
		let fetcher = Arc::clone(&self.fetcher);
		let subscriptions = Arc::clone(&self.subscriptions);
		let local_user = Arc::clone(&self.local_user);
		let generation = self.registry.generation();

		tokio::spawn(async move {
			if username.trim().is_empty() {
				debug!("no local username; skipping local user lookup");
				return None;
			}

			let platform_id = match resolver.resolve_user_id(&username).await {
				Ok(Some(id)) => id,
				Ok(None) => {
					debug!(%username, "local user id unknown");
					return None;
				}
				Err(err) => {
					warn!(%username, error = %err, "local user id lookup failed");
					return None;
				}
			};

			let refs = match fetcher.resolve_user_by_platform_id(&platform_id).await {
				Ok(refs) => refs.unwrap_or_default(),
				Err(err) => {
					warn!(user_id = %platform_id, error = %err, "local user cosmetics lookup failed");
					Default::default()
				}
			};

			let user = LocalUser {
				platform_id: platform_id.clone(),
				provider_id: refs.user_id.clone(),
			};
			if let Some(provider_id) = &user.provider_id {
				subscriptions.subscribe_user(provider_id);
			}
			local_user.send_replace(Some(user.clone()));
			info!(user_id = %platform_id, provider_id = ?user.provider_id, "local user resolved");

			fetcher.apply_user_refs(&platform_id, &refs, generation).await;
			Some(user)
		})
	}

	/// Terminal; the service cannot be restarted.
	pub async fn shutdown(&self) {
		self.gateway.disconnect().await;
		info!("cosmetics service stopped");
	}

	pub fn join_channel(&self, channel_id: &ChannelId) -> bool {
		self.subscriptions.subscribe_channel(channel_id)
	}

	pub fn leave_channel(&self, channel_id: &ChannelId) -> bool {
		self.subscriptions.unsubscribe_channel(channel_id)
	}

	/// A chat user was seen; look up their badge in the background. Empty ids are ignored.
	pub fn user_seen(&self, raw_user_id: &str) -> Option<JoinHandle<Option<CosmeticId>>> {
		let user_id = PlatformUserId::new(raw_user_id).ok()?;
		Some(self.fetcher.fetch_user_badges(user_id))
	}

	/// Announce that the local user is viewing `channel_id`. Needs a resolved local user.
	pub fn announce_presence(&self, channel_id: &ChannelId, is_self: bool) -> Option<JoinHandle<()>> {
		let provider_id = self.local_user.borrow().as_ref()?.provider_id.clone()?;
		self.presence.announce(&provider_id, channel_id, is_self)
	}

	/// Announce `channel_id` once for every gateway session, as soon as both the session
	/// and the local user exist. Never returns while the service is alive.
	pub async fn announce_each_session(&self, channel_id: &ChannelId) {
		let mut state = self.gateway.state_watch();
		let mut local_user = self.local_user.subscribe();
		let mut announced: Option<String> = None;

		loop {
			let session_id = state.borrow_and_update().session().map(|s| s.session_id.clone());
			drop(local_user.borrow_and_update());

			if let Some(id) = session_id
				&& announced.as_deref() != Some(id.as_str())
				&& self.announce_presence(channel_id, true).is_some()
			{
				info!(session_id = %id, channel_id = %channel_id, "presence announced");
				announced = Some(id);
			}

			let alive = tokio::select! {
				res = state.changed() => res.is_ok(),
				res = local_user.changed() => res.is_ok(),
			};
			if !alive {
				return;
			}
		}
	}

	pub fn user_icons(&self, user_id: &PlatformUserId) -> Vec<Arc<BadgeIcon>> {
		self.registry.get_user_icons(user_id)
	}

	/// Drop all cached cosmetics; lookups already running are discarded.
	pub fn reset_cache(&self) {
		self.registry.clear();
	}

	pub fn local_user(&self) -> Option<LocalUser> {
		self.local_user.borrow().clone()
	}

	pub fn registry(&self) -> &Arc<BadgeRegistry> {
		&self.registry
	}

	pub fn fetcher(&self) -> &Arc<MetadataFetcher> {
		&self.fetcher
	}

	pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
		&self.subscriptions
	}

	pub fn presence(&self) -> &PresenceReporter {
		&self.presence
	}

	pub fn state(&self) -> ConnectionState {
		self.gateway.state()
	}

	pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
		self.gateway.state_watch()
	}
}
