#![forbid(unsafe_code)]

mod gql;


use std::sync::Arc;

use chatty_domain::{CosmeticId, Platform, PlatformUserId};
use dashmap::DashSet;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use gql::{CosmeticBadge, CosmeticDetails, CosmeticPaint, CosmeticsApi, SevenTvGqlClient, UserCosmeticRefs};

use crate::error::LookupError;
use crate::registry::BadgeRegistry;

/// Resolves cosmetic references over the network and writes results into the registry.
///
/// Every remote call runs on a spawned task and holds one permit of a shared semaphore.
pub struct MetadataFetcher {
	api: Arc<dyn CosmeticsApi>,
	registry: Arc<BadgeRegistry>,
	platform: Platform,
	permits: Semaphore,
	in_flight: DashSet<PlatformUserId>,
	definitions_in_flight: DashSet<CosmeticId>,
}

impl MetadataFetcher {
	pub fn new(api: Arc<dyn CosmeticsApi>, registry: Arc<BadgeRegistry>, max_concurrent: usize) -> Self {
		Self {
			api,
			registry,
			platform: Platform::Twitch,
			permits: Semaphore::new(max_concurrent.max(1)),
			in_flight: DashSet::new(),
			definitions_in_flight: DashSet::new(),
		}
	}

	pub fn registry(&self) -> &Arc<BadgeRegistry> {
		&self.registry
	}

	pub fn api(&self) -> &Arc<dyn CosmeticsApi> {
		&self.api
	}

	/// Cosmetic references for a platform account. Unknown accounts and malformed
	/// responses yield `Ok(None)`; transport failures and error statuses are returned.
	pub async fn resolve_user_by_platform_id(
		&self,
		user_id: &PlatformUserId,
	) -> Result<Option<UserCosmeticRefs>, LookupError> {
		let _permit = self
			.permits
			.acquire()
			.await
			.map_err(|_| LookupError::Network("fetch pool closed".to_string()))?;

		metrics::counter!("chatty_cosmetics_lookups_total").increment(1);
		match self.api.user_by_connection(self.platform, user_id).await {
			Ok(refs) => Ok(refs),
			Err(LookupError::NotFound) => {
				debug!(user_id = %user_id, "no cosmetics profile");
				Ok(None)
			}
			Err(LookupError::Malformed(detail)) => {
				warn!(user_id = %user_id, %detail, "malformed user cosmetics response");
				Ok(None)
			}
			Err(err) => {
				metrics::counter!("chatty_cosmetics_lookup_errors_total").increment(1);
				Err(err)
			}
		}
	}

	/// One batched request for all `ids`. Ids the remote does not know are simply absent.
	pub async fn resolve_cosmetic_details(&self, ids: &[CosmeticId]) -> Result<CosmeticDetails, LookupError> {
		if ids.is_empty() {
			return Ok(CosmeticDetails::default());
		}

		let _permit = self
			.permits
			.acquire()
			.await
			.map_err(|_| LookupError::Network("fetch pool closed".to_string()))?;

		metrics::counter!("chatty_cosmetics_lookups_total").increment(1);
		match self.api.cosmetics(ids).await {
			Ok(details) => Ok(details),
			Err(LookupError::NotFound) => Ok(CosmeticDetails::default()),
			Err(LookupError::Malformed(detail)) => {
				warn!(count = ids.len(), %detail, "malformed cosmetic details response");
				Ok(CosmeticDetails::default())
			}
			Err(err) => {
				metrics::counter!("chatty_cosmetics_lookup_errors_total").increment(1);
				Err(err)
			}
		}
	}

	/// Resolve and assign the badge a chat user has selected. Resolves to the assigned badge id.
	///
	/// Concurrent calls for the same user collapse into one lookup; results are dropped if the
	/// registry was cleared while the lookup was running.
	pub fn fetch_user_badges(self: &Arc<Self>, user_id: PlatformUserId) -> JoinHandle<Option<CosmeticId>> {
		let this = Arc::clone(self);
		let generation = self.registry.generation();
		tokio::spawn(async move {
			if !this.in_flight.insert(user_id.clone()) {
				debug!(user_id = %user_id, "badge lookup already running");
				return None;
			}
			let assigned = this.fetch_user_badges_inner(&user_id, generation).await;
			this.in_flight.remove(&user_id);
			assigned
		})
	}

	async fn fetch_user_badges_inner(&self, user_id: &PlatformUserId, generation: u64) -> Option<CosmeticId> {
		let refs = match self.resolve_user_by_platform_id(user_id).await {
			Ok(Some(refs)) => refs,
			Ok(None) => return None,
			Err(err) => {
				warn!(user_id = %user_id, error = %err, "user cosmetics lookup failed");
				return None;
			}
		};

		self.apply_user_refs(user_id, &refs, generation).await
	}

	/// Register (if needed) and assign the badge named by `refs`, as of `generation`.
	pub async fn apply_user_refs(
		&self,
		user_id: &PlatformUserId,
		refs: &UserCosmeticRefs,
		generation: u64,
	) -> Option<CosmeticId> {
		let badge_id = refs.badge_id.clone()?;

		if !self.registry.has_badge(&badge_id) {
			let details = match self.resolve_cosmetic_details(&refs.ref_ids()).await {
				Ok(details) => details,
				Err(err) => {
					warn!(user_id = %user_id, badge_id = %badge_id, error = %err, "cosmetic details lookup failed");
					return None;
				}
			};

			let Some(badge) = details.badge(&badge_id) else {
				debug!(user_id = %user_id, badge_id = %badge_id, "badge missing from cosmetic details");
				return None;
			};

			let def = match badge.to_definition(self.registry.cdn_base()) {
				Ok(def) => def,
				Err(err) => {
					warn!(badge_id = %badge_id, error = %err, "rejecting fetched badge");
					return None;
				}
			};

			if !self.registry.register_badge_if_current(def, generation) {
				return None;
			}
		}

		if !self.registry.assign_if_current(user_id, &badge_id, generation) {
			return None;
		}

		info!(user_id = %user_id, badge_id = %badge_id, "badge assigned from profile");
		Some(badge_id)
	}

	/// Register definitions for `ids`. Resolves to the number of badges registered.
	///
	/// Ids already being fetched are skipped, so a burst of entitlements for one unknown badge
	/// costs a single request.
	pub fn fetch_badge_definitions(self: &Arc<Self>, ids: Vec<CosmeticId>) -> JoinHandle<usize> {
		// Claimed before spawning so callers in the same tick see each other.
		let ids: Vec<CosmeticId> = ids
			.into_iter()
			.filter(|id| self.definitions_in_flight.insert(id.clone()))
			.collect();
		let this = Arc::clone(self);
		let generation = self.registry.generation();
		tokio::spawn(async move {
			if ids.is_empty() {
				return 0;
			}
			let registered = this.fetch_badge_definitions_inner(&ids, generation).await;
			for id in &ids {
				this.definitions_in_flight.remove(id);
			}
			registered
		})
	}

	async fn fetch_badge_definitions_inner(&self, ids: &[CosmeticId], generation: u64) -> usize {
		let details = match self.resolve_cosmetic_details(ids).await {
			Ok(details) => details,
			Err(err) => {
				warn!(count = ids.len(), error = %err, "badge definitions lookup failed");
				return 0;
			}
		};

		let mut registered = 0;
		for badge in &details.badges {
			match badge.to_definition(self.registry.cdn_base()) {
				Ok(def) => {
					if self.registry.register_badge_if_current(def, generation) {
						registered += 1;
					}
				}
				Err(err) => warn!(error = %err, "rejecting fetched badge"),
			}
		}
		debug!(requested = ids.len(), registered, "badge definitions fetched");
		registered
	}
}
