#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chatty_domain::{CosmeticId, Platform, PlatformUserId};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::frame::{DispatchPayload, DispatchType};
use crate::fetcher::MetadataFetcher;
use crate::registry::BadgeRegistry;

const KIND_BADGE: &str = "BADGE";

/// Receives dispatches of the types it was registered for. Runs on the gateway
/// receive task, so it must hand any network work off to a spawned task.
pub trait DispatchHandler: Send + Sync {
	fn handle(&self, payload: &DispatchPayload);
}

#[derive(Default)]
pub struct DispatchRouter {
	handlers: HashMap<DispatchType, Vec<Arc<dyn DispatchHandler>>>,
}

impl DispatchRouter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, dispatch_type: DispatchType, handler: Arc<dyn DispatchHandler>) {
		self.handlers.entry(dispatch_type).or_default().push(handler);
	}

	pub fn handles(&self, dispatch_type: &DispatchType) -> bool {
		self.handlers.contains_key(dispatch_type)
	}

	/// Returns how many handlers saw the payload.
	pub fn route(&self, payload: &DispatchPayload) -> usize {
		let Some(handlers) = self.handlers.get(&payload.dispatch_type) else {
			debug!(dispatch_type = ?payload.dispatch_type, "unhandled dispatch type");
			return 0;
		};

		for handler in handlers {
			handler.handle(payload);
		}
		handlers.len()
	}
}

/// Applies badge creations and entitlement grants/revocations to the registry.
pub struct CosmeticDispatchHandler {
	registry: Arc<BadgeRegistry>,
	fetcher: Arc<MetadataFetcher>,
	platform: Platform,
}

impl CosmeticDispatchHandler {
	pub fn new(registry: Arc<BadgeRegistry>, fetcher: Arc<MetadataFetcher>) -> Self {
		Self {
			registry,
			fetcher,
			platform: Platform::Twitch,
		}
	}

	/// Register for `cosmetic.create`, `entitlement.create` and `entitlement.delete`.
	pub fn install(self: Arc<Self>, router: &mut DispatchRouter) {
		for dispatch_type in [
			DispatchType::CosmeticCreate,
			DispatchType::EntitlementCreate,
			DispatchType::EntitlementDelete,
		] {
			router.register(dispatch_type, Arc::clone(&self) as Arc<dyn DispatchHandler>);
		}
	}

	fn cosmetic_created(&self, object: CosmeticObject) {
		if object.kind.as_deref() != Some(KIND_BADGE) {
			debug!(kind = ?object.kind, "ignoring non-badge cosmetic");
			return;
		}
		let Some(data) = object.data else {
			return;
		};

		if let Ok(badge_id) = self.registry.register_badge_json(&data) {
			info!(badge_id = %badge_id, "badge registered from gateway");
		}
	}

	fn entitlement_created(&self, object: EntitlementObject) {
		let Some((user_id, badge_id)) = self.badge_entitlement(object) else {
			return;
		};

		self.registry.assign(&user_id, &badge_id);
		info!(user_id = %user_id, badge_id = %badge_id, "badge entitlement granted");

		if !self.registry.has_badge(&badge_id) {
			debug!(badge_id = %badge_id, "entitled badge unknown; fetching definition");
			let _ = self.fetcher.fetch_badge_definitions(vec![badge_id]);
		}
	}

	fn entitlement_deleted(&self, object: EntitlementObject) {
		let Some((user_id, badge_id)) = self.badge_entitlement(object) else {
			return;
		};

		if self.registry.unassign(&user_id, &badge_id) {
			info!(user_id = %user_id, badge_id = %badge_id, "badge entitlement revoked");
		}
	}

	/// `(platform user, badge)` for a badge entitlement on the first connection of our platform.
	fn badge_entitlement(&self, object: EntitlementObject) -> Option<(PlatformUserId, CosmeticId)> {
		if object.kind.as_deref() != Some(KIND_BADGE) {
			debug!(kind = ?object.kind, "ignoring non-badge entitlement");
			return None;
		}

		let badge_id = object.ref_id.and_then(|id| CosmeticId::new(id).ok())?;
		let connection = object
			.user?
			.connections?
			.into_iter()
			.find(|c| c.platform.as_deref() == Some(self.platform.as_connection_str()))?;
		let user_id = connection.id.and_then(|id| PlatformUserId::new(id).ok())?;
		Some((user_id, badge_id))
	}
}

impl DispatchHandler for CosmeticDispatchHandler {
	fn handle(&self, payload: &DispatchPayload) {
		match payload.dispatch_type {
			DispatchType::CosmeticCreate => {
				if let Some(object) = parse_object(payload) {
					self.cosmetic_created(object);
				}
			}
			DispatchType::EntitlementCreate => {
				if let Some(object) = parse_object(payload) {
					self.entitlement_created(object);
				}
			}
			DispatchType::EntitlementDelete => {
				if let Some(object) = parse_object(payload) {
					self.entitlement_deleted(object);
				}
			}
			_ => {}
		}
	}
}

fn parse_object<T: DeserializeOwned>(payload: &DispatchPayload) -> Option<T> {
	let Some(object) = &payload.body.object else {
		debug!(dispatch_type = ?payload.dispatch_type, "dispatch without object");
		return None;
	};

	match T::deserialize(object) {
		Ok(parsed) => Some(parsed),
		Err(err) => {
			warn!(dispatch_type = ?payload.dispatch_type, error = %err, "malformed dispatch object");
			metrics::counter!("chatty_cosmetics_protocol_errors_total").increment(1);
			None
		}
	}
}

#[derive(Debug, Deserialize)]
struct CosmeticObject {
	#[serde(default)]
	kind: Option<String>,
	#[serde(default)]
	data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct EntitlementObject {
	#[serde(default)]
	kind: Option<String>,
	#[serde(default)]
	ref_id: Option<String>,
	#[serde(default)]
	user: Option<EntitledUser>,
}

#[derive(Debug, Deserialize)]
struct EntitledUser {
	#[serde(default)]
	connections: Option<Vec<UserConnection>>,
}

#[derive(Debug, Deserialize)]
struct UserConnection {
	#[serde(default)]
	platform: Option<String>,
	#[serde(default)]
	id: Option<String>,
}
