#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chatty_domain::{CosmeticId, PlatformUserId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RegistrationError;

/// Badge image at one of the CDN resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BadgeScale {
	One,
	Two,
	Three,
}

impl BadgeScale {
	pub const ALL: [BadgeScale; 3] = [BadgeScale::One, BadgeScale::Two, BadgeScale::Three];

	pub fn as_path(self) -> &'static str {
		match self {
			Self::One => "1x",
			Self::Two => "2x",
			Self::Three => "3x",
		}
	}
}

/// Derive the CDN url of a badge image; the API never returns these.
pub fn badge_image_url(cdn_base: &str, badge_id: &CosmeticId, scale: BadgeScale) -> String {
	format!("{}/{}/{}.webp", cdn_base.trim_end_matches('/'), badge_id, scale.as_path())
}

/// Immutable badge record. Re-registering an id replaces the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeDefinition {
	pub id: CosmeticId,
	pub name: String,
	pub tooltip: Option<String>,
	pub image_url_1x: String,
	pub image_url_2x: String,
	pub image_url_3x: String,
}

impl BadgeDefinition {
	pub fn new(id: CosmeticId, name: impl Into<String>, tooltip: Option<String>, cdn_base: &str) -> Self {
		Self {
			image_url_1x: badge_image_url(cdn_base, &id, BadgeScale::One),
			image_url_2x: badge_image_url(cdn_base, &id, BadgeScale::Two),
			image_url_3x: badge_image_url(cdn_base, &id, BadgeScale::Three),
			id,
			name: name.into(),
			tooltip: tooltip.filter(|t| !t.trim().is_empty()),
		}
	}

	/// Build from a raw `{id, name, tooltip?}` object. Missing `id` or `name` rejects the whole payload.
	pub fn from_json(value: &serde_json::Value, cdn_base: &str) -> Result<Self, RegistrationError> {
		let obj = value.as_object().ok_or(RegistrationError::NotAnObject)?;

		let id = obj
			.get("id")
			.and_then(|v| v.as_str())
			.and_then(|s| CosmeticId::new(s).ok())
			.ok_or(RegistrationError::MissingField("id"))?;
		let name = obj
			.get("name")
			.and_then(|v| v.as_str())
			.filter(|s| !s.trim().is_empty())
			.ok_or(RegistrationError::MissingField("name"))?;
		let tooltip = obj.get("tooltip").and_then(|v| v.as_str()).map(str::to_string);

		Ok(Self::new(id, name, tooltip, cdn_base))
	}

	pub fn image_url(&self, scale: BadgeScale) -> &str {
		match scale {
			BadgeScale::One => &self.image_url_1x,
			BadgeScale::Two => &self.image_url_2x,
			BadgeScale::Three => &self.image_url_3x,
		}
	}
}

/// Render-ready badge handed to the chat view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadgeIcon {
	pub badge_id: CosmeticId,
	pub name: String,
	/// Falls back to the badge name when the definition has no tooltip.
	pub tooltip: String,
	pub url_1x: String,
	pub url_2x: String,
}

impl BadgeIcon {
	fn from_definition(def: &BadgeDefinition) -> Self {
		Self {
			badge_id: def.id.clone(),
			name: def.name.clone(),
			tooltip: def.tooltip.clone().unwrap_or_else(|| def.name.clone()),
			url_1x: def.image_url_1x.clone(),
			url_2x: def.image_url_2x.clone(),
		}
	}
}

#[derive(Debug, Default)]
struct RegistryMaps {
	badges: DashMap<CosmeticId, Arc<BadgeDefinition>>,
	assignments: DashMap<PlatformUserId, Vec<CosmeticId>>,
	icons: DashMap<CosmeticId, Arc<BadgeIcon>>,
}

/// Badge definitions, per-user assignments and the derived icon cache.
///
/// Every operation takes the outer lock shared and relies on per-key atomicity of the
/// inner maps; `clear` takes it exclusively so the three maps reset together.
#[derive(Debug)]
pub struct BadgeRegistry {
	cdn_base: String,
	maps: RwLock<RegistryMaps>,
	generation: AtomicU64,
}

impl BadgeRegistry {
	pub fn new(cdn_base: impl Into<String>) -> Self {
		Self {
			cdn_base: cdn_base.into(),
			maps: RwLock::new(RegistryMaps::default()),
			generation: AtomicU64::new(0),
		}
	}

	pub fn cdn_base(&self) -> &str {
		&self.cdn_base
	}

	/// Bumped by every `clear`; fetches compare against it before writing.
	pub fn generation(&self) -> u64 {
		self.generation.load(Ordering::Acquire)
	}

	pub fn register_badge(&self, def: BadgeDefinition) {
		let maps = self.maps.read();
		Self::insert_badge(&maps, def);
	}

	/// Register only if no `clear` happened since `generation` was read.
	pub fn register_badge_if_current(&self, def: BadgeDefinition, generation: u64) -> bool {
		let maps = self.maps.read();
		if self.generation() != generation {
			debug!(badge_id = %def.id, generation, "dropping stale badge registration");
			return false;
		}
		Self::insert_badge(&maps, def);
		true
	}

	pub fn register_badge_json(&self, value: &serde_json::Value) -> Result<CosmeticId, RegistrationError> {
		let def = BadgeDefinition::from_json(value, &self.cdn_base).inspect_err(|err| {
			warn!(error = %err, "rejecting badge payload");
		})?;
		let id = def.id.clone();
		self.register_badge(def);
		Ok(id)
	}

	fn insert_badge(maps: &RegistryMaps, def: BadgeDefinition) {
		let id = def.id.clone();
		debug!(badge_id = %id, name = %def.name, "badge registered");
		maps.badges.insert(id.clone(), Arc::new(def));
		maps.icons.remove(&id);
		metrics::counter!("chatty_cosmetics_badges_registered_total").increment(1);
	}

	pub fn get_badge(&self, badge_id: &CosmeticId) -> Option<Arc<BadgeDefinition>> {
		let maps = self.maps.read();
		maps.badges.get(badge_id).map(|entry| Arc::clone(entry.value()))
	}

	pub fn has_badge(&self, badge_id: &CosmeticId) -> bool {
		self.maps.read().badges.contains_key(badge_id)
	}

	/// Returns `true` if the badge was not already assigned to the user.
	pub fn assign(&self, user_id: &PlatformUserId, badge_id: &CosmeticId) -> bool {
		let maps = self.maps.read();
		Self::insert_assignment(&maps, user_id, badge_id)
	}

	/// Returns `false` only when the generation moved on; an existing assignment counts as applied.
	pub fn assign_if_current(&self, user_id: &PlatformUserId, badge_id: &CosmeticId, generation: u64) -> bool {
		let maps = self.maps.read();
		if self.generation() != generation {
			debug!(user_id = %user_id, badge_id = %badge_id, generation, "dropping stale badge assignment");
			return false;
		}
		Self::insert_assignment(&maps, user_id, badge_id);
		true
	}

	fn insert_assignment(maps: &RegistryMaps, user_id: &PlatformUserId, badge_id: &CosmeticId) -> bool {
		let mut badges = maps.assignments.entry(user_id.clone()).or_default();
		if badges.contains(badge_id) {
			return false;
		}
		badges.push(badge_id.clone());
		true
	}

	/// Returns `true` if the badge was assigned. The user entry is dropped once empty.
	pub fn unassign(&self, user_id: &PlatformUserId, badge_id: &CosmeticId) -> bool {
		let maps = self.maps.read();
		let mut removed = false;
		maps.assignments.remove_if_mut(user_id, |_, badges| {
			let before = badges.len();
			badges.retain(|b| b != badge_id);
			removed = badges.len() != before;
			badges.is_empty()
		});
		removed
	}

	/// Assigned badge ids in assignment order.
	pub fn get_user_badges(&self, user_id: &PlatformUserId) -> Vec<CosmeticId> {
		let maps = self.maps.read();
		maps.assignments
			.get(user_id)
			.map(|entry| entry.value().clone())
			.unwrap_or_default()
	}

	pub fn user_has_badge(&self, user_id: &PlatformUserId, badge_id: &CosmeticId) -> bool {
		let maps = self.maps.read();
		maps.assignments
			.get(user_id)
			.is_some_and(|entry| entry.value().contains(badge_id))
	}

	/// Cached icon for `badge_id`, built on first access. `None` without a definition.
	pub fn get_icon(&self, badge_id: &CosmeticId) -> Option<Arc<BadgeIcon>> {
		let maps = self.maps.read();
		if let Some(icon) = maps.icons.get(badge_id) {
			return Some(Arc::clone(icon.value()));
		}

		match maps.icons.entry(badge_id.clone()) {
			Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
			Entry::Vacant(entry) => {
				let def = maps.badges.get(badge_id).map(|d| Arc::clone(d.value()))?;
				let icon = Arc::new(BadgeIcon::from_definition(&def));
				entry.insert(Arc::clone(&icon));
				Some(icon)
			}
		}
	}

	/// Icons for every assigned badge, skipping ids that have no definition yet.
	pub fn get_user_icons(&self, user_id: &PlatformUserId) -> Vec<Arc<BadgeIcon>> {
		self.get_user_badges(user_id)
			.iter()
			.filter_map(|badge_id| self.get_icon(badge_id))
			.collect()
	}

	pub fn badge_count(&self) -> usize {
		self.maps.read().badges.len()
	}

	pub fn users_with_badges_count(&self) -> usize {
		self.maps.read().assignments.len()
	}

	/// Drop all definitions, assignments and icons and start a new generation.
	pub fn clear(&self) {
		let maps = self.maps.write();
		maps.badges.clear();
		maps.assignments.clear();
		maps.icons.clear();
		let generation = self.generation.fetch_add(1, Ordering::AcqRel).saturating_add(1);
		debug!(generation, "badge registry cleared");
	}
}
