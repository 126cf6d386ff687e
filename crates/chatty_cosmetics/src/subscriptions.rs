#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use chatty_domain::{ChannelId, Platform, ProviderUserId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Event types a channel subscription expands to.
const CHANNEL_EVENT_TYPES: [&str; 3] = ["emote_set.*", "cosmetic.*", "entitlement.*"];
const USER_EVENT_TYPE: &str = "user.*";

/// One gateway subscription: an event-type pattern plus its condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionTopic {
	#[serde(rename = "type")]
	pub event_type: String,
	#[serde(default)]
	pub condition: BTreeMap<String, String>,
}

impl SubscriptionTopic {
	pub fn new<K, V>(event_type: impl Into<String>, condition: impl IntoIterator<Item = (K, V)>) -> Self
	where
		K: Into<String>,
		V: Into<String>,
	{
		Self {
			event_type: event_type.into(),
			condition: condition.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
		}
	}

	/// The three channel-scoped topics (emote sets, cosmetics, entitlements).
	pub fn channel_topics(channel_id: &ChannelId, platform: Platform) -> [Self; 3] {
		CHANNEL_EVENT_TYPES.map(|event_type| {
			Self::new(
				event_type,
				[
					("ctx", "channel"),
					("id", channel_id.as_str()),
					("platform", platform.as_connection_str()),
				],
			)
		})
	}

	pub fn user_topic(user_id: &ProviderUserId) -> Self {
		Self::new(USER_EVENT_TYPE, [("object_id", user_id.as_str())])
	}
}

/// Emitted towards the gateway on tracked-set transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionCommand {
	Subscribe(SubscriptionTopic),
	Unsubscribe(SubscriptionTopic),
}

#[derive(Debug, Default)]
struct Tracked {
	channels: BTreeSet<ChannelId>,
	users: BTreeSet<ProviderUserId>,
}

/// Tracks subscribed channels and users and turns transitions into commands.
///
/// The check-and-set and the command emission happen under one lock, so concurrent
/// callers for the same id never produce duplicate or reordered commands.
#[derive(Debug)]
pub struct SubscriptionManager {
	platform: Platform,
	tracked: Mutex<Tracked>,
	commands: mpsc::UnboundedSender<SubscriptionCommand>,
}

impl SubscriptionManager {
	pub fn new(platform: Platform, commands: mpsc::UnboundedSender<SubscriptionCommand>) -> Self {
		Self {
			platform,
			tracked: Mutex::new(Tracked::default()),
			commands,
		}
	}

	/// Returns `true` if the channel was not tracked before.
	pub fn subscribe_channel(&self, channel_id: &ChannelId) -> bool {
		let mut tracked = self.tracked.lock();
		if !tracked.channels.insert(channel_id.clone()) {
			return false;
		}
		for topic in SubscriptionTopic::channel_topics(channel_id, self.platform) {
			self.emit(SubscriptionCommand::Subscribe(topic));
		}
		info!(channel_id = %channel_id, "subscribed to channel cosmetics");
		true
	}

	/// Returns `true` if the channel was tracked before.
	pub fn unsubscribe_channel(&self, channel_id: &ChannelId) -> bool {
		let mut tracked = self.tracked.lock();
		if !tracked.channels.remove(channel_id) {
			return false;
		}
		for topic in SubscriptionTopic::channel_topics(channel_id, self.platform) {
			self.emit(SubscriptionCommand::Unsubscribe(topic));
		}
		info!(channel_id = %channel_id, "unsubscribed from channel cosmetics");
		true
	}

	pub fn subscribe_user(&self, user_id: &ProviderUserId) -> bool {
		let mut tracked = self.tracked.lock();
		if !tracked.users.insert(user_id.clone()) {
			return false;
		}
		self.emit(SubscriptionCommand::Subscribe(SubscriptionTopic::user_topic(user_id)));
		info!(user_id = %user_id, "subscribed to user updates");
		true
	}

	pub fn unsubscribe_user(&self, user_id: &ProviderUserId) -> bool {
		let mut tracked = self.tracked.lock();
		if !tracked.users.remove(user_id) {
			return false;
		}
		self.emit(SubscriptionCommand::Unsubscribe(SubscriptionTopic::user_topic(user_id)));
		info!(user_id = %user_id, "unsubscribed from user updates");
		true
	}

	pub fn tracked_channels(&self) -> Vec<ChannelId> {
		self.tracked.lock().channels.iter().cloned().collect()
	}

	pub fn tracked_users(&self) -> Vec<ProviderUserId> {
		self.tracked.lock().users.iter().cloned().collect()
	}

	/// Every topic that must be (re)sent when a new session starts.
	pub fn replay_topics(&self) -> Vec<SubscriptionTopic> {
		let tracked = self.tracked.lock();
		let mut topics = Vec::with_capacity(tracked.channels.len() * CHANNEL_EVENT_TYPES.len() + tracked.users.len());
		for channel_id in &tracked.channels {
			topics.extend(SubscriptionTopic::channel_topics(channel_id, self.platform));
		}
		for user_id in &tracked.users {
			topics.push(SubscriptionTopic::user_topic(user_id));
		}
		topics
	}

	fn emit(&self, cmd: SubscriptionCommand) {
		if self.commands.send(cmd).is_err() {
			debug!("gateway command channel closed; subscription kept for replay");
		}
	}
}
