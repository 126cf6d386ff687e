#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chatty_domain::{ChannelId, Platform, ProviderUserId};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::fetcher::CosmeticsApi;
use crate::gateway::ConnectionState;

const PRESENCE_KIND_CHANNEL: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceRequest {
	pub kind: u8,
	pub passive: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	pub data: PresenceData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceData {
	pub platform: &'static str,
	pub id: String,
}

impl PresenceRequest {
	pub fn channel(platform: Platform, channel_id: &ChannelId, is_self: bool, session_id: Option<&str>) -> Self {
		Self {
			kind: PRESENCE_KIND_CHANNEL,
			passive: is_self,
			session_id: if is_self { session_id.map(str::to_string) } else { None },
			data: PresenceData {
				platform: platform.as_connection_str(),
				id: channel_id.as_str().to_string(),
			},
		}
	}
}

/// Rate-limited "user is watching this channel" announcements.
pub struct PresenceReporter {
	api: Arc<dyn CosmeticsApi>,
	platform: Platform,
	state: watch::Receiver<ConnectionState>,
	cooldown: Duration,
	last_sent: Mutex<Option<Instant>>,
}

impl PresenceReporter {
	pub fn new(
		api: Arc<dyn CosmeticsApi>,
		platform: Platform,
		state: watch::Receiver<ConnectionState>,
		cooldown: Duration,
	) -> Self {
		Self {
			api,
			platform,
			state,
			cooldown,
			last_sent: Mutex::new(None),
		}
	}

	/// Fire-and-forget. Returns the spawned request, or `None` when there is no session
	/// or the cooldown has not elapsed.
	pub fn announce(&self, user_id: &ProviderUserId, channel_id: &ChannelId, is_self: bool) -> Option<JoinHandle<()>> {
		let session_id = match &*self.state.borrow() {
			ConnectionState::Connected(session) => session.session_id.clone(),
			_ => {
				debug!(channel_id = %channel_id, "no gateway session; presence skipped");
				return None;
			}
		};

		{
			let mut last_sent = self.last_sent.lock();
			let now = Instant::now();
			if let Some(last) = *last_sent
				&& now.duration_since(last) < self.cooldown
			{
				return None;
			}
			*last_sent = Some(now);
		}

		let request = PresenceRequest::channel(self.platform, channel_id, is_self, Some(&session_id));
		let api = Arc::clone(&self.api);
		let user_id = user_id.clone();
		metrics::counter!("chatty_cosmetics_presence_sent_total").increment(1);

		Some(tokio::spawn(async move {
			match api.send_presence(&user_id, &request).await {
				Ok(()) => debug!(user_id = %user_id, channel_id = %request.data.id, "presence sent"),
				Err(err) => warn!(user_id = %user_id, error = %err, "presence update failed"),
			}
		}))
	}
}
