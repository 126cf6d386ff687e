#![forbid(unsafe_code)]

use std::time::Duration;

use tracing::warn;

/// Smallest duration any timer setting is allowed to take.
pub const MIN_DURATION: Duration = Duration::from_millis(1);

pub const DEFAULT_APP_NAME: &str = "chatty";
pub const DEFAULT_APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Runtime settings for the cosmetics subsystem.
#[derive(Debug, Clone)]
pub struct CosmeticsConfig {
	/// Gateway WebSocket endpoint (without the app/version query).
	pub event_api_url: String,
	/// GraphQL endpoint used for user and cosmetic lookups.
	pub gql_url: String,
	/// Presence endpoint; `{user_id}` is replaced with the provider user id.
	pub presence_url_template: String,
	/// Badge image base; images live at `{base}/{id}/{1x,2x,3x}.webp`.
	pub badge_cdn_base: String,
	/// Sent as the `app` query parameter and `X-7TV-Platform` header.
	pub app_name: String,
	/// Sent as the `version` query parameter and `X-7TV-Version` header.
	pub app_version: String,

	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	/// Max wait for HELLO after the socket opens.
	pub hello_timeout: Duration,
	/// Heartbeat interval assumed when HELLO omits one.
	pub default_heartbeat_interval: Duration,
	/// Silence longer than `liveness_multiplier * heartbeat_interval` forces a reconnect.
	pub liveness_multiplier: u32,

	pub request_timeout: Duration,
	pub max_concurrent_fetches: usize,
	pub presence_cooldown: Duration,
}

impl Default for CosmeticsConfig {
	fn default() -> Self {
		Self {
			event_api_url: "wss://events.7tv.io/v3".to_string(),
			gql_url: "https://7tv.io/v3/gql".to_string(),
			presence_url_template: "https://7tv.io/v3/users/{user_id}/presences".to_string(),
			badge_cdn_base: "https://cdn.7tv.app/badge".to_string(),
			app_name: DEFAULT_APP_NAME.to_string(),
			app_version: DEFAULT_APP_VERSION.to_string(),
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			hello_timeout: Duration::from_secs(15),
			default_heartbeat_interval: Duration::from_secs(25),
			liveness_multiplier: 2,
			request_timeout: Duration::from_secs(10),
			max_concurrent_fetches: 4,
			presence_cooldown: Duration::from_secs(10),
		}
	}
}

impl CosmeticsConfig {
	/// Clamp values the gateway and fetcher cannot run with: zero durations get a 1 ms floor,
	/// inverted reconnect bounds are swapped, and counts are at least 1.
	pub fn normalized(mut self) -> Self {
		if self.reconnect_min_delay > self.reconnect_max_delay {
			warn!("reconnect_min_delay > reconnect_max_delay; swapped");
			std::mem::swap(&mut self.reconnect_min_delay, &mut self.reconnect_max_delay);
		}
		for (name, value) in [
			("reconnect_min_delay", &mut self.reconnect_min_delay),
			("reconnect_max_delay", &mut self.reconnect_max_delay),
			("hello_timeout", &mut self.hello_timeout),
			("default_heartbeat_interval", &mut self.default_heartbeat_interval),
			("request_timeout", &mut self.request_timeout),
		] {
			if *value < MIN_DURATION {
				warn!(setting = name, "zero duration raised to 1ms");
				*value = MIN_DURATION;
			}
		}
		self.liveness_multiplier = self.liveness_multiplier.max(1);
		self.max_concurrent_fetches = self.max_concurrent_fetches.max(1);
		self
	}

	/// Gateway URL including the `app` and `version` query parameters.
	pub fn event_api_url_with_query(&self) -> Result<url::Url, url::ParseError> {
		let mut url = url::Url::parse(&self.event_api_url)?;
		url.query_pairs_mut()
			.append_pair("app", &self.app_name)
			.append_pair("version", &self.app_version);
		Ok(url)
	}

	pub fn presence_url(&self, user_id: &str) -> String {
		self.presence_url_template.replace("{user_id}", user_id)
	}

	/// Silence budget for a session with the given heartbeat interval.
	pub fn liveness_timeout(&self, heartbeat_interval: Duration) -> Duration {
		heartbeat_interval.saturating_mul(self.liveness_multiplier.max(1))
	}

	/// Exponential backoff: `min * 2^attempt`, clamped to `[min, max]`.
	pub fn backoff_delay(&self, attempt: u32) -> Duration {
		let min = self.reconnect_min_delay;
		let max = self.reconnect_max_delay.max(min);
		let pow = attempt.min(16);
		let ms = min.as_millis().saturating_mul(1u128 << pow);
		let d = Duration::from_millis(u64::try_from(ms).unwrap_or(u64::MAX));
		d.min(max).max(min)
	}
}
