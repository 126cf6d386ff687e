#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chatty_cosmetics::CosmeticsConfig;
use chatty_domain::{ChannelId, PlatformUserId, ProviderUserId};
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.chatty/cosmetics.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatty").join("cosmetics.toml"))
}

/// Load the daemon config from TOML and env overrides.
pub fn load_daemon_config_from_path(path: &Path) -> anyhow::Result<DaemonConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = DaemonConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	normalize(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
	pub cosmetics: CosmeticsConfig,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Twitch id of the signed-in account; enables presence and the local user subscription.
	pub local_user_id: Option<PlatformUserId>,
	/// Channels whose emote set/cosmetic/entitlement events are subscribed at startup.
	pub channels: Vec<ChannelId>,
	/// Provider accounts whose `user.*` events are subscribed at startup.
	pub watch_users: Vec<ProviderUserId>,
	/// Chat users whose badges are looked up at startup.
	pub prefetch_users: Vec<PlatformUserId>,
	/// Channel announced as watched whenever a gateway session starts.
	pub presence_channel: Option<ChannelId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	metrics_bind: Option<String>,
	local_user_id: Option<String>,
	presence_channel: Option<String>,

	#[serde(default)]
	channels: Vec<String>,
	#[serde(default)]
	watch_users: Vec<String>,
	#[serde(default)]
	prefetch_users: Vec<String>,

	#[serde(default)]
	seventv: FileSevenTvSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSevenTvSettings {
	event_api_url: Option<String>,
	gql_url: Option<String>,
	presence_url_template: Option<String>,
	badge_cdn_base: Option<String>,
	app_name: Option<String>,
	app_version: Option<String>,

	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
	hello_timeout_ms: Option<u64>,
	default_heartbeat_interval_ms: Option<u64>,
	liveness_multiplier: Option<u32>,

	request_timeout_ms: Option<u64>,
	max_concurrent_fetches: Option<usize>,
	presence_cooldown_ms: Option<u64>,
}

impl DaemonConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = CosmeticsConfig::default();
		let s = file.seventv;

		let cosmetics = CosmeticsConfig {
			event_api_url: non_empty(s.event_api_url).unwrap_or(defaults.event_api_url),
			gql_url: non_empty(s.gql_url).unwrap_or(defaults.gql_url),
			presence_url_template: non_empty(s.presence_url_template).unwrap_or(defaults.presence_url_template),
			badge_cdn_base: non_empty(s.badge_cdn_base).unwrap_or(defaults.badge_cdn_base),
			app_name: non_empty(s.app_name).unwrap_or(defaults.app_name),
			app_version: non_empty(s.app_version).unwrap_or(defaults.app_version),
			reconnect_min_delay: s
				.reconnect_min_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.reconnect_min_delay),
			reconnect_max_delay: s
				.reconnect_max_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.reconnect_max_delay),
			hello_timeout: s
				.hello_timeout_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.hello_timeout),
			default_heartbeat_interval: s
				.default_heartbeat_interval_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.default_heartbeat_interval),
			liveness_multiplier: s.liveness_multiplier.unwrap_or(defaults.liveness_multiplier),
			request_timeout: s
				.request_timeout_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.request_timeout),
			max_concurrent_fetches: s.max_concurrent_fetches.unwrap_or(defaults.max_concurrent_fetches),
			presence_cooldown: s
				.presence_cooldown_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.presence_cooldown),
		};

		Self {
			cosmetics,
			metrics_bind: non_empty(file.metrics_bind),
			local_user_id: parse_id(file.local_user_id, "local_user_id"),
			channels: parse_ids(file.channels, "channels"),
			watch_users: parse_ids(file.watch_users, "watch_users"),
			prefetch_users: parse_ids(file.prefetch_users, "prefetch_users"),
			presence_channel: parse_id(file.presence_channel, "presence_channel"),
		}
	}
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_id<T, E>(raw: Option<String>, field: &'static str) -> Option<T>
where
	T: std::str::FromStr<Err = E>,
	E: std::fmt::Display,
{
	let raw = non_empty(raw)?;
	match raw.parse::<T>() {
		Ok(id) => Some(id),
		Err(e) => {
			warn!(field, value = %raw, error = %e, "ignoring invalid id in config");
			None
		}
	}
}

fn parse_ids<T, E>(raw: Vec<String>, field: &'static str) -> Vec<T>
where
	T: std::str::FromStr<Err = E>,
	E: std::fmt::Display,
{
	raw.into_iter().filter_map(|v| parse_id(Some(v), field)).collect()
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut DaemonConfig, env: impl Fn(&str) -> Option<String>) {
	let string = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
	let millis = |key: &str| string(key).and_then(|v| v.parse::<u64>().ok()).map(Duration::from_millis);

	if let Some(v) = string("CHATTY_COSMETICS_EVENT_API_URL") {
		cfg.cosmetics.event_api_url = v;
		info!("cosmetics config: event_api_url overridden by env");
	}

	if let Some(v) = string("CHATTY_COSMETICS_GQL_URL") {
		cfg.cosmetics.gql_url = v;
		info!("cosmetics config: gql_url overridden by env");
	}

	if let Some(v) = string("CHATTY_COSMETICS_BADGE_CDN_BASE") {
		cfg.cosmetics.badge_cdn_base = v;
		info!("cosmetics config: badge_cdn_base overridden by env");
	}

	if let Some(d) = millis("CHATTY_COSMETICS_RECONNECT_MIN_DELAY_MS") {
		cfg.cosmetics.reconnect_min_delay = d;
		info!(min_ms = d.as_millis() as u64, "cosmetics config: reconnect_min_delay overridden by env");
	}

	if let Some(d) = millis("CHATTY_COSMETICS_RECONNECT_MAX_DELAY_MS") {
		cfg.cosmetics.reconnect_max_delay = d;
		info!(max_ms = d.as_millis() as u64, "cosmetics config: reconnect_max_delay overridden by env");
	}

	if let Some(d) = millis("CHATTY_COSMETICS_PRESENCE_COOLDOWN_MS") {
		cfg.cosmetics.presence_cooldown = d;
		info!(cooldown_ms = d.as_millis() as u64, "cosmetics config: presence_cooldown overridden by env");
	}

	if let Some(n) = string("CHATTY_COSMETICS_MAX_CONCURRENT_FETCHES").and_then(|v| v.parse::<usize>().ok()) {
		cfg.cosmetics.max_concurrent_fetches = n;
		info!(n, "cosmetics config: max_concurrent_fetches overridden by env");
	}

	if let Some(v) = string("CHATTY_COSMETICS_LOCAL_USER_ID") {
		match PlatformUserId::new(v) {
			Ok(id) => {
				cfg.local_user_id = Some(id);
				info!("cosmetics config: local_user_id overridden by env");
			}
			Err(e) => warn!(error = %e, "invalid CHATTY_COSMETICS_LOCAL_USER_ID"),
		}
	}

	if let Some(v) = string("CHATTY_COSMETICS_METRICS_BIND") {
		cfg.metrics_bind = Some(v);
		info!("cosmetics config: metrics_bind overridden by env");
	}
}

fn normalize(cfg: &mut DaemonConfig) {
	cfg.cosmetics = std::mem::take(&mut cfg.cosmetics).normalized();
}
