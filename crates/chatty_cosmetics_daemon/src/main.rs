#![forbid(unsafe_code)]

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use chatty_cosmetics::{CosmeticsService, IdentityResolver, LookupError};
use chatty_domain::PlatformUserId;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatty_cosmetics_daemon [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.chatty/cosmetics.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatty_cosmetics=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// The daemon is configured with the account id directly, so no name lookup is needed.
struct ConfiguredIdentity(PlatformUserId);

#[async_trait]
impl IdentityResolver for ConfiguredIdentity {
	async fn resolve_user_id(&self, _username: &str) -> Result<Option<PlatformUserId>, LookupError> {
		Ok(Some(self.0.clone()))
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_daemon_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded cosmetics config (toml + env overrides)");

	init_metrics(cfg.metrics_bind.as_deref());

	let cfg = Arc::new(cfg);
	let svc = Arc::new(CosmeticsService::new(cfg.cosmetics.clone()).context("build cosmetics service")?);

	for channel in &cfg.channels {
		svc.join_channel(channel);
	}
	for user in &cfg.watch_users {
		svc.subscriptions().subscribe_user(user);
	}

	match cfg.local_user_id.clone() {
		Some(id) => {
			let username = id.as_str().to_string();
			let _ = svc.start_with_identity(Arc::new(ConfiguredIdentity(id)), username);
		}
		None => {
			svc.start();
		}
	}

	for user in &cfg.prefetch_users {
		let _ = svc.user_seen(user.as_str());
	}

	info!(
		channels = cfg.channels.len(),
		watch_users = cfg.watch_users.len(),
		"chatty_cosmetics_daemon running"
	);

	let presence = cfg.presence_channel.clone().map(|channel| {
		let svc = Arc::clone(&svc);
		tokio::spawn(async move { svc.announce_each_session(&channel).await })
	});

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutdown requested");

	if let Some(presence) = presence {
		presence.abort();
	}
	svc.shutdown().await;
	info!(
		badges = svc.registry().badge_count(),
		users = svc.registry().users_with_badges_count(),
		"chatty_cosmetics_daemon stopped"
	);

	Ok(())
}
