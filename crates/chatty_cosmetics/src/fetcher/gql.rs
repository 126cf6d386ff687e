#![forbid(unsafe_code)]

use async_trait::async_trait;
use chatty_domain::{CosmeticId, Platform, PlatformUserId, ProviderUserId};
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CosmeticsConfig;
use crate::error::{LookupError, RegistrationError};
use crate::presence::PresenceRequest;
use crate::registry::BadgeDefinition;

const USER_COSMETICS_QUERY: &str = r#"
query UserCosmetics($id: String!, $platform: ConnectionPlatform!) {
	userByConnection(id: $id, platform: $platform) {
		id
		style {
			badge_id
			paint_id
		}
	}
}
"#;

const COSMETICS_OPERATION: &str = "GetCosmestics";

const COSMETICS_QUERY: &str = r#"
query GetCosmestics($list: [ObjectID!]) {
	cosmetics(list: $list) {
		paints {
			id
			kind
			name
			function
			color
			angle
			shape
			image_url
			repeat
		}
		badges {
			id
			kind
			name
			tooltip
			tag
		}
	}
}
"#;

/// Cosmetic references attached to a platform account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserCosmeticRefs {
	pub user_id: Option<ProviderUserId>,
	pub badge_id: Option<CosmeticId>,
	pub paint_id: Option<CosmeticId>,
}

impl UserCosmeticRefs {
	/// Every referenced cosmetic, badge first.
	pub fn ref_ids(&self) -> Vec<CosmeticId> {
		self.badge_id.iter().chain(self.paint_id.iter()).cloned().collect()
	}

	pub fn is_empty(&self) -> bool {
		self.badge_id.is_none() && self.paint_id.is_none()
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CosmeticBadge {
	#[serde(default)]
	pub id: Option<String>,
	#[serde(default)]
	pub name: Option<String>,
	#[serde(default)]
	pub tooltip: Option<String>,
	#[serde(default)]
	pub tag: Option<String>,
}

impl CosmeticBadge {
	pub fn cosmetic_id(&self) -> Option<CosmeticId> {
		self.id.as_deref().and_then(|id| CosmeticId::new(id).ok())
	}

	pub fn to_definition(&self, cdn_base: &str) -> Result<BadgeDefinition, RegistrationError> {
		let id = self.cosmetic_id().ok_or(RegistrationError::MissingField("id"))?;
		let name = self
			.name
			.as_deref()
			.filter(|n| !n.trim().is_empty())
			.ok_or(RegistrationError::MissingField("name"))?;
		Ok(BadgeDefinition::new(id, name, self.tooltip.clone(), cdn_base))
	}
}

/// Paints are resolved alongside badges but have no registry of their own.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CosmeticPaint {
	#[serde(default)]
	pub id: Option<String>,
	#[serde(default)]
	pub name: Option<String>,
	#[serde(default)]
	pub function: Option<String>,
	#[serde(default)]
	pub color: Option<i64>,
	#[serde(default)]
	pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CosmeticDetails {
	#[serde(default)]
	pub badges: Vec<CosmeticBadge>,
	#[serde(default)]
	pub paints: Vec<CosmeticPaint>,
}

impl CosmeticDetails {
	pub fn badge(&self, badge_id: &CosmeticId) -> Option<&CosmeticBadge> {
		self.badges.iter().find(|b| b.id.as_deref() == Some(badge_id.as_str()))
	}

	pub fn is_empty(&self) -> bool {
		self.badges.is_empty() && self.paints.is_empty()
	}
}

/// Remote lookups the fetcher and presence reporter depend on.
#[async_trait]
pub trait CosmeticsApi: Send + Sync {
	/// `Ok(None)` when the account has no cosmetics profile.
	async fn user_by_connection(
		&self,
		platform: Platform,
		user_id: &PlatformUserId,
	) -> Result<Option<UserCosmeticRefs>, LookupError>;

	async fn cosmetics(&self, ids: &[CosmeticId]) -> Result<CosmeticDetails, LookupError>;

	async fn send_presence(&self, user_id: &ProviderUserId, presence: &PresenceRequest) -> Result<(), LookupError>;
}

pub struct SevenTvGqlClient {
	http: Client,
	cfg: CosmeticsConfig,
}

impl SevenTvGqlClient {
	pub fn new(cfg: &CosmeticsConfig) -> Result<Self, LookupError> {
		let mut headers = HeaderMap::new();
		headers.insert(
			"X-7TV-Platform",
			HeaderValue::from_str(&cfg.app_name).map_err(|err| LookupError::Client(err.to_string()))?,
		);
		headers.insert(
			"X-7TV-Version",
			HeaderValue::from_str(&cfg.app_version).map_err(|err| LookupError::Client(err.to_string()))?,
		);

		let http = Client::builder()
			.timeout(cfg.request_timeout)
			.default_headers(headers)
			.build()
			.map_err(|err| LookupError::Client(err.to_string()))?;

		Ok(Self {
			http,
			cfg: cfg.clone(),
		})
	}

	async fn post<T, V>(&self, req: GraphqlRequest<'_, V>, context: &str) -> Result<T, LookupError>
	where
		T: for<'de> Deserialize<'de>,
		V: Serialize,
	{
		let resp = self.http.post(&self.cfg.gql_url).json(&req).send().await?;

		let status = resp.status();
		if status == reqwest::StatusCode::NOT_FOUND {
			return Err(LookupError::NotFound);
		}
		if !status.is_success() {
			return Err(LookupError::Status(status.as_u16()));
		}

		let body: GraphqlResponse<T> = resp.json().await?;
		debug!(context, "gql response received");
		body.into_data()
	}
}

#[async_trait]
impl CosmeticsApi for SevenTvGqlClient {
	async fn user_by_connection(
		&self,
		platform: Platform,
		user_id: &PlatformUserId,
	) -> Result<Option<UserCosmeticRefs>, LookupError> {
		let req = GraphqlRequest {
			operation_name: None,
			query: USER_COSMETICS_QUERY,
			variables: UserCosmeticsVars {
				id: user_id.as_str(),
				platform: platform.as_connection_str(),
			},
		};

		match self.post::<UserCosmeticsData, _>(req, "user cosmetics").await {
			Ok(data) => Ok(data.into_refs()),
			Err(LookupError::NotFound) => Ok(None),
			Err(err) => Err(err),
		}
	}

	async fn cosmetics(&self, ids: &[CosmeticId]) -> Result<CosmeticDetails, LookupError> {
		let req = GraphqlRequest {
			operation_name: Some(COSMETICS_OPERATION),
			query: COSMETICS_QUERY,
			variables: CosmeticsVars {
				list: ids.iter().map(CosmeticId::as_str).collect(),
			},
		};

		let data: CosmeticsData = self.post(req, "cosmetic details").await?;
		Ok(data.cosmetics.unwrap_or_default())
	}

	async fn send_presence(&self, user_id: &ProviderUserId, presence: &PresenceRequest) -> Result<(), LookupError> {
		let url = self.cfg.presence_url(user_id.as_str());
		let resp = self.http.post(url).json(presence).send().await?;
		let status = resp.status();
		if !status.is_success() {
			return Err(LookupError::Status(status.as_u16()));
		}
		Ok(())
	}
}

#[derive(Debug, Serialize)]
struct GraphqlRequest<'a, V> {
	#[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
	operation_name: Option<&'a str>,
	query: &'a str,
	variables: V,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
	data: Option<T>,
	errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
	message: String,
}

impl<T> GraphqlResponse<T> {
	fn into_data(self) -> Result<T, LookupError> {
		if let Some(errors) = self.errors.filter(|e| !e.is_empty()) {
			let messages: Vec<_> = errors.into_iter().map(|e| e.message).collect();
			if messages.iter().any(|m| m.to_ascii_lowercase().contains("not found")) {
				return Err(LookupError::NotFound);
			}
			if self.data.is_none() {
				return Err(LookupError::Malformed(messages.join(", ")));
			}
			debug!(errors = %messages.join(", "), "gql partial response");
		}

		self.data.ok_or_else(|| LookupError::Malformed("response missing data".to_string()))
	}
}

#[derive(Debug, Serialize)]
struct UserCosmeticsVars<'a> {
	id: &'a str,
	platform: &'a str,
}

#[derive(Debug, Serialize)]
struct CosmeticsVars<'a> {
	list: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct UserCosmeticsData {
	#[serde(rename = "userByConnection")]
	user_by_connection: Option<GqlUser>,
}

#[derive(Debug, Deserialize)]
struct GqlUser {
	#[serde(default)]
	id: Option<String>,
	#[serde(default)]
	style: Option<GqlUserStyle>,
}

#[derive(Debug, Deserialize)]
struct GqlUserStyle {
	#[serde(default)]
	badge_id: Option<String>,
	#[serde(default)]
	paint_id: Option<String>,
}

impl UserCosmeticsData {
	fn into_refs(self) -> Option<UserCosmeticRefs> {
		let user = self.user_by_connection?;
		let style = user.style;
		Some(UserCosmeticRefs {
			user_id: user.id.and_then(|id| ProviderUserId::new(id).ok()),
			badge_id: style
				.as_ref()
				.and_then(|s| s.badge_id.as_deref())
				.and_then(|id| CosmeticId::new(id).ok()),
			paint_id: style
				.as_ref()
				.and_then(|s| s.paint_id.as_deref())
				.and_then(|id| CosmeticId::new(id).ok()),
		})
	}
}

#[derive(Debug, Deserialize)]
struct CosmeticsData {
	cosmetics: Option<CosmeticDetails>,
}
