#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Chat platform whose accounts cosmetics are resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
	Twitch,
}

impl Platform {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Platform::Twitch => "twitch",
		}
	}

	/// Upper-case connection name used by the cosmetics provider (`TWITCH`).
	pub const fn as_connection_str(self) -> &'static str {
		match self {
			Platform::Twitch => "TWITCH",
		}
	}
}

impl fmt::Display for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown platform: {0}")]
	UnknownPlatform(String),
}

impl FromStr for Platform {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"twitch" => Ok(Platform::Twitch),
			other => Err(ParseIdError::UnknownPlatform(other.to_string())),
		}
	}
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty id (surrounding whitespace is trimmed).
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				let trimmed = id.trim();
				if trimmed.is_empty() {
					return Err(ParseIdError::Empty);
				}
				if trimmed.len() == id.len() {
					Ok(Self(id))
				} else {
					Ok(Self(trimmed.to_string()))
				}
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}

			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::new(s.to_string())
			}
		}

		impl AsRef<str> for $name {
			fn as_ref(&self) -> &str {
				&self.0
			}
		}
	};
}

string_id! {
	/// Chat-platform user id (e.g. a Twitch user id), the key badges are assigned under.
	PlatformUserId
}

string_id! {
	/// Chat-platform channel id a gateway subscription is scoped to.
	ChannelId
}

string_id! {
	/// Cosmetic reference id (badge or paint) issued by the provider.
	CosmeticId
}

string_id! {
	/// User id inside the cosmetics provider (not the chat platform).
	ProviderUserId
}
