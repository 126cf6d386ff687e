#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod fetcher;
pub mod gateway;
pub mod presence;
pub mod registry;
pub mod service;
pub mod subscriptions;

pub use config::CosmeticsConfig;
pub use error::{LookupError, ProtocolError, RegistrationError, TransportError};
pub use fetcher::{CosmeticsApi, MetadataFetcher, SevenTvGqlClient};
pub use gateway::{ConnectionSession, ConnectionState, GatewayConnection};
pub use presence::PresenceReporter;
pub use registry::{BadgeDefinition, BadgeIcon, BadgeRegistry, BadgeScale};
pub use service::{CosmeticsService, IdentityResolver, LocalUser};
pub use subscriptions::{SubscriptionManager, SubscriptionTopic};
