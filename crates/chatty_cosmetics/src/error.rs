#![forbid(unsafe_code)]

use thiserror::Error;

/// Socket/WebSocket level failure. Always transient: the gateway reconnects with backoff.
#[derive(Debug, Error)]
pub enum TransportError {
	#[error("connect failed: {0}")]
	Connect(String),
	#[error("send failed: {0}")]
	Send(String),
	#[error("receive failed: {0}")]
	Receive(String),
	#[error("connection closed")]
	Closed,
}

/// Malformed or unexpected gateway frame. The frame is dropped, the connection kept.
#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("invalid frame json: {0}")]
	InvalidJson(#[from] serde_json::Error),
	#[error("unknown opcode: {0}")]
	UnknownOpcode(u64),
	#[error("invalid {opcode} payload: {detail}")]
	InvalidPayload { opcode: &'static str, detail: String },
}

/// Cosmetic lookup failure. Callers treat every variant as "no cosmetic".
#[derive(Debug, Error)]
pub enum LookupError {
	#[error("network error: {0}")]
	Network(String),
	#[error("unexpected status {0}")]
	Status(u16),
	#[error("not found")]
	NotFound,
	#[error("malformed response: {0}")]
	Malformed(String),
	#[error("http client setup failed: {0}")]
	Client(String),
}

impl From<reqwest::Error> for LookupError {
	fn from(err: reqwest::Error) -> Self {
		if let Some(status) = err.status() {
			Self::Status(status.as_u16())
		} else if err.is_decode() {
			Self::Malformed(err.to_string())
		} else {
			Self::Network(err.to_string())
		}
	}
}

/// Badge payload rejected before it reached the registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
	#[error("badge payload missing field `{0}`")]
	MissingField(&'static str),
	#[error("badge payload is not an object")]
	NotAnObject,
}
