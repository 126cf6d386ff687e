#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::subscriptions::SubscriptionTopic;

/// Gateway opcodes. Inbound: 0, 1, 2, 4, 5, 6. Outbound: 2, 35, 36.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
	Dispatch,
	Hello,
	Heartbeat,
	Reconnect,
	Ack,
	Error,
	Subscribe,
	Unsubscribe,
}

impl Opcode {
	pub fn from_u64(op: u64) -> Option<Self> {
		match op {
			0 => Some(Self::Dispatch),
			1 => Some(Self::Hello),
			2 => Some(Self::Heartbeat),
			4 => Some(Self::Reconnect),
			5 => Some(Self::Ack),
			6 => Some(Self::Error),
			35 => Some(Self::Subscribe),
			36 => Some(Self::Unsubscribe),
			_ => None,
		}
	}

	pub fn as_u8(self) -> u8 {
		match self {
			Self::Dispatch => 0,
			Self::Hello => 1,
			Self::Heartbeat => 2,
			Self::Reconnect => 4,
			Self::Ack => 5,
			Self::Error => 6,
			Self::Subscribe => 35,
			Self::Unsubscribe => 36,
		}
	}

	pub fn name(self) -> &'static str {
		match self {
			Self::Dispatch => "DISPATCH",
			Self::Hello => "HELLO",
			Self::Heartbeat => "HEARTBEAT",
			Self::Reconnect => "RECONNECT",
			Self::Ack => "ACK",
			Self::Error => "ERROR",
			Self::Subscribe => "SUBSCRIBE",
			Self::Unsubscribe => "UNSUBSCRIBE",
		}
	}
}

impl fmt::Display for Opcode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// One decoded gateway frame.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayFrame {
	Dispatch(DispatchPayload),
	Hello(HelloPayload),
	Heartbeat,
	Reconnect,
	Ack(serde_json::Value),
	Error(serde_json::Value),
	Subscribe(SubscriptionTopic),
	Unsubscribe(SubscriptionTopic),
}

impl GatewayFrame {
	pub fn opcode(&self) -> Opcode {
		match self {
			Self::Dispatch(_) => Opcode::Dispatch,
			Self::Hello(_) => Opcode::Hello,
			Self::Heartbeat => Opcode::Heartbeat,
			Self::Reconnect => Opcode::Reconnect,
			Self::Ack(_) => Opcode::Ack,
			Self::Error(_) => Opcode::Error,
			Self::Subscribe(_) => Opcode::Subscribe,
			Self::Unsubscribe(_) => Opcode::Unsubscribe,
		}
	}

	/// Decode a `{"op": <int>, "d": <payload>}` text frame.
	pub fn decode(text: &str) -> Result<Self, ProtocolError> {
		let envelope: Envelope = serde_json::from_str(text)?;
		let opcode = Opcode::from_u64(envelope.op).ok_or(ProtocolError::UnknownOpcode(envelope.op))?;
		let d = envelope.d.unwrap_or(serde_json::Value::Null);

		let frame = match opcode {
			Opcode::Dispatch => Self::Dispatch(payload(opcode, d)?),
			Opcode::Hello => Self::Hello(payload(opcode, d)?),
			Opcode::Heartbeat => Self::Heartbeat,
			Opcode::Reconnect => Self::Reconnect,
			Opcode::Ack => Self::Ack(d),
			Opcode::Error => Self::Error(d),
			Opcode::Subscribe => Self::Subscribe(payload(opcode, d)?),
			Opcode::Unsubscribe => Self::Unsubscribe(payload(opcode, d)?),
		};
		Ok(frame)
	}

	pub fn encode(&self) -> Result<String, ProtocolError> {
		let d = match self {
			Self::Dispatch(p) => Some(serde_json::to_value(p)?),
			Self::Hello(p) => Some(serde_json::to_value(p)?),
			Self::Heartbeat | Self::Reconnect => None,
			Self::Ack(v) | Self::Error(v) => Some(v.clone()),
			Self::Subscribe(t) | Self::Unsubscribe(t) => Some(serde_json::to_value(t)?),
		};

		let envelope = Envelope {
			op: u64::from(self.opcode().as_u8()),
			d,
		};
		Ok(serde_json::to_string(&envelope)?)
	}
}

fn payload<T>(opcode: Opcode, d: serde_json::Value) -> Result<T, ProtocolError>
where
	T: for<'de> Deserialize<'de>,
{
	serde_json::from_value(d).map_err(|err| ProtocolError::InvalidPayload {
		opcode: opcode.name(),
		detail: err.to_string(),
	})
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
	op: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	d: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
	/// Milliseconds.
	#[serde(default)]
	pub heartbeat_interval: Option<u64>,
	pub session_id: String,
}

impl HelloPayload {
	pub fn heartbeat_interval(&self) -> Option<Duration> {
		self.heartbeat_interval.filter(|ms| *ms > 0).map(Duration::from_millis)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DispatchType {
	#[serde(rename = "system.announcement")]
	SystemAnnouncement,
	#[serde(rename = "emote.create")]
	EmoteCreate,
	#[serde(rename = "emote.update")]
	EmoteUpdate,
	#[serde(rename = "emote.delete")]
	EmoteDelete,
	#[serde(rename = "emote_set.create")]
	EmoteSetCreate,
	#[serde(rename = "emote_set.update")]
	EmoteSetUpdate,
	#[serde(rename = "emote_set.delete")]
	EmoteSetDelete,
	#[serde(rename = "user.create")]
	UserCreate,
	#[serde(rename = "user.update")]
	UserUpdate,
	#[serde(rename = "user.delete")]
	UserDelete,
	#[serde(rename = "cosmetic.create")]
	CosmeticCreate,
	#[serde(rename = "cosmetic.update")]
	CosmeticUpdate,
	#[serde(rename = "cosmetic.delete")]
	CosmeticDelete,
	#[serde(rename = "entitlement.create")]
	EntitlementCreate,
	#[serde(rename = "entitlement.update")]
	EntitlementUpdate,
	#[serde(rename = "entitlement.delete")]
	EntitlementDelete,
	#[serde(other)]
	Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchPayload {
	#[serde(rename = "type")]
	pub dispatch_type: DispatchType,
	#[serde(default)]
	pub body: DispatchBody,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchBody {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub object: Option<serde_json::Value>,
}
