use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(DeviceId);

const PNI_PREFIX: &str = "PNI:";

/// An account identifier as it appears on the wire: a bare UUID for an ACI,
/// or a `PNI:`-prefixed UUID for a phone-number identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "uuid", rename_all = "snake_case")]
pub enum ServiceId {
    Aci(Uuid),
    Pni(Uuid),
}

impl ServiceId {
    pub fn parse_or_none(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Some(pni) = raw.strip_prefix(PNI_PREFIX) {
            return Uuid::parse_str(pni).ok().map(ServiceId::Pni);
        }
        Uuid::parse_str(raw).ok().map(ServiceId::Aci)
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            ServiceId::Aci(uuid) | ServiceId::Pni(uuid) => *uuid,
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceId::Aci(uuid) => write!(f, "{uuid}"),
            ServiceId::Pni(uuid) => write!(f, "{PNI_PREFIX}{uuid}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Ciphertext,
    KeyExchange,
    PrekeyBundle,
    ServerDeliveryReceipt,
    UnidentifiedSender,
    PlaintextContent,
    #[serde(other)]
    Unknown,
}

impl EnvelopeType {
    /// Types that carry content for the decryptor.
    pub fn is_decryptable(&self) -> bool {
        matches!(
            self,
            EnvelopeType::Ciphertext
                | EnvelopeType::PrekeyBundle
                | EnvelopeType::UnidentifiedSender
                | EnvelopeType::PlaintextContent
        )
    }
}

/// One undecrypted inbound unit as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub envelope_type: EnvelopeType,
    /// Sender-assigned timestamp in epoch milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_device: Option<DeviceId>,
    pub server_timestamp: i64,
    pub server_delivered_timestamp: i64,
    #[serde(default)]
    pub urgent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_guid: Option<String>,
    #[serde(default)]
    pub content: Vec<u8>,
}

impl Envelope {
    pub fn source(&self) -> Option<ServiceId> {
        self.source_service_id
            .as_deref()
            .and_then(ServiceId::parse_or_none)
    }

    /// Time the envelope spent queued on the server before it was handed to us.
    pub fn server_queue_latency(&self) -> Duration {
        Duration::milliseconds(
            self.server_delivered_timestamp
                .saturating_sub(self.server_timestamp)
                .max(0),
        )
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }
}
