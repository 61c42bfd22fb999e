use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Upstream catalog events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    pub id: Uuid,
    pub sku: Option<String>,
    pub name: String,
    pub category: Option<String>,
    pub brand: Option<String>,
    #[serde(rename = "type")]
    pub item_type: Option<String>,
    pub base_price: Option<BigDecimal>,
    pub description: Option<String>,
    #[serde(default = "default_rental_eligible")]
    pub rental_eligible: bool,
}

fn default_rental_eligible() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum CatalogEvent {
    ItemCreated(CatalogItem),
    ItemUpdated(CatalogItem),
    #[serde(rename_all = "camelCase")]
    ItemDeleted { id: Uuid },
    #[serde(rename_all = "camelCase")]
    ItemPriceChanged {
        id: Uuid,
        old_price: Option<BigDecimal>,
        new_price: BigDecimal,
    },
}

/// Result of decoding a catalog message. Kinds this service does not know
/// about are surfaced rather than treated as errors so the consumer can skip
/// them.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedCatalogEvent {
    Known(CatalogEvent),
    Unknown(String),
}

impl CatalogEvent {
    pub const KNOWN_KINDS: [&'static str; 4] =
        ["ItemCreated", "ItemUpdated", "ItemDeleted", "ItemPriceChanged"];

    pub fn decode(payload: &str) -> Result<DecodedCatalogEvent, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(payload)?;
        let kind = value
            .get("eventType")
            .and_then(|k| k.as_str())
            .unwrap_or_default()
            .to_string();

        if !Self::KNOWN_KINDS.contains(&kind.as_str()) {
            return Ok(DecodedCatalogEvent::Unknown(kind));
        }

        serde_json::from_value(value).map(DecodedCatalogEvent::Known)
    }

    pub fn item_id(&self) -> Uuid {
        match self {
            CatalogEvent::ItemCreated(item) | CatalogEvent::ItemUpdated(item) => item.id,
            CatalogEvent::ItemDeleted { id } | CatalogEvent::ItemPriceChanged { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CatalogEvent::ItemCreated(_) => "ItemCreated",
            CatalogEvent::ItemUpdated(_) => "ItemUpdated",
            CatalogEvent::ItemDeleted { .. } => "ItemDeleted",
            CatalogEvent::ItemPriceChanged { .. } => "ItemPriceChanged",
        }
    }
}

// ---------------------------------------------------------------------------
// Downstream reservation events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReservationEventKind {
    #[serde(rename_all = "camelCase")]
    ReservationCreated { expires_at: DateTime<Utc> },
    ReservationConfirmed,
    ReservationCancelled { reason: Option<String> },
    ReservationExpired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationEvent {
    pub event_id: Uuid,
    #[serde(flatten)]
    pub kind: ReservationEventKind,
    pub reservation_id: String,
    pub item_id: Uuid,
    pub customer_id: Uuid,
    pub quantity: i32,
    pub occurred_at: DateTime<Utc>,
}

impl ReservationEvent {
    pub fn new(
        kind: ReservationEventKind,
        reservation_id: String,
        item_id: Uuid,
        customer_id: Uuid,
        quantity: i32,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            reservation_id,
            item_id,
            customer_id,
            quantity,
            occurred_at,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            ReservationEventKind::ReservationCreated { .. } => "ReservationCreated",
            ReservationEventKind::ReservationConfirmed => "ReservationConfirmed",
            ReservationEventKind::ReservationCancelled { .. } => "ReservationCancelled",
            ReservationEventKind::ReservationExpired => "ReservationExpired",
        }
    }
}

// ---------------------------------------------------------------------------
// Inventory commands and replies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "commandType", rename_all_fields = "camelCase")]
pub enum CommandAction {
    CreateReservation {
        item_id: Uuid,
        customer_id: Uuid,
        quantity: i32,
        timeout_minutes: Option<i64>,
        planned_start: Option<DateTime<Utc>>,
        planned_end: Option<DateTime<Utc>>,
        notes: Option<String>,
    },
    ConfirmReservation {
        reservation_id: String,
    },
    CancelReservation {
        reservation_id: String,
        reason: Option<String>,
    },
    ExtendReservation {
        reservation_id: String,
        additional_minutes: i64,
        reason: Option<String>,
    },
    UpdateStock {
        item_id: Uuid,
        delta: i32,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: Uuid,
    pub idempotency_key: String,
    pub action: CommandAction,
    pub created_at: DateTime<Utc>,
}

impl Command {
    pub fn new(action: CommandAction) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            idempotency_key: id.to_string(),
            action,
            created_at: Utc::now(),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReply {
    pub id: Uuid,
    pub command_id: Uuid,
    pub status: CommandStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CommandReply {
    pub fn success(command_id: Uuid, result: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_id,
            status: CommandStatus::Success,
            result,
            error: None,
            error_kind: None,
            created_at: Utc::now(),
        }
    }

    pub fn failed(command_id: Uuid, kind: &str, error: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_id,
            status: CommandStatus::Failed,
            result: None,
            error: Some(error),
            error_kind: Some(kind.to_string()),
            created_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}
