/// Shared types for the chat layer: REST DTOs, bus envelopes, store entries
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Prefix of client-generated ids for optimistic messages
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Generate a fresh local id for an optimistic message
pub fn new_local_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4())
}

/// True for ids produced by [`new_local_id`]
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    #[default]
    Active,
    Archived,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    #[default]
    Sent,
    Delivered,
    Read,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    System,
    PriceOffer,
    OfferAccepted,
    OfferRejected,
    OfferCountered,
}

impl MessageType {
    /// One of the price-offer subtypes
    pub fn is_offer(&self) -> bool {
        matches!(
            self,
            MessageType::PriceOffer
                | MessageType::OfferAccepted
                | MessageType::OfferRejected
                | MessageType::OfferCountered
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
    Countered,
    Cancelled,
}

/// Marketplace listing a conversation or offer is anchored to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingRef {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "thumbnailUrl", alias = "image")]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_id", alias = "sellerId")]
    pub owner_id: Option<String>,
}

/// One conversation thread between two users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_id_vec", alias = "participantIds")]
    pub participants: Vec<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub last_message_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_time", alias = "lastMessageTime")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "lastMessage")]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub status: ConversationStatus,
    #[serde(default, alias = "item")]
    pub listing: Option<ListingRef>,
}

impl Conversation {
    /// The participant that is not `user_id`
    pub fn counterpart(&self, user_id: &str) -> Option<&str> {
        self.participants
            .iter()
            .map(String::as_str)
            .find(|p| *p != user_id)
    }
}

/// Price-offer fields carried by offer messages
#[derive(Debug, Clone, PartialEq)]
pub struct OfferDetails {
    pub price: f64,
    pub status: OfferStatus,
    pub related_offer_id: Option<String>,
    pub listing: Option<ListingRef>,
}

/// A chat message as exchanged with the server.
///
/// Validated at the boundary: decoding fails when the id or the owning
/// conversation id is missing, or when an offer message carries no price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub media: Vec<String>,
    pub status: DeliveryStatus,
    pub kind: MessageType,
    pub offer: Option<OfferDetails>,
    pub created_at: Option<DateTime<Utc>>,
    /// Correlation id echoed back for messages sent by this client
    pub client_message_id: Option<String>,
}

impl Message {
    /// Plain text message
    pub fn text(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            content: content.into(),
            media: Vec::new(),
            status: DeliveryStatus::Sent,
            kind: MessageType::Text,
            offer: None,
            created_at: Some(Utc::now()),
            client_message_id: None,
        }
    }

    /// Short text for conversation list previews
    pub fn preview(&self) -> String {
        match self.kind {
            MessageType::Image => "[Image]".to_string(),
            MessageType::File => "[File]".to_string(),
            kind if kind.is_offer() => match &self.offer {
                Some(offer) => format!("[Offer] {}", offer.price),
                None => "[Offer]".to_string(),
            },
            _ => self.content.chars().take(80).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default, deserialize_with = "de_opt_id")]
    id: Option<String>,
    #[serde(
        default,
        deserialize_with = "de_opt_id",
        alias = "conservationId",
        alias = "roomId"
    )]
    conversation_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    sender_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    recipient_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "mediaUrls")]
    media: Vec<String>,
    #[serde(default)]
    status: DeliveryStatus,
    #[serde(default, rename = "type")]
    kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offer_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offer_status: Option<OfferStatus>,
    #[serde(
        default,
        deserialize_with = "de_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    related_offer_id: Option<String>,
    #[serde(default, alias = "item", skip_serializing_if = "Option::is_none")]
    listing: Option<ListingRef>,
    #[serde(default, deserialize_with = "de_opt_time", alias = "timestamp")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_message_id: Option<String>,
}

impl TryFrom<WireMessage> for Message {
    type Error = String;

    fn try_from(w: WireMessage) -> std::result::Result<Self, Self::Error> {
        let id = w
            .id
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "message without id".to_string())?;
        let conversation_id = w
            .conversation_id
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("message {} without conversation id", id))?;

        let offer = if w.kind.is_offer() {
            let price = w
                .offer_price
                .ok_or_else(|| format!("offer message {} without price", id))?;
            Some(OfferDetails {
                price,
                status: w.offer_status.unwrap_or_default(),
                related_offer_id: w.related_offer_id,
                listing: w.listing,
            })
        } else {
            None
        };

        Ok(Message {
            id,
            conversation_id,
            sender_id: w.sender_id.unwrap_or_default(),
            recipient_id: w.recipient_id.unwrap_or_default(),
            content: w.content.unwrap_or_default(),
            media: w.media,
            status: w.status,
            kind: w.kind,
            offer,
            created_at: w.created_at,
            client_message_id: w.client_message_id,
        })
    }
}

impl From<Message> for WireMessage {
    fn from(m: Message) -> Self {
        let (offer_price, offer_status, related_offer_id, listing) = match m.offer {
            Some(o) => (Some(o.price), Some(o.status), o.related_offer_id, o.listing),
            None => (None, None, None, None),
        };
        WireMessage {
            id: Some(m.id),
            conversation_id: Some(m.conversation_id),
            sender_id: Some(m.sender_id),
            recipient_id: Some(m.recipient_id),
            content: Some(m.content),
            media: m.media,
            status: m.status,
            kind: m.kind,
            offer_price,
            offer_status,
            related_offer_id,
            listing,
            created_at: m.created_at,
            client_message_id: m.client_message_id,
        }
    }
}

/// A message as held by the conversation store
#[derive(Debug, Clone, PartialEq)]
pub enum MessageEntry {
    /// Optimistic entry awaiting server confirmation
    Pending {
        local_id: String,
        message: Message,
        failed: bool,
    },
    /// Server-confirmed message
    Confirmed(Message),
}

impl MessageEntry {
    /// Local id for pending entries, server id for confirmed ones
    pub fn id(&self) -> &str {
        match self {
            MessageEntry::Pending { local_id, .. } => local_id,
            MessageEntry::Confirmed(m) => &m.id,
        }
    }

    pub fn message(&self) -> &Message {
        match self {
            MessageEntry::Pending { message, .. } => message,
            MessageEntry::Confirmed(m) => m,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MessageEntry::Pending { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, MessageEntry::Pending { failed: true, .. })
    }

    /// Status to render: pending entries report FAILED once their send failed
    pub fn status(&self) -> DeliveryStatus {
        match self {
            MessageEntry::Pending { failed: true, .. } => DeliveryStatus::Failed,
            MessageEntry::Pending { message, .. } => message.status,
            MessageEntry::Confirmed(m) => m.status,
        }
    }
}

/// Spring-style page returned by paginated endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub content: Vec<T>,
    #[serde(default)]
    pub number: u32,
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub total_elements: u64,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub last: bool,
}

impl<T> Page<T> {
    /// Whether another page may follow, judged by the page being full-sized
    pub fn has_more(&self, requested_size: u32) -> bool {
        requested_size > 0 && self.content.len() >= requested_size as usize
    }
}

/// Envelope published to `/app/send-message`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEnvelope {
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
}

/// Envelope delivered on `/user/queue/responses`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub status: AckStatus,
    #[serde(default)]
    pub client_message_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub message_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Events broadcast by the connection manager
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Bus session established and subscriptions in place
    Connected { user_id: String },
    /// Bus session lost or closed
    Disconnected { reason: String },
    /// A message addressed to this user
    Inbound { message: Message },
    /// Acknowledgement of one of our own publishes
    Ack { response: ResponseEnvelope },
}

// ─── Lenient decoding helpers ────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Str(String),
    Int(i64),
    Uint(u64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Str(s) => s,
            RawId::Int(n) => n.to_string(),
            RawId::Uint(n) => n.to_string(),
        }
    }
}

/// Ids arrive as strings or numbers depending on the endpoint
fn de_id<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    RawId::deserialize(d).map(String::from)
}

fn de_opt_id<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(Option::<RawId>::deserialize(d)?.map(String::from))
}

fn de_id_vec<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<String>, D::Error> {
    let raw = Option::<Vec<RawId>>::deserialize(d)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(String::from)
        .collect())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTime {
    Text(String),
    Millis(i64),
}

/// RFC 3339, zone-less local date-times (taken as UTC), or epoch millis
fn de_opt_time<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error> {
    let raw = match Option::<RawTime>::deserialize(d)? {
        Some(raw) => raw,
        None => return Ok(None),
    };
    match raw {
        RawTime::Millis(ms) => Ok(Utc.timestamp_millis_opt(ms).single()),
        RawTime::Text(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
                return Ok(Some(dt.with_timezone(&Utc)));
            }
            NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| Some(Utc.from_utc_datetime(&naive)))
                .map_err(serde::de::Error::custom)
        }
    }
}
