//! Microsoft Graph type definitions
//!
//! Collection envelopes and the compact projections returned to MCP clients.
//! The projections deserialize straight from Graph's resource shape and
//! serialize in a flattened form.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A page of a Graph collection as returned on the wire
#[derive(Debug, Clone, Deserialize)]
pub struct GraphCollection<T> {
    /// Items; absent means empty
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,

    /// Link to the next page
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
}

/// Anything that carries a Graph resource id
pub trait Identified {
    fn id(&self) -> Option<&str>;
}

impl Identified for Value {
    fn id(&self) -> Option<&str> {
        self.get("id").and_then(Value::as_str)
    }
}

/// An item type that can be read from a Graph collection and handed back out
pub trait GraphItem: DeserializeOwned + Serialize + Identified + Send + 'static {}

impl<T> GraphItem for T where T: DeserializeOwned + Serialize + Identified + Send + 'static {}

/// Reconciled result handed back to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,

    /// Opaque cursor for the next page, when more results exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, continuation_token: Option<String>) -> Self {
        Self {
            items,
            continuation_token,
        }
    }
}

/// `emailAddress` wrapper used by Graph for senders and recipients
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    #[serde(default)]
    email_address: Option<EmailAddress>,
}

/// A mailbox as shown to clients
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "GraphRecipient")]
pub struct EmailAddress {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl From<GraphRecipient> for EmailAddress {
    fn from(recipient: GraphRecipient) -> Self {
        recipient.email_address.unwrap_or_default()
    }
}

/// Compact view of a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub from: Option<EmailAddress>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub to_recipients: Vec<EmailAddress>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub cc_recipients: Vec<EmailAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<Value>,
    #[serde(default)]
    pub received_date_time: Option<String>,
    #[serde(default)]
    pub sent_date_time: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub categories: Vec<String>,
    #[serde(default)]
    pub is_read: Option<bool>,
    #[serde(default)]
    pub has_attachments: Option<bool>,
    #[serde(default)]
    pub importance: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub internet_message_id: Option<String>,
    #[serde(default)]
    pub body_preview: Option<String>,
}

impl Identified for MessageSummary {
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DateTimeTimeZone {
    #[serde(default)]
    date_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Location {
    #[serde(default)]
    display_name: Option<String>,
}

/// Event resource fields read from Graph
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphEvent {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    start: Option<DateTimeTimeZone>,
    #[serde(default)]
    end: Option<DateTimeTimeZone>,
    #[serde(default)]
    organizer: Option<EmailAddress>,
    #[serde(default, deserialize_with = "null_as_empty")]
    attendees: Vec<EmailAddress>,
    #[serde(default)]
    location: Option<Location>,
    #[serde(default)]
    web_link: Option<String>,
    #[serde(default)]
    is_all_day: Option<bool>,
    #[serde(default)]
    is_cancelled: Option<bool>,
    #[serde(default)]
    has_attachments: Option<bool>,
    #[serde(default)]
    importance: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    categories: Vec<String>,
}

/// Compact view of a calendar event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "GraphEvent")]
pub struct EventSummary {
    pub id: Option<String>,
    pub subject: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub organizer: Option<String>,
    pub attendees: Vec<String>,
    pub location: Option<String>,
    pub web_link: Option<String>,
    pub is_all_day: Option<bool>,
    pub is_cancelled: Option<bool>,
    pub has_attachments: Option<bool>,
    pub importance: Option<String>,
    pub categories: Vec<String>,
}

impl From<GraphEvent> for EventSummary {
    fn from(event: GraphEvent) -> Self {
        Self {
            id: event.id,
            subject: event.subject,
            start: event.start.and_then(|s| s.date_time),
            end: event.end.and_then(|e| e.date_time),
            organizer: event.organizer.and_then(|o| o.address),
            attendees: event
                .attendees
                .into_iter()
                .filter_map(|a| a.address)
                .collect(),
            location: event
                .location
                .and_then(|l| l.display_name)
                .filter(|name| !name.is_empty()),
            web_link: event.web_link,
            is_all_day: event.is_all_day,
            is_cancelled: event.is_cancelled,
            has_attachments: event.has_attachments,
            importance: event.importance,
            categories: event.categories,
        }
    }
}

impl Identified for EventSummary {
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

/// Graph sends `null` for some list fields
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
