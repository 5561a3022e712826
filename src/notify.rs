//! Push notification planning for new feed items.
//!
//! Nothing here talks to a push service. Planning turns a new item and the
//! candidate recipients into messages; delivery results are classified so
//! callers know which device tokens to forget.

use crate::types::{FeedItem, ItemId, ViewerId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const NEW_POST_TITLE: &str = "New Matenc Forum Post!";

const BODY_LIMIT: usize = 100;
const ELLIPSIS: &str = "...";
const FALLBACK_AUTHOR: &str = "Someone";
const FALLBACK_BODY: &str = "Check out the latest discussion.";
const POST_SCREEN: &str = "/Main_pages/ForumPost/";

/// A user who may receive new-post notifications.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub viewer_id: ViewerId,
    pub push_token: Option<String>,
    /// Opted in to alerts for new forum posts.
    pub new_post_alerts: bool,
}

/// Where a tapped notification should lead.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTarget {
    pub screen: String,
    pub item_id: ItemId,
}

impl NotificationTarget {
    pub fn for_item(item: &ItemId) -> Self {
        Self {
            screen: format!("{}{}", POST_SCREEN, item),
            item_id: item.clone(),
        }
    }

    /// The data payload attached to a push message.
    pub fn to_data(&self) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("screen".into(), Value::from(self.screen.clone()));
        data.insert("postId".into(), Value::from(self.item_id.as_str()));
        data
    }

    /// Recover the target from a delivered data payload. Accepts payloads
    /// carrying only the screen route.
    pub fn from_data(data: &Map<String, Value>) -> Option<Self> {
        let screen = data.get("screen").and_then(Value::as_str);
        let item = data
            .get("postId")
            .and_then(Value::as_str)
            .or_else(|| screen.and_then(|s| s.strip_prefix(POST_SCREEN)))
            .filter(|id| !id.is_empty() && !id.contains('/'))?;

        let item_id = ItemId::new(item);
        Some(Self {
            screen: screen.map_or_else(|| format!("{}{}", POST_SCREEN, item), str::to_string),
            item_id,
        })
    }
}

/// A single message ready for the push service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub to: ViewerId,
    pub token: String,
    pub title: String,
    pub body: String,
    pub target: NotificationTarget,
}

/// Result of registering a device for push.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRegistration {
    /// `None` when permission was refused or the device cannot receive push.
    pub token: Option<String>,
}

impl PushRegistration {
    pub fn granted(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn denied() -> Self {
        Self { token: None }
    }

    pub fn is_registered(&self) -> bool {
        self.token.as_deref().map_or(false, |t| !t.is_empty())
    }
}

/// What to do with a token after a failed delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFailure {
    /// The token is dead; drop it from the user's profile.
    RemoveToken,
    /// Anything else; keep the token.
    Keep,
}

/// Classify a push service error code.
pub fn classify_delivery_failure(code: &str) -> DeliveryFailure {
    match code {
        "messaging/registration-token-not-registered"
        | "messaging/invalid-registration-token"
        | "messaging/mismatched-credential" => DeliveryFailure::RemoveToken,
        _ => DeliveryFailure::Keep,
    }
}

/// Plan notifications for a freshly created post.
///
/// Posts without a title produce nothing. The author is never notified,
/// and recipients who opted out or have no token are skipped.
pub fn plan_new_item_notifications(item: &FeedItem, recipients: &[Recipient]) -> Vec<PushMessage> {
    let Some(title) = item.text("title").filter(|t| !t.trim().is_empty()) else {
        tracing::debug!(item = %item.id, "post has no title, skipping notifications");
        return Vec::new();
    };

    let author = item
        .text("username")
        .filter(|u| !u.is_empty())
        .unwrap_or(FALLBACK_AUTHOR);
    let content = item
        .text("content")
        .filter(|c| !c.is_empty())
        .unwrap_or(FALLBACK_BODY);
    let body = format!("{} posted: \"{} - {}\"", author, title, truncate(content));
    let target = NotificationTarget::for_item(&item.id);

    let messages: Vec<PushMessage> = recipients
        .iter()
        .filter(|r| r.new_post_alerts && r.viewer_id != item.author_id)
        .filter_map(|r| {
            let token = r.push_token.as_deref().filter(|t| !t.is_empty());
            if token.is_none() {
                tracing::debug!(viewer = %r.viewer_id, "recipient has no push token");
            }
            token.map(|token| PushMessage {
                to: r.viewer_id.clone(),
                token: token.to_string(),
                title: NEW_POST_TITLE.to_string(),
                body: body.clone(),
                target: target.clone(),
            })
        })
        .collect();

    tracing::debug!(item = %item.id, messages = messages.len(), "planned notifications");
    messages
}

/// Cut to `BODY_LIMIT` characters, marking the cut with an ellipsis.
fn truncate(text: &str) -> String {
    if text.chars().count() <= BODY_LIMIT {
        return text.to_string();
    }
    let keep = BODY_LIMIT - ELLIPSIS.len();
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}
