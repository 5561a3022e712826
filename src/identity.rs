//! Signed-in user identity and auth state changes.

use crate::types::ViewerId;
use serde::{Deserialize, Serialize};

const AVATAR_SERVICE: &str = "https://ui-avatars.com/api/";

/// The signed-in user as reported by the identity provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub viewer_id: ViewerId,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub photo_url: Option<String>,
}

impl Identity {
    pub fn new(viewer_id: ViewerId) -> Self {
        Self {
            viewer_id,
            display_name: None,
            email: None,
            photo_url: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_photo_url(mut self, url: impl Into<String>) -> Self {
        self.photo_url = Some(url.into());
        self
    }

    /// Name shown next to the user's posts: the display name, else the
    /// local part of the email, else "User".
    pub fn display_label(&self) -> String {
        non_blank(self.display_name.as_deref())
            .or_else(|| {
                self.email
                    .as_deref()
                    .and_then(|email| email.split('@').next())
                    .and_then(|local| non_blank(Some(local)))
            })
            .unwrap_or("User")
            .to_string()
    }

    /// Profile photo, or a generated avatar for the display label.
    pub fn avatar_url(&self) -> String {
        match non_blank(self.photo_url.as_deref()) {
            Some(url) => url.to_string(),
            None => format!(
                "{}?name={}&background=random",
                AVATAR_SERVICE,
                encode_component(&self.display_label())
            ),
        }
    }
}

/// Auth state change delivered by the identity provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthEvent {
    SignedIn(Identity),
    SignedOut,
    ProfileChanged(Identity),
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.trim().is_empty())
}

/// Percent-encode everything outside the URI unreserved set.
fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_label_prefers_name() {
        let id = Identity::new(ViewerId::new("u1"))
            .with_display_name("Ada")
            .with_email("ada@example.com");
        assert_eq!(id.display_label(), "Ada");
    }

    #[test]
    fn test_display_label_falls_back_to_email() {
        let id = Identity::new(ViewerId::new("u1")).with_email("grace.h@example.com");
        assert_eq!(id.display_label(), "grace.h");

        let blank = Identity::new(ViewerId::new("u2")).with_display_name("  ");
        assert_eq!(blank.display_label(), "User");
    }

    #[test]
    fn test_avatar_url() {
        let id = Identity::new(ViewerId::new("u1")).with_display_name("Ada L");
        assert_eq!(
            id.avatar_url(),
            "https://ui-avatars.com/api/?name=Ada%20L&background=random"
        );

        let photo = id.with_photo_url("https://cdn/x.png");
        assert_eq!(photo.avatar_url(), "https://cdn/x.png");
    }

    #[test]
    fn test_auth_event_json() {
        let event = AuthEvent::SignedIn(Identity::new(ViewerId::new("u1")));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "signed_in");
        let back: AuthEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
