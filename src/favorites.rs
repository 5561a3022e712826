//! Per-viewer favorites stored on the viewer's profile document.
//!
//! Profiles live in the [`PROFILES`] feed, one item per viewer. Favorites
//! are grouped by kind (`"posts"`, `"blueprints"`, ...) under the
//! `favorites` field, each kind a list with set semantics.

use crate::error::{Result, SyncError};
use crate::source::FeedSource;
use crate::types::{FeedId, ItemId, ViewerId};
use serde_json::{Map, Value};

/// Feed holding one profile document per viewer.
pub const PROFILES: &str = "users";

/// Profile field holding favorites by kind.
pub const FAVORITES: &str = "favorites";

pub fn profile_feed() -> FeedId {
    FeedId::new(PROFILES)
}

fn profile_item(viewer: &ViewerId) -> ItemId {
    ItemId::new(viewer.as_str())
}

fn check(viewer: &ViewerId, kind: &str) -> Result<()> {
    if viewer.as_str().trim().is_empty() {
        return Err(SyncError::Validation("viewer id is empty".into()));
    }
    if kind.trim().is_empty() {
        return Err(SyncError::Validation("favorite kind is empty".into()));
    }
    Ok(())
}

/// Edit the `kind` list inside a profile payload, creating it on demand.
/// A malformed `favorites` field or list is replaced.
fn edit_list<F>(payload: &mut Map<String, Value>, kind: &str, f: F)
where
    F: FnOnce(&mut Vec<Value>),
{
    let mut by_kind = match payload.remove(FAVORITES) {
        Some(Value::Object(by_kind)) => by_kind,
        _ => Map::new(),
    };
    let mut list = match by_kind.remove(kind) {
        Some(Value::Array(list)) => list,
        _ => Vec::new(),
    };
    f(&mut list);
    by_kind.insert(kind.to_string(), Value::Array(list));
    payload.insert(FAVORITES.to_string(), Value::Object(by_kind));
}

fn read(payload: &Map<String, Value>, kind: &str) -> Vec<Value> {
    payload
        .get(FAVORITES)
        .and_then(|favorites| favorites.get(kind))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Add `entry` to the viewer's `kind` favorites unless an equal entry is
/// already there. The profile must exist. Returns the updated list.
pub fn add_favorite(source: &dyn FeedSource, viewer: &ViewerId, kind: &str, entry: Value) -> Result<Vec<Value>> {
    check(viewer, kind)?;
    let updated = source
        .update(&profile_feed(), &profile_item(viewer), &mut |payload| {
            edit_list(payload, kind, |list| {
                if !list.contains(&entry) {
                    list.push(entry.clone());
                }
            });
            Ok(())
        })
        .map_err(|e| {
            tracing::warn!(%viewer, kind, error = %e, "adding favorite failed");
            e
        })?;
    Ok(read(&updated.payload, kind))
}

/// Remove every entry equal to `entry` from the viewer's `kind` favorites.
/// Returns the updated list.
pub fn remove_favorite(source: &dyn FeedSource, viewer: &ViewerId, kind: &str, entry: &Value) -> Result<Vec<Value>> {
    check(viewer, kind)?;
    let updated = source
        .update(&profile_feed(), &profile_item(viewer), &mut |payload| {
            edit_list(payload, kind, |list| list.retain(|existing| existing != entry));
            Ok(())
        })
        .map_err(|e| {
            tracing::warn!(%viewer, kind, error = %e, "removing favorite failed");
            e
        })?;
    Ok(read(&updated.payload, kind))
}

/// The viewer's `kind` favorites, empty when none were saved.
pub fn favorites(source: &dyn FeedSource, viewer: &ViewerId, kind: &str) -> Result<Vec<Value>> {
    check(viewer, kind)?;
    let profile = source.get(&profile_feed(), &profile_item(viewer))?;
    Ok(read(&profile.payload, kind))
}

pub fn is_favorite(source: &dyn FeedSource, viewer: &ViewerId, kind: &str, entry: &Value) -> Result<bool> {
    Ok(favorites(source, viewer, kind)?.contains(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryFeedSource;
    use crate::types::{FeedItem, ManualClock, Timestamp};
    use serde_json::json;
    use std::sync::Arc;

    fn source_with_profile(viewer: &str) -> MemoryFeedSource {
        let source = MemoryFeedSource::new(Arc::new(ManualClock::new(Timestamp(1_000))));
        let mut payload = Map::new();
        payload.insert("email".into(), json!(format!("{}@example.com", viewer)));
        source.insert(
            &profile_feed(),
            FeedItem {
                id: ItemId::new(viewer),
                created_at: Some(Timestamp(1)),
                author_id: ViewerId::new(viewer),
                payload,
            },
        );
        source
    }

    #[test]
    fn test_add_is_idempotent() {
        let source = source_with_profile("ada");
        let ada = ViewerId::new("ada");

        add_favorite(&source, &ada, "posts", json!("p1")).unwrap();
        let list = add_favorite(&source, &ada, "posts", json!("p1")).unwrap();
        assert_eq!(list, vec![json!("p1")]);

        let list = add_favorite(&source, &ada, "posts", json!("p2")).unwrap();
        assert_eq!(list, vec![json!("p1"), json!("p2")]);
        assert!(is_favorite(&source, &ada, "posts", &json!("p2")).unwrap());

        // Other profile fields survive.
        let profile = source.get(&profile_feed(), &ItemId::new("ada")).unwrap();
        assert_eq!(profile.text("email"), Some("ada@example.com"));
    }

    #[test]
    fn test_remove_and_kinds_are_separate() {
        let source = source_with_profile("ada");
        let ada = ViewerId::new("ada");
        let blueprint = json!({"id": "bp1", "name": "Shelter"});

        add_favorite(&source, &ada, "posts", json!("p1")).unwrap();
        add_favorite(&source, &ada, "blueprints", blueprint.clone()).unwrap();

        let list = remove_favorite(&source, &ada, "posts", &json!("p1")).unwrap();
        assert!(list.is_empty());
        assert_eq!(favorites(&source, &ada, "blueprints").unwrap(), vec![blueprint.clone()]);

        // Removing something absent is not an error.
        remove_favorite(&source, &ada, "posts", &json!("p9")).unwrap();
        assert!(!is_favorite(&source, &ada, "posts", &json!("p1")).unwrap());
    }

    #[test]
    fn test_malformed_favorites_field_is_replaced() {
        let source = source_with_profile("ada");
        let ada = ViewerId::new("ada");
        source
            .update(&profile_feed(), &ItemId::new("ada"), &mut |payload| {
                payload.insert(FAVORITES.into(), json!("oops"));
                Ok(())
            })
            .unwrap();

        assert!(favorites(&source, &ada, "posts").unwrap().is_empty());
        let list = add_favorite(&source, &ada, "posts", json!("p1")).unwrap();
        assert_eq!(list, vec![json!("p1")]);
    }

    #[test]
    fn test_missing_profile_and_bad_input() {
        let source = source_with_profile("ada");
        let err = add_favorite(&source, &ViewerId::new("bob"), "posts", json!("p1")).unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));

        let err = add_favorite(&source, &ViewerId::new("ada"), " ", json!("p1")).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }
}
