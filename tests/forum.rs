//! Forum and marketplace flows built on the synchronizer: posting, comment
//! threads, reviews, favorites, notifications and media attachments.

use readtrack::favorites::profile_feed;
use readtrack::{
    add_comment, add_favorite, add_review, delete_comment, delete_item, favorites, is_favorite,
    plan_new_item_notifications, remove_favorite, FeedId, FeedItem, FeedSource, Identity, ItemId,
    ManualClock, MediaStore, MediaStoreConfig, MemoryCursorStore, MemoryFeedSource,
    NotificationTarget, OrderSpec, PostDraft, RatingSummary, Recipient, SyncConfig, SyncError,
    SyncState, Synchronizer, Timestamp, ViewerId, AVERAGE_RATING, COMMENT_COUNT,
    NUMBER_OF_RATINGS,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

fn setup() -> (Arc<MemoryFeedSource>, Arc<ManualClock>, Synchronizer) {
    let clock = Arc::new(ManualClock::new(Timestamp(1_000)));
    let source = Arc::new(MemoryFeedSource::new(clock.clone()));
    let sync = Synchronizer::new(
        source.clone(),
        Arc::new(MemoryCursorStore::new()),
        clock.clone(),
        SyncConfig::fast(),
    );
    (source, clock, sync)
}

fn forum() -> FeedId {
    FeedId::new("forumPosts")
}

fn ada() -> Identity {
    Identity::new(ViewerId::new("ada")).with_email("ada@example.com")
}

fn bob() -> Identity {
    Identity::new(ViewerId::new("bob")).with_display_name("Bob")
}

#[test]
fn test_post_then_comment_thread() {
    let (source, clock, sync) = setup();
    sync.activate(forum(), ada().viewer_id).unwrap();
    sync.wait_for(WAIT, |v| v.state == SyncState::Ready).unwrap();

    let post = sync
        .publish_post(&forum(), &ada(), &PostDraft::new("Printer", "Which filament?"))
        .unwrap();
    assert_eq!(post.text("username"), Some("ada"));

    let view = sync
        .wait_for(WAIT, |v| v.snapshot.len() == 1)
        .unwrap();
    assert_eq!(view.unread_count(), 0);

    clock.advance(5);
    add_comment(source.as_ref(), &forum(), &post.id, &bob(), "PETG").unwrap();
    clock.advance(5);
    let second = add_comment(source.as_ref(), &forum(), &post.id, &bob(), "or PLA").unwrap();

    let view = sync
        .wait_for(WAIT, |v| {
            v.snapshot
                .get(&post.id)
                .map_or(false, |c| c.item.counter(COMMENT_COUNT) == 2)
        })
        .unwrap();
    // Counter bumps on the author's own post do not make it unread.
    assert_eq!(view.unread_count(), 0);

    // Reading the thread: oldest first, both comments new to ada.
    sync.activate_ordered(forum().comments_of(&post.id), ada().viewer_id, OrderSpec::OldestFirst)
        .unwrap();
    let thread = sync
        .wait_for(WAIT, |v| v.state == SyncState::Ready && v.snapshot.len() == 2)
        .unwrap();
    let texts: Vec<_> = thread
        .snapshot
        .items
        .iter()
        .filter_map(|c| c.item.text("text").map(str::to_string))
        .collect();
    assert_eq!(texts, vec!["PETG", "or PLA"]);
    assert_eq!(thread.unread_count(), 2);

    // Only the comment's author may remove it.
    let err = delete_comment(source.as_ref(), &forum(), &post.id, &second.id, &ada().viewer_id)
        .unwrap_err();
    assert!(matches!(err, SyncError::Permission(_)));

    let count =
        delete_comment(source.as_ref(), &forum(), &post.id, &second.id, &bob().viewer_id).unwrap();
    assert_eq!(count, 1);
    sync.wait_for(WAIT, |v| v.snapshot.len() == 1).unwrap();
}

#[test]
fn test_invalid_post_is_rejected() {
    let (source, _clock, sync) = setup();
    let err = sync
        .publish_post(&forum(), &ada(), &PostDraft::new("  ", "body"))
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    assert_eq!(source.item_count(&forum()), 0);
}

#[test]
fn test_delete_post_by_author_only() {
    let (source, _clock, sync) = setup();
    let post = sync
        .publish_post(&forum(), &ada(), &PostDraft::new("Title", "Body"))
        .unwrap();

    assert!(matches!(
        delete_item(source.as_ref(), &forum(), &post.id, &bob().viewer_id),
        Err(SyncError::Permission(_))
    ));
    delete_item(source.as_ref(), &forum(), &post.id, &ada().viewer_id).unwrap();
    assert!(matches!(
        source.get(&forum(), &post.id),
        Err(SyncError::NotFound(_))
    ));
}

#[test]
fn test_new_post_notifies_other_subscribers() {
    let (_source, _clock, sync) = setup();
    let post = sync
        .publish_post(&forum(), &bob(), &PostDraft::new("Swap", "Trading spools"))
        .unwrap();

    let recipients = vec![
        Recipient {
            viewer_id: ViewerId::new("bob"),
            push_token: Some("tok-bob".into()),
            new_post_alerts: true,
        },
        Recipient {
            viewer_id: ViewerId::new("ada"),
            push_token: Some("tok-ada".into()),
            new_post_alerts: true,
        },
    ];
    let messages = plan_new_item_notifications(&post, &recipients);

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].token, "tok-ada");
    assert_eq!(messages[0].body, "Bob posted: \"Swap - Trading spools\"");

    let data = messages[0].target.to_data();
    let target = NotificationTarget::from_data(&data).unwrap();
    assert_eq!(target.item_id, post.id);
}

#[test]
fn test_post_with_uploaded_image() {
    let dir = TempDir::new().unwrap();
    let media = MediaStore::open(MediaStoreConfig {
        path: dir.path().join("media"),
        ..Default::default()
    })
    .unwrap();
    let (source, _clock, sync) = setup();

    let upload = media.upload(b"\x89PNG fake", "image/png", |_, _| {}).unwrap();

    let mut payload = PostDraft::new("Blueprint", "See image").to_payload(&ada());
    payload.insert("imageUrl".into(), Value::from(upload.url.clone()));
    let post = sync.publish(&forum(), &ada().viewer_id, payload).unwrap();

    let stored = source.get(&forum(), &post.id).unwrap();
    let url = stored.text("imageUrl").unwrap();
    assert_eq!(media.resolve(url).unwrap().content, b"\x89PNG fake");
}

// --- Marketplace ---

fn market() -> FeedId {
    FeedId::new("marketBlueprints")
}

#[test]
fn test_reviews_update_listing_live() {
    let (source, clock, sync) = setup();
    let mut payload = Map::new();
    payload.insert("blueprintName".into(), json!("Rain barrel"));
    let listing = source
        .publish(&market(), readtrack::ItemDraft::new(bob().viewer_id, payload))
        .unwrap();

    sync.activate(market(), ada().viewer_id).unwrap();
    sync.wait_for(WAIT, |v| v.state == SyncState::Ready && v.snapshot.len() == 1)
        .unwrap();

    clock.advance(10);
    add_review(source.as_ref(), &market(), &listing.id, &ada(), 5, "Works great").unwrap();
    let (_, summary) =
        add_review(source.as_ref(), &market(), &listing.id, &bob(), 4, "Leaks a bit").unwrap();
    assert_eq!(summary, RatingSummary { average: 4.5, count: 2 });

    let view = sync
        .wait_for(WAIT, |v| {
            v.snapshot
                .get(&listing.id)
                .map_or(false, |c| c.item.counter(NUMBER_OF_RATINGS) == 2)
        })
        .unwrap();
    let shown = &view.snapshot.get(&listing.id).unwrap().item;
    assert_eq!(shown.payload[AVERAGE_RATING], json!(4.5));
    // The aggregate update does not create a new item in the listing feed.
    assert_eq!(view.snapshot.len(), 1);

    // The review thread is its own feed.
    sync.activate(market().reviews_of(&listing.id), ada().viewer_id)
        .unwrap();
    let reviews = sync
        .wait_for(WAIT, |v| v.state == SyncState::Ready && v.snapshot.len() == 2)
        .unwrap();
    let mut ratings: Vec<i64> = reviews
        .snapshot
        .items
        .iter()
        .map(|c| c.item.counter("rating"))
        .collect();
    ratings.sort();
    assert_eq!(ratings, vec![4, 5]);
}

#[test]
fn test_favorites_on_profile() {
    let (source, _clock, _sync) = setup();
    source.insert(
        &profile_feed(),
        FeedItem {
            id: ItemId::new("ada"),
            created_at: Some(Timestamp(1)),
            author_id: ada().viewer_id,
            payload: Map::new(),
        },
    );
    let viewer = ada().viewer_id;

    add_favorite(source.as_ref(), &viewer, "blueprints", json!("bp1")).unwrap();
    add_favorite(source.as_ref(), &viewer, "posts", json!("p7")).unwrap();
    assert!(is_favorite(source.as_ref(), &viewer, "blueprints", &json!("bp1")).unwrap());

    remove_favorite(source.as_ref(), &viewer, "blueprints", &json!("bp1")).unwrap();
    assert!(favorites(source.as_ref(), &viewer, "blueprints").unwrap().is_empty());
    assert_eq!(
        favorites(source.as_ref(), &viewer, "posts").unwrap(),
        vec![json!("p7")]
    );

    // No profile, no favorites.
    assert!(matches!(
        add_favorite(source.as_ref(), &bob().viewer_id, "posts", json!("p7")),
        Err(SyncError::NotFound(_))
    ));
}
