//! Forum posts, comment threads and deletion.
//!
//! A post is an ordinary feed item whose payload carries a title, the body,
//! the author's label and avatar, a rating and a comment counter. Comments
//! live in a separate feed per post (see [`FeedId::comments_of`]) and keep
//! the parent's `commentCount` in step through the source's atomic
//! [`FeedSource::increment`].

use crate::error::{Result, SyncError};
use crate::identity::Identity;
use crate::source::FeedSource;
use crate::sync::Synchronizer;
use crate::types::{FeedId, FeedItem, ItemDraft, ItemId, ViewerId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Counter on a post holding the size of its comment thread.
pub const COMMENT_COUNT: &str = "commentCount";

/// User input for a new forum post.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDraft {
    pub title: String,
    pub content: String,
}

impl PostDraft {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(SyncError::Validation("post title is empty".into()));
        }
        if self.content.trim().is_empty() {
            return Err(SyncError::Validation("post content is empty".into()));
        }
        Ok(())
    }

    /// The stored document for this post, written by `author`.
    pub fn to_payload(&self, author: &Identity) -> Map<String, Value> {
        let mut payload = author_fields(author);
        payload.insert("title".into(), Value::from(self.title.trim()));
        payload.insert("content".into(), Value::from(self.content.trim()));
        payload.insert("rating".into(), Value::from(0));
        payload.insert(COMMENT_COUNT.into(), Value::from(0));
        payload
    }
}

/// Display fields stored with everything a viewer writes.
pub(crate) fn author_fields(author: &Identity) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("username".into(), Value::from(author.display_label()));
    fields.insert("avatarUrl".into(), Value::from(author.avatar_url()));
    fields
}

impl Synchronizer {
    /// Publish a forum post as `author`.
    ///
    /// Goes through [`Synchronizer::publish`], so the author's own cursor
    /// moves past the post when `feed` is the active feed.
    pub fn publish_post(&self, feed: &FeedId, author: &Identity, draft: &PostDraft) -> Result<FeedItem> {
        draft.validate()?;
        self.publish(feed, &author.viewer_id, draft.to_payload(author))
    }
}

/// Add a comment to `item` and bump its comment counter.
///
/// The parent must exist. Returns the stored comment.
pub fn add_comment(
    source: &dyn FeedSource,
    feed: &FeedId,
    item: &ItemId,
    author: &Identity,
    text: &str,
) -> Result<FeedItem> {
    if text.trim().is_empty() {
        return Err(SyncError::Validation("comment is empty".into()));
    }

    source.get(feed, item)?;

    let mut payload = author_fields(author);
    payload.insert("text".into(), Value::from(text.trim()));
    let comment = source.publish(
        &feed.comments_of(item),
        ItemDraft::new(author.viewer_id.clone(), payload),
    )?;

    let count = source.increment(feed, item, COMMENT_COUNT, 1)?;
    tracing::debug!(feed = %feed, item = %item, comment = %comment.id, count, "added comment");
    Ok(comment)
}

/// Delete a comment. Only its author may do so.
///
/// Returns the parent's new comment count, never below zero.
pub fn delete_comment(
    source: &dyn FeedSource,
    feed: &FeedId,
    item: &ItemId,
    comment: &ItemId,
    requester: &ViewerId,
) -> Result<i64> {
    let thread = feed.comments_of(item);
    delete_item(source, &thread, comment, requester)?;

    let count = source.increment(feed, item, COMMENT_COUNT, -1)?;
    tracing::debug!(feed = %feed, item = %item, %comment, count, "deleted comment");
    Ok(count)
}

/// Delete an item on behalf of `requester`, who must be its author.
pub fn delete_item(source: &dyn FeedSource, feed: &FeedId, item: &ItemId, requester: &ViewerId) -> Result<()> {
    let existing = source.get(feed, item)?;
    if &existing.author_id != requester {
        tracing::warn!(feed = %feed, %item, requester = %requester, "delete by non-author rejected");
        return Err(SyncError::Permission(format!(
            "{} is not the author of {}",
            requester, item
        )));
    }
    source.delete(feed, item)
}
