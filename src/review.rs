//! Star reviews and the rating aggregate kept on the reviewed item.
//!
//! Reviews live in a feed per item (see [`FeedId::reviews_of`]). The item
//! itself carries `averageRating` and `numberOfRatings`, recomputed through
//! [`FeedSource::update`] so concurrent reviews never lose a vote.

use crate::error::{Result, SyncError};
use crate::identity::Identity;
use crate::publish::author_fields;
use crate::source::FeedSource;
use crate::types::{FeedId, FeedItem, ItemDraft, ItemId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mean star rating on a reviewed item, rounded to two decimals.
pub const AVERAGE_RATING: &str = "averageRating";

/// Number of reviews folded into [`AVERAGE_RATING`].
pub const NUMBER_OF_RATINGS: &str = "numberOfRatings";

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

/// The rating aggregate stored on an item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingSummary {
    pub average: f64,
    pub count: i64,
}

impl RatingSummary {
    /// Read the aggregate from a payload. Missing or malformed fields count
    /// as no ratings yet.
    pub fn from_payload(payload: &Map<String, Value>) -> Self {
        let average = payload
            .get(AVERAGE_RATING)
            .and_then(Value::as_f64)
            .filter(|avg| avg.is_finite() && *avg >= 0.0)
            .unwrap_or(0.0);
        let count = payload
            .get(NUMBER_OF_RATINGS)
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .max(0);
        Self { average, count }
    }

    /// Fold one more rating in. The previous total is rebuilt from the
    /// stored (already rounded) average.
    pub fn with_rating(self, rating: u8) -> Self {
        let count = self.count.saturating_add(1);
        let total = self.average * self.count as f64 + f64::from(rating);
        Self {
            average: round2(total / count as f64),
            count,
        }
    }

    fn write_to(&self, payload: &mut Map<String, Value>) {
        payload.insert(AVERAGE_RATING.into(), Value::from(self.average));
        payload.insert(NUMBER_OF_RATINGS.into(), Value::from(self.count));
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Review `item` of `feed` and fold the rating into the item's aggregate.
///
/// Input is checked before any I/O and the item must exist. The review is
/// stored first, so a failed aggregate update leaves a review that is not
/// yet counted. Returns the stored review and the new aggregate.
pub fn add_review(
    source: &dyn FeedSource,
    feed: &FeedId,
    item: &ItemId,
    author: &Identity,
    rating: u8,
    text: &str,
) -> Result<(FeedItem, RatingSummary)> {
    if !(MIN_RATING..=MAX_RATING).contains(&rating) {
        return Err(SyncError::Validation(format!(
            "rating must be between {} and {}, got {}",
            MIN_RATING, MAX_RATING, rating
        )));
    }
    if text.trim().is_empty() {
        return Err(SyncError::Validation("review text is empty".into()));
    }

    source.get(feed, item)?;

    let mut payload = author_fields(author);
    payload.insert("rating".into(), Value::from(rating));
    payload.insert("text".into(), Value::from(text.trim()));
    let review = source.publish(
        &feed.reviews_of(item),
        ItemDraft::new(author.viewer_id.clone(), payload),
    )?;

    let updated = source
        .update(feed, item, &mut |payload| {
            RatingSummary::from_payload(payload)
                .with_rating(rating)
                .write_to(payload);
            Ok(())
        })
        .map_err(|e| {
            tracing::warn!(feed = %feed, %item, review = %review.id, error = %e, "rating aggregate not updated");
            e
        })?;

    let summary = RatingSummary::from_payload(&updated.payload);
    tracing::debug!(
        feed = %feed,
        %item,
        review = %review.id,
        average = summary.average,
        count = summary.count,
        "added review"
    );
    Ok((review, summary))
}
