//! Activity event reads and the signals derived from them.
//!
//! The event store is append-only and externally owned; this module only
//! queries it over a trailing window. Two consumers sit on top: the
//! geography-affinity detector (dominant neighbourhood of recent intent)
//! and the implicit-rating aggregation feeding the collaborative predictor.

use crate::config::EventStoreConfig;
use crate::error::Result;
use crate::models::{ActivityAction, ActivityEvent, Rating};
use async_trait::async_trait;
use clickhouse::{Client, Row};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Hard cap on events pulled per query.
const MAX_EVENTS: usize = 10_000;

/// Upper bound of the implicit rating scale.
const RATING_SCALE_MAX: f64 = 20.0;

/// Read access to the time-indexed activity event store.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Most recent events for one user inside the trailing window, newest
    /// first.
    async fn recent_events(&self, user_id: i64, lookback_days: i64) -> Result<Vec<ActivityEvent>>;

    /// Recent events across all users inside the trailing window.
    async fn recent_events_all(&self, lookback_days: i64) -> Result<Vec<ActivityEvent>>;
}

#[derive(Debug, Row, Deserialize)]
struct EventRow {
    user_id: i64,
    property_id: i64,
    action: String,
    dong_id: i32,
    #[serde(with = "clickhouse::serde::time::datetime")]
    event_time: time::OffsetDateTime,
}

impl From<EventRow> for ActivityEvent {
    fn from(row: EventRow) -> Self {
        ActivityEvent {
            user_id: row.user_id,
            listing_id: row.property_id,
            action: ActivityAction::parse(&row.action),
            dong_id: row.dong_id,
            timestamp: chrono::DateTime::from_timestamp(row.event_time.unix_timestamp(), 0)
                .unwrap_or_default(),
        }
    }
}

/// ClickHouse-backed [`ActivityStore`].
pub struct ClickHouseActivityStore {
    client: Client,
    database: String,
}

impl ClickHouseActivityStore {
    pub fn new(config: &EventStoreConfig) -> Self {
        let client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database)
            .with_user(&config.username)
            .with_password(&config.password);

        info!(url = %config.url, database = %config.database, "ClickHouseActivityStore initialized");

        Self {
            client,
            database: config.database.clone(),
        }
    }
}

#[async_trait]
impl ActivityStore for ClickHouseActivityStore {
    async fn recent_events(&self, user_id: i64, lookback_days: i64) -> Result<Vec<ActivityEvent>> {
        let query = format!(
            r#"
            SELECT user_id, property_id, action, dong_id, event_time
            FROM {}.activity_log
            WHERE user_id = {}
              AND event_time >= now() - INTERVAL {} DAY
            ORDER BY event_time DESC
            LIMIT {}
            "#,
            self.database, user_id, lookback_days, MAX_EVENTS
        );

        debug!(user_id, lookback_days, "Fetching user activity events");
        let rows: Vec<EventRow> = self.client.query(&query).fetch_all().await?;
        Ok(rows.into_iter().map(ActivityEvent::from).collect())
    }

    async fn recent_events_all(&self, lookback_days: i64) -> Result<Vec<ActivityEvent>> {
        let query = format!(
            r#"
            SELECT user_id, property_id, action, dong_id, event_time
            FROM {}.activity_log
            WHERE event_time >= now() - INTERVAL {} DAY
            ORDER BY event_time DESC
            LIMIT {}
            "#,
            self.database, lookback_days, MAX_EVENTS
        );

        debug!(lookback_days, "Fetching activity events for training window");
        let rows: Vec<EventRow> = self.client.query(&query).fetch_all().await?;
        Ok(rows.into_iter().map(ActivityEvent::from).collect())
    }
}

/// Infers the neighbourhood a user is currently interested in from their
/// recent intent actions. Refuses to guess on thin signal.
pub struct GeographyDetector<A: ActivityStore> {
    store: Arc<A>,
    lookback_days: i64,
    min_events: usize,
}

impl<A: ActivityStore> GeographyDetector<A> {
    pub fn new(store: Arc<A>, lookback_days: i64, min_events: usize) -> Self {
        Self {
            store,
            lookback_days,
            min_events,
        }
    }

    /// The most frequent dong among the user's recent intent events, or
    /// `None` when fewer than the minimum number of qualifying events exist.
    /// Count ties resolve to the lowest dong id for determinism.
    pub async fn dominant_dong(&self, user_id: i64) -> Result<Option<i32>> {
        let events = self.store.recent_events(user_id, self.lookback_days).await?;

        let mut counts: HashMap<i32, usize> = HashMap::new();
        let mut qualifying = 0_usize;
        for event in events.iter().filter(|e| e.action.is_intent()) {
            qualifying += 1;
            *counts.entry(event.dong_id).or_insert(0) += 1;
        }

        if qualifying < self.min_events {
            debug!(
                user_id,
                qualifying,
                min_events = self.min_events,
                "Insufficient activity signal for neighbourhood affinity"
            );
            return Ok(None);
        }

        let dominant = counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(dong, _)| dong);

        info!(user_id, ?dominant, qualifying, "Neighbourhood affinity detected");
        Ok(dominant)
    }
}

/// Per-action weights used to turn the event stream into implicit ratings.
/// Tuning values; stronger intent earns a higher rating contribution.
#[derive(Debug, Clone)]
pub struct ActionWeights {
    pub view: f64,
    pub search: f64,
    pub compare: f64,
    pub comment: f64,
    pub save: f64,
}

impl Default for ActionWeights {
    fn default() -> Self {
        Self {
            view: 1.0,
            search: 2.0,
            compare: 3.0,
            comment: 4.0,
            save: 5.0,
        }
    }
}

impl ActionWeights {
    /// Weight of one action; unknown action kinds contribute nothing.
    pub fn weight(&self, action: &ActivityAction) -> Option<f64> {
        match action {
            ActivityAction::View => Some(self.view),
            ActivityAction::Search => Some(self.search),
            ActivityAction::Compare => Some(self.compare),
            ActivityAction::Comment => Some(self.comment),
            ActivityAction::Save => Some(self.save),
            ActivityAction::Other(_) => None,
        }
    }
}

/// Sum event weights per (user, listing) into ratings on the predictor's
/// 0..=20 scale. Events without a concrete listing are skipped.
pub fn aggregate_ratings(events: &[ActivityEvent], weights: &ActionWeights) -> Vec<Rating> {
    let mut sums: HashMap<(i64, i64), f64> = HashMap::new();
    for event in events {
        if event.listing_id <= 0 {
            continue;
        }
        if let Some(weight) = weights.weight(&event.action) {
            *sums.entry((event.user_id, event.listing_id)).or_insert(0.0) += weight;
        }
    }

    let mut ratings: Vec<Rating> = sums
        .into_iter()
        .map(|((user_id, listing_id), score)| Rating {
            user_id,
            listing_id,
            score: score.min(RATING_SCALE_MAX),
        })
        .collect();
    ratings.sort_by_key(|r| (r.user_id, r.listing_id));
    ratings
}
