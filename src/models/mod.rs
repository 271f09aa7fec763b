use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// POI categories scored for every listing.
///
/// The ordering of [`PoiCategory::ALL`] is the canonical vector layout used
/// by the score computer, the candidate cache and the similarity ranker.
/// Every component that builds or consumes a 7-dimensional vector indexes it
/// through this ordering; changing it would silently corrupt similarity math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoiCategory {
    Transport,
    Restaurant,
    Health,
    Convenience,
    Cafe,
    Chicken,
    Leisure,
}

/// Number of scored POI categories.
pub const CATEGORY_COUNT: usize = 7;

impl PoiCategory {
    pub const ALL: [PoiCategory; CATEGORY_COUNT] = [
        PoiCategory::Transport,
        PoiCategory::Restaurant,
        PoiCategory::Health,
        PoiCategory::Convenience,
        PoiCategory::Cafe,
        PoiCategory::Chicken,
        PoiCategory::Leisure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PoiCategory::Transport => "transport",
            PoiCategory::Restaurant => "restaurant",
            PoiCategory::Health => "health",
            PoiCategory::Convenience => "convenience",
            PoiCategory::Cafe => "cafe",
            PoiCategory::Chicken => "chicken",
            PoiCategory::Leisure => "leisure",
        }
    }

    /// Position of this category in the canonical vector layout.
    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|c| c == self).unwrap_or(0)
    }

    pub fn from_str(name: &str) -> Option<PoiCategory> {
        Self::ALL.iter().copied().find(|c| c.as_str() == name)
    }
}

/// Per-category proximity score for one listing.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CategoryScore {
    /// POIs of the category within the scoring radius.
    pub count: u32,
    /// Blended count/distance score.
    pub score: f64,
}

/// Ordered per-category scores for one listing, laid out per
/// [`PoiCategory::ALL`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertyVector {
    scores: [CategoryScore; CATEGORY_COUNT],
}

impl PropertyVector {
    pub fn new(scores: [CategoryScore; CATEGORY_COUNT]) -> Self {
        Self { scores }
    }

    pub fn get(&self, category: PoiCategory) -> CategoryScore {
        self.scores[category.index()]
    }

    pub fn set(&mut self, category: PoiCategory, score: CategoryScore) {
        self.scores[category.index()] = score;
    }

    /// Dense score row in canonical category order.
    pub fn score_row(&self) -> [f64; CATEGORY_COUNT] {
        let mut row = [0.0; CATEGORY_COUNT];
        for (i, s) in self.scores.iter().enumerate() {
            row[i] = s.score;
        }
        row
    }

    /// Per-category POI counts in canonical category order.
    pub fn count_row(&self) -> [u32; CATEGORY_COUNT] {
        let mut row = [0; CATEGORY_COUNT];
        for (i, s) in self.scores.iter().enumerate() {
            row[i] = s.count;
        }
        row
    }

    pub fn iter(&self) -> impl Iterator<Item = (PoiCategory, CategoryScore)> + '_ {
        PoiCategory::ALL.iter().zip(self.scores.iter()).map(|(c, s)| (*c, *s))
    }
}

/// A listing row as read from the relational store.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
    pub dong_id: i32,
}

/// Optional candidate filters applied before similarity ranking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingFilters {
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub room_type: Option<String>,
    pub contract_type: Option<String>,
}

impl ListingFilters {
    pub fn is_empty(&self) -> bool {
        self.min_price.is_none()
            && self.max_price.is_none()
            && self.room_type.is_none()
            && self.contract_type.is_none()
    }
}

/// Per-user category preference flags plus an optional commute anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct UserPreference {
    pub user_id: i64,
    /// 0/1 flags in canonical category order.
    pub flags: [bool; CATEGORY_COUNT],
    /// Work/school coordinate, when the user supplied one.
    pub office_lat: Option<f64>,
    pub office_lon: Option<f64>,
    /// Neighbourhood the user registered interest in.
    pub dong_id: Option<i32>,
}

/// Action kinds recorded in the activity event stream. The set is open but
/// bounded: unknown kinds are carried through as [`ActivityAction::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityAction {
    View,
    Search,
    Compare,
    Comment,
    /// "zzim" in the event stream: the user saved/bookmarked a listing.
    Save,
    Other(String),
}

impl ActivityAction {
    pub fn as_str(&self) -> &str {
        match self {
            ActivityAction::View => "view",
            ActivityAction::Search => "search",
            ActivityAction::Compare => "compare",
            ActivityAction::Comment => "comment",
            ActivityAction::Save => "zzim",
            ActivityAction::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> ActivityAction {
        match s {
            "view" => ActivityAction::View,
            "search" => ActivityAction::Search,
            "compare" => ActivityAction::Compare,
            "comment" => ActivityAction::Comment,
            "zzim" | "save" => ActivityAction::Save,
            other => ActivityAction::Other(other.to_string()),
        }
    }

    /// Whether the action expresses interest in a concrete listing or
    /// neighbourhood (the subset counted by the geography detector).
    pub fn is_intent(&self) -> bool {
        matches!(
            self,
            ActivityAction::View
                | ActivityAction::Search
                | ActivityAction::Compare
                | ActivityAction::Comment
                | ActivityAction::Save
        )
    }
}

/// One user activity event from the event store. Append-only upstream;
/// read here in a trailing window.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEvent {
    pub user_id: i64,
    pub listing_id: i64,
    pub action: ActivityAction,
    pub dong_id: i32,
    pub timestamp: DateTime<Utc>,
}

/// An implicit rating derived from activity events, consumed by the
/// collaborative predictor's training contract.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rating {
    pub user_id: i64,
    pub listing_id: i64,
    pub score: f64,
}

/// One ranked listing returned by the similarity ranker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedListing {
    pub listing_id: i64,
    pub similarity: f64,
    /// Category contributing most to the listing's normalized score, only
    /// annotated when demographics were supplied with the request.
    pub dominant_category: Option<PoiCategory>,
}

/// Result of the hybrid recommendation chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridRecommendation {
    pub dong_id: Option<i32>,
    pub listing_ids: Vec<i64>,
}
