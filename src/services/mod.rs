pub mod activity;
pub mod candidates;
pub mod diversity;
pub mod hybrid;
pub mod poi_cache;
pub mod predictor;
pub mod ranking;
pub mod scoring;

pub use candidates::CandidateVectorCache;
pub use diversity::MmrReranker;
pub use hybrid::HybridRecommender;
pub use poi_cache::PoiSpatialCache;
pub use ranking::SimilarityRanker;
pub use scoring::batch::ScoreRecalculator;
pub use scoring::PropertyScorer;
