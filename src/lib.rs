pub mod config;
pub mod db;
pub mod error;
pub mod geo;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::{AppError, Result};
pub use services::{
    CandidateVectorCache, HybridRecommender, MmrReranker, PoiSpatialCache, PropertyScorer,
    ScoreRecalculator, SimilarityRanker,
};
