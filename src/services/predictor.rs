//! Contract for the externally-owned collaborative predictor.

use crate::error::Result;
use crate::models::Rating;
use async_trait::async_trait;

/// Matrix-factorization (or similar) predictor consumed purely through this
/// train/predict contract. The learning algorithm itself lives outside this
/// crate.
#[async_trait]
pub trait CollaborativePredictor: Send + Sync {
    /// Fit the model on implicit ratings.
    async fn train(&self, ratings: &[Rating]) -> Result<()>;

    /// Whether `train` has completed at least once.
    fn is_trained(&self) -> bool;

    /// Predicted rating of a listing for a user.
    ///
    /// Precondition: [`is_trained`](Self::is_trained) returns `true`.
    /// Calling earlier is a contract violation and surfaces as
    /// [`AppError::ModelNotTrained`](crate::error::AppError::ModelNotTrained).
    async fn predict(&self, user_id: i64, listing_id: i64) -> Result<f64>;
}
