//! Column-wise normalization of candidate vectors, with a TTL cache over
//! the global statistics fetched from the store.

use crate::error::{AppError, Result};
use crate::models::CATEGORY_COUNT;
use ndarray::{Array1, Array2};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::info;

/// Supported normalization methods. An unknown method is a configuration
/// error for the single request, never silently defaulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    MinMax,
    ZScore,
}

impl Normalization {
    pub fn parse(s: &str) -> Result<Normalization> {
        match s {
            "minmax" => Ok(Normalization::MinMax),
            "zscore" => Ok(Normalization::ZScore),
            other => Err(AppError::Configuration(format!(
                "unknown normalization method: {}",
                other
            ))),
        }
    }
}

/// A normalizer fitted on the global per-category statistics. The same
/// fitted transform is applied to candidates and to the user vector.
#[derive(Debug, Clone, PartialEq)]
pub enum FittedNormalizer {
    /// Per-category (min, max).
    MinMax([(f64, f64); CATEGORY_COUNT]),
    /// Per-category (mean, std).
    ZScore([(f64, f64); CATEGORY_COUNT]),
}

impl FittedNormalizer {
    /// Per-category (offset, denominator) with degenerate columns guarded
    /// to a denominator of 1.
    fn params(&self) -> [(f64, f64); CATEGORY_COUNT] {
        match self {
            FittedNormalizer::MinMax(bounds) => {
                let mut params = [(0.0, 1.0); CATEGORY_COUNT];
                for (i, (min, max)) in bounds.iter().enumerate() {
                    let denom = max - min;
                    params[i] = (*min, if denom == 0.0 { 1.0 } else { denom });
                }
                params
            }
            FittedNormalizer::ZScore(moments) => {
                let mut params = [(0.0, 1.0); CATEGORY_COUNT];
                for (i, (mean, std)) in moments.iter().enumerate() {
                    params[i] = (*mean, if *std == 0.0 { 1.0 } else { *std });
                }
                params
            }
        }
    }

    /// Normalize a listings × categories matrix column by column.
    pub fn apply_matrix(&self, matrix: &Array2<f64>) -> Array2<f64> {
        let params = self.params();
        let mut out = matrix.clone();
        for (j, (offset, denom)) in params.iter().enumerate() {
            let mut column = out.column_mut(j);
            column.mapv_inplace(|v| (v - offset) / denom);
        }
        out
    }

    /// Normalize a single score row with the same fitted parameters.
    pub fn apply_row(&self, row: &[f64; CATEGORY_COUNT]) -> Array1<f64> {
        let params = self.params();
        Array1::from_iter(
            row.iter()
                .zip(params.iter())
                .map(|(v, (offset, denom))| (v - offset) / denom),
        )
    }
}

/// Source of the global normalization statistics.
#[async_trait::async_trait]
pub trait StatsSource: Send + Sync {
    async fn fetch_bounds(&self) -> Result<Option<[(f64, f64); CATEGORY_COUNT]>>;
    async fn fetch_moments(&self) -> Result<Option<[(f64, f64); CATEGORY_COUNT]>>;
}

struct StatsEntry {
    value: [(f64, f64); CATEGORY_COUNT],
    loaded_at: Instant,
}

/// TTL cache over min/max and mean/std aggregates. Aggregate queries scan
/// the whole score table, so they are refreshed at most once per window.
pub struct StatsCache {
    ttl: Duration,
    bounds: RwLock<Option<StatsEntry>>,
    moments: RwLock<Option<StatsEntry>>,
}

impl StatsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            bounds: RwLock::new(None),
            moments: RwLock::new(None),
        }
    }

    /// Fitted normalizer for the requested method; `None` when the score
    /// table is empty.
    pub async fn fitted<S: StatsSource>(
        &self,
        source: &S,
        method: Normalization,
    ) -> Result<Option<FittedNormalizer>> {
        match method {
            Normalization::MinMax => Ok(self
                .cached(&self.bounds, || source.fetch_bounds(), "min/max")
                .await?
                .map(FittedNormalizer::MinMax)),
            Normalization::ZScore => Ok(self
                .cached(&self.moments, || source.fetch_moments(), "mean/std")
                .await?
                .map(FittedNormalizer::ZScore)),
        }
    }

    async fn cached<'a, F, Fut>(
        &'a self,
        slot: &'a RwLock<Option<StatsEntry>>,
        fetch: F,
        label: &'static str,
    ) -> Result<Option<[(f64, f64); CATEGORY_COUNT]>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Option<[(f64, f64); CATEGORY_COUNT]>>>,
    {
        {
            let guard = slot.read().await;
            if let Some(entry) = guard.as_ref() {
                if entry.loaded_at.elapsed() < self.ttl {
                    return Ok(Some(entry.value));
                }
            }
        }

        let mut guard = slot.write().await;
        if let Some(entry) = guard.as_ref() {
            if entry.loaded_at.elapsed() < self.ttl {
                return Ok(Some(entry.value));
            }
        }

        match fetch().await? {
            Some(value) => {
                info!(stats = label, "Normalization statistics refreshed");
                *guard = Some(StatsEntry {
                    value,
                    loaded_at: Instant::now(),
                });
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_method() {
        assert_eq!(Normalization::parse("minmax").unwrap(), Normalization::MinMax);
        assert_eq!(Normalization::parse("zscore").unwrap(), Normalization::ZScore);
        assert!(matches!(
            Normalization::parse("log"),
            Err(AppError::Configuration(_))
        ));
    }

    #[test]
    fn test_minmax_maps_columns_into_unit_interval() {
        let matrix = array![
            [0.0, 10.0, 5.0, 1.0, 2.0, 3.0, 4.0],
            [5.0, 20.0, 5.0, 3.0, 4.0, 6.0, 8.0],
            [10.0, 30.0, 5.0, 5.0, 6.0, 9.0, 12.0],
        ];
        let mut bounds = [(0.0, 0.0); CATEGORY_COUNT];
        for j in 0..CATEGORY_COUNT {
            let col = matrix.column(j);
            bounds[j] = (
                col.iter().cloned().fold(f64::INFINITY, f64::min),
                col.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            );
        }

        let normalizer = FittedNormalizer::MinMax(bounds);
        let normalized = normalizer.apply_matrix(&matrix);
        for value in normalized.iter() {
            assert!((0.0..=1.0).contains(value), "value {} out of range", value);
        }
        // Degenerate column (min == max) maps to zero, not NaN.
        assert!(normalized.column(2).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_zscore_centers_reference_population() {
        let matrix = array![
            [1.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [3.0, 4.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [5.0, 6.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        ];
        let mut moments = [(0.0, 0.0); CATEGORY_COUNT];
        for j in 0..CATEGORY_COUNT {
            let col = matrix.column(j);
            let mean = col.sum() / col.len() as f64;
            let var = col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / col.len() as f64;
            moments[j] = (mean, var.sqrt());
        }

        let normalizer = FittedNormalizer::ZScore(moments);
        let normalized = normalizer.apply_matrix(&matrix);
        for j in 0..CATEGORY_COUNT {
            let mean = normalized.column(j).sum() / 3.0;
            assert!(mean.abs() < 1e-9, "column {} mean {}", j, mean);
        }
    }

    #[test]
    fn test_same_transform_applies_to_user_row() {
        let bounds = [(0.0, 10.0); CATEGORY_COUNT];
        let normalizer = FittedNormalizer::MinMax(bounds);
        let row = normalizer.apply_row(&[5.0; CATEGORY_COUNT]);
        for v in row.iter() {
            assert!((v - 0.5).abs() < 1e-12);
        }
    }

    struct CountingSource {
        calls: AtomicUsize,
        empty: bool,
    }

    #[async_trait::async_trait]
    impl StatsSource for CountingSource {
        async fn fetch_bounds(&self) -> Result<Option<[(f64, f64); CATEGORY_COUNT]>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.empty {
                Ok(None)
            } else {
                Ok(Some([(0.0, 1.0); CATEGORY_COUNT]))
            }
        }

        async fn fetch_moments(&self) -> Result<Option<[(f64, f64); CATEGORY_COUNT]>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some([(0.0, 1.0); CATEGORY_COUNT]))
        }
    }

    #[tokio::test]
    async fn test_stats_cache_reuses_fresh_values() {
        let source = CountingSource {
            calls: AtomicUsize::new(0),
            empty: false,
        };
        let cache = StatsCache::new(Duration::from_secs(3600));

        cache.fitted(&source, Normalization::MinMax).await.unwrap();
        cache.fitted(&source, Normalization::MinMax).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // Moments are cached independently of bounds.
        cache.fitted(&source, Normalization::ZScore).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_store_is_not_cached() {
        let source = CountingSource {
            calls: AtomicUsize::new(0),
            empty: true,
        };
        let cache = StatsCache::new(Duration::from_secs(3600));

        assert!(cache
            .fitted(&source, Normalization::MinMax)
            .await
            .unwrap()
            .is_none());
        cache.fitted(&source, Normalization::MinMax).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
