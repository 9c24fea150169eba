// src/stats/cache.rs

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::models::statistics::{AttemptSelection, CalculatedStatistics};
use crate::store::StatsStore;

/// How long a cached statistics row stays usable.
pub const STATISTICS_TTL_SECONDS: i64 = 900;

/// Content-addressed key for one statistics selection: quiz, policy, and
/// the student subset. The student list is sorted and deduplicated first,
/// so the hash is independent of the order the caller assembled it in.
pub fn selection_hash(quiz_id: i64, policy: AttemptSelection, students: Option<&[i64]>) -> String {
    let mut ids: Vec<i64> = students.map(|s| s.to_vec()).unwrap_or_default();
    ids.sort_unstable();
    ids.dedup();

    let mut hasher = Sha256::new();
    hasher.update(quiz_id.to_le_bytes());
    hasher.update(policy.as_str().as_bytes());
    // "no subset" and "empty subset" select different attempt sets and
    // must not collide.
    match students {
        None => hasher.update(b"all"),
        Some(_) => {
            hasher.update((ids.len() as u64).to_le_bytes());
            for id in &ids {
                hasher.update(id.to_le_bytes());
            }
        }
    }
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

/// Time-boxed cache over the statistics store.
///
/// Staleness is hash + TTL based: the cache never notices new attempts on
/// its own. The regrade engine invalidates explicitly; everything else
/// ages out after the TTL.
pub struct StatisticsCache<'a> {
    store: &'a dyn StatsStore,
}

impl<'a> StatisticsCache<'a> {
    pub fn new(store: &'a dyn StatsStore) -> Self {
        Self { store }
    }

    /// A previously stored result, but only while its `time_modified` is
    /// inside the TTL window. An expired entry is treated as absent, not
    /// as an error.
    pub async fn get_cached(
        &self,
        hash: &str,
    ) -> Result<Option<CalculatedStatistics>, AppError> {
        let Some(stats) = self.store.get_statistics(hash).await? else {
            return Ok(None);
        };
        let age = Utc::now().signed_duration_since(stats.time_modified);
        if age < Duration::seconds(STATISTICS_TTL_SECONDS) {
            Ok(Some(stats))
        } else {
            Ok(None)
        }
    }

    pub async fn last_calculated_time(
        &self,
        hash: &str,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        self.store.last_calculated_time(hash).await
    }

    /// Drop the cached aggregate and every per-question row sharing the
    /// hash.
    pub async fn invalidate(&self, hash: &str) -> Result<(), AppError> {
        self.store.invalidate(hash).await
    }

    /// Drop everything cached for a quiz, whatever the selection.
    pub async fn invalidate_quiz(&self, quiz_id: i64) -> Result<(), AppError> {
        self.store.invalidate_quiz(quiz_id).await
    }
}
