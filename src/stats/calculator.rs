// src/stats/calculator.rs

use chrono::Utc;

use crate::error::AppError;
use crate::models::statistics::{
    AttemptSelection, CalculatedStatistics, PolicyAggregate, PolicyBreakdown,
};
use crate::stats::cache::selection_hash;
use crate::store::{AttemptStore, StatsStore};

/// Computes aggregate attempt statistics for one selection policy.
///
/// Small samples are a policy, not an error: each higher moment is left
/// `None` when its sample-size precondition is unmet or its formula
/// degenerates, and the calculator never raises for them.
pub struct StatisticsCalculator<'a> {
    attempts: &'a dyn AttemptStore,
    stats: &'a dyn StatsStore,
}

impl<'a> StatisticsCalculator<'a> {
    pub fn new(attempts: &'a dyn AttemptStore, stats: &'a dyn StatsStore) -> Self {
        Self { attempts, stats }
    }

    /// Compute (and persist, keyed by the selection hash) the statistics
    /// for a quiz.
    ///
    /// `position_count` is the number of scored positions in the quiz;
    /// `sum_of_mark_variance` the summed per-position mark variance. Both
    /// feed the internal-consistency coefficient and come from the
    /// structure and attempt data the caller already has.
    pub async fn calculate(
        &self,
        quiz_id: i64,
        policy: AttemptSelection,
        students: Option<&[i64]>,
        position_count: i64,
        sum_of_mark_variance: Option<f64>,
    ) -> Result<CalculatedStatistics, AppError> {
        // Count and mean for every policy, for side-by-side display;
        // only the requested policy drives the rest.
        let mut breakdown = PolicyBreakdown::default();
        for each in AttemptSelection::ALL {
            let (count, mean) = self
                .attempts
                .grade_count_and_mean(quiz_id, each, students)
                .await?;
            breakdown.set(each, PolicyAggregate { count, mean });
        }

        let selected = breakdown.get(policy);
        let mut result = CalculatedStatistics {
            quiz_id,
            policy,
            breakdown,
            count: selected.count,
            mean: selected.mean,
            median: None,
            standard_deviation: None,
            skewness: None,
            kurtosis: None,
            cic: None,
            error_ratio: None,
            standard_error: None,
            time_modified: Utc::now(),
        };

        if selected.count == 0 {
            self.persist(&result, students).await?;
            return Ok(result);
        }

        let mut grades = self
            .attempts
            .sum_of_grades(quiz_id, policy, students)
            .await?;
        grades.sort_by(|a, b| a.total_cmp(b));

        let s = grades.len() as i64;
        result.count = s;
        result.median = median(&grades);

        let mean = match result.mean {
            Some(mean) => mean,
            None => grades.iter().sum::<f64>() / s as f64,
        };
        result.mean = Some(mean);

        if s > 1 {
            let sf = s as f64;
            let (m2, m3, m4) = central_moments(&grades, mean);

            // Bessel-corrected variance: the second k-statistic. The
            // standard deviation itself is only reported for s > 2;
            // below that the sample is too small to be meaningful and
            // the field stays absent.
            let k2 = sf * m2 / (sf - 1.0);
            if s > 2 {
                result.standard_deviation = finite(k2.sqrt());
            }

            if s > 2 && k2 != 0.0 {
                let k3 = sf * sf * m3 / ((sf - 1.0) * (sf - 2.0));
                result.skewness = finite(k3 / k2.powf(1.5));
            }

            if s > 3 && k2 != 0.0 {
                let k4 = sf * sf * ((sf + 1.0) * m4 - 3.0 * (sf - 1.0) * m2 * m2)
                    / ((sf - 1.0) * (sf - 2.0) * (sf - 3.0));
                result.kurtosis = finite(k4 / (k2 * k2));
            }

            // Internal consistency needs more than one scored position
            // and a non-degenerate total variance.
            if position_count > 1 && k2 != 0.0 {
                if let Some(item_variance) = sum_of_mark_variance {
                    let p = position_count as f64;
                    result.cic = finite(100.0 * p / (p - 1.0) * (1.0 - item_variance / k2));
                    if let Some(cic) = result.cic {
                        let under = 1.0 - cic / 100.0;
                        if under >= 0.0 {
                            result.error_ratio = finite(100.0 * under.sqrt());
                        }
                        if let (Some(ratio), Some(sd)) =
                            (result.error_ratio, result.standard_deviation)
                        {
                            result.standard_error = finite(ratio * sd / 100.0);
                        }
                    }
                }
            }
        }

        self.persist(&result, students).await?;
        Ok(result)
    }

    async fn persist(
        &self,
        result: &CalculatedStatistics,
        students: Option<&[i64]>,
    ) -> Result<(), AppError> {
        let hash = selection_hash(result.quiz_id, result.policy, students);
        self.stats.put_statistics(&hash, result).await
    }
}

/// Median of an already-sorted sample. Even sizes average the two middle
/// values (1-based ranks s/2 and s/2 + 1).
pub fn median(sorted: &[f64]) -> Option<f64> {
    let s = sorted.len();
    if s == 0 {
        return None;
    }
    if s % 2 == 1 {
        Some(sorted[s / 2])
    } else {
        Some((sorted[s / 2 - 1] + sorted[s / 2]) / 2.0)
    }
}

/// Population central moments m2, m3, m4 about the given mean.
pub fn central_moments(values: &[f64], mean: f64) -> (f64, f64, f64) {
    let s = values.len() as f64;
    let mut m2 = 0.0;
    let mut m3 = 0.0;
    let mut m4 = 0.0;
    for value in values {
        let d = value - mean;
        m2 += d * d;
        m3 += d * d * d;
        m4 += d * d * d * d;
    }
    (m2 / s, m3 / s, m4 / s)
}

fn finite(x: f64) -> Option<f64> {
    if x.is_finite() { Some(x) } else { None }
}
