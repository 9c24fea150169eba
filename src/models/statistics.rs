// src/models/statistics.rs

use serde::{Deserialize, Serialize};

/// Which of a student's attempts count toward their grade, and therefore
/// which attempts are included in aggregate statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptSelection {
    /// The student's first attempt.
    First,
    /// The student's most recent finished attempt.
    Last,
    /// The attempt with the highest sum of grades.
    Highest,
    /// The mean sum of grades over all the student's finished attempts,
    /// treated as one synthetic value per student.
    Average,
}

impl AttemptSelection {
    pub const ALL: [AttemptSelection; 4] = [
        AttemptSelection::First,
        AttemptSelection::Last,
        AttemptSelection::Highest,
        AttemptSelection::Average,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptSelection::First => "first",
            AttemptSelection::Last => "last",
            AttemptSelection::Highest => "highest",
            AttemptSelection::Average => "average",
        }
    }
}

impl std::str::FromStr for AttemptSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(AttemptSelection::First),
            "last" => Ok(AttemptSelection::Last),
            "highest" => Ok(AttemptSelection::Highest),
            "average" => Ok(AttemptSelection::Average),
            other => Err(format!("unknown attempt selection '{}'", other)),
        }
    }
}

/// Count and mean of the sum-of-grades column for one selection policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyAggregate {
    pub count: i64,
    pub mean: Option<f64>,
}

/// Count/mean for every selection policy. All four are always computed so
/// reports can show them side by side, even though only the requested
/// policy drives the higher moments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyBreakdown {
    pub first: PolicyAggregate,
    pub last: PolicyAggregate,
    pub highest: PolicyAggregate,
    pub average: PolicyAggregate,
}

impl PolicyBreakdown {
    pub fn get(&self, policy: AttemptSelection) -> PolicyAggregate {
        match policy {
            AttemptSelection::First => self.first,
            AttemptSelection::Last => self.last,
            AttemptSelection::Highest => self.highest,
            AttemptSelection::Average => self.average,
        }
    }

    pub fn set(&mut self, policy: AttemptSelection, aggregate: PolicyAggregate) {
        match policy {
            AttemptSelection::First => self.first = aggregate,
            AttemptSelection::Last => self.last = aggregate,
            AttemptSelection::Highest => self.highest = aggregate,
            AttemptSelection::Average => self.average = aggregate,
        }
    }
}

/// Aggregate statistics over the sum-of-grades of the selected attempts.
///
/// Higher moments are optional: each is None when its sample-size
/// precondition is unmet or its formula degenerates (zero variance,
/// negative value under a square root). Absence is a policy, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatedStatistics {
    pub quiz_id: i64,
    pub policy: AttemptSelection,
    pub breakdown: PolicyBreakdown,

    /// Number of attempts contributing under `policy`.
    pub count: i64,

    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub standard_deviation: Option<f64>,
    pub skewness: Option<f64>,
    pub kurtosis: Option<f64>,

    /// Coefficient of internal consistency, as a percentage.
    pub cic: Option<f64>,
    pub error_ratio: Option<f64>,
    pub standard_error: Option<f64>,

    pub time_modified: chrono::DateTime<chrono::Utc>,
}
