use chrono::{DateTime, Utc};
use clap::ValueEnum;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ReconError, ReconResult};

/// Which ledger a movement was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    #[serde(alias = "banco")]
    Bank,
    #[serde(alias = "aux", alias = "auxiliar")]
    #[value(alias = "aux")]
    Auxiliary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[serde(alias = "in", alias = "E")]
    #[value(alias = "in")]
    Inflow,
    #[serde(alias = "out", alias = "S")]
    #[value(alias = "out")]
    Outflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MovementState {
    Unreconciled,
    Reconciled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    InProgress,
    Finalized,
}

/// How an automatic match was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Criterion {
    ExactInflow,
    ExactOutflow,
    ApproximateInflow,
    ApproximateOutflow,
}

impl Source {
    #[cfg(test)]
    pub const ALL: [Source; 2] = [Source::Bank, Source::Auxiliary];

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Bank => "bank",
            Source::Auxiliary => "auxiliary",
        }
    }

    pub fn opposite(self) -> Source {
        match self {
            Source::Bank => Source::Auxiliary,
            Source::Auxiliary => Source::Bank,
        }
    }

    pub fn parse_stored(raw: &str) -> ReconResult<Self> {
        match raw {
            "bank" => Ok(Source::Bank),
            "auxiliary" => Ok(Source::Auxiliary),
            other => Err(ReconError::corrupt("source", other)),
        }
    }
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Inflow, Direction::Outflow];

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inflow => "inflow",
            Direction::Outflow => "outflow",
        }
    }

    pub fn parse_stored(raw: &str) -> ReconResult<Self> {
        match raw {
            "inflow" => Ok(Direction::Inflow),
            "outflow" => Ok(Direction::Outflow),
            other => Err(ReconError::corrupt("direction", other)),
        }
    }
}

impl MovementState {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementState::Unreconciled => "unreconciled",
            MovementState::Reconciled => "reconciled",
        }
    }

    pub fn parse_stored(raw: &str) -> ReconResult<Self> {
        match raw {
            "unreconciled" => Ok(MovementState::Unreconciled),
            "reconciled" => Ok(MovementState::Reconciled),
            other => Err(ReconError::corrupt("movement state", other)),
        }
    }
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::InProgress => "in-progress",
            JobState::Finalized => "finalized",
        }
    }

    pub fn parse_stored(raw: &str) -> ReconResult<Self> {
        match raw {
            "in-progress" => Ok(JobState::InProgress),
            "finalized" => Ok(JobState::Finalized),
            other => Err(ReconError::corrupt("job state", other)),
        }
    }
}

impl Criterion {
    pub fn exact(direction: Direction) -> Self {
        match direction {
            Direction::Inflow => Criterion::ExactInflow,
            Direction::Outflow => Criterion::ExactOutflow,
        }
    }

    pub fn approximate(direction: Direction) -> Self {
        match direction {
            Direction::Inflow => Criterion::ApproximateInflow,
            Direction::Outflow => Criterion::ApproximateOutflow,
        }
    }

    #[cfg(test)]
    pub fn direction(self) -> Direction {
        match self {
            Criterion::ExactInflow | Criterion::ApproximateInflow => Direction::Inflow,
            Criterion::ExactOutflow | Criterion::ApproximateOutflow => Direction::Outflow,
        }
    }

    #[cfg(test)]
    pub fn is_exact(self) -> bool {
        matches!(self, Criterion::ExactInflow | Criterion::ExactOutflow)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Criterion::ExactInflow => "exact-inflow",
            Criterion::ExactOutflow => "exact-outflow",
            Criterion::ApproximateInflow => "approximate-inflow",
            Criterion::ApproximateOutflow => "approximate-outflow",
        }
    }

    pub fn parse_stored(raw: &str) -> ReconResult<Self> {
        match raw {
            "exact-inflow" => Ok(Criterion::ExactInflow),
            "exact-outflow" => Ok(Criterion::ExactOutflow),
            "approximate-inflow" => Ok(Criterion::ApproximateInflow),
            "approximate-outflow" => Ok(Criterion::ApproximateOutflow),
            other => Err(ReconError::corrupt("criterion", other)),
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })*
    };
}

display_as_str!(Source, Direction, MovementState, JobState, Criterion);

/// One ledger line, as persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Movement {
    pub id: i64,
    pub job_id: i64,
    /// Raw date text as supplied at ingestion; parsed by the normalizer.
    pub date: String,
    pub description: String,
    /// Always an absolute magnitude; the sign lives in `direction`.
    pub value: Decimal,
    pub source: Source,
    pub direction: Direction,
    pub state: MovementState,
}

/// A movement that has not been stored yet.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMovement {
    pub date: String,
    #[serde(default)]
    pub description: String,
    pub value: Decimal,
    pub source: Source,
    pub direction: Direction,
}

impl NewMovement {
    pub fn new(
        date: impl Into<String>,
        description: impl Into<String>,
        value: Decimal,
        source: Source,
        direction: Direction,
    ) -> Self {
        Self {
            date: date.into(),
            description: description.into(),
            value: value.abs(),
            source,
            direction,
        }
    }

    /// Magnitude to persist; imported rows may carry a sign.
    pub fn magnitude(&self) -> Decimal {
        self.value.abs()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Match {
    pub id: i64,
    pub job_id: i64,
    pub bank_movement_id: i64,
    pub aux_movement_id: i64,
    pub criterion: Criterion,
    /// 0 for exact matches, day distance for approximate ones.
    pub difference: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Match {
    #[cfg(test)]
    pub fn involves(&self, movement_id: i64) -> bool {
        self.bank_movement_id == movement_id || self.aux_movement_id == movement_id
    }
}

/// Operator-forced association between movement sets. No pairwise claim.
#[derive(Debug, Clone, Serialize)]
pub struct ManualGrouping {
    pub id: i64,
    pub job_id: i64,
    pub created_at: DateTime<Utc>,
    pub bank_ids: Vec<i64>,
    pub aux_ids: Vec<i64>,
}

impl ManualGrouping {
    pub fn member_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.bank_ids.iter().chain(self.aux_ids.iter()).copied()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub account: Option<String>,
    pub period: Option<String>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total: u64,
    pub reconciled: u64,
    pub pending: u64,
    pub matches: u64,
    pub groupings: u64,
}

impl JobStats {
    /// Whole-number share of reconciled movements, rounded down.
    pub fn percent_reconciled(&self) -> u64 {
        if self.total == 0 {
            0
        } else {
            self.reconciled * 100 / self.total
        }
    }
}
