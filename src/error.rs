use thiserror::Error;

pub type ReconResult<T> = Result<T, ReconError>;

#[derive(Debug, Error)]
pub enum ReconError {
    #[error("No such reconciliation job: {0}")]
    JobNotFound(i64),

    #[error("No such movement: {0}")]
    MovementNotFound(i64),

    #[error("No such match: {0}")]
    MatchNotFound(i64),

    #[error("No such manual grouping: {0}")]
    GroupingNotFound(i64),

    #[error("Manual grouping rejected: {0}")]
    InvalidGrouping(String),

    #[error(
        "Movement {movement_id} belongs to manual grouping {grouping_id}; delete the grouping first"
    )]
    MovementInGrouping { movement_id: i64, grouping_id: i64 },

    #[error("Invalid {field} in store: {value:?}")]
    Corrupt { field: &'static str, value: String },

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

impl ReconError {
    pub fn corrupt(field: &'static str, value: impl Into<String>) -> Self {
        ReconError::Corrupt {
            field,
            value: value.into(),
        }
    }
}
