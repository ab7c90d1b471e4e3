//! In-memory `ReconStore` for engine tests.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::domain::{
    Criterion, Direction, JobState, ManualGrouping, Match, Movement, MovementState, Source,
};
use crate::engine::ReconStore;
use crate::error::{ReconError, ReconResult};

#[derive(Debug, Default)]
pub struct MemoryStore {
    pub jobs: BTreeMap<i64, JobState>,
    pub movements: BTreeMap<i64, Movement>,
    pub matches: Vec<Match>,
    pub groupings: Vec<ManualGrouping>,
    next_id: i64,
}

impl MemoryStore {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn add_job(&mut self) -> i64 {
        let id = self.next_id();
        self.jobs.insert(id, JobState::InProgress);
        id
    }

    pub fn add(
        &mut self,
        job_id: i64,
        source: Source,
        direction: Direction,
        date: &str,
        value: i64,
    ) -> i64 {
        let id = self.next_id();
        self.movements.insert(
            id,
            Movement {
                id,
                job_id,
                date: date.to_string(),
                description: String::new(),
                value: Decimal::from(value),
                source,
                direction,
                state: MovementState::Unreconciled,
            },
        );
        id
    }

    pub fn state_of(&self, movement_id: i64) -> MovementState {
        self.movements[&movement_id].state
    }
}

impl ReconStore for MemoryStore {
    fn job_state(&self, job_id: i64) -> ReconResult<Option<JobState>> {
        Ok(self.jobs.get(&job_id).copied())
    }

    fn set_job_state(&mut self, job_id: i64, state: JobState) -> ReconResult<()> {
        let slot = self
            .jobs
            .get_mut(&job_id)
            .ok_or(ReconError::JobNotFound(job_id))?;
        *slot = state;
        Ok(())
    }

    fn get_movement(&self, movement_id: i64) -> ReconResult<Option<Movement>> {
        Ok(self.movements.get(&movement_id).cloned())
    }

    fn get_unreconciled_movements(
        &self,
        job_id: i64,
        source: Source,
        direction: Direction,
    ) -> ReconResult<Vec<Movement>> {
        Ok(self
            .movements
            .values()
            .filter(|m| {
                m.job_id == job_id
                    && m.source == source
                    && m.direction == direction
                    && m.state == MovementState::Unreconciled
            })
            .cloned()
            .collect())
    }

    fn set_movement_state(&mut self, movement_id: i64, state: MovementState) -> ReconResult<()> {
        let m = self
            .movements
            .get_mut(&movement_id)
            .ok_or(ReconError::MovementNotFound(movement_id))?;
        m.state = state;
        Ok(())
    }

    fn count_unreconciled(&self, job_id: i64) -> ReconResult<u64> {
        Ok(self
            .movements
            .values()
            .filter(|m| m.job_id == job_id && m.state == MovementState::Unreconciled)
            .count() as u64)
    }

    fn delete_movement(&mut self, movement_id: i64) -> ReconResult<()> {
        self.movements
            .remove(&movement_id)
            .map(|_| ())
            .ok_or(ReconError::MovementNotFound(movement_id))
    }

    fn create_match(
        &mut self,
        job_id: i64,
        bank_movement_id: i64,
        aux_movement_id: i64,
        criterion: Criterion,
        difference: Decimal,
    ) -> ReconResult<Match> {
        let m = Match {
            id: self.next_id(),
            job_id,
            bank_movement_id,
            aux_movement_id,
            criterion,
            difference,
            created_at: Utc::now(),
        };
        self.matches.push(m.clone());
        Ok(m)
    }

    fn get_match(&self, match_id: i64) -> ReconResult<Option<Match>> {
        Ok(self.matches.iter().find(|m| m.id == match_id).cloned())
    }

    fn matches_for_movement(&self, movement_id: i64) -> ReconResult<Vec<Match>> {
        Ok(self
            .matches
            .iter()
            .filter(|m| m.involves(movement_id))
            .cloned()
            .collect())
    }

    fn delete_match(&mut self, match_id: i64) -> ReconResult<()> {
        self.matches.retain(|m| m.id != match_id);
        Ok(())
    }

    fn create_manual_grouping(
        &mut self,
        job_id: i64,
        bank_ids: &[i64],
        aux_ids: &[i64],
    ) -> ReconResult<ManualGrouping> {
        let grouping = ManualGrouping {
            id: self.next_id(),
            job_id,
            created_at: Utc::now(),
            bank_ids: bank_ids.to_vec(),
            aux_ids: aux_ids.to_vec(),
        };
        self.groupings.push(grouping.clone());
        Ok(grouping)
    }

    fn get_manual_grouping(&self, grouping_id: i64) -> ReconResult<Option<ManualGrouping>> {
        Ok(self.groupings.iter().find(|g| g.id == grouping_id).cloned())
    }

    fn grouping_for_movement(&self, movement_id: i64) -> ReconResult<Option<i64>> {
        Ok(self
            .groupings
            .iter()
            .find(|g| g.member_ids().any(|id| id == movement_id))
            .map(|g| g.id))
    }

    fn delete_manual_grouping(&mut self, grouping_id: i64) -> ReconResult<()> {
        self.groupings.retain(|g| g.id != grouping_id);
        Ok(())
    }
}
