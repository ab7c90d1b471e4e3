//! Reconciliation engine: matching passes, recording, completion, and the
//! manual override path.
//!
//! All mutation goes through [`ReconStore`]. Callers wrap each entry point in
//! one store transaction and serialize runs per job.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::domain::{
    Criterion, Direction, JobState, ManualGrouping, Match, Movement, MovementState, Source,
};
use crate::error::{ReconError, ReconResult};
use crate::matcher::{Pairing, TieBreak, approximate_matches, exact_matches};
use crate::normalize::{ComparisonRecord, normalize};

/// Persistence the engine needs from its host.
pub trait ReconStore {
    fn job_state(&self, job_id: i64) -> ReconResult<Option<JobState>>;
    fn set_job_state(&mut self, job_id: i64, state: JobState) -> ReconResult<()>;

    fn get_movement(&self, movement_id: i64) -> ReconResult<Option<Movement>>;
    /// Unreconciled movements in stable (id) order.
    fn get_unreconciled_movements(
        &self,
        job_id: i64,
        source: Source,
        direction: Direction,
    ) -> ReconResult<Vec<Movement>>;
    fn set_movement_state(&mut self, movement_id: i64, state: MovementState) -> ReconResult<()>;
    fn count_unreconciled(&self, job_id: i64) -> ReconResult<u64>;
    fn delete_movement(&mut self, movement_id: i64) -> ReconResult<()>;

    fn create_match(
        &mut self,
        job_id: i64,
        bank_movement_id: i64,
        aux_movement_id: i64,
        criterion: Criterion,
        difference: Decimal,
    ) -> ReconResult<Match>;
    fn get_match(&self, match_id: i64) -> ReconResult<Option<Match>>;
    fn matches_for_movement(&self, movement_id: i64) -> ReconResult<Vec<Match>>;
    fn delete_match(&mut self, match_id: i64) -> ReconResult<()>;

    fn create_manual_grouping(
        &mut self,
        job_id: i64,
        bank_ids: &[i64],
        aux_ids: &[i64],
    ) -> ReconResult<ManualGrouping>;
    fn get_manual_grouping(&self, grouping_id: i64) -> ReconResult<Option<ManualGrouping>>;
    fn grouping_for_movement(&self, movement_id: i64) -> ReconResult<Option<i64>>;
    fn delete_manual_grouping(&mut self, grouping_id: i64) -> ReconResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SliceSummary {
    pub direction: Direction,
    pub bank_processed: usize,
    pub aux_processed: usize,
    /// Movements left out of both passes because their date could not be read.
    pub undated: usize,
    pub exact: usize,
    pub approximate: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub job_id: i64,
    pub slices: Vec<SliceSummary>,
    pub job_state: JobState,
}

impl RunSummary {
    pub fn exact(&self) -> usize {
        self.slices.iter().map(|s| s.exact).sum()
    }

    pub fn approximate(&self) -> usize {
        self.slices.iter().map(|s| s.approximate).sum()
    }

    pub fn total_matches(&self) -> usize {
        self.exact() + self.approximate()
    }

    pub fn undated(&self) -> usize {
        self.slices.iter().map(|s| s.undated).sum()
    }
}

/// Runs the automatic passes with a configurable tie-break.
pub struct Reconciler<T: TieBreak> {
    tie_break: T,
}

impl<T: TieBreak> Reconciler<T> {
    pub fn new(tie_break: T) -> Self {
        Self { tie_break }
    }

    /// Exact then approximate matching for each direction, followed by one
    /// completion check. Re-running only ever sees unreconciled movements.
    pub fn run(&self, store: &mut impl ReconStore, job_id: i64) -> ReconResult<RunSummary> {
        require_job(&*store, job_id)?;

        let mut slices = Vec::with_capacity(Direction::ALL.len());
        for direction in Direction::ALL {
            slices.push(self.run_slice(store, job_id, direction)?);
        }

        let job_state = check_completion(store, job_id)?;
        let summary = RunSummary {
            job_id,
            slices,
            job_state,
        };
        info!(
            job_id,
            exact = summary.exact(),
            approximate = summary.approximate(),
            undated = summary.undated(),
            state = %job_state,
            "reconciliation run finished"
        );
        Ok(summary)
    }

    fn run_slice(
        &self,
        store: &mut impl ReconStore,
        job_id: i64,
        direction: Direction,
    ) -> ReconResult<SliceSummary> {
        let (bank, aux) = load_slice(&*store, job_id, direction)?;
        let undated = bank
            .iter()
            .chain(aux.iter())
            .filter(|r| r.date.is_none())
            .inspect(|r| warn!(movement_id = r.movement_id, "unreadable date; not matched"))
            .count();

        let mut summary = SliceSummary {
            direction,
            bank_processed: bank.len(),
            aux_processed: aux.len(),
            undated,
            exact: 0,
            approximate: 0,
        };
        if bank.is_empty() || aux.is_empty() {
            debug!(job_id, %direction, "nothing to pair");
            return Ok(summary);
        }

        let exact = exact_matches(&bank, &aux, &self.tie_break);
        record_pairings(store, job_id, &exact, Criterion::exact(direction))?;
        summary.exact = exact.len();

        // Reload so the approximate pass only sees what the exact pass left.
        let (bank, aux) = load_slice(&*store, job_id, direction)?;
        let approximate = approximate_matches(&bank, &aux, &self.tie_break);
        record_pairings(store, job_id, &approximate, Criterion::approximate(direction))?;
        summary.approximate = approximate.len();

        info!(
            job_id,
            %direction,
            bank = summary.bank_processed,
            aux = summary.aux_processed,
            exact = summary.exact,
            approximate = summary.approximate,
            "slice reconciled"
        );
        Ok(summary)
    }
}

fn load_slice(
    store: &impl ReconStore,
    job_id: i64,
    direction: Direction,
) -> ReconResult<(Vec<ComparisonRecord>, Vec<ComparisonRecord>)> {
    let bank = store.get_unreconciled_movements(job_id, Source::Bank, direction)?;
    let aux = store.get_unreconciled_movements(job_id, Source::Auxiliary, direction)?;
    Ok((normalize(&bank), normalize(&aux)))
}

fn record_pairings(
    store: &mut impl ReconStore,
    job_id: i64,
    pairings: &[Pairing],
    criterion: Criterion,
) -> ReconResult<()> {
    for pairing in pairings {
        record_match(store, job_id, pairing, criterion)?;
    }
    Ok(())
}

/// Stores one accepted pairing and marks both movements reconciled.
///
/// Callers must not pass a movement twice; the matchers' 1:1 resolution
/// guarantees that for automatic runs.
pub fn record_match(
    store: &mut impl ReconStore,
    job_id: i64,
    pairing: &Pairing,
    criterion: Criterion,
) -> ReconResult<Match> {
    let m = store.create_match(
        job_id,
        pairing.bank_movement_id,
        pairing.aux_movement_id,
        criterion,
        Decimal::from(pairing.difference),
    )?;
    store.set_movement_state(pairing.bank_movement_id, MovementState::Reconciled)?;
    store.set_movement_state(pairing.aux_movement_id, MovementState::Reconciled)?;
    debug!(
        match_id = m.id,
        bank = pairing.bank_movement_id,
        aux = pairing.aux_movement_id,
        criterion = %criterion,
        difference = pairing.difference,
        "match recorded"
    );
    Ok(m)
}

/// Promotes the job to finalized when nothing is left unreconciled.
///
/// Never reopens a finalized job; returns the state the job is left in.
pub fn check_completion(store: &mut impl ReconStore, job_id: i64) -> ReconResult<JobState> {
    let current = require_job(&*store, job_id)?;
    let pending = store.count_unreconciled(job_id)?;
    debug!(job_id, pending, "completion check");
    if pending == 0 && current != JobState::Finalized {
        store.set_job_state(job_id, JobState::Finalized)?;
        info!(job_id, "job finalized");
        return Ok(JobState::Finalized);
    }
    Ok(current)
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupingOutcome {
    pub grouping: ManualGrouping,
    /// Requested identifiers that failed validation and were left out.
    pub skipped: Vec<i64>,
}

/// Operator override: resolves arbitrary bank and auxiliary movements together.
///
/// Each identifier must exist, belong to `job_id`, sit on the expected side,
/// and still be unreconciled. Identifiers failing any check (or repeated) are
/// skipped and reported; the request fails only when none survive.
pub fn create_manual_grouping(
    store: &mut impl ReconStore,
    job_id: i64,
    bank_ids: &[i64],
    aux_ids: &[i64],
) -> ReconResult<GroupingOutcome> {
    require_job(&*store, job_id)?;

    let mut seen = HashSet::new();
    let mut skipped = Vec::new();
    let mut accept = |ids: &[i64], side: Source| -> ReconResult<Vec<i64>> {
        let mut valid = Vec::new();
        for &id in ids {
            let ok = seen.insert(id)
                && store.get_movement(id)?.is_some_and(|m| {
                    m.job_id == job_id && m.source == side && m.state == MovementState::Unreconciled
                });
            if ok {
                valid.push(id);
            } else {
                warn!(job_id, movement_id = id, side = %side, "skipping movement in manual grouping");
                skipped.push(id);
            }
        }
        Ok(valid)
    };
    let bank = accept(bank_ids, Source::Bank)?;
    let aux = accept(aux_ids, Source::Auxiliary)?;

    if bank.is_empty() && aux.is_empty() {
        return Err(ReconError::InvalidGrouping(format!(
            "none of the given movements are unreconciled members of job {job_id}"
        )));
    }

    let grouping = store.create_manual_grouping(job_id, &bank, &aux)?;
    for id in grouping.member_ids() {
        store.set_movement_state(id, MovementState::Reconciled)?;
    }
    info!(
        job_id,
        grouping_id = grouping.id,
        bank = grouping.bank_ids.len(),
        aux = grouping.aux_ids.len(),
        skipped = skipped.len(),
        "manual grouping created"
    );
    Ok(GroupingOutcome { grouping, skipped })
}

/// Deletes an automatic match and returns both movements to unreconciled.
pub fn delete_match(store: &mut impl ReconStore, match_id: i64) -> ReconResult<Match> {
    let m = store
        .get_match(match_id)?
        .ok_or(ReconError::MatchNotFound(match_id))?;
    store.set_movement_state(m.bank_movement_id, MovementState::Unreconciled)?;
    store.set_movement_state(m.aux_movement_id, MovementState::Unreconciled)?;
    store.delete_match(match_id)?;
    info!(match_id, job_id = m.job_id, "match deleted");
    Ok(m)
}

/// Deletes a manual grouping and returns every member to unreconciled.
pub fn delete_manual_grouping(
    store: &mut impl ReconStore,
    grouping_id: i64,
) -> ReconResult<ManualGrouping> {
    let grouping = store
        .get_manual_grouping(grouping_id)?
        .ok_or(ReconError::GroupingNotFound(grouping_id))?;
    for id in grouping.member_ids() {
        store.set_movement_state(id, MovementState::Unreconciled)?;
    }
    store.delete_manual_grouping(grouping_id)?;
    info!(grouping_id, job_id = grouping.job_id, "manual grouping deleted");
    Ok(grouping)
}

/// Administrative removal of a movement. Matches that reference it are
/// deleted and their counterparts restored; grouped movements are refused.
pub fn delete_movement(store: &mut impl ReconStore, movement_id: i64) -> ReconResult<Movement> {
    let movement = store
        .get_movement(movement_id)?
        .ok_or(ReconError::MovementNotFound(movement_id))?;
    if let Some(grouping_id) = store.grouping_for_movement(movement_id)? {
        return Err(ReconError::MovementInGrouping {
            movement_id,
            grouping_id,
        });
    }
    for m in store.matches_for_movement(movement_id)? {
        delete_match(store, m.id)?;
    }
    store.delete_movement(movement_id)?;
    info!(movement_id, job_id = movement.job_id, "movement deleted");
    Ok(movement)
}

/// Explicit state change outside the completion check (force-finalize or reopen).
pub fn set_job_state(
    store: &mut impl ReconStore,
    job_id: i64,
    state: JobState,
) -> ReconResult<()> {
    require_job(&*store, job_id)?;
    store.set_job_state(job_id, state)?;
    info!(job_id, state = %state, "job state set");
    Ok(())
}

fn require_job(store: &impl ReconStore, job_id: i64) -> ReconResult<JobState> {
    store.job_state(job_id)?.ok_or(ReconError::JobNotFound(job_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{FirstSeen, TieBreakStrategy};
    use crate::memory_store::MemoryStore;

    fn setup() -> (MemoryStore, i64) {
        let mut store = MemoryStore::default();
        let job = store.add_job();
        (store, job)
    }

    fn run(store: &mut MemoryStore, job: i64) -> RunSummary {
        Reconciler::new(FirstSeen).run(store, job).unwrap()
    }

    #[test]
    fn scenario_exact_inflow() {
        let (mut store, job) = setup();
        let b = store.add(job, Source::Bank, Direction::Inflow, "2024-11-15", 150000);
        let a = store.add(job, Source::Auxiliary, Direction::Inflow, "2024-11-15", 150000);

        let summary = run(&mut store, job);
        assert_eq!(summary.exact(), 1);
        assert_eq!(store.matches.len(), 1);
        let m = &store.matches[0];
        assert_eq!((m.bank_movement_id, m.aux_movement_id), (b, a));
        assert_eq!(m.criterion, Criterion::ExactInflow);
        assert_eq!(m.difference, Decimal::ZERO);
        assert_eq!(store.state_of(b), MovementState::Reconciled);
        assert_eq!(store.state_of(a), MovementState::Reconciled);
    }

    #[test]
    fn scenario_approximate_outflow_two_days() {
        let (mut store, job) = setup();
        store.add(job, Source::Bank, Direction::Outflow, "2024-11-17", 320000);
        store.add(job, Source::Auxiliary, Direction::Outflow, "2024-11-19", 320000);

        let summary = run(&mut store, job);
        assert_eq!(summary.exact(), 0);
        assert_eq!(summary.approximate(), 1);
        assert_eq!(store.matches[0].criterion, Criterion::ApproximateOutflow);
        assert_eq!(store.matches[0].difference, Decimal::from(2));
    }

    #[test]
    fn scenario_four_day_gap_stays_open() {
        let (mut store, job) = setup();
        let b = store.add(job, Source::Bank, Direction::Outflow, "2024-11-17", 320000);
        let a = store.add(job, Source::Auxiliary, Direction::Outflow, "2024-11-21", 320000);

        let summary = run(&mut store, job);
        assert_eq!(summary.total_matches(), 0);
        assert_eq!(store.state_of(b), MovementState::Unreconciled);
        assert_eq!(store.state_of(a), MovementState::Unreconciled);
        assert_eq!(summary.job_state, JobState::InProgress);
    }

    #[test]
    fn directions_never_cross() {
        let (mut store, job) = setup();
        store.add(job, Source::Bank, Direction::Inflow, "2024-11-15", 5000);
        store.add(job, Source::Auxiliary, Direction::Outflow, "2024-11-15", 5000);

        assert_eq!(run(&mut store, job).total_matches(), 0);
    }

    #[test]
    fn exact_takes_precedence_over_approximate() {
        let (mut store, job) = setup();
        // Bank 1 qualifies approximately with aux 3 and exactly with aux 4.
        let b = store.add(job, Source::Bank, Direction::Inflow, "2024-11-10", 700);
        store.add(job, Source::Auxiliary, Direction::Inflow, "2024-11-11", 700);
        let exact_aux = store.add(job, Source::Auxiliary, Direction::Inflow, "2024-11-10", 700);

        let summary = run(&mut store, job);
        assert_eq!((summary.exact(), summary.approximate()), (1, 0));
        let m = &store.matches[0];
        assert_eq!((m.bank_movement_id, m.aux_movement_id), (b, exact_aux));
        assert!(m.criterion.is_exact());
    }

    #[test]
    fn rerun_is_idempotent() {
        let (mut store, job) = setup();
        store.add(job, Source::Bank, Direction::Inflow, "2024-11-15", 100);
        store.add(job, Source::Auxiliary, Direction::Inflow, "2024-11-16", 100);
        store.add(job, Source::Bank, Direction::Outflow, "2024-11-15", 900);

        assert_eq!(run(&mut store, job).total_matches(), 1);
        let second = run(&mut store, job);
        assert_eq!(second.total_matches(), 0);
        assert_eq!(store.matches.len(), 1);
    }

    #[test]
    fn all_matched_job_is_finalized() {
        let (mut store, job) = setup();
        for day in 1..=5 {
            let date = format!("2024-11-{day:02}");
            let value = 1000 * day;
            let aux_date = format!("2024-11-{:02}", day + (day % 2));
            store.add(job, Source::Bank, Direction::Inflow, &date, value);
            store.add(job, Source::Auxiliary, Direction::Inflow, &aux_date, value);
        }

        let summary = run(&mut store, job);
        assert_eq!(summary.total_matches(), 5);
        assert_eq!(store.count_unreconciled(job).unwrap(), 0);
        assert_eq!(summary.job_state, JobState::Finalized);
        assert_eq!(store.job_state(job).unwrap(), Some(JobState::Finalized));
    }

    #[test]
    fn undated_movements_are_counted_and_left_alone() {
        let (mut store, job) = setup();
        let b = store.add(job, Source::Bank, Direction::Inflow, "sin fecha", 100);
        store.add(job, Source::Auxiliary, Direction::Inflow, "2024-11-15", 100);

        let summary = run(&mut store, job);
        assert_eq!(summary.undated(), 1);
        assert_eq!(summary.total_matches(), 0);
        assert_eq!(store.state_of(b), MovementState::Unreconciled);
    }

    #[test]
    fn completion_does_not_reopen() {
        let (mut store, job) = setup();
        assert_eq!(check_completion(&mut store, job).unwrap(), JobState::Finalized);
        store.add(job, Source::Bank, Direction::Inflow, "2024-11-15", 100);
        assert_eq!(check_completion(&mut store, job).unwrap(), JobState::Finalized);
    }

    #[test]
    fn unknown_job_is_an_error() {
        let mut store = MemoryStore::default();
        let err = Reconciler::new(TieBreakStrategy::default())
            .run(&mut store, 42)
            .unwrap_err();
        assert!(matches!(err, ReconError::JobNotFound(42)));
    }

    #[test]
    fn manual_grouping_marks_members_without_matches() {
        let (mut store, job) = setup();
        let b1 = store.add(job, Source::Bank, Direction::Outflow, "2024-11-01", 10);
        let b2 = store.add(job, Source::Bank, Direction::Outflow, "2024-11-02", 20);
        let a = store.add(job, Source::Auxiliary, Direction::Outflow, "2024-11-03", 30);

        let outcome = create_manual_grouping(&mut store, job, &[b1, b2], &[a]).unwrap();
        assert!(outcome.skipped.is_empty());
        assert_eq!(outcome.grouping.bank_ids, vec![b1, b2]);
        assert_eq!(outcome.grouping.aux_ids, vec![a]);
        assert!(store.matches.is_empty());
        for id in [b1, b2, a] {
            assert_eq!(store.state_of(id), MovementState::Reconciled);
        }
    }

    #[test]
    fn manual_grouping_skips_invalid_identifiers() {
        let (mut store, job) = setup();
        let other_job = store.add_job();
        let b = store.add(job, Source::Bank, Direction::Inflow, "2024-11-01", 10);
        let a = store.add(job, Source::Auxiliary, Direction::Inflow, "2024-11-01", 10);
        let foreign = store.add(other_job, Source::Auxiliary, Direction::Inflow, "2024-11-01", 10);

        // `a` on the bank side is the wrong source; 999 does not exist.
        let outcome =
            create_manual_grouping(&mut store, job, &[b, a, 999, b], &[foreign]).unwrap();
        assert_eq!(outcome.grouping.bank_ids, vec![b]);
        assert!(outcome.grouping.aux_ids.is_empty());
        assert_eq!(outcome.skipped, vec![a, 999, b, foreign]);
        assert_eq!(store.state_of(a), MovementState::Unreconciled);
        assert_eq!(store.state_of(foreign), MovementState::Unreconciled);

        let err = create_manual_grouping(&mut store, job, &[b], &[]).unwrap_err();
        assert!(matches!(err, ReconError::InvalidGrouping(_)));
    }

    #[test]
    fn matched_movements_cannot_join_a_grouping() {
        let (mut store, job) = setup();
        let b = store.add(job, Source::Bank, Direction::Inflow, "2024-11-15", 100);
        let a = store.add(job, Source::Auxiliary, Direction::Inflow, "2024-11-15", 100);
        run(&mut store, job);

        let err = create_manual_grouping(&mut store, job, &[b], &[a]).unwrap_err();
        assert!(matches!(err, ReconError::InvalidGrouping(_)));
        assert!(store.groupings.is_empty());
        assert_eq!(store.matches.len(), 1);

        // Once the match is undone the same movements can be grouped.
        let match_id = store.matches[0].id;
        delete_match(&mut store, match_id).unwrap();
        let outcome = create_manual_grouping(&mut store, job, &[b], &[a]).unwrap();
        assert!(outcome.skipped.is_empty());
    }

    #[test]
    fn deleting_match_and_grouping_restores_movements() {
        let (mut store, job) = setup();
        let b = store.add(job, Source::Bank, Direction::Inflow, "2024-11-15", 100);
        let a = store.add(job, Source::Auxiliary, Direction::Inflow, "2024-11-15", 100);
        let c = store.add(job, Source::Bank, Direction::Inflow, "2024-11-20", 55);
        run(&mut store, job);

        let match_id = store.matches[0].id;
        delete_match(&mut store, match_id).unwrap();
        assert!(store.matches.is_empty());
        assert_eq!(store.state_of(b), MovementState::Unreconciled);
        assert_eq!(store.state_of(a), MovementState::Unreconciled);
        assert!(matches!(
            delete_match(&mut store, match_id),
            Err(ReconError::MatchNotFound(_))
        ));

        let grouping = create_manual_grouping(&mut store, job, &[c], &[a]).unwrap().grouping;
        delete_manual_grouping(&mut store, grouping.id).unwrap();
        assert_eq!(store.state_of(c), MovementState::Unreconciled);
        assert_eq!(store.state_of(a), MovementState::Unreconciled);
        assert!(store.groupings.is_empty());
    }

    #[test]
    fn deleting_matched_movement_releases_counterpart() {
        let (mut store, job) = setup();
        let b = store.add(job, Source::Bank, Direction::Inflow, "2024-11-15", 100);
        let a = store.add(job, Source::Auxiliary, Direction::Inflow, "2024-11-15", 100);
        let g = store.add(job, Source::Bank, Direction::Inflow, "2024-11-30", 1);
        run(&mut store, job);
        create_manual_grouping(&mut store, job, &[g], &[]).unwrap();

        delete_movement(&mut store, b).unwrap();
        assert!(store.matches.is_empty());
        assert_eq!(store.state_of(a), MovementState::Unreconciled);
        assert!(store.get_movement(b).unwrap().is_none());

        let err = delete_movement(&mut store, g).unwrap_err();
        assert!(matches!(err, ReconError::MovementInGrouping { .. }));
    }
}
