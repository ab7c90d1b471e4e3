use crate::config::{AppPaths, now_utc, workspace_slug};
use crate::domain::{
    Criterion, Direction, Job, JobState, JobStats, ManualGrouping, Match, Movement, MovementState,
    NewMovement, Source,
};
use crate::engine::ReconStore;
use crate::error::{ReconError, ReconResult};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use rust_decimal::Decimal;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

pub struct Db {
    conn: Connection,
}

const MOVEMENT_COLUMNS: &str = "id, job_id, date, description, value, source, direction, state";
const MATCH_COLUMNS: &str =
    "id, job_id, bank_movement_id, aux_movement_id, criterion, difference, created_at";
const JOB_COLUMNS: &str = "id, name, account, period, state, created_at";

impl Db {
    pub fn open(paths: &AppPaths, workspace: &str) -> Result<(Self, PathBuf)> {
        let slug = workspace_slug(workspace);
        let ws_dir = paths.data_dir.join("workspaces").join(slug);
        fs::create_dir_all(&ws_dir)
            .with_context(|| format!("Failed to create workspace dir {}", ws_dir.display()))?;

        let db_path = ws_dir.join("conciliar.sqlite3");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open DB {}", db_path.display()))?;

        let db = Self { conn };
        db.migrate()?;
        Ok((db, db_path))
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                account TEXT,
                period TEXT,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS movements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL REFERENCES jobs(id),
                date TEXT NOT NULL,
                description TEXT NOT NULL,
                value TEXT NOT NULL,
                source TEXT NOT NULL,
                direction TEXT NOT NULL,
                state TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_movements_slice
                ON movements(job_id, source, direction, state);

            CREATE TABLE IF NOT EXISTS matches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL REFERENCES jobs(id),
                bank_movement_id INTEGER NOT NULL REFERENCES movements(id),
                aux_movement_id INTEGER NOT NULL REFERENCES movements(id),
                criterion TEXT NOT NULL,
                difference TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_matches_job ON matches(job_id);
            CREATE INDEX IF NOT EXISTS idx_matches_bank ON matches(bank_movement_id);
            CREATE INDEX IF NOT EXISTS idx_matches_aux ON matches(aux_movement_id);

            CREATE TABLE IF NOT EXISTS manual_groupings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL REFERENCES jobs(id),
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS manual_grouping_members (
                grouping_id INTEGER NOT NULL REFERENCES manual_groupings(id) ON DELETE CASCADE,
                movement_id INTEGER NOT NULL REFERENCES movements(id),
                source TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (grouping_id, movement_id)
            );

            CREATE INDEX IF NOT EXISTS idx_grouping_members_movement
                ON manual_grouping_members(movement_id);
            "#,
        )?;
        Ok(())
    }

    /// Runs `f` inside one immediate transaction; rolls back if it fails.
    pub fn atomically<T, E>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, E>) -> Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(out) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(out)
            }
            Err(err) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    pub fn insert_job(
        &self,
        name: &str,
        account: Option<&str>,
        period: Option<&str>,
    ) -> ReconResult<Job> {
        let created_at = now_utc();
        self.conn.execute(
            "INSERT INTO jobs (name, account, period, state, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                name,
                account,
                period,
                JobState::InProgress.as_str(),
                created_at.to_rfc3339()
            ],
        )?;
        Ok(Job {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
            account: account.map(str::to_string),
            period: period.map(str::to_string),
            state: JobState::InProgress,
            created_at,
        })
    }

    pub fn get_job(&self, job_id: i64) -> ReconResult<Option<Job>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id],
                RawJob::from_row,
            )
            .optional()?;
        raw.map(RawJob::into_job).transpose()
    }

    pub fn list_jobs(&self) -> ReconResult<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id ASC"))?;
        let rows = stmt.query_map([], RawJob::from_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_job()?);
        }
        Ok(out)
    }

    pub fn job_stats(&self, job_id: i64) -> ReconResult<JobStats> {
        let (total, reconciled): (i64, i64) = self.conn.query_row(
            r#"
            SELECT COUNT(*), COALESCE(SUM(CASE WHEN state = ?2 THEN 1 ELSE 0 END), 0)
            FROM movements
            WHERE job_id = ?1
            "#,
            params![job_id, MovementState::Reconciled.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let matches: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM matches WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;
        let groupings: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM manual_groupings WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;

        Ok(JobStats {
            total: total as u64,
            reconciled: reconciled as u64,
            pending: (total - reconciled) as u64,
            matches: matches as u64,
            groupings: groupings as u64,
        })
    }

    pub fn insert_movement(&self, job_id: i64, movement: &NewMovement) -> ReconResult<i64> {
        self.conn.execute(
            r#"
            INSERT INTO movements (job_id, date, description, value, source, direction, state)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                job_id,
                movement.date.trim(),
                movement.description,
                movement.magnitude().to_string(),
                movement.source.as_str(),
                movement.direction.as_str(),
                MovementState::Unreconciled.as_str(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_movements(
        &self,
        job_id: i64,
        source: Option<Source>,
        state: Option<MovementState>,
    ) -> ReconResult<Vec<Movement>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {MOVEMENT_COLUMNS}
            FROM movements
            WHERE job_id = ?1
              AND (?2 IS NULL OR source = ?2)
              AND (?3 IS NULL OR state = ?3)
            ORDER BY id ASC
            "#
        ))?;
        let rows = stmt.query_map(
            params![job_id, source.map(Source::as_str), state.map(MovementState::as_str)],
            RawMovement::from_row,
        )?;
        collect_movements(rows)
    }

    pub fn list_matches(&self, job_id: i64) -> ReconResult<Vec<Match>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MATCH_COLUMNS} FROM matches WHERE job_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![job_id], RawMatch::from_row)?;
        collect_matches(rows)
    }

    pub fn list_groupings(&self, job_id: i64) -> ReconResult<Vec<ManualGrouping>> {
        let ids: Vec<i64> = {
            let mut stmt = self
                .conn
                .prepare("SELECT id FROM manual_groupings WHERE job_id = ?1 ORDER BY id ASC")?;
            stmt.query_map(params![job_id], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(grouping) = self.get_manual_grouping(id)? {
                out.push(grouping);
            }
        }
        Ok(out)
    }
}

impl ReconStore for Db {
    fn job_state(&self, job_id: i64) -> ReconResult<Option<JobState>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.as_deref().map(JobState::parse_stored).transpose()
    }

    fn set_job_state(&mut self, job_id: i64, state: JobState) -> ReconResult<()> {
        let changed = self.conn.execute(
            "UPDATE jobs SET state = ?2 WHERE id = ?1",
            params![job_id, state.as_str()],
        )?;
        if changed == 0 {
            return Err(ReconError::JobNotFound(job_id));
        }
        Ok(())
    }

    fn get_movement(&self, movement_id: i64) -> ReconResult<Option<Movement>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {MOVEMENT_COLUMNS} FROM movements WHERE id = ?1"),
                params![movement_id],
                RawMovement::from_row,
            )
            .optional()?;
        raw.map(RawMovement::into_movement).transpose()
    }

    fn get_unreconciled_movements(
        &self,
        job_id: i64,
        source: Source,
        direction: Direction,
    ) -> ReconResult<Vec<Movement>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {MOVEMENT_COLUMNS}
            FROM movements
            WHERE job_id = ?1 AND source = ?2 AND direction = ?3 AND state = ?4
            ORDER BY id ASC
            "#
        ))?;
        let rows = stmt.query_map(
            params![
                job_id,
                source.as_str(),
                direction.as_str(),
                MovementState::Unreconciled.as_str()
            ],
            RawMovement::from_row,
        )?;
        collect_movements(rows)
    }

    fn set_movement_state(&mut self, movement_id: i64, state: MovementState) -> ReconResult<()> {
        let changed = self.conn.execute(
            "UPDATE movements SET state = ?2 WHERE id = ?1",
            params![movement_id, state.as_str()],
        )?;
        if changed == 0 {
            return Err(ReconError::MovementNotFound(movement_id));
        }
        Ok(())
    }

    fn count_unreconciled(&self, job_id: i64) -> ReconResult<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM movements WHERE job_id = ?1 AND state = ?2",
            params![job_id, MovementState::Unreconciled.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    fn delete_movement(&mut self, movement_id: i64) -> ReconResult<()> {
        let changed = self
            .conn
            .execute("DELETE FROM movements WHERE id = ?1", params![movement_id])?;
        if changed == 0 {
            return Err(ReconError::MovementNotFound(movement_id));
        }
        Ok(())
    }

    fn create_match(
        &mut self,
        job_id: i64,
        bank_movement_id: i64,
        aux_movement_id: i64,
        criterion: Criterion,
        difference: Decimal,
    ) -> ReconResult<Match> {
        let created_at = now_utc();
        self.conn.execute(
            r#"
            INSERT INTO matches (job_id, bank_movement_id, aux_movement_id, criterion, difference, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                job_id,
                bank_movement_id,
                aux_movement_id,
                criterion.as_str(),
                difference.to_string(),
                created_at.to_rfc3339(),
            ],
        )?;
        Ok(Match {
            id: self.conn.last_insert_rowid(),
            job_id,
            bank_movement_id,
            aux_movement_id,
            criterion,
            difference,
            created_at,
        })
    }

    fn get_match(&self, match_id: i64) -> ReconResult<Option<Match>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {MATCH_COLUMNS} FROM matches WHERE id = ?1"),
                params![match_id],
                RawMatch::from_row,
            )
            .optional()?;
        raw.map(RawMatch::into_match).transpose()
    }

    fn matches_for_movement(&self, movement_id: i64) -> ReconResult<Vec<Match>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {MATCH_COLUMNS}
            FROM matches
            WHERE bank_movement_id = ?1 OR aux_movement_id = ?1
            ORDER BY id ASC
            "#
        ))?;
        let rows = stmt.query_map(params![movement_id], RawMatch::from_row)?;
        collect_matches(rows)
    }

    fn delete_match(&mut self, match_id: i64) -> ReconResult<()> {
        let changed = self
            .conn
            .execute("DELETE FROM matches WHERE id = ?1", params![match_id])?;
        if changed == 0 {
            return Err(ReconError::MatchNotFound(match_id));
        }
        Ok(())
    }

    fn create_manual_grouping(
        &mut self,
        job_id: i64,
        bank_ids: &[i64],
        aux_ids: &[i64],
    ) -> ReconResult<ManualGrouping> {
        let created_at = now_utc();
        self.conn.execute(
            "INSERT INTO manual_groupings (job_id, created_at) VALUES (?1, ?2)",
            params![job_id, created_at.to_rfc3339()],
        )?;
        let id = self.conn.last_insert_rowid();

        let mut stmt = self.conn.prepare(
            r#"
            INSERT INTO manual_grouping_members (grouping_id, movement_id, source, position)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )?;
        for (source, ids) in [(Source::Bank, bank_ids), (Source::Auxiliary, aux_ids)] {
            for (position, movement_id) in ids.iter().enumerate() {
                stmt.execute(params![id, movement_id, source.as_str(), position as i64])?;
            }
        }

        Ok(ManualGrouping {
            id,
            job_id,
            created_at,
            bank_ids: bank_ids.to_vec(),
            aux_ids: aux_ids.to_vec(),
        })
    }

    fn get_manual_grouping(&self, grouping_id: i64) -> ReconResult<Option<ManualGrouping>> {
        let head: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT job_id, created_at FROM manual_groupings WHERE id = ?1",
                params![grouping_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((job_id, created_at)) = head else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            r#"
            SELECT movement_id, source
            FROM manual_grouping_members
            WHERE grouping_id = ?1
            ORDER BY position ASC
            "#,
        )?;
        let rows = stmt.query_map(params![grouping_id], |row| {
            let movement_id: i64 = row.get(0)?;
            let source: String = row.get(1)?;
            Ok((movement_id, source))
        })?;

        let mut bank_ids = Vec::new();
        let mut aux_ids = Vec::new();
        for row in rows {
            let (movement_id, source) = row?;
            match Source::parse_stored(&source)? {
                Source::Bank => bank_ids.push(movement_id),
                Source::Auxiliary => aux_ids.push(movement_id),
            }
        }

        Ok(Some(ManualGrouping {
            id: grouping_id,
            job_id,
            created_at: parse_timestamp(&created_at)?,
            bank_ids,
            aux_ids,
        }))
    }

    fn grouping_for_movement(&self, movement_id: i64) -> ReconResult<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT grouping_id FROM manual_grouping_members WHERE movement_id = ?1 LIMIT 1",
                params![movement_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn delete_manual_grouping(&mut self, grouping_id: i64) -> ReconResult<()> {
        let changed = self.conn.execute(
            "DELETE FROM manual_groupings WHERE id = ?1",
            params![grouping_id],
        )?;
        if changed == 0 {
            return Err(ReconError::GroupingNotFound(grouping_id));
        }
        Ok(())
    }
}

struct RawJob {
    id: i64,
    name: String,
    account: Option<String>,
    period: Option<String>,
    state: String,
    created_at: String,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            account: row.get(2)?,
            period: row.get(3)?,
            state: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_job(self) -> ReconResult<Job> {
        Ok(Job {
            id: self.id,
            name: self.name,
            account: self.account,
            period: self.period,
            state: JobState::parse_stored(&self.state)?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

struct RawMovement {
    id: i64,
    job_id: i64,
    date: String,
    description: String,
    value: String,
    source: String,
    direction: String,
    state: String,
}

impl RawMovement {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            date: row.get(2)?,
            description: row.get(3)?,
            value: row.get(4)?,
            source: row.get(5)?,
            direction: row.get(6)?,
            state: row.get(7)?,
        })
    }

    fn into_movement(self) -> ReconResult<Movement> {
        Ok(Movement {
            id: self.id,
            job_id: self.job_id,
            date: self.date,
            description: self.description,
            value: parse_decimal(&self.value, "movement value")?,
            source: Source::parse_stored(&self.source)?,
            direction: Direction::parse_stored(&self.direction)?,
            state: MovementState::parse_stored(&self.state)?,
        })
    }
}

struct RawMatch {
    id: i64,
    job_id: i64,
    bank_movement_id: i64,
    aux_movement_id: i64,
    criterion: String,
    difference: String,
    created_at: String,
}

impl RawMatch {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            bank_movement_id: row.get(2)?,
            aux_movement_id: row.get(3)?,
            criterion: row.get(4)?,
            difference: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_match(self) -> ReconResult<Match> {
        Ok(Match {
            id: self.id,
            job_id: self.job_id,
            bank_movement_id: self.bank_movement_id,
            aux_movement_id: self.aux_movement_id,
            criterion: Criterion::parse_stored(&self.criterion)?,
            difference: parse_decimal(&self.difference, "match difference")?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

fn collect_movements(
    rows: impl Iterator<Item = rusqlite::Result<RawMovement>>,
) -> ReconResult<Vec<Movement>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?.into_movement()?);
    }
    Ok(out)
}

fn collect_matches(
    rows: impl Iterator<Item = rusqlite::Result<RawMatch>>,
) -> ReconResult<Vec<Match>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?.into_match()?);
    }
    Ok(out)
}

fn parse_decimal(raw: &str, field: &'static str) -> ReconResult<Decimal> {
    raw.parse::<Decimal>()
        .map_err(|_| ReconError::corrupt(field, raw))
}

fn parse_timestamp(raw: &str) -> ReconResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ReconError::corrupt("timestamp", raw))
}
