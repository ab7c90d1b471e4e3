mod cli;
mod config;
mod db;
mod domain;
mod engine;
mod error;
mod logging;
mod matcher;
#[cfg(test)]
mod memory_store;
mod normalize;
mod similarity;

use anyhow::{Context, Result};
use clap::Parser;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::cli::{
    Cli, Command, GroupCmd, JobCmd, MatchCmd, MovementCmd, ReconcileCmd, SuggestArgs, WsCmd,
};
use crate::config::{AppConfig, AppPaths, app_paths, load_or_init_config, write_config};
use crate::db::Db;
use crate::domain::{JobState, NewMovement};
use crate::engine::{ReconStore, Reconciler, RunSummary};
use crate::error::ReconError;
use crate::normalize::{ComparisonRecord, normalize};
use crate::similarity::rank_candidates;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let paths = app_paths(cli.home.clone())?;
    let (mut cfg, cfg_path) = load_or_init_config(&paths)?;
    logging::init(&cfg.log_level, cli.verbose);

    match cli.command {
        Command::Ws(args) => handle_ws(args.cmd, &paths, &mut cfg, &cfg_path),
        cmd => {
            let (mut db, db_path) = Db::open(&paths, &cfg.current_workspace)?;
            debug!(db = %db_path.display(), workspace = %cfg.current_workspace, "database opened");

            match cmd {
                Command::Job(args) => handle_job(&mut db, args.cmd),
                Command::Movement(args) => handle_movement(&mut db, args.cmd),
                Command::Reconcile(args) => handle_reconcile(&mut db, &cfg, args.cmd),
                Command::Match(args) => handle_match(&mut db, args.cmd),
                Command::Group(args) => handle_group(&mut db, args.cmd),
                Command::Suggest(args) => handle_suggest(&db, &cfg, args),
                Command::Ws(_) => unreachable!(),
            }
        }
    }
}

fn handle_job(db: &mut Db, cmd: JobCmd) -> Result<()> {
    match cmd {
        JobCmd::Create {
            name,
            account,
            period,
        } => {
            let job = db.insert_job(&name, account.as_deref(), period.as_deref())?;
            println!("Created job {}: {}", job.id, job.name);
        }
        JobCmd::List => {
            let jobs = db.list_jobs()?;
            if jobs.is_empty() {
                println!("No jobs yet.");
                return Ok(());
            }
            let mut rows = Vec::with_capacity(jobs.len());
            for job in jobs {
                let stats = db.job_stats(job.id)?;
                rows.push(vec![
                    job.id.to_string(),
                    job.name,
                    job.account.unwrap_or_default(),
                    job.period.unwrap_or_default(),
                    job.state.to_string(),
                    stats.total.to_string(),
                    format!("{}%", stats.percent_reconciled()),
                ]);
            }
            print_table(
                &["id", "name", "account", "period", "state", "movements", "reconciled"],
                &rows,
            );
        }
        JobCmd::Show { id } => {
            let job = db.get_job(id)?.ok_or(ReconError::JobNotFound(id))?;
            let stats = db.job_stats(id)?;
            println!("Job {}: {}", job.id, job.name);
            if let Some(account) = &job.account {
                println!("Account: {account}");
            }
            if let Some(period) = &job.period {
                println!("Period: {period}");
            }
            println!("State: {}", job.state);
            println!("Created: {}", job.created_at.to_rfc3339());
            println!("Movements: {}", stats.total);
            println!("Reconciled: {}", stats.reconciled);
            println!("Pending: {}", stats.pending);
            println!("Progress: {}%", stats.percent_reconciled());
            println!("Matches: {}", stats.matches);
            println!("Manual groupings: {}", stats.groupings);
        }
        JobCmd::Finalize { id } => {
            db.atomically(|db| engine::set_job_state(db, id, JobState::Finalized))?;
            println!("Job {id} finalized");
        }
        JobCmd::Reopen { id } => {
            db.atomically(|db| engine::set_job_state(db, id, JobState::InProgress))?;
            println!("Job {id} reopened");
        }
    }
    Ok(())
}

fn handle_movement(db: &mut Db, cmd: MovementCmd) -> Result<()> {
    match cmd {
        MovementCmd::Add {
            job,
            source,
            direction,
            date,
            value,
            description,
        } => {
            require_job(db, job)?;
            let value = parse_decimal(&value, "value")?;
            let description = description.unwrap_or_default();
            let row = NewMovement::new(date, description, value, source, direction);
            let id = db.insert_movement(job, &row)?;
            println!("Added movement {id} to job {job}");
        }
        MovementCmd::Import { job, file } => {
            require_job(db, job)?;
            let rows = read_import_file(&file)?;
            let count = db.atomically(|db| -> Result<usize> {
                for row in &rows {
                    db.insert_movement(job, row)?;
                }
                Ok(rows.len())
            })?;
            println!("Imported {count} movements into job {job}");
        }
        MovementCmd::List { job, source, state } => {
            require_job(db, job)?;
            let movements = db.list_movements(job, source, state)?;
            if movements.is_empty() {
                println!("No movements.");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = movements
                .into_iter()
                .map(|m| {
                    vec![
                        m.id.to_string(),
                        m.source.to_string(),
                        m.direction.to_string(),
                        m.date,
                        m.value.to_string(),
                        m.state.to_string(),
                        m.description,
                    ]
                })
                .collect();
            print_table(
                &["id", "source", "direction", "date", "value", "state", "description"],
                &rows,
            );
        }
        MovementCmd::Delete { id } => {
            let movement = db.atomically(|db| engine::delete_movement(db, id))?;
            println!("Deleted movement {id} from job {}", movement.job_id);
        }
    }
    Ok(())
}

fn handle_reconcile(db: &mut Db, cfg: &AppConfig, cmd: ReconcileCmd) -> Result<()> {
    match cmd {
        ReconcileCmd::Run { job, json } => {
            let reconciler = Reconciler::new(cfg.tie_break);
            let summary = db
                .atomically(|db| reconciler.run(db, job))
                .with_context(|| format!("Reconciliation of job {job} failed"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_run_summary(&summary);
            }
        }
        ReconcileCmd::Manual { job, bank, aux } => {
            let outcome =
                db.atomically(|db| engine::create_manual_grouping(db, job, &bank, &aux))?;
            let g = &outcome.grouping;
            println!(
                "Created grouping {} ({} bank, {} auxiliary)",
                g.id,
                g.bank_ids.len(),
                g.aux_ids.len()
            );
            if !outcome.skipped.is_empty() {
                println!("Skipped movements: {}", join_ids(&outcome.skipped));
            }
        }
    }
    Ok(())
}

fn print_run_summary(summary: &RunSummary) {
    let rows: Vec<Vec<String>> = summary
        .slices
        .iter()
        .map(|s| {
            vec![
                s.direction.to_string(),
                s.bank_processed.to_string(),
                s.aux_processed.to_string(),
                s.undated.to_string(),
                s.exact.to_string(),
                s.approximate.to_string(),
            ]
        })
        .collect();
    print_table(
        &["direction", "bank", "auxiliary", "undated", "exact", "approximate"],
        &rows,
    );
    println!(
        "Matches: {} (exact {}, approximate {})",
        summary.total_matches(),
        summary.exact(),
        summary.approximate()
    );
    if summary.undated() > 0 {
        println!("Skipped for unreadable dates: {}", summary.undated());
    }
    println!("Job state: {}", summary.job_state);
}

fn handle_match(db: &mut Db, cmd: MatchCmd) -> Result<()> {
    match cmd {
        MatchCmd::List { job } => {
            require_job(db, job)?;
            let matches = db.list_matches(job)?;
            if matches.is_empty() {
                println!("No matches.");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = matches
                .into_iter()
                .map(|m| {
                    vec![
                        m.id.to_string(),
                        m.bank_movement_id.to_string(),
                        m.aux_movement_id.to_string(),
                        m.criterion.to_string(),
                        m.difference.to_string(),
                        m.created_at.to_rfc3339(),
                    ]
                })
                .collect();
            print_table(
                &["id", "bank", "auxiliary", "criterion", "difference", "created_at"],
                &rows,
            );
        }
        MatchCmd::Delete { id } => {
            let m = db.atomically(|db| engine::delete_match(db, id))?;
            println!(
                "Deleted match {id}; movements {} and {} are unreconciled again",
                m.bank_movement_id, m.aux_movement_id
            );
        }
    }
    Ok(())
}

fn handle_group(db: &mut Db, cmd: GroupCmd) -> Result<()> {
    match cmd {
        GroupCmd::List { job } => {
            require_job(db, job)?;
            let groupings = db.list_groupings(job)?;
            if groupings.is_empty() {
                println!("No manual groupings.");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = groupings
                .iter()
                .map(|g| {
                    vec![
                        g.id.to_string(),
                        join_ids(&g.bank_ids),
                        join_ids(&g.aux_ids),
                        g.created_at.to_rfc3339(),
                    ]
                })
                .collect();
            print_table(&["id", "bank", "auxiliary", "created_at"], &rows);
        }
        GroupCmd::Delete { id } => {
            let g = db.atomically(|db| engine::delete_manual_grouping(db, id))?;
            println!(
                "Deleted grouping {id}; {} movements are unreconciled again",
                g.bank_ids.len() + g.aux_ids.len()
            );
        }
    }
    Ok(())
}

fn handle_suggest(db: &Db, cfg: &AppConfig, args: SuggestArgs) -> Result<()> {
    let target = db
        .get_movement(args.movement_id)?
        .ok_or(ReconError::MovementNotFound(args.movement_id))?;
    let pool = db.get_unreconciled_movements(
        target.job_id,
        target.source.opposite(),
        target.direction,
    )?;
    let by_id: HashMap<i64, _> = pool.iter().map(|m| (m.id, m)).collect();

    let ranked = rank_candidates(&ComparisonRecord::from_movement(&target), &normalize(&pool));
    let limit = args.limit.unwrap_or(cfg.similarity_limit);
    let rows: Vec<Vec<String>> = ranked
        .into_iter()
        .take(limit)
        .filter_map(|s| {
            let m = by_id.get(&s.movement_id)?;
            Some(vec![
                m.id.to_string(),
                format!("{:.3}", s.score),
                m.date.clone(),
                m.value.to_string(),
                m.description.clone(),
            ])
        })
        .collect();

    if rows.is_empty() {
        println!(
            "No unreconciled {} {} movements to compare against.",
            target.source.opposite(),
            target.direction
        );
        return Ok(());
    }
    print_table(&["id", "score", "date", "value", "description"], &rows);
    Ok(())
}

fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    if headers.is_empty() {
        println!("(no columns)");
        return;
    }

    let cols = headers.len();
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();

    for row in rows {
        for (i, cell) in row.iter().take(cols).enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    fn print_row(cells: &[String], widths: &[usize]) {
        print!("|");
        for (i, w) in widths.iter().enumerate() {
            let cell = cells.get(i).map(String::as_str).unwrap_or("");
            print!(" {:width$} |", cell, width = *w);
        }
        println!();
    }

    fn print_sep(widths: &[usize]) {
        print!("|");
        for w in widths {
            print!("{}|", "-".repeat(w + 2));
        }
        println!();
    }

    let header_cells: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    print_row(&header_cells, &widths);
    print_sep(&widths);
    for row in rows {
        print_row(row, &widths);
    }
}

fn handle_ws(cmd: WsCmd, paths: &AppPaths, cfg: &mut AppConfig, cfg_path: &Path) -> Result<()> {
    match cmd {
        WsCmd::Check => {
            println!("You are currently in workspace: {}", cfg.current_workspace);
        }
        WsCmd::Add { name } => {
            // Creating a workspace is just creating its db.
            let _ = Db::open(paths, &name)?;
            println!("Added workspace: {name}");
        }
        WsCmd::Checkout { name } => {
            let _ = Db::open(paths, &name)?;
            cfg.current_workspace = name.clone();
            write_config(cfg_path, cfg)?;
            println!("Checked out workspace: {name}");
        }
    }
    Ok(())
}

fn require_job(db: &Db, job_id: i64) -> Result<()> {
    db.job_state(job_id)?.ok_or(ReconError::JobNotFound(job_id))?;
    Ok(())
}

fn read_import_file(path: &Path) -> Result<Vec<NewMovement>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Invalid movement rows in {}", path.display()))
}

fn parse_decimal(raw: &str, field: &'static str) -> Result<Decimal> {
    raw.trim()
        .parse::<Decimal>()
        .with_context(|| format!("Invalid decimal for {field}: {raw}"))
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
