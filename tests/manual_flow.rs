use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

fn conciliar_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("conciliar"))
}

fn run_ok_out(home: &tempfile::TempDir, args: &[&str]) -> String {
    let mut cmd = conciliar_cmd();
    cmd.env("CONCILIAR_HOME", home.path());
    cmd.args(args);
    let out = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(out).expect("utf8 stdout")
}

fn import(home: &tempfile::TempDir, rows: &str) {
    let file = home.path().join("rows.json");
    std::fs::write(&file, rows).expect("write rows");
    let out = run_ok_out(
        home,
        &["movement", "import", "--job", "1", file.to_str().expect("utf8 path")],
    );
    assert!(out.contains("Imported"), "{out}");
}

fn new_job() -> tempfile::TempDir {
    let home = tempfile::tempdir().expect("tempdir");
    run_ok_out(&home, &["job", "create", "--name", "Manual"]);
    home
}

#[test]
fn import_accepts_legacy_codes_and_signed_values() {
    let home = new_job();
    import(
        &home,
        r#"[
            {"date": "15/11/2024", "description": "Nomina", "value": "-150000", "source": "banco", "direction": "S"},
            {"date": "2024-11-15", "value": 150000, "source": "aux", "direction": "out"}
        ]"#,
    );

    let out = run_ok_out(&home, &["movement", "list", "--job", "1", "--source", "bank"]);
    assert!(out.contains("outflow"));
    assert!(out.contains("150000"));
    assert!(!out.contains("-150000"));
    assert!(out.contains("Nomina"));
    assert!(!out.contains("auxiliary"));
}

#[test]
fn malformed_import_writes_nothing() {
    let home = new_job();
    let file = home.path().join("bad.json");
    std::fs::write(&file, r#"[{"date": "2024-11-15", "value": "abc"}]"#).expect("write");

    let mut cmd = conciliar_cmd();
    cmd.env("CONCILIAR_HOME", home.path());
    cmd.args(["movement", "import", "--job", "1", file.to_str().expect("utf8 path")]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Invalid movement rows"));

    let out = run_ok_out(&home, &["movement", "list", "--job", "1"]);
    assert!(out.contains("No movements."));
}

#[test]
fn manual_grouping_resolves_many_to_one_without_matches() {
    let home = new_job();
    import(
        &home,
        r#"[
            {"date": "2024-11-01", "value": "10", "source": "bank", "direction": "outflow"},
            {"date": "2024-11-02", "value": "20", "source": "bank", "direction": "outflow"},
            {"date": "2024-11-03", "value": "30", "source": "auxiliary", "direction": "outflow"}
        ]"#,
    );

    let out = run_ok_out(
        &home,
        &["reconcile", "manual", "1", "--bank", "1", "2", "--aux", "3"],
    );
    assert!(out.contains("Created grouping 1 (2 bank, 1 auxiliary)"), "{out}");

    let out = run_ok_out(&home, &["match", "list", "1"]);
    assert!(out.contains("No matches."));

    let out = run_ok_out(&home, &["group", "list", "1"]);
    assert!(out.contains("1,2"));

    let out = run_ok_out(&home, &["job", "show", "1"]);
    assert!(out.contains("Reconciled: 3"));
    assert!(out.contains("Manual groupings: 1"));

    // Grouped movements cannot be deleted out from under the grouping.
    let mut cmd = conciliar_cmd();
    cmd.env("CONCILIAR_HOME", home.path());
    cmd.args(["movement", "delete", "2"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("belongs to manual grouping 1"));

    let out = run_ok_out(&home, &["group", "delete", "1"]);
    assert!(out.contains("3 movements are unreconciled again"));
    let out = run_ok_out(&home, &["job", "show", "1"]);
    assert!(out.contains("Reconciled: 0"));
}

#[test]
fn manual_grouping_skips_invalid_ids_and_rejects_empty_result() {
    let home = new_job();
    import(
        &home,
        r#"[
            {"date": "2024-11-01", "value": "10", "source": "bank", "direction": "inflow"},
            {"date": "2024-11-01", "value": "10", "source": "auxiliary", "direction": "inflow"}
        ]"#,
    );

    let out = run_ok_out(
        &home,
        &["reconcile", "manual", "1", "--bank", "1", "2", "99"],
    );
    assert!(out.contains("Created grouping 1 (1 bank, 0 auxiliary)"), "{out}");
    assert!(out.contains("Skipped movements: 2,99"), "{out}");

    let mut cmd = conciliar_cmd();
    cmd.env("CONCILIAR_HOME", home.path());
    cmd.args(["reconcile", "manual", "1", "--bank", "1"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Manual grouping rejected"));
}

#[test]
fn deleting_a_match_lets_the_next_run_pair_again() {
    let home = new_job();
    import(
        &home,
        r#"[
            {"date": "2024-11-15", "value": "700", "source": "bank", "direction": "inflow"},
            {"date": "2024-11-15", "value": "700", "source": "auxiliary", "direction": "inflow"}
        ]"#,
    );
    run_ok_out(&home, &["reconcile", "run", "1"]);

    let out = run_ok_out(&home, &["match", "delete", "1"]);
    assert!(out.contains("movements 1 and 2 are unreconciled again"), "{out}");

    let out = run_ok_out(&home, &["reconcile", "run", "1"]);
    assert!(out.contains("Matches: 1 (exact 1, approximate 0)"), "{out}");
}

#[test]
fn deleting_a_matched_movement_releases_its_counterpart() {
    let home = new_job();
    import(
        &home,
        r#"[
            {"date": "2024-11-15", "value": "700", "source": "bank", "direction": "inflow"},
            {"date": "2024-11-15", "value": "700", "source": "auxiliary", "direction": "inflow"}
        ]"#,
    );
    run_ok_out(&home, &["reconcile", "run", "1"]);

    run_ok_out(&home, &["movement", "delete", "1"]);
    let out = run_ok_out(&home, &["match", "list", "1"]);
    assert!(out.contains("No matches."));
    let out = run_ok_out(&home, &["job", "show", "1"]);
    assert!(out.contains("Movements: 1"));
    assert!(out.contains("Pending: 1"));
}

#[test]
fn suggest_ranks_opposite_side_by_description() {
    let home = new_job();
    import(
        &home,
        r#"[
            {"date": "2024-11-15", "description": "Proveedor Insumos ACME factura 99812", "value": "1000", "source": "bank", "direction": "outflow"},
            {"date": "2024-11-20", "description": "Arriendo local", "value": "400", "source": "auxiliary", "direction": "outflow"},
            {"date": "2024-11-22", "description": "ACME insumos fact 99812", "value": "990", "source": "auxiliary", "direction": "outflow"},
            {"date": "2024-11-22", "description": "ACME insumos", "value": "990", "source": "auxiliary", "direction": "inflow"}
        ]"#,
    );

    let out = run_ok_out(&home, &["suggest", "1", "--limit", "1"]);
    assert!(out.contains("ACME insumos fact 99812"), "{out}");
    assert!(!out.contains("Arriendo"), "{out}");

    let out = run_ok_out(&home, &["suggest", "1"]);
    assert!(out.contains("Arriendo local"), "{out}");
    assert!(!out.contains("inflow"), "{out}");

    // Suggestions never record anything.
    let out = run_ok_out(&home, &["match", "list", "1"]);
    assert!(out.contains("No matches."));
}
