#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use anyhow::Result;
use assert_cmd::Command;
use tempfile::tempdir;

use util::*;

fn seed_pair(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let main = dir.join("main.db");
    let copy = dir.join("copy.db");
    let m = create_tracker(&main);
    insert_quote(&m, 1, "Q1", "Acme (main)", "2024-01-05 00:00:00");
    insert_quote(&m, 2, "Q2", "Birch", "2024-01-01 00:00:00");
    insert_note(&m, 1, "main note");
    let c = create_tracker(&copy);
    insert_quote(&c, 1, "Q1", "Acme (copy)", "2024-01-09 00:00:00");
    insert_quote(&c, 2, "Q3", "Cedar", "2024-01-02 00:00:00");
    insert_note(&c, 1, "copy note");
    (main, copy)
}

#[test]
fn merge_cli_prints_summary_and_exits_zero() -> Result<()> {
    let tmp = tempdir()?;
    let (main, copy) = seed_pair(tmp.path());
    let output = tmp.path().join("merged.db");

    let out = Command::cargo_bin("quote-merge")?
        .arg("merge")
        .arg("--main")
        .arg(&main)
        .arg("--copy")
        .arg(&copy)
        .arg("--output")
        .arg(&output)
        .output()?;
    assert!(
        out.status.success(),
        "stdout: {}\nstderr: {}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("1 unique to main, 1 unique to copy, 1 overlapping"));
    assert!(stdout.contains("Primary rows: 3"));
    assert!(stdout.contains("Integrity violations: 0"));
    assert!(stdout.contains("Status: success"));
    assert!(output.exists());
    Ok(())
}

#[test]
fn merge_cli_json_and_report_file() -> Result<()> {
    let tmp = tempdir()?;
    let (main, copy) = seed_pair(tmp.path());
    let output = tmp.path().join("merged.db");
    let report_file = tmp.path().join("reports").join("merge.json");

    let out = Command::cargo_bin("quote-merge")?
        .arg("merge")
        .arg("--main")
        .arg(&main)
        .arg("--copy")
        .arg(&copy)
        .arg("--output")
        .arg(&output)
        .arg("--json")
        .arg("--report-file")
        .arg(&report_file)
        .output()?;
    assert!(out.status.success());

    let report: serde_json::Value = serde_json::from_slice(&out.stdout)?;
    assert_eq!(report["status"], "success");
    assert_eq!(report["finalPrimaryCount"], 3);
    assert_eq!(report["decisions"]["overlapping"], 1);
    assert_eq!(report["backups"].as_array().map(Vec::len), Some(2));

    let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&report_file)?)?;
    assert_eq!(saved["runId"], report["runId"]);
    Ok(())
}

#[test]
fn plan_cli_lists_conflicts_without_writing() -> Result<()> {
    let tmp = tempdir()?;
    let (main, copy) = seed_pair(tmp.path());

    let out = Command::cargo_bin("quote-merge")?
        .arg("plan")
        .arg("--main")
        .arg(&main)
        .arg("--copy")
        .arg(&copy)
        .output()?;
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Merge plan"));
    assert!(stdout.contains("Q1"));
    assert!(stdout.contains("copy"));

    let backups = std::fs::read_dir(tmp.path())?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().contains(".backup_"))
        .count();
    assert_eq!(backups, 0);
    Ok(())
}

#[test]
fn merge_cli_reports_missing_input_and_exits_one() -> Result<()> {
    let tmp = tempdir()?;
    let (main, _) = seed_pair(tmp.path());

    let out = Command::cargo_bin("quote-merge")?
        .arg("merge")
        .arg("--main")
        .arg(&main)
        .arg("--copy")
        .arg(tmp.path().join("absent.db"))
        .arg("--output")
        .arg(tmp.path().join("merged.db"))
        .output()?;
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("MERGE/INPUT_MISSING"), "stderr: {stderr}");
    Ok(())
}

#[test]
fn custom_dependent_spec_is_accepted_and_bad_ones_rejected() -> Result<()> {
    let tmp = tempdir()?;
    let (main, copy) = seed_pair(tmp.path());

    let ok = Command::cargo_bin("quote-merge")?
        .arg("merge")
        .arg("--main")
        .arg(&main)
        .arg("--copy")
        .arg(&copy)
        .arg("--output")
        .arg(tmp.path().join("notes_only.db"))
        .args(["--dependent", "notes:quote_id", "--reference", "default_tasks"])
        .arg("--json")
        .output()?;
    assert!(ok.status.success());
    let report: serde_json::Value = serde_json::from_slice(&ok.stdout)?;
    let tables: Vec<&str> = report["tables"]
        .as_array()
        .expect("tables array")
        .iter()
        .filter_map(|table| table["table"].as_str())
        .collect();
    assert_eq!(tables, vec!["default_tasks", "quotes", "notes"]);

    let bad = Command::cargo_bin("quote-merge")?
        .arg("merge")
        .arg("--main")
        .arg(&main)
        .arg("--copy")
        .arg(&copy)
        .arg("--output")
        .arg(tmp.path().join("never.db"))
        .args(["--dependent", "notes;drop"])
        .output()?;
    assert!(!bad.status.success());
    assert!(!tmp.path().join("never.db").exists());
    Ok(())
}
