use std::fs;

use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn backends_lists_pattern_scanner() {
    assert_cmd::cargo::cargo_bin_cmd!("switchboard")
        .arg("backends")
        .assert()
        .success()
        .stdout(predicate::str::contains("Backends:"))
        .stdout(predicate::str::contains("- pattern:"));
}

#[test]
fn backends_json_is_sorted() {
    let out = assert_cmd::cargo::cargo_bin_cmd!("switchboard")
        .arg("backends")
        .arg("--json")
        .output()
        .expect("run backends");
    assert!(out.status.success());
    let entries: Vec<serde_json::Value> = serde_json::from_slice(&out.stdout).expect("json");
    let names: Vec<&str> = entries.iter().filter_map(|e| e["name"].as_str()).collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
    assert!(names.contains(&"pattern"));
}

#[test]
fn scan_binary_fails_for_missing_file() {
    let dir = tempdir().expect("tempdir");
    assert_cmd::cargo::cargo_bin_cmd!("switchboard")
        .arg("scan-binary")
        .arg(dir.path().join("missing.elf"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Binary not found"));
}

#[test]
fn scan_binary_rejects_non_elf_input() {
    let dir = tempdir().expect("tempdir");
    let junk = dir.path().join("junk.bin");
    fs::write(&junk, b"definitely not an elf file").expect("write junk");
    assert_cmd::cargo::cargo_bin_cmd!("switchboard")
        .arg("scan-binary")
        .arg(&junk)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cannot parse"));
}

#[test]
fn scan_binary_rejects_unknown_backend() {
    let dir = tempdir().expect("tempdir");
    let junk = dir.path().join("junk.bin");
    fs::write(&junk, b"x").expect("write junk");
    assert_cmd::cargo::cargo_bin_cmd!("switchboard")
        .arg("scan-binary")
        .arg(&junk)
        .arg("--backend")
        .arg("ghidra")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Scan backend not found: ghidra"));
}
