use std::fs;

use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn sled_sim_routes_learned_and_registered_identifiers() {
    assert_cmd::cargo::cargo_bin_cmd!("switchboard")
        .arg("sled-sim")
        .arg("--capacity")
        .arg("64")
        .arg("--resolver")
        .arg("0x410000")
        .arg("--handler")
        .arg("0x400800:100:200")
        .arg("--learn")
        .arg("5=0x401000")
        .arg("--route")
        .arg("5")
        .arg("--route")
        .arg("150")
        .arg("--route")
        .arg("7")
        .assert()
        .success()
        .stdout(predicate::str::contains("2 entries (partial)"))
        .stdout(predicate::str::contains("- 5 -> 0x401000"))
        .stdout(predicate::str::contains("- 150 -> 0x400800"))
        .stdout(predicate::str::contains("- 7 -> fallback"));
}

#[test]
fn sled_sim_without_resolver_traps() {
    let out = assert_cmd::cargo::cargo_bin_cmd!("switchboard")
        .arg("sled-sim")
        .arg("--capacity")
        .arg("32")
        .arg("--route")
        .arg("9")
        .arg("--json")
        .output()
        .expect("run sled-sim");
    assert!(out.status.success());
    let outcome: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json");
    assert_eq!(outcome["state"], "empty");
    assert_eq!(outcome["routes"][0]["route"], "trap");
}

#[test]
fn sled_sim_reports_full_before_and_wrap_after() {
    let run = |learn: &[&str]| {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("switchboard");
        cmd.arg("sled-sim").arg("--capacity").arg("12").arg("--resolver").arg("0x410000").arg("--json");
        for entry in learn {
            cmd.arg("--learn").arg(entry);
        }
        let out = cmd.output().expect("run sled-sim");
        assert!(out.status.success());
        serde_json::from_slice::<serde_json::Value>(&out.stdout).expect("json")
    };

    let full = run(&["1=0x401000", "2=0x402000"]);
    assert_eq!(full["state"], "full");
    assert_eq!(full["wrapped"], false);

    let wrapped = run(&["1=0x401000", "2=0x402000", "3=0x403000"]);
    assert_eq!(wrapped["state"], "partial");
    assert_eq!(wrapped["wrapped"], true);
    assert_eq!(wrapped["entries"], 3);
    assert_eq!(wrapped["live"], 1);
}

#[test]
fn sled_sim_rejects_overlapping_ranges() {
    assert_cmd::cargo::cargo_bin_cmd!("switchboard")
        .arg("sled-sim")
        .arg("--capacity")
        .arg("64")
        .arg("--handler")
        .arg("0x400800:100:200")
        .arg("--handler")
        .arg("0x400900:150:300")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to register handler 0x400900:150:300"));
}

fn x86_table(base: u64, got: u64, entries: usize) -> Vec<u8> {
    let mut bytes = vec![0x90u8; 16];
    for i in 0..entries {
        let addr = base + 16 + 16 * i as u64;
        let slot = got + 8 * i as u64;
        let disp = (slot as i64 - (addr as i64 + 6)) as i32;
        let mut entry = vec![0xff, 0x25];
        entry.extend_from_slice(&disp.to_le_bytes());
        entry.resize(16, 0x90);
        bytes.extend(entry);
    }
    bytes
}

#[test]
fn plt_sim_patches_resolved_entries() {
    let dir = tempdir().expect("tempdir");
    let table = dir.path().join("plt.bin");
    let patched = dir.path().join("plt.patched.bin");
    fs::write(&table, x86_table(0x401000, 0x404000, 2)).expect("write table");

    assert_cmd::cargo::cargo_bin_cmd!("switchboard")
        .arg("plt-sim")
        .arg("--arch")
        .arg("x86_64")
        .arg("--table")
        .arg(&table)
        .arg("--base")
        .arg("0x401000")
        .arg("--slot")
        .arg("0x404000=0x402000")
        .arg("--slot")
        .arg("0x404008=0")
        .arg("--output")
        .arg(&patched)
        .assert()
        .success()
        .stdout(predicate::str::contains("Entries: 2 (1 patched)"))
        .stdout(predicate::str::contains("- 0x401010: direct branch"))
        .stdout(predicate::str::contains("- 0x401020: slot not resolved yet"));

    let bytes = fs::read(&patched).expect("patched table");
    assert_eq!(bytes[16], 0xe9);
    assert_eq!(&bytes[32..34], &[0xff, 0x25]);
}

#[test]
fn plt_sim_reports_missing_slots() {
    let dir = tempdir().expect("tempdir");
    let table = dir.path().join("plt.bin");
    fs::write(&table, x86_table(0x401000, 0x404000, 1)).expect("write table");

    assert_cmd::cargo::cargo_bin_cmd!("switchboard")
        .arg("plt-sim")
        .arg("--arch")
        .arg("x86_64")
        .arg("--table")
        .arg(&table)
        .arg("--base")
        .arg("0x401000")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not readable"));
}
