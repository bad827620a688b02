use std::fs;
use std::path::Path;

use switchboard::{canonicalize_or_current, infer_output_name, parse_assignment, parse_number_pair, parse_u64, sha256_file};
use tempfile::tempdir;

#[test]
fn canonicalize_or_current_resolves_existing_relative_path() {
    let original = std::env::current_dir().expect("cwd");
    let tmp = tempdir().expect("tempdir");
    let subdir = tmp.path().join("nested");
    fs::create_dir_all(&subdir).expect("create nested");
    std::env::set_current_dir(tmp.path()).expect("chdir tmp");

    let result = canonicalize_or_current("nested").expect("canonicalize nested");
    assert_eq!(result, subdir.canonicalize().expect("canonicalize subdir"));

    std::env::set_current_dir(original).expect("restore cwd");
}

#[test]
fn canonicalize_or_current_joins_missing_paths() {
    let result = canonicalize_or_current("does-not-exist-yet").expect("join");
    assert!(result.is_absolute());
    assert!(result.ends_with("does-not-exist-yet"));
}

#[test]
fn infer_output_name_drops_the_extension() {
    assert_eq!(infer_output_name(Path::new("/tmp/out/libdemo.json")), "libdemo");
    assert_eq!(infer_output_name(Path::new("server.yaml")), "server");
    assert_eq!(infer_output_name(Path::new("/")), "a.out");
}

#[test]
fn sha256_file_hashes_contents() {
    let tmp = tempdir().expect("tempdir");
    let file = tmp.path().join("abc.txt");
    fs::write(&file, "abc").expect("write");
    assert_eq!(
        sha256_file(&file).expect("hash"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert!(sha256_file(&tmp.path().join("missing")).is_err());
}

#[test]
fn numbers_accept_decimal_and_hex() {
    assert_eq!(parse_u64("42").expect("dec"), 42);
    assert_eq!(parse_u64("0x4000").expect("hex"), 0x4000);
    assert_eq!(parse_u64("0X1_0000").expect("hex with separator"), 0x10000);
    assert!(parse_u64("zz").is_err());
}

#[test]
fn assignments_split_on_the_first_equals() {
    assert_eq!(parse_assignment("__noic_resolve_fn=7").expect("pair"), ("__noic_resolve_fn", "7"));
    assert_eq!(parse_number_pair("0x420018=0x7000").expect("numbers"), (0x420018, 0x7000));
    assert!(parse_assignment("novalue").is_err());
    assert!(parse_assignment("=3").is_err());
}
