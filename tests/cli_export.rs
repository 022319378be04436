mod common;

use common::Fixture;
use predicates::prelude::*;
use std::fs;

#[test]
fn empty_keep_cannot_be_exported() {
    let fx = Fixture::new();
    fx.candidate("still-pending");

    fx.cmd()
        .arg("export")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("nothing to export"));
    assert!(!fx.results().join("exported_results.osc").exists());
}

#[test]
fn writes_default_file_with_config_tags() {
    let fx = Fixture::new();
    fx.candidate_in("keep", "b");
    fx.candidate_in("keep", "a");

    fx.cmd()
        .arg("export")
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote 2 features tagged golf=feature"))
        .stdout(predicate::str::contains("type/xml"));

    let body = fs::read_to_string(fx.results().join("exported_results.osc")).unwrap();
    assert!(body.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
    assert_eq!(body.matches("<way ").count(), 2);
    assert_eq!(body.matches("<tag k=\"golf\" v=\"feature\"/>").count(), 2);
}

#[test]
fn tag_flags_replace_config_tags() {
    let fx = Fixture::new();
    fx.candidate_in("keep", "a");

    fx.cmd()
        .args(["export", "--stdout", "--tag", "golf=bunker", "--tag", "surface=sand"])
        .assert()
        .success()
        .stdout(predicate::str::contains("<tag k=\"golf\" v=\"bunker\"/>"))
        .stdout(predicate::str::contains("<tag k=\"surface\" v=\"sand\"/>"))
        .stdout(predicate::str::contains("v=\"feature\"").not());
}

#[test]
fn invalid_tag_is_a_user_error() {
    let fx = Fixture::new();
    fx.candidate_in("keep", "a");

    fx.cmd()
        .args(["export", "--tag", "golf"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("invalid tag 'golf'"));
}

#[test]
fn writes_to_explicit_output() {
    let fx = Fixture::new();
    fx.candidate_in("keep", "a");
    let out = fx.dir.path().join("exports").join("golf.osc");

    fx.cmd()
        .args(["export", "--output"])
        .arg(&out)
        .assert()
        .success();
    assert!(fs::read_to_string(out).unwrap().contains("<osmChange version=\"0.6\""));
}

#[test]
fn discarded_and_pending_are_not_exported() {
    let fx = Fixture::new();
    fx.candidate_in("keep", "a");
    fx.candidate_in("discard", "b");
    fx.candidate("c");

    let output = fx.cmd().args(["export", "--stdout"]).output().unwrap();
    assert!(output.status.success());
    let body = String::from_utf8(output.stdout).unwrap();
    assert_eq!(body.matches("<way ").count(), 1);
}

#[test]
fn export_is_repeatable() {
    let fx = Fixture::new();
    fx.candidate_in("keep", "a");
    fx.candidate("b");

    let first = fx.cmd().args(["export", "--stdout"]).output().unwrap();
    fx.cmd().args(["keep", "b"]).assert().success();
    let second = fx.cmd().args(["export", "--stdout"]).output().unwrap();

    let count = |out: &[u8]| String::from_utf8_lossy(out).matches("<way ").count();
    assert_eq!(count(&first.stdout), 1);
    assert_eq!(count(&second.stdout), 2);
}
