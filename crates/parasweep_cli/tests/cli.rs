use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const COIN: &str = "\
# biased coin
type: dtmc
const p
states: 3
label heads: 1
0 -> 1 : p
0 -> 2 : 1 - p
";

fn write_model(dir: &TempDir, name: &str, text: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, text).unwrap();
    path
}

fn coin_cmd(dir: &TempDir) -> assert_cmd::Command {
    let model = write_model(dir, "coin.txt", COIN);
    let mut cmd = cargo_bin_cmd!("parasweep");
    cmd.arg("explicit")
        .arg(model)
        .arg("P=? [ F \"heads\" ]");
    cmd
}

#[test]
fn evaluates_a_valuation() {
    let dir = TempDir::new().unwrap();
    coin_cmd(&dir)
        .write_stdin("1:p=0.5\n")
        .assert()
        .success()
        .stdout("Parasweep_RESULT:1:0.5\n");
}

#[test]
fn method_directive_produces_no_output() {
    let dir = TempDir::new().unwrap();
    coin_cmd(&dir)
        .write_stdin("METHOD:ABOVI\n2:p=0.5\n")
        .assert()
        .success()
        .stdout("Parasweep_RESULT:2:0.5\n");
}

#[test]
fn bad_valuation_does_not_stop_the_loop() {
    let dir = TempDir::new().unwrap();
    coin_cmd(&dir)
        .write_stdin("3:p=notanumber\n4:p=1/4\n")
        .assert()
        .success()
        .stdout(
            predicate::str::starts_with("Parasweep_RESULT:3:ERROR invalid value")
                .and(predicate::str::ends_with("Parasweep_RESULT:4:0.25\n")),
        );
}

#[test]
fn invalid_utf8_is_answered_and_the_loop_continues() {
    let dir = TempDir::new().unwrap();
    coin_cmd(&dir)
        .write_stdin(b"1:p=0.5\n2:p=\xff\n3:p=0.25\n".to_vec())
        .assert()
        .success()
        .stdout(
            predicate::str::starts_with("Parasweep_RESULT:1:0.5\nParasweep_RESULT:2:ERROR")
                .and(predicate::str::ends_with("Parasweep_RESULT:3:0.25\n")),
        );
}

#[test]
fn terminator_as_first_line_emits_nothing() {
    let dir = TempDir::new().unwrap();
    coin_cmd(&dir)
        .write_stdin("EOF\n1:p=0.5\n")
        .assert()
        .success()
        .stdout("");
}

#[test]
fn options_and_initial_method() {
    let dir = TempDir::new().unwrap();
    coin_cmd(&dir)
        .arg("")
        .arg("lu")
        .arg("--options")
        .arg("OUTPUT-PRECISION=2")
        .write_stdin("1:p=1/3\nOPTIONS:OUTPUT-PRECISION=default,UNKNOWN=1\n2:p=0.5\n")
        .assert()
        .success()
        .stdout("Parasweep_RESULT:1:0.33\nParasweep_RESULT:2:0.5\n");
}

#[test]
fn constants_and_json_models() {
    let dir = TempDir::new().unwrap();
    let model = write_model(
        &dir,
        "retry.json",
        r#"{
            "type": "dtmc",
            "constants": [{"name": "p"}, {"name": "cost"}],
            "states": 2,
            "labels": {"goal": [1]},
            "rewards": [{"state": 0, "value": "cost"}],
            "transitions": [
                {"source": 0, "target": 1, "value": "p"},
                {"source": 0, "target": 0, "value": "1 - p"}
            ]
        }"#,
    );
    cargo_bin_cmd!("parasweep")
        .arg("json")
        .arg(model)
        .arg("R=? [ F \"goal\" ]")
        .arg("cost=2")
        .arg("lu")
        .write_stdin("a:p=0.5\nb:p=0\n")
        .assert()
        .success()
        .stdout("Parasweep_RESULT:a:4\nParasweep_RESULT:b:inf\n");
}

#[test]
fn nondeterministic_models() {
    let dir = TempDir::new().unwrap();
    let model = write_model(
        &dir,
        "choice.txt",
        "type: mdp\nconst p\nstates: 3\nlabel goal: 1\n\
         0 [a] -> 1 : p\n0 [a] -> 2 : 1 - p\n0 [b] -> 1 : 0.5\n0 [b] -> 2 : 0.5\n",
    );
    cargo_bin_cmd!("parasweep")
        .arg("explicit")
        .arg(model)
        .arg("Pmax=? [ F \"goal\" ]")
        .write_stdin("1:p=0.2\n2:p=0.8\n")
        .assert()
        .success()
        .stdout("Parasweep_RESULT:1:0.5\nParasweep_RESULT:2:0.8\n");
}

#[test]
fn unknown_model_kind_exits_before_reading_the_model() {
    cargo_bin_cmd!("parasweep")
        .arg("pepa")
        .arg("/nonexistent/model")
        .arg("P=? [ F \"goal\" ]")
        .write_stdin("1:p=0.5\n")
        .assert()
        .code(255)
        .stdout("");
}

#[test]
fn unsupported_model_types_have_distinct_exit_codes() {
    let dir = TempDir::new().unwrap();
    let pomdp = write_model(&dir, "pomdp.txt", "type: pomdp\nstates: 1\n");
    cargo_bin_cmd!("parasweep")
        .arg("explicit")
        .arg(pomdp)
        .arg("Pmax=? [ F \"init\" ]")
        .assert()
        .code(254)
        .stdout("");

    let ma = write_model(&dir, "ma.txt", "type: ma\nstates: 1\n");
    cargo_bin_cmd!("parasweep")
        .arg("explicit")
        .arg(ma)
        .arg("Pmax=? [ F \"init\" ]")
        .assert()
        .code(253)
        .stdout("");
}

#[test]
fn other_startup_failures_exit_with_one() {
    let dir = TempDir::new().unwrap();
    cargo_bin_cmd!("parasweep")
        .arg("explicit")
        .arg(dir.path().join("missing.txt"))
        .arg("P=? [ F \"heads\" ]")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to read model file"));

    coin_cmd(&dir)
        .arg("")
        .arg("vi")
        .arg("--options")
        .arg("MAX-ITER=0")
        .assert()
        .code(1);

    let model = write_model(&dir, "coin2.txt", COIN);
    cargo_bin_cmd!("parasweep")
        .arg("explicit")
        .arg(model)
        .arg("P=? [ F \"tails\" ]")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("tails"));
}
