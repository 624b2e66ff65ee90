use std::path::Path;
use std::process::Command;

fn run(fixture: &str, history_dir: Option<&Path>) -> (String, String, bool) {
    let path = format!("tests/fixtures/{fixture}");
    let mut command = Command::new(env!("CARGO_BIN_EXE_sas-eft"));
    command.arg(&path).env("RUST_LOG", "warn").env_remove("SAS_EFT_CONFIG");
    if let Some(dir) = history_dir {
        command.arg(dir);
    }
    let output = command.output().expect("failed to run binary");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

const HEADER: &str =
    "id,command,transaction,requested,reported,acknowledged,status,to_be_processed,timestamp";

#[test]
fn valid_script() {
    let (stdout, stderr, success) = run("valid.csv", None);

    assert!(success);
    assert!(stderr.is_empty(), "unexpected stderr: {stderr}");

    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[0], HEADER);
    assert_eq!(lines[1], "2,D3,2,25.00,25.00,true,operation_successful,false,800");
    assert_eq!(lines[2], "1,D0,1,100.00,100.00,true,operation_successful,false,0");
    assert_eq!(lines.len(), 3);
}

#[test]
fn implied_nack_leaves_transfer_unexecuted() {
    let (stdout, _, success) = run("nacked.csv", None);

    assert!(success);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[1], "2,D0,2,30.00,30.00,true,operation_successful,false,2000");
    assert_eq!(lines[2], "1,D0,1,50.00,50.00,false,operation_successful,false,0");
}

#[test]
fn resend_of_completed_transfer_is_not_executed_twice() {
    let (stdout, _, success) = run("resend.csv", None);

    assert!(success);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1], "1,D0,1,100.00,100.00,true,operation_successful,false,0");
}

#[test]
fn errors_warn_but_do_not_block() {
    let (stdout, stderr, success) = run("with_errors.csv", None);

    assert!(success);
    assert!(stderr.contains("unrecognized event"));
    assert!(stderr.contains("unrecognized command"));
    assert!(stderr.contains("missing millis"));

    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[0], HEADER);
    assert_eq!(lines[1], "1,D0,1,100.00,100.00,true,operation_successful,false,0");
}

#[test]
fn pending_transfer_is_recovered_on_restart() {
    let dir = tempfile::tempdir().unwrap();

    let (stdout, _, success) = run("pending.csv", Some(dir.path()));
    assert!(success);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[1], "1,D0,4,15.00,15.00,false,operation_successful,true,0");

    // same script again: recovery settles transfer 4 first, so both its
    // messages are resends
    let (stdout, _, success) = run("pending.csv", Some(dir.path()));
    assert!(success);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1], "1,D0,4,15.00,15.00,true,operation_successful,false,0");
}
