use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;

fn accounts_file(rows: &[&str]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "account, balance, currency").unwrap();
    for row in rows {
        writeln!(file, "{}", row).unwrap();
    }
    file
}

fn transfers_file(rows: &[&str]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "sender, receiver, amount, currency").unwrap();
    for row in rows {
        writeln!(file, "{}", row).unwrap();
    }
    file
}

#[test]
fn test_exact_balance_can_be_sent() {
    let accounts = accounts_file(&["a, 1000000.0000, INR", "b, 0, INR"]);
    let transfers = transfers_file(&["a, b, 1000000, INR", "a, b, 0.0001, INR"]);

    let mut cmd = Command::new(cargo_bin!("fundsflow"));
    cmd.arg(transfers.path()).arg("--accounts").arg(accounts.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("a,0,INR"))
        .stdout(predicate::str::contains("b,1000000,INR"));
}

#[test]
fn test_extreme_decimal_precision() {
    let accounts = accounts_file(&["a, 1, INR", "b, 0, INR"]);
    let transfers = transfers_file(&["a, b, 0.0001, INR", "a, b, 0.0001, INR"]);

    let mut cmd = Command::new(cargo_bin!("fundsflow"));
    cmd.arg(transfers.path()).arg("--accounts").arg(accounts.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("a,0.9998,INR"))
        .stdout(predicate::str::contains("b,0.0002,INR"));
}

#[test]
fn test_zero_and_negative_amounts_move_nothing() {
    let accounts = accounts_file(&["a, 10, INR", "b, 10, INR"]);
    let transfers = transfers_file(&["a, b, 0, INR", "a, b, -5, INR"]);

    let mut cmd = Command::new(cargo_bin!("fundsflow"));
    cmd.arg(transfers.path()).arg("--accounts").arg(accounts.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("a,10,INR"))
        .stdout(predicate::str::contains("b,10,INR"));
}
