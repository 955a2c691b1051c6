use rand::Rng;
use std::fs::File;
use std::io::Error;
use std::path::Path;

pub const ACCOUNTS: usize = 50;
pub const OPENING_BALANCE: u32 = 1_000;

pub fn account_name(i: usize) -> String {
    format!("acc-{:02}", i)
}

/// Writes `ACCOUNTS` accounts, each opened with `OPENING_BALANCE` INR.
pub fn generate_accounts(path: &Path) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    wtr.write_record(["account", "balance", "currency"])?;
    for i in 1..=ACCOUNTS {
        wtr.write_record([account_name(i).as_str(), &OPENING_BALANCE.to_string(), "INR"])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes `rows` transfers of 1.0 INR from the first account to the second.
pub fn generate_transfers(path: &Path, rows: usize) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    wtr.write_record(["sender", "receiver", "amount", "currency"])?;
    for _ in 0..rows {
        wtr.write_record([account_name(1).as_str(), &account_name(2), "1.0", "INR"])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes `rows` transfers between random accounts with random amounts.
///
/// Some rows are self-transfers or overdraw the sender; the engine is expected
/// to fail those without touching balances.
pub fn generate_random_transfers(path: &Path, rows: usize) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    wtr.write_record(["sender", "receiver", "amount", "currency"])?;

    let mut rng = rand::thread_rng();
    for _ in 0..rows {
        let sender = rng.gen_range(1..=ACCOUNTS);
        let receiver = rng.gen_range(1..=ACCOUNTS);
        let cents: u32 = rng.gen_range(1..=(OPENING_BALANCE * 100));
        let amount = format!("{}.{:02}", cents / 100, cents % 100);
        wtr.write_record([
            account_name(sender).as_str(),
            &account_name(receiver),
            &amount,
            "INR",
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
