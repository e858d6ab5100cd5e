use crate::domain::account::Account;
use crate::domain::ledger::LedgerEntry;
use crate::error::Result;
use std::io::Write;

/// Writes account balances and ledger history as CSV.
pub struct AccountWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> AccountWriter<W> {
    pub fn new(sink: W) -> Self {
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(sink);
        Self { writer }
    }

    /// `account,balance` rows in the order given.
    pub fn write_accounts(&mut self, accounts: &[Account]) -> Result<()> {
        self.writer.write_record(["account", "balance"])?;
        for account in accounts {
            let balance = account.balance.to_string();
            self.writer
                .write_record([account.id.as_str(), balance.as_str()])?;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_history(&mut self, entries: &[LedgerEntry]) -> Result<()> {
        self.writer.write_record([
            "id",
            "account",
            "type",
            "status",
            "amount",
            "balance_before",
            "balance_after",
            "counterparty",
            "reference_id",
            "remarks",
            "created_at",
        ])?;
        for entry in entries {
            self.writer.write_record([
                entry.id.to_string(),
                entry.account_id.to_string(),
                entry.entry_type.to_string(),
                entry.status.to_string(),
                entry.amount.to_string(),
                entry.balance_before.to_string(),
                entry.balance_after.to_string(),
                entry
                    .counterparty_account_id
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                entry.reference_id.map(|id| id.to_string()).unwrap_or_default(),
                entry.remarks.clone(),
                entry.created_at.to_rfc3339(),
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
