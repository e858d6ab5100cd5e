use crate::domain::account::AccountId;
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

/// One ledger operation requested by a CSV row.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Open {
        account: AccountId,
    },
    TopUp {
        account: AccountId,
        amount: Decimal,
    },
    Payment {
        account: AccountId,
        amount: Decimal,
        remarks: String,
    },
    Transfer {
        from: AccountId,
        to: AccountId,
        amount: Decimal,
        remarks: String,
    },
}

#[derive(Debug, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum CommandType {
    Open,
    Topup,
    Payment,
    Transfer,
}

#[derive(Debug, Deserialize)]
struct CommandRecord {
    r#type: CommandType,
    account: String,
    #[serde(default)]
    counterparty: Option<String>,
    #[serde(default)]
    amount: Option<Decimal>,
    #[serde(default)]
    remarks: Option<String>,
}

impl TryFrom<CommandRecord> for Command {
    type Error = LedgerError;

    fn try_from(record: CommandRecord) -> Result<Self> {
        let account = AccountId::parse(record.account)?;
        let amount = || {
            record
                .amount
                .ok_or_else(|| LedgerError::invalid(format!("{:?} row needs an amount", record.r#type)))
        };
        let remarks = record.remarks.clone().unwrap_or_default();

        Ok(match record.r#type {
            CommandType::Open => Command::Open { account },
            CommandType::Topup => Command::TopUp {
                account,
                amount: amount()?,
            },
            CommandType::Payment => Command::Payment {
                account,
                amount: amount()?,
                remarks,
            },
            CommandType::Transfer => {
                let to = record
                    .counterparty
                    .clone()
                    .filter(|raw| !raw.is_empty())
                    .ok_or_else(|| LedgerError::invalid("transfer row needs a counterparty"))?;
                Command::Transfer {
                    from: account,
                    to: AccountId::parse(to)?,
                    amount: amount()?,
                    remarks,
                }
            }
        })
    }
}

/// Reads ledger commands from a CSV source with the header
/// `type, account, counterparty, amount, remarks`.
///
/// Fields are trimmed and trailing columns may be omitted.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily parses rows; a bad row yields an error without ending the stream.
    pub fn commands(self) -> impl Iterator<Item = Result<Command>> {
        self.reader
            .into_deserialize::<CommandRecord>()
            .map(|result| result.map_err(LedgerError::from).and_then(Command::try_from))
    }
}
