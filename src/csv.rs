use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::Amount;
use crate::egm::DisableReason;
use crate::model::{EftCommand, HistoryLogEntry, TransactionNumber, TransferRequest};
use crate::session::ScriptEvent;

/// Errors that can occur when reading a host script
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open script: {0}")]
    Open(#[source] csv::Error),

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized event '{event}'")]
    UnrecognizedEvent { line: usize, event: String },

    #[error("line {line}: unrecognized command '{command}'")]
    UnrecognizedCommand { line: usize, command: String },

    #[error("line {line}: {event} missing {field}")]
    MissingField {
        line: usize,
        event: String,
        field: &'static str,
    },
}

#[derive(Debug, Deserialize)]
struct InputRow {
    event: String,
    command: Option<String>,
    transaction: Option<TransactionNumber>,
    amount: Option<u64>,
    ack: Option<bool>,
    millis: Option<u64>,
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    id: u64,
    command: EftCommand,
    transaction: TransactionNumber,
    requested: String,
    reported: String,
    acknowledged: bool,
    status: &'static str,
    to_be_processed: bool,
    timestamp: u64,
}

/// Read host script events from a csv file
pub fn read_script(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<ScriptEvent, CsvError>>, CsvError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(CsvError::Open)?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            parse_event(line, row)
        }))
}

fn parse_event(line: usize, row: InputRow) -> Result<ScriptEvent, CsvError> {
    let missing = |field| CsvError::MissingField {
        line,
        event: row.event.clone(),
        field,
    };

    let event = match row.event.as_str() {
        "command" => {
            let raw = row.command.as_deref().ok_or_else(|| missing("command"))?;
            let command = raw
                .parse::<EftCommand>()
                .map_err(|command| CsvError::UnrecognizedCommand { line, command })?;
            let transaction = row.transaction.ok_or_else(|| missing("transaction"))?;
            let amount = row.amount.ok_or_else(|| missing("amount"))?;
            ScriptEvent::Command(TransferRequest::new(
                command,
                transaction,
                Amount::from_cents(amount),
                row.ack.unwrap_or(false),
            ))
        }
        "advance" => {
            let millis = row.millis.ok_or_else(|| missing("millis"))?;
            ScriptEvent::Advance(Duration::from_millis(millis))
        }
        "implied_ack" => ScriptEvent::ImpliedAck,
        "implied_nack" => ScriptEvent::ImpliedNack,
        "reack" => ScriptEvent::ReAck,
        "door_open" => ScriptEvent::DoorOpen(true),
        "door_closed" => ScriptEvent::DoorOpen(false),
        "game_start" => ScriptEvent::GameIdle(false),
        "game_end" => ScriptEvent::GameIdle(true),
        "disable" | "enable" => {
            let reason = DisableReason::new(row.reason.clone().ok_or_else(|| missing("reason"))?);
            if row.event == "disable" {
                ScriptEvent::Disable(reason)
            } else {
                ScriptEvent::Enable(reason)
            }
        }
        other => {
            return Err(CsvError::UnrecognizedEvent {
                line,
                event: other.to_string(),
            });
        }
    };
    Ok(event)
}

/// Write history entries, newest first, in csv format
pub fn write_history(
    writer: impl io::Write,
    entries: impl IntoIterator<Item = HistoryLogEntry>,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);

    for entry in entries {
        let row = OutputRow {
            id: entry.id,
            command: entry.command,
            transaction: entry.transaction_number,
            requested: entry.requested_amount.to_string(),
            reported: entry.reported_amount.to_string(),
            acknowledged: entry.acknowledgement,
            status: entry.reported_status.as_str(),
            to_be_processed: entry.to_be_processed,
            timestamp: entry.timestamp_ms,
        };
        writer.serialize(&row)?;
    }

    writer.flush()?;
    Ok(())
}
