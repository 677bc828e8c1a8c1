//! Output formatting utilities

use crate::OutputFormat;
use bundlefetch_types::{CacheRecord, VerifyResult};
use console::style;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Print a value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

pub fn success(message: impl std::fmt::Display) {
    println!("{} {}", style("✓").green().bold(), message);
}

pub fn failure(message: impl std::fmt::Display) {
    println!("{} {}", style("✗").red().bold(), message);
}

#[derive(Tabled)]
struct RecordRow {
    key: String,
    size: String,
    crc: String,
    verified: String,
}

pub fn print_records(records: &[CacheRecord], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(records)?,
        OutputFormat::Table => {
            let rows: Vec<RecordRow> = records
                .iter()
                .map(|r| RecordRow {
                    key: r.key.clone(),
                    size: format_bytes(r.size),
                    crc: r.crc.clone(),
                    verified: r.verified_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                })
                .collect();
            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if records.is_empty() {
                println!("{}", style("No cached entries").dim());
                return Ok(());
            }
            for record in records {
                println!(
                    "{} {} {}",
                    style("•").cyan(),
                    style(&record.key).bold(),
                    style(format_bytes(record.size)).dim()
                );
            }
            println!();
            println!(
                "{} entr{} total",
                style(records.len()).bold(),
                if records.len() == 1 { "y" } else { "ies" }
            );
        }
    }
    Ok(())
}

#[derive(Serialize, Tabled)]
pub struct VerifyRow {
    pub key: String,
    pub result: VerifyResult,
}

pub fn print_verify_results(rows: &[VerifyRow], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(rows)?,
        OutputFormat::Table => println!("{}", Table::new(rows)),
        OutputFormat::Human => {
            for row in rows {
                if row.result.is_success() {
                    success(&row.key);
                } else {
                    failure(format!("{}: {}", row.key, row.result));
                }
            }
        }
    }
    Ok(())
}
