//! Accounts event validation

use anyhow::{Context, Result};
use detector_lib::processor::parse_event;
use std::path::Path;
use tabled::Tabled;

use crate::output::{print_error, print_rows, print_success, OutputFormat};

#[derive(Tabled)]
struct AccountRow {
    #[tabled(rename = "Id")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Email")]
    email: String,
}

/// Validate an accounts event file; an invalid event is an error exit
pub fn validate_event(file: &Path, format: OutputFormat) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let accounts = match parse_event(&raw) {
        Ok(accounts) => accounts,
        Err(e) => {
            print_error(&format!("{}: {}", file.display(), e));
            return Err(e).context("event validation failed");
        }
    };

    if format == OutputFormat::Table {
        print_success(&format!("{} accounts valid", accounts.len()));
    }
    let rows: Vec<AccountRow> = accounts
        .iter()
        .map(|a| AccountRow {
            id: a.id.clone(),
            name: a.name.clone(),
            email: a.email.clone(),
        })
        .collect();
    print_rows(&rows, &accounts, format)
}
