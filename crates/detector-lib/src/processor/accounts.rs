//! Account event validation and the failed-account registry

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};

use crate::clock::Clock;
use crate::error::EventValidationError;
use crate::models::Account;
use crate::observability::DetectorMetrics;
use crate::store::{StoreClient, StoreItem};

/// Stored error messages are cut to this many characters
const MAX_ERROR_CHARS: usize = 200;

const REQUIRED_FIELDS: [&str; 3] = ["Id", "Name", "Email"];

/// Parse and validate a raw `{"accounts": [...]}` event
pub fn parse_event(raw: &str) -> Result<Vec<Account>, EventValidationError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| EventValidationError::Json(e.to_string()))?;
    validate_event(&value)
}

/// Validate an accounts event
///
/// `accounts` must be a list of objects, each with a non-empty string `Id`
/// and string `Name` and `Email`. The first violation is reported with the
/// offending index.
pub fn validate_event(event: &Value) -> Result<Vec<Account>, EventValidationError> {
    let object = event
        .as_object()
        .ok_or_else(|| EventValidationError::NotAnObject(json_kind(event)))?;
    let accounts = object
        .get("accounts")
        .ok_or(EventValidationError::MissingAccounts)?;
    let entries = accounts
        .as_array()
        .ok_or_else(|| EventValidationError::AccountsNotList(json_kind(accounts)))?;

    let mut validated = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let fields = entry
            .as_object()
            .ok_or_else(|| EventValidationError::AccountNotObject {
                index,
                kind: json_kind(entry),
            })?;

        let missing: Vec<&'static str> = REQUIRED_FIELDS
            .into_iter()
            .filter(|f| !fields.contains_key(*f))
            .collect();
        if !missing.is_empty() {
            return Err(EventValidationError::MissingFields {
                index,
                fields: missing,
            });
        }

        let id = match fields.get("Id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(EventValidationError::InvalidField {
                    index,
                    field: "Id",
                    reason: "must be a non-empty string",
                })
            }
        };
        let name = string_field(fields.get("Name"), index, "Name")?;
        let email = string_field(fields.get("Email"), index, "Email")?;

        validated.push(Account {
            id: id.to_string(),
            name: name.to_string(),
            email: email.to_string(),
        });
    }

    Ok(validated)
}

fn string_field<'a>(
    value: Option<&'a Value>,
    index: usize,
    field: &'static str,
) -> Result<&'a str, EventValidationError> {
    value
        .and_then(Value::as_str)
        .ok_or(EventValidationError::InvalidField {
            index,
            field,
            reason: "must be a string",
        })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Attributes of a failed-account marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedAccountRecord {
    pub account_id: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Accounts that recently failed processing and are skipped until their marker expires
pub struct FailedAccountRegistry {
    known: DashSet<String>,
    client: StoreClient,
    table: String,
    ttl_secs: i64,
    clock: Arc<dyn Clock>,
    metrics: DetectorMetrics,
}

impl FailedAccountRegistry {
    pub fn new(
        client: StoreClient,
        table: impl Into<String>,
        ttl_secs: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            known: DashSet::new(),
            client,
            table: table.into(),
            ttl_secs,
            clock,
            metrics: DetectorMetrics::new(),
        }
    }

    /// Reload the set from the durable table; a failed scan leaves it empty
    pub async fn refresh(&self) -> usize {
        let items = self.client.scan_items(&self.table).await;
        self.known.clear();
        for item in items {
            match item.decode::<FailedAccountRecord>() {
                Ok(record) => {
                    self.known.insert(record.account_id);
                }
                Err(_) => {
                    self.known.insert(item.key);
                }
            }
        }
        info!(failed_accounts = self.known.len(), "Loaded failed accounts");
        self.known.len()
    }

    pub fn is_failed(&self, account_id: &str) -> bool {
        self.known.contains(account_id)
    }

    /// Record a failure; a write error is logged and the account is still skipped in-process
    pub async fn record(&self, account_id: &str, error_message: &str) {
        let now = self.clock.now();
        let record = FailedAccountRecord {
            account_id: account_id.to_string(),
            error: error_message.chars().take(MAX_ERROR_CHARS).collect(),
            failed_at: now,
        };
        self.known.insert(account_id.to_string());
        self.metrics.inc_failed_accounts();

        let expires_at = now.timestamp() + self.ttl_secs;
        let result = match StoreItem::encode(account_id, &record, expires_at) {
            Ok(item) => self.client.put_item(&self.table, item).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(account_id = %account_id, error = %e, "Failed to record failed account");
        }
    }

    /// Every live failed-account marker
    pub async fn list(&self) -> Vec<FailedAccountRecord> {
        self.client
            .scan_items(&self.table)
            .await
            .into_iter()
            .filter_map(|item| item.decode::<FailedAccountRecord>().ok())
            .collect()
    }
}
