//! Status extractor: turns `status` responses into typed jail records.
//!
//! Every response is `(return_code, payload)`. For a jail-scoped query the
//! payload looks like
//!
//! ```text
//! [ ("Filter",  [("Currently failed", n), ("Total failed", n), ("File list", [...])]),
//!   ("Actions", [("Currently banned", n), ("Total banned", n), ("Banned IP list", [...])]) ]
//! ```
//!
//! Only positions are checked, never labels, so translated or renamed labels
//! keep working. Trailing entries are ignored.

use serde::Serialize;
use tracing::debug;

use f2b_exporter_config::AppConfig;

use super::connection::{ConnectionManager, ConnectionState, Dialer, RequestError, UnixDialer};
use super::value::{self, Command, DecodingError, Value};

/// Counters for one jail, as of the latest poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Jail {
    pub name: String,
    pub currently_failed: i64,
    pub total_failed: i64,
    pub currently_banned: i64,
    pub total_banned: i64,
}

/// Field names used in [`ExtractError::SchemaMismatch`].
pub mod field {
    pub const RESPONSE: &str = "response";
    pub const JAIL_LIST: &str = "jail list";
    pub const CURRENTLY_FAILED: &str = "currently failed";
    pub const TOTAL_FAILED: &str = "total failed";
    pub const CURRENTLY_BANNED: &str = "currently banned";
    pub const TOTAL_BANNED: &str = "total banned";
}

/// Failure to obtain or interpret a status response.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Decoding(#[from] DecodingError),

    #[error("fail2ban reported failure (code {code}): {detail}")]
    DaemonReportedFailure { code: i64, detail: String },

    #[error(
        "unexpected {field}{}: {reason}",
        .jail.as_deref().map(|j| format!(" for jail {j:?}")).unwrap_or_default()
    )]
    SchemaMismatch {
        field: &'static str,
        jail: Option<String>,
        reason: String,
    },
}

impl ExtractError {
    fn mismatch(field: &'static str, jail: Option<&str>, reason: impl Into<String>) -> Self {
        ExtractError::SchemaMismatch {
            field,
            jail: jail.map(str::to_string),
            reason: reason.into(),
        }
    }
}

/// The two sections of a jail status and the counters each one carries.
const SECTIONS: [(&str, [&str; 2]); 2] = [
    ("Filter", [field::CURRENTLY_FAILED, field::TOTAL_FAILED]),
    ("Actions", [field::CURRENTLY_BANNED, field::TOTAL_BANNED]),
];

/// High-level fail2ban client.
pub struct StatusClient<D: Dialer = UnixDialer> {
    conn: ConnectionManager<D>,
}

impl<D: Dialer> Clone for StatusClient<D> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

impl StatusClient<UnixDialer> {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(ConnectionManager::from_config(config))
    }
}

impl<D: Dialer> StatusClient<D> {
    pub fn new(conn: ConnectionManager<D>) -> Self {
        Self { conn }
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Close the daemon session.
    pub async fn close(&self) {
        self.conn.close().await;
    }

    /// Run `status` (optionally for one jail) and return the payload.
    pub async fn get_status(&self, jail: Option<&str>) -> Result<Value, ExtractError> {
        let cmd = Command::status(jail);
        let bytes = self.conn.exchange(&cmd).await?;
        let response = value::decode(&bytes)?;
        debug!(command = %cmd, "decoded status response");

        let (code, payload) = match response {
            Value::Sequence(mut items) if items.len() == 2 => {
                let payload = items.pop().unwrap_or(Value::Nil);
                let code = items.pop().unwrap_or(Value::Nil);
                (code, payload)
            }
            other => {
                return Err(ExtractError::mismatch(
                    field::RESPONSE,
                    jail,
                    format!("expected (code, payload), got {}", describe(&other)),
                ));
            }
        };

        match code {
            Value::Integer(0) => Ok(payload),
            Value::Integer(code) => Err(ExtractError::DaemonReportedFailure {
                code,
                detail: match payload {
                    Value::Text(text) => text,
                    other => describe(&other),
                },
            }),
            other => Err(ExtractError::mismatch(
                field::RESPONSE,
                jail,
                format!("return code is {}, expected integer", other.kind()),
            )),
        }
    }

    /// Names of all configured jails, in the order the daemon lists them.
    pub async fn list_jail_names(&self) -> Result<Vec<String>, ExtractError> {
        let payload = self.get_status(None).await?;
        parse_jail_names(&payload)
    }

    /// Counters for a single jail.
    pub async fn get_jail(&self, name: &str) -> Result<Jail, ExtractError> {
        let payload = self.get_status(Some(name)).await?;
        parse_jail(name, &payload)
    }

    /// Counters for every jail. The first failure aborts the whole poll.
    pub async fn get_all_jails(&self) -> Result<Vec<Jail>, ExtractError> {
        let names = self.list_jail_names().await?;
        let mut jails = Vec::with_capacity(names.len());
        for name in &names {
            jails.push(self.get_jail(name).await?);
        }
        debug!(jails = jails.len(), "polled all jails");
        Ok(jails)
    }
}

/// Second entry of the global status: `("Jail list", "a, b, c")`.
pub fn parse_jail_names(payload: &Value) -> Result<Vec<String>, ExtractError> {
    let mismatch = |reason: String| ExtractError::mismatch(field::JAIL_LIST, None, reason);

    let entries = payload
        .as_sequence()
        .ok_or_else(|| mismatch(format!("status payload is {}", describe(payload))))?;
    let entry = entries
        .get(1)
        .ok_or_else(|| mismatch(format!("status payload has {} entries", entries.len())))?;
    let (_, list) = entry
        .as_entry()
        .ok_or_else(|| mismatch(format!("expected (label, list), got {}", describe(entry))))?;
    let list = list
        .as_text()
        .ok_or_else(|| mismatch(format!("jail list is {}, expected text", list.kind())))?;

    Ok(list
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect())
}

/// Jail-scoped payload: the Filter and Actions sections.
pub fn parse_jail(name: &str, payload: &Value) -> Result<Jail, ExtractError> {
    let mismatch =
        |field: &'static str, reason: String| ExtractError::mismatch(field, Some(name), reason);

    let sections = payload
        .as_sequence()
        .ok_or_else(|| mismatch(field::CURRENTLY_FAILED, format!("jail payload is {}", describe(payload))))?;

    let mut counters = [0i64; 4];
    for (index, (section, fields)) in SECTIONS.iter().enumerate() {
        let first = fields[0];
        let entry = sections
            .get(index)
            .ok_or_else(|| mismatch(first, format!("missing {section} section")))?;
        let (_, body) = entry
            .as_entry()
            .ok_or_else(|| mismatch(first, format!("{section} section is {}", describe(entry))))?;
        let items = body.as_sequence().ok_or_else(|| {
            mismatch(first, format!("{section} section holds {}, expected a sequence", body.kind()))
        })?;

        for (slot, field) in fields.iter().enumerate() {
            let item = items
                .get(slot)
                .ok_or_else(|| mismatch(*field, format!("missing from {section} section")))?;
            let (_, value) = item
                .as_entry()
                .ok_or_else(|| mismatch(*field, format!("expected (label, integer), got {}", describe(item))))?;
            counters[index * 2 + slot] = value
                .as_integer()
                .ok_or_else(|| mismatch(*field, format!("value is {}, expected integer", value.kind())))?;
        }
    }

    let [currently_failed, total_failed, currently_banned, total_banned] = counters;
    Ok(Jail {
        name: name.to_string(),
        currently_failed,
        total_failed,
        currently_banned,
        total_banned,
    })
}

fn describe(value: &Value) -> String {
    match value {
        Value::Sequence(items) => format!("a sequence of {}", items.len()),
        other => format!("{} value", other.kind()),
    }
}
