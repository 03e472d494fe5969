//! Command/response protocol spoken by line-oriented, synchronously
//! acknowledging printers.
//!
//! Every line sent is keyed by its command token (`G28`, `M31`, ...). The
//! [ProtocolTable] maps a token to the ordered list of [Validator]s that must
//! each accept one response line before the command counts as acknowledged.
//! Tokens with no entry expect a single `ok`.

mod validators;

use std::{borrow::Cow, collections::BTreeMap, sync::OnceLock, time::Duration};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use validators::{is_ack, is_device_error, ResponseValue, Validator, Verdict};

use crate::{error::ProtocolError, Connection, FabricatorError};

/// Mapping of command token to the validators its responses must pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTable(BTreeMap<String, Vec<Validator>>);

impl CommandTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the entry for `token`.
    pub fn with(mut self, token: &str, validators: &[Validator]) -> Self {
        self.0.insert(token.to_ascii_uppercase(), validators.to_vec());
        self
    }

    /// Validators registered for `token`, if any.
    pub fn get(&self, token: &str) -> Option<&[Validator]> {
        self.0.get(token).map(Vec::as_slice)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Merge a family's `base` table with a model's `overrides`.
///
/// Every key of either table is present in the result. Where both define a
/// key, the entry from `overrides` wins.
pub fn merge_tables(base: &CommandTable, overrides: &CommandTable) -> CommandTable {
    let mut merged = base.0.clone();
    for (token, validators) in overrides.0.iter() {
        merged.insert(token.clone(), validators.clone());
    }
    CommandTable(merged)
}

/// Everything needed to speak to one device model.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolTable {
    /// Response validators per command token.
    pub commands: CommandTable,

    /// Sent once after connecting.
    pub startup: Vec<String>,

    /// Homing sequence used by `reset`.
    pub home: Vec<String>,

    /// Sent after a job finishes or is cancelled.
    pub shutdown: Vec<String>,

    /// Aborts the running build.
    pub cancel: String,

    /// Token marking the start of the timed part of a build.
    pub begin_timing: Option<String>,

    /// Highest feed rate (mm/min) the model accepts, if limited.
    pub max_feed_rate: Option<u32>,
}

const DEFAULT_VALIDATORS: &[Validator] = &[Validator::Ok];

impl ProtocolTable {
    /// Validators for the command on `line`; a lone `ok` when the token has
    /// no entry.
    pub fn validators(&self, line: &str) -> &[Validator] {
        command_token(line)
            .and_then(|token| self.commands.get(&token))
            .unwrap_or(DEFAULT_VALIDATORS)
    }

    /// Rewrite any `F` word above the model's maximum feed rate down to the
    /// maximum.
    pub fn limit_feed_rate<'a>(&self, line: &'a str) -> Cow<'a, str> {
        let Some(max) = self.max_feed_rate else {
            return Cow::Borrowed(line);
        };
        static FEED: OnceLock<Regex> = OnceLock::new();
        let re = FEED.get_or_init(|| Regex::new(r"\bF(\d+(?:\.\d+)?)").expect("static regex is valid"));
        re.replace_all(line, |caps: &Captures| match caps[1].parse::<f64>() {
            Ok(feed) if feed > f64::from(max) => format!("F{}", max),
            _ => caps[0].to_owned(),
        })
    }

    /// True when `line` carries the model's begin-timing token.
    pub fn is_begin_timing(&self, line: &str) -> bool {
        match (&self.begin_timing, command_token(line)) {
            (Some(begin), Some(token)) => begin.eq_ignore_ascii_case(&token),
            _ => false,
        }
    }
}

/// Strip a trailing `;` comment and surrounding whitespace. Returns `None`
/// for lines with nothing left to send.
pub fn strip_comment(line: &str) -> Option<&str> {
    let command = match line.split_once(';') {
        Some((command, _)) => command,
        None => line,
    }
    .trim();
    if command.is_empty() {
        None
    } else {
        Some(command)
    }
}

/// Upper-cased command token of `line`, skipping a leading `N` line number.
pub fn command_token(line: &str) -> Option<String> {
    let command = strip_comment(line)?;
    let mut words = command.split_whitespace();
    let mut token = words.next()?;
    if token.starts_with(['N', 'n']) && token[1..].chars().all(|c| c.is_ascii_digit()) {
        token = words.next()?;
    }
    Some(token.to_ascii_uppercase())
}

/// Kinds of command with different worst-case response times.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommandClass {
    /// Ordinary moves and settings.
    Motion,

    /// Axis homing.
    Homing,

    /// Bed leveling probes.
    BedLeveling,

    /// Wait-for-temperature commands.
    Heating,
}

impl CommandClass {
    /// Class of the command with `token`.
    pub fn of(token: &str) -> Self {
        match token {
            "G28" | "G161" | "G162" => Self::Homing,
            "G80" => Self::BedLeveling,
            t if t.starts_with("G29") => Self::BedLeveling,
            "M109" | "M190" | "M116" | "M133" | "M134" => Self::Heating,
            _ => Self::Motion,
        }
    }
}

/// Bounds on how long to wait for a device to answer.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolTimeouts {
    /// Longest single read, in milliseconds.
    pub read_timeout_ms: u64,

    /// Pause after a read that timed out, in milliseconds.
    pub retry_backoff_ms: u64,

    /// Total budget for ordinary commands, in seconds.
    pub motion_secs: f64,

    /// Total budget for homing commands, in seconds.
    pub homing_secs: f64,

    /// Total budget for bed leveling commands, in seconds.
    pub leveling_secs: f64,

    /// Total budget for wait-for-temperature commands, in seconds.
    pub heating_secs: f64,
}

impl Default for ProtocolTimeouts {
    fn default() -> Self {
        Self {
            read_timeout_ms: 1_000,
            retry_backoff_ms: 100,
            motion_secs: 120.0,
            homing_secs: 300.0,
            leveling_secs: 600.0,
            heating_secs: 900.0,
        }
    }
}

impl ProtocolTimeouts {
    /// Total wait budget for commands of `class`.
    pub fn budget(&self, class: CommandClass) -> Duration {
        let secs = match class {
            CommandClass::Motion => self.motion_secs,
            CommandClass::Homing => self.homing_secs,
            CommandClass::BedLeveling => self.leveling_secs,
            CommandClass::Heating => self.heating_secs,
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    fn backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Send one command line and wait for every response its validators expect.
///
/// Responses that fail a validator are skipped as unrelated chatter unless
/// they are device error reports, which fail the command at once. Chatter
/// is what firmware sends unprompted between acknowledgments, such as the
/// temperature reports `M155` turns on or `echo:busy` keepalives. Reads that
/// time out are retried after a short backoff until the command class's
/// budget runs out.
pub async fn send_command(
    conn: &mut Connection,
    table: &ProtocolTable,
    timeouts: &ProtocolTimeouts,
    line: &str,
) -> Result<Vec<ResponseValue>, FabricatorError> {
    let validators = table.validators(line);
    let class = command_token(line)
        .map(|token| CommandClass::of(&token))
        .unwrap_or(CommandClass::Motion);
    let budget = timeouts.budget(class);

    conn.write_line(line)
        .await
        .map_err(|e| FabricatorError::connection(conn.device_path(), e))?;

    let deadline = Instant::now() + budget;
    let mut values = vec![];
    let mut last_response: Option<String> = None;

    for validator in validators {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ProtocolError::Timeout {
                    command: line.to_owned(),
                    budget,
                    last_response,
                }
                .into());
            }

            let wait = timeouts.read_timeout().min(deadline - now);
            let response = match conn.read_line(wait).await {
                Ok(Some(response)) => response,
                Ok(None) => {
                    tokio::time::sleep(timeouts.backoff().min(deadline.saturating_duration_since(Instant::now())))
                        .await;
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(ProtocolError::Closed {
                        command: line.to_owned(),
                    }
                    .into());
                }
                Err(e) => return Err(FabricatorError::connection(conn.device_path(), e)),
            };

            match validator.validate(&response) {
                Verdict::Value(value) => {
                    values.push(value);
                    break;
                }
                Verdict::Pass => break,
                Verdict::Fail if is_device_error(&response) => {
                    return Err(ProtocolError::Rejected {
                        command: line.to_owned(),
                        response,
                    }
                    .into());
                }
                Verdict::Fail => {
                    tracing::trace!(
                        device = conn.device_path(),
                        command = line,
                        response = response,
                        "skipping unrelated response"
                    );
                    last_response = Some(response);
                }
            }
        }
    }

    Ok(values)
}
