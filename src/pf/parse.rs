use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::debug;

/// Counters for a single ALTQ queue taken from one dump.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStat {
    pub name: String,
    /// Packets transmitted (monotonic).
    pub packets: u64,
    /// Bytes transmitted (monotonic).
    pub bytes: u64,
    /// Packets dropped (monotonic).
    pub drops: u64,
    /// Bytes dropped (monotonic).
    pub dropped_bytes: u64,
    /// Current queue length.
    pub qlength: u64,
    /// Queue length limit, zero when not reported.
    pub qlimit: u64,
    /// Child queue names from the `{...}` list on the header line.
    pub children: Vec<String>,
}

impl QueueStat {
    /// Returns true for queues that only aggregate child queues.
    pub fn is_parent(&self) -> bool {
        !self.children.is_empty()
    }
}

/// Errors that can occur while parsing a counter dump.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unrecognized counter dump: no queue header found")]
    UnrecognizedOutput,

    #[error("line {line}: queue header without a name")]
    MissingName { line: usize },

    #[error("line {line}: counter line outside of a queue block")]
    OrphanCounters { line: usize },

    #[error("queue {queue}: missing field {field}")]
    MissingField { queue: String, field: &'static str },

    #[error("queue {queue}: invalid value {value:?} for {field}")]
    InvalidValue {
        queue: String,
        field: &'static str,
        value: String,
    },
}

/// Result of parsing one dump: every valid queue plus the blocks that were
/// skipped.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedDump {
    pub queues: BTreeMap<String, QueueStat>,
    pub errors: Vec<ParseError>,
}

// Field labels as produced by `tokenize_counters`.
const FIELD_PKTS: &str = "pkts";
const FIELD_BYTES: &str = "pkts_bytes";
const FIELD_DROPS: &str = "dropped_pkts";
const FIELD_DROPPED_BYTES: &str = "dropped_pkts_bytes";
const FIELD_QLENGTH: &str = "qlength";

/// Parses the verbose queue listing of `pfctl -s queue -v`.
///
/// Malformed blocks are skipped and reported in [`ParsedDump::errors`]; they
/// never hide the other queues. Fails only when the text is non-empty but
/// contains no queue header at all.
pub fn parse_dump(text: &str) -> Result<ParsedDump, ParseError> {
    let mut dump = ParsedDump::default();
    let mut saw_header = false;
    let mut current: Option<Block> = None;
    // Set after a bad header so its counter lines are not reported again.
    let mut skipping = false;

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("queue ") {
            saw_header = true;
            if let Some(block) = current.take() {
                dump.finish(block);
            }

            match Block::from_header(rest) {
                Some(block) => {
                    current = Some(block);
                    skipping = false;
                }
                None => {
                    dump.errors.push(ParseError::MissingName { line: idx + 1 });
                    skipping = true;
                }
            }
            continue;
        }

        if line.starts_with('[') {
            match current.as_mut() {
                Some(block) => block.absorb(line),
                None if !skipping => {
                    dump.errors
                        .push(ParseError::OrphanCounters { line: idx + 1 });
                }
                None => {}
            }
        }
    }

    if let Some(block) = current.take() {
        dump.finish(block);
    }

    if !saw_header && !text.trim().is_empty() {
        return Err(ParseError::UnrecognizedOutput);
    }

    Ok(dump)
}

impl ParsedDump {
    fn finish(&mut self, block: Block) {
        match block.into_stat() {
            Ok(stat) => {
                let name = stat.name.clone();
                if self.queues.insert(name.clone(), stat).is_some() {
                    debug!(queue = %name, "duplicate queue name, keeping the later block");
                }
            }
            Err(e) => self.errors.push(e),
        }
    }
}

/// A queue block being accumulated line by line.
#[derive(Debug)]
struct Block {
    name: String,
    children: Vec<String>,
    fields: HashMap<String, String>,
}

impl Block {
    fn from_header(rest: &str) -> Option<Self> {
        let name = rest.split_whitespace().next()?;
        // A brace list can only follow the name.
        if name.starts_with('{') {
            return None;
        }

        let children = match (rest.rfind('{'), rest.trim_end().strip_suffix('}')) {
            (Some(open), Some(body)) if open < body.len() => body[open + 1..]
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };

        Some(Self {
            name: name.to_string(),
            children,
            fields: HashMap::new(),
        })
    }

    fn absorb(&mut self, line: &str) {
        for (label, value) in tokenize_counters(line) {
            self.fields.entry(label).or_insert(value);
        }
    }

    fn into_stat(self) -> Result<QueueStat, ParseError> {
        let packets = self.counter(FIELD_PKTS, "pkts")?;
        let bytes = self.counter(FIELD_BYTES, "bytes")?;
        let drops = self.counter(FIELD_DROPS, "dropped pkts")?;
        let dropped_bytes = match self.fields.get(FIELD_DROPPED_BYTES) {
            Some(_) => self.counter(FIELD_DROPPED_BYTES, "dropped bytes")?,
            None => 0,
        };
        let (qlength, qlimit) = self.qlength()?;

        Ok(QueueStat {
            name: self.name,
            packets,
            bytes,
            drops,
            dropped_bytes,
            qlength,
            qlimit,
            children: self.children,
        })
    }

    fn counter(&self, key: &str, field: &'static str) -> Result<u64, ParseError> {
        let raw = self.fields.get(key).ok_or_else(|| ParseError::MissingField {
            queue: self.name.clone(),
            field,
        })?;
        self.number(raw, field)
    }

    fn qlength(&self) -> Result<(u64, u64), ParseError> {
        let raw = self
            .fields
            .get(FIELD_QLENGTH)
            .ok_or_else(|| ParseError::MissingField {
                queue: self.name.clone(),
                field: "qlength",
            })?;

        match raw.split_once('/') {
            Some((len, limit)) => Ok((
                self.number(len, "qlength")?,
                self.number(limit, "qlength")?,
            )),
            None => Ok((self.number(raw, "qlength")?, 0)),
        }
    }

    fn number(&self, raw: &str, field: &'static str) -> Result<u64, ParseError> {
        raw.trim().parse().map_err(|_| ParseError::InvalidValue {
            queue: self.name.clone(),
            field,
            value: raw.to_string(),
        })
    }
}

/// Splits a bracketed counter line into `(label, value)` pairs.
///
/// Multi-word labels are joined with `_`. A bare `bytes` label that follows
/// a `*pkts` label names that counter's byte count, so
/// `[ pkts: 1 bytes: 2 dropped pkts: 3 bytes: 4 ]` yields `pkts`,
/// `pkts_bytes`, `dropped_pkts` and `dropped_pkts_bytes`.
fn tokenize_counters(line: &str) -> Vec<(String, String)> {
    let inner = line.trim();
    let inner = inner.strip_prefix('[').unwrap_or(inner);
    let inner = inner.strip_suffix(']').unwrap_or(inner);

    let mut pairs = Vec::new();
    let mut words: Vec<&str> = Vec::new();
    let mut label: Option<String> = None;
    let mut prev_label = String::new();
    let mut value = String::new();

    for tok in inner.split_whitespace() {
        if let Some(word) = tok.strip_suffix(':') {
            if let Some(l) = label.take() {
                pairs.push((l, std::mem::take(&mut value)));
            }
            words.push(word);
            let mut joined = words.join("_");
            words.clear();
            if joined == "bytes" && prev_label.ends_with("pkts") {
                joined = format!("{prev_label}_bytes");
            }
            prev_label.clone_from(&joined);
            label = Some(joined);
        } else if label.is_some() && (value.is_empty() || value.ends_with('/')) {
            value.push_str(tok);
        } else {
            if let Some(l) = label.take() {
                pairs.push((l, std::mem::take(&mut value)));
            }
            words.push(tok);
        }
    }

    if let Some(l) = label {
        pairs.push((l, value));
    }

    pairs
}
