use regex::Regex;
use std::{fmt, sync::LazyLock};

use crate::{
    error::{VeldResult, WireError},
    sim::{Replicate, StepCount},
};

/// One line of the leader/worker coordination protocol.
///
/// Line-oriented and newline-terminated; one record per line. `parse` and
/// `Display` are inverses for every variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireResponse {
    /// `[progress N]` — absolute step count, not an increment.
    Progress(StepCount),
    /// `[end N]` — replicate N complete.
    End(Replicate),
    /// `[error] message`.
    Error(String),
    /// `[N] data` — tab-delimited key=value payload for replicate N.
    Datum {
        replicate: Replicate,
        payload: String,
    },
    /// `[N]` — empty datum, ignored by consumers.
    Empty(Replicate),
}

static END_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\[end (\d+)\]$").expect("regex"));
static EMPTY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\[(\d+)\]$").expect("regex"));
static ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[error\] (.*)$").expect("regex"));
static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[progress (\d+)\]$").expect("regex"));
static DATUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(\d+)\] (.+)$").expect("regex"));

impl WireResponse {
    /// Dispatches a line to each strategy in fixed order: end, empty,
    /// error, progress, datum. The first match wins.
    pub fn parse(line: &str) -> VeldResult<WireResponse> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(captures) = END_RE.captures(line) {
            return Ok(WireResponse::End(Replicate(parse_number(&captures[1], line)?)));
        }
        if let Some(captures) = EMPTY_RE.captures(line) {
            return Ok(WireResponse::Empty(Replicate(parse_number(&captures[1], line)?)));
        }
        if let Some(captures) = ERROR_RE.captures(line) {
            return Ok(WireResponse::Error(captures[1].to_string()));
        }
        if let Some(captures) = PROGRESS_RE.captures(line) {
            return Ok(WireResponse::Progress(StepCount(parse_number(
                &captures[1],
                line,
            )?)));
        }
        if let Some(captures) = DATUM_RE.captures(line) {
            return Ok(WireResponse::Datum {
                replicate: Replicate(parse_number(&captures[1], line)?),
                payload: captures[2].to_string(),
            });
        }
        Err(WireError::InvalidWire(line.to_string()).into())
    }

    /// A leader aggregating workers rewrites replicate numbers into its own
    /// numbering space. Progress and error lines pass through.
    pub fn renumber(self, offset: u32) -> WireResponse {
        match self {
            WireResponse::End(r) => WireResponse::End(Replicate(r.0 + offset)),
            WireResponse::Empty(r) => WireResponse::Empty(Replicate(r.0 + offset)),
            WireResponse::Datum { replicate, payload } => WireResponse::Datum {
                replicate: Replicate(replicate.0 + offset),
                payload,
            },
            other => other,
        }
    }
}

impl fmt::Display for WireResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireResponse::Progress(step) => write!(f, "[progress {}]", step.0),
            WireResponse::End(replicate) => write!(f, "[end {}]", replicate.0),
            WireResponse::Error(message) => write!(f, "[error] {message}"),
            WireResponse::Datum { replicate, payload } => {
                write!(f, "[{}] {payload}", replicate.0)
            }
            WireResponse::Empty(replicate) => write!(f, "[{}]", replicate.0),
        }
    }
}

fn parse_number<T: std::str::FromStr>(text: &str, line: &str) -> VeldResult<T> {
    text.parse()
        .map_err(|_| WireError::InvalidWire(line.to_string()).into())
}

/// Tracks the absolute step count a worker reports. Workers send totals,
/// never increments, so a dropped line cannot skew the leader's view.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProgressTracker {
    total: u64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `completed` more steps and returns the line to send.
    pub fn advance(&mut self, completed: u64) -> WireResponse {
        self.total += completed;
        WireResponse::Progress(StepCount(self.total))
    }
}

/// Structured datum payload: `name:key1=value1<TAB>key2=value2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatumPayload {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl DatumPayload {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn entry(mut self, key: &str, value: &str) -> Self {
        self.entries.push((key.to_string(), value.to_string()));
        self
    }

    /// Serializes, replacing tabs and newlines in values with spaces so the
    /// line stays one record.
    pub fn encode(&self) -> String {
        let body = self
            .entries
            .iter()
            .map(|(k, v)| format!("{}={}", sanitize(k), sanitize(v)))
            .collect::<Vec<_>>()
            .join("\t");
        format!("{}:{}", sanitize(&self.name), body)
    }

    pub fn parse(text: &str) -> VeldResult<DatumPayload> {
        let (name, body) = text
            .split_once(':')
            .ok_or_else(|| WireError::InvalidDatum(format!("missing name: '{text}'")))?;
        let mut entries = Vec::new();
        for pair in body.split('\t').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| WireError::InvalidDatum(format!("missing '=': '{pair}'")))?;
            entries.push((key.to_string(), value.to_string()));
        }
        Ok(DatumPayload {
            name: name.to_string(),
            entries,
        })
    }
}

fn sanitize(text: &str) -> String {
    text.replace(['\t', '\n', '\r'], " ")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_trip_for_all_response_types() {
        let canonical = [
            "[progress 42]",
            "[3] k=v\tu=7",
            "[end 5]",
            "[error] boom",
            "[9]",
        ];
        for line in canonical {
            let parsed = WireResponse::parse(line).unwrap();
            assert_eq!(parsed.to_string(), line, "format(parse(line)) == line");
            let reparsed = WireResponse::parse(&parsed.to_string()).unwrap();
            assert_eq!(reparsed, parsed, "parse(format(r)) == r");
        }
    }

    #[test]
    fn test_parse_dispatch_order() {
        // `[5]` must parse as an empty datum, not a malformed datum line.
        assert_eq!(
            WireResponse::parse("[5]").unwrap(),
            WireResponse::Empty(Replicate(5))
        );
        // `[end 5]` must win over the datum strategy.
        assert_eq!(
            WireResponse::parse("[end 5]").unwrap(),
            WireResponse::End(Replicate(5))
        );
    }

    #[test]
    fn test_unparseable_line_raises_invalid_wire() {
        for line in ["", "nonsense", "[progress many]", "[-1] x"] {
            let err = WireResponse::parse(line).unwrap_err();
            assert!(
                matches!(err, crate::error::VeldError::Wire(WireError::InvalidWire(_))),
                "expected InvalidWire for '{line}'"
            );
        }
    }

    #[test]
    fn test_progress_is_absolute() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.advance(10).to_string(), "[progress 10]");
        assert_eq!(
            tracker.advance(5).to_string(),
            "[progress 15]",
            "totals, not increments"
        );
    }

    #[test]
    fn test_leader_renumbering() {
        let datum = WireResponse::parse("[2] a=1").unwrap();
        assert_eq!(datum.renumber(10).to_string(), "[12] a=1");

        let progress = WireResponse::parse("[progress 3]").unwrap();
        assert_eq!(progress.renumber(10).to_string(), "[progress 3]");
    }

    #[test]
    fn test_datum_payload_encode_parse() {
        let payload = DatumPayload::new("Tree@0,0#1")
            .entry("age", "4")
            .entry("note", "has\ttab and\nnewline");
        let encoded = payload.encode();
        assert!(!encoded.contains('\n'), "newlines become spaces");

        let parsed = DatumPayload::parse(&encoded).unwrap();
        assert_eq!(parsed.name, "Tree@0,0#1");
        assert_eq!(parsed.entries[0], ("age".to_string(), "4".to_string()));
        assert_eq!(
            parsed.entries[1].1, "has tab and newline",
            "sanitized value survives the round trip"
        );
    }
}
