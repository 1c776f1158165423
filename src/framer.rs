//! Line framing and envelope enrichment.
//!
//! A batch body is a stream of newline-delimited records. Chunks arrive at
//! arbitrary boundaries, so the framer carries the trailing partial line over
//! to the next chunk. Each complete line is then turned into an [`Envelope`]:
//! JSON objects are enriched in place, anything else is wrapped as text.

use serde_json::{Map, Value};

/// Record delimiter.
pub const DELIMITER: u8 = b'\n';

/// Output of [`frame`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Framed {
    /// Complete lines, without their delimiter.
    pub records: Vec<Vec<u8>>,
    /// Trailing bytes after the last delimiter.
    pub remainder: Vec<u8>,
}

/// Split `remainder ++ chunk` on the delimiter.
///
/// Every piece but the last is a complete record; the last piece becomes the
/// new remainder even when it is empty.
pub fn frame(remainder: &[u8], chunk: &[u8]) -> Framed {
    let mut joined = Vec::with_capacity(remainder.len() + chunk.len());
    joined.extend_from_slice(remainder);
    joined.extend_from_slice(chunk);

    let mut pieces: Vec<Vec<u8>> = joined
        .split(|b| *b == DELIMITER)
        .map(<[u8]>::to_vec)
        .collect();

    // split() always yields at least one piece
    let remainder = pieces.pop().unwrap_or_default();

    Framed {
        records: pieces,
        remainder,
    }
}

/// Offset bytes consumed by a complete record (line plus delimiter).
pub fn record_size(line: &[u8]) -> u64 {
    line.len() as u64 + 1
}

/// Result of attempting a structured parse on one record.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRecord {
    /// The line is a self-describing JSON object.
    Structured(Map<String, Value>),
    /// Anything else, kept verbatim (after trimming).
    Raw(String),
}

/// Trim and classify a record. Returns `None` for blank lines.
pub fn parse_record(line: &[u8]) -> Option<ParsedRecord> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Some(ParsedRecord::Structured(map)),
        _ => Some(ParsedRecord::Raw(trimmed.to_string())),
    }
}

/// Fields stamped on every envelope from one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeContext {
    pub batch_id: u64,
    pub source_identifier: String,
    pub service: String,
}

impl EnvelopeContext {
    pub fn new(batch_id: u64, source_identifier: impl Into<String>, service: &str) -> Self {
        Self {
            batch_id,
            source_identifier: source_identifier.into(),
            service: service.to_lowercase(),
        }
    }
}

/// One log record ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    body: Map<String, Value>,
}

impl Envelope {
    pub fn new(record: ParsedRecord, ctx: &EnvelopeContext) -> Self {
        let mut body = match record {
            ParsedRecord::Structured(map) => map,
            ParsedRecord::Raw(text) => {
                let mut map = Map::new();
                map.insert("textMessage".to_string(), Value::String(text));
                map
            }
        };

        body.insert("batchId".to_string(), Value::from(ctx.batch_id));
        body.insert(
            "sourceIdentifier".to_string(),
            Value::String(ctx.source_identifier.clone()),
        );
        body.insert("service".to_string(), Value::String(ctx.service.clone()));

        Self { body }
    }

    /// Frame-to-envelope in one step; `None` for blank lines.
    pub fn from_line(line: &[u8], ctx: &EnvelopeContext) -> Option<Self> {
        parse_record(line).map(|record| Self::new(record, ctx))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }

    /// Serialized request body.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a Map<String, Value> cannot fail
        serde_json::to_vec(&self.body).unwrap_or_default()
    }
}
