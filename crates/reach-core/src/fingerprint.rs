//! Run identity and fingerprint derivation.
//!
//! The event log hash is the SHA-256 of the log's NDJSON form, where each
//! line is the canonical encoding of `{"payload", "seq", "type"}` followed by
//! a newline. Timestamps never reach the hasher.

use sha2::{Digest, Sha256};

use crate::canon::{ByteSink, Canonicalizer, EVENT_MAX_DEPTH};
use crate::error::Result;
use crate::types::{Event, RunId};

/// Version string bound into every fingerprint.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `run_id = SHA256(pack_hash ‖ input_hash ‖ sequence)`.
pub fn derive_run_id(pack_hash: &str, input_hash: &str, sequence: u64) -> RunId {
    let mut hasher = Sha256::new();
    hasher.update(pack_hash.as_bytes());
    hasher.update(input_hash.as_bytes());
    hasher.update(sequence.to_string().as_bytes());
    RunId(hex::encode(hasher.finalize()))
}

/// Write one event's hashed line into `sink`.
pub fn write_event_line<S: ByteSink>(
    canon: &Canonicalizer,
    event: &Event,
    sink: &mut S,
) -> Result<()> {
    sink.put(b"{\"payload\":");
    canon.write(&event.payload, sink)?;
    sink.put(b",\"seq\":");
    sink.put(event.seq.to_string().as_bytes());
    sink.put(b",\"type\":");
    canon.write(&serde_json::Value::String(event.event_type.clone()), sink)?;
    sink.put(b"}\n");
    Ok(())
}

/// Timestamp-free NDJSON bytes of `events`, exactly as hashed.
pub fn hashed_ndjson<'a, I>(events: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a Event>,
{
    let canon = Canonicalizer::new(EVENT_MAX_DEPTH);
    let mut out = Vec::new();
    for event in events {
        write_event_line(&canon, event, &mut out)?;
    }
    Ok(out)
}

/// SHA-256 over the hashed NDJSON form, streamed event by event.
pub fn event_log_hash<'a, I>(events: I) -> Result<String>
where
    I: IntoIterator<Item = &'a Event>,
{
    let canon = Canonicalizer::new(EVENT_MAX_DEPTH);
    let mut hasher = Sha256::new();
    for event in events {
        write_event_line(&canon, event, &mut hasher)?;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// `SHA256(run_id ‖ engine_version ‖ event_log_hash)`.
pub fn compute_fingerprint<'a, I>(run_id: &RunId, engine_version: &str, events: I) -> Result<String>
where
    I: IntoIterator<Item = &'a Event>,
{
    let log_hash = event_log_hash(events)?;
    Ok(fingerprint_from_log_hash(run_id, engine_version, &log_hash))
}

pub fn fingerprint_from_log_hash(run_id: &RunId, engine_version: &str, log_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_str().as_bytes());
    hasher.update(engine_version.as_bytes());
    hasher.update(log_hash.as_bytes());
    hex::encode(hasher.finalize())
}
