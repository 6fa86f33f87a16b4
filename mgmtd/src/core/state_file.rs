//! On-disk formats of the target state store.
//!
//! The state file is `u32 count` followed by `count` records of
//! `u16 target_id, i32 reachability, i32 consistency, i64 seconds, i64 nanoseconds`,
//! all little-endian. The needs-resync list is plain text with one target ID per line.

use bytes::{Buf, BufMut, BytesMut};
use tracing::warn;

use common::states::{CombinedTargetState, ConsistencyState, ReachabilityState};

use crate::core::error::StoreError;

const RECORD_LEN: usize = 2 + 4 + 4 + 8 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateRecord {
    pub target_id: u16,
    pub state: CombinedTargetState,
    pub changed_secs: i64,
    pub changed_nanos: i64,
}

pub fn encode_states(records: &[StateRecord]) -> Result<Vec<u8>, StoreError> {
    let count = u32::try_from(records.len())
        .map_err(|_| StoreError::MalformedData(format!("too many targets: {}", records.len())))?;

    let mut buf = BytesMut::with_capacity(4 + records.len() * RECORD_LEN);
    buf.put_u32_le(count);
    for record in records {
        buf.put_u16_le(record.target_id);
        buf.put_i32_le(record.state.reachability.code());
        buf.put_i32_le(record.state.consistency.code());
        buf.put_i64_le(record.changed_secs);
        buf.put_i64_le(record.changed_nanos);
    }
    Ok(buf.to_vec())
}

pub fn decode_states(mut buf: &[u8]) -> Result<Vec<StateRecord>, StoreError> {
    if buf.remaining() < 4 {
        return Err(StoreError::MalformedData("state file is missing its record count".into()));
    }

    let count = buf.get_u32_le() as usize;
    let needed = count.saturating_mul(RECORD_LEN);
    if buf.remaining() < needed {
        return Err(StoreError::MalformedData(format!(
            "state file truncated: {} records need {} bytes, {} present",
            count,
            needed,
            buf.remaining()
        )));
    }

    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let target_id = buf.get_u16_le();
        let reachability_code = buf.get_i32_le();
        let consistency_code = buf.get_i32_le();
        let changed_secs = buf.get_i64_le();
        let changed_nanos = buf.get_i64_le();

        let reachability = ReachabilityState::from_code(reachability_code).ok_or_else(|| {
            StoreError::MalformedData(format!(
                "target {}: unknown reachability state {}",
                target_id, reachability_code
            ))
        })?;
        let consistency = ConsistencyState::from_code(consistency_code).ok_or_else(|| {
            StoreError::MalformedData(format!(
                "target {}: unknown consistency state {}",
                target_id, consistency_code
            ))
        })?;

        records.push(StateRecord {
            target_id,
            state: CombinedTargetState::new(reachability, consistency),
            changed_secs,
            changed_nanos,
        });
    }

    if buf.has_remaining() {
        return Err(StoreError::MalformedData(format!(
            "{} trailing bytes after {} state records",
            buf.remaining(),
            count
        )));
    }

    Ok(records)
}

/// Skips blank lines, `#` comments, and entries that are not a nonzero target ID.
pub fn parse_needs_resync_list(text: &str) -> Vec<u16> {
    let mut targets = Vec::new();

    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match line.parse::<u16>() {
            Ok(0) | Err(_) => {
                warn!(line = line_no + 1, entry = line, "ignoring invalid target id in needs-resync list");
            }
            Ok(target_id) => targets.push(target_id),
        }
    }

    targets
}

pub fn format_needs_resync_list<I>(targets: I) -> String
where
    I: IntoIterator<Item = u16>,
{
    targets
        .into_iter()
        .map(|target| format!("{}\n", target))
        .collect()
}
