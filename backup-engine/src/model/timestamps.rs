//! Per-table region-server log timestamps and the derived start code.

use super::TableName;
use std::collections::BTreeMap;

/// Region server identifier → last consumed log timestamp (ms since epoch).
pub type ServerTimestamps = BTreeMap<String, u64>;

/// Table → region server timestamps.
pub type TimestampMap = BTreeMap<TableName, ServerTimestamps>;

/// Minimum timestamp per region server across all tables.
pub fn region_server_minimums(map: &TimestampMap) -> ServerTimestamps {
    let mut mins = ServerTimestamps::new();
    for servers in map.values() {
        for (server, &ts) in servers {
            mins.entry(server.clone())
                .and_modify(|cur| *cur = (*cur).min(ts))
                .or_insert(ts);
        }
    }
    mins
}

/// Global low-water mark below which log segments may be reclaimed.
///
/// `None` when the map has no entries at all.
pub fn compute_start_code(map: &TimestampMap) -> Option<u64> {
    region_server_minimums(map).into_values().min()
}
