//! Routing table maintenance logic.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::common::{Id, RoutingTable};

/// Interval between maintenance checks.
pub const REFRESH_TICK_INTERVAL: Duration = Duration::from_secs(5);
/// Interval between refreshes toward our own id, and between bucket refreshes.
const REFRESH_TABLE_INTERVAL: u64 = 15 * 60;
/// A bucket refreshed more recently than this is left alone.
const MIN_BUCKET_IDLE: u64 = 45;

/// Routing table maintenance state
#[derive(Debug)]
pub struct RoutingMaintenance {
    /// Unix seconds, `0` until the first self refresh.
    last_self_refresh: u64,
    /// Unix seconds, `0` until the first bucket refresh.
    last_bucket_refresh: u64,
    next_tick: Instant,
}

impl RoutingMaintenance {
    pub fn new() -> Self {
        RoutingMaintenance {
            last_self_refresh: 0,
            last_bucket_refresh: 0,
            next_tick: Instant::now(),
        }
    }

    /// Returns the target of a refresh traversal to start, if one is due.
    pub fn refresh_target(&mut self, table: &mut RoutingTable) -> Option<Id> {
        let now = Instant::now();

        if now < self.next_tick {
            return None;
        }
        self.next_tick = now + REFRESH_TICK_INTERVAL;

        self.refresh_target_at(unix_now(), table)
    }

    /// Refresh toward our own id every 15 minutes. Otherwise, at most every
    /// 15 minutes, refresh the stalest bucket with a random id in its range,
    /// unless it was refreshed in the last 45 seconds.
    pub(crate) fn refresh_target_at(&mut self, now: u64, table: &mut RoutingTable) -> Option<Id> {
        if now.saturating_sub(self.last_self_refresh) > REFRESH_TABLE_INTERVAL {
            self.last_self_refresh = now;

            debug!(context = "routing_table_refresh", "Refreshing own id");
            return Some(*table.id());
        }

        if now.saturating_sub(self.last_bucket_refresh) < REFRESH_TABLE_INTERVAL {
            return None;
        }

        let index = table.stalest_bucket(now)?;
        let last_refresh = table.buckets()[index].last_refresh();

        if now.saturating_sub(last_refresh) < MIN_BUCKET_IDLE {
            return None;
        }

        self.last_bucket_refresh = now;
        table.set_last_refresh(index, now);

        debug!(context = "routing_table_refresh", bucket = index, "Refreshing bucket");

        Some(table.id().random_with_prefix(index))
    }
}

impl Default for RoutingMaintenance {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}
