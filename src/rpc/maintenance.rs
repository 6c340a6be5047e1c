//! Periodic node maintenance decisions.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::common::{BucketRange, Id, RoutingTable};

use super::config::Config;

/// Periodic maintenance state
#[derive(Debug)]
pub struct Maintenance {
    interval: Duration,
    bucket_refresh_interval: Duration,
    republish_interval: Duration,
    questionable_after: Duration,
    last_run: Instant,
    last_republish: Instant,
}

/// Decisions about what maintenance to perform on this tick.
#[derive(Debug, Default)]
pub struct MaintenanceDecisions {
    /// Whether to bootstrap again because the routing table is empty.
    pub should_bootstrap: bool,

    /// Whether to drop expired values from the store.
    pub should_expire: bool,

    /// Whether to re-announce locally put values.
    pub should_republish: bool,

    /// Buckets that didn't change in a while, to refresh with a lookup.
    pub buckets_to_refresh: Vec<BucketRange>,

    /// Unverified, questionable or quiet good nodes to ping.
    pub nodes_to_ping: Vec<(Id, SocketAddr)>,
}

impl Maintenance {
    pub fn new(config: &Config) -> Self {
        let now = Instant::now();

        Maintenance {
            interval: config.maintenance_interval,
            bucket_refresh_interval: config.bucket_refresh_interval,
            republish_interval: config.republish_interval,
            questionable_after: config.questionable_after,
            last_run: now,
            last_republish: now,
        }
    }

    /// Determine what maintenance operations should be performed.
    ///
    /// Returns None if maintenance isn't due yet.
    pub fn periodic_maintenance_decisions(
        &mut self,
        routing_table: &RoutingTable,
    ) -> Option<MaintenanceDecisions> {
        self.periodic_maintenance_decisions_at(Instant::now(), routing_table)
    }

    fn periodic_maintenance_decisions_at(
        &mut self,
        now: Instant,
        routing_table: &RoutingTable,
    ) -> Option<MaintenanceDecisions> {
        if now.saturating_duration_since(self.last_run) < self.interval {
            return None;
        }
        self.last_run = now;

        let should_republish =
            now.saturating_duration_since(self.last_republish) >= self.republish_interval;
        if should_republish {
            self.last_republish = now;
        }

        let buckets_to_refresh = if routing_table.is_empty() {
            vec![]
        } else {
            routing_table
                .buckets_needing_refresh(self.bucket_refresh_interval)
                .collect()
        };

        let nodes_to_ping = routing_table
            .nodes()
            .filter(|node| node.should_ping(now, self.questionable_after))
            .map(|node| (*node.id(), node.address()))
            .collect();

        Some(MaintenanceDecisions {
            should_bootstrap: routing_table.is_empty(),
            should_expire: true,
            should_republish,
            buckets_to_refresh,
            nodes_to_ping,
        })
    }
}
