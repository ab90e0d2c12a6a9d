//! Naming Metrics
//!
//! Recorded through the `metrics` facade; nothing is exported until the
//! embedding process installs a recorder.
//!
//! Metrics tracked:
//! - `naming_registrations_total` - counter of successful registrations by service
//! - `naming_active_leases` - gauge of leases currently kept alive by this process
//! - `naming_keepalive_acks_total` - counter of drained keep-alive acknowledgements
//! - `naming_lease_lost_total` - counter of leases lost without a shutdown request
//! - `naming_membership_updates_total` - counter of delivered updates by operation
//! - `naming_watch_errors_total` - counter of failed `Watcher::next` calls

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register descriptions for all metrics
pub fn describe_metrics() {
    describe_counter!(
        "naming_registrations_total",
        "Total number of successful service registrations"
    );
    describe_gauge!(
        "naming_active_leases",
        "Number of leases currently kept alive"
    );
    describe_counter!(
        "naming_keepalive_acks_total",
        "Total number of keep-alive acknowledgements drained"
    );
    describe_counter!(
        "naming_lease_lost_total",
        "Total number of leases lost without a shutdown request"
    );
    describe_counter!(
        "naming_membership_updates_total",
        "Total number of membership updates delivered"
    );
    describe_counter!(
        "naming_watch_errors_total",
        "Total number of failed watcher reads"
    );
}

pub(crate) fn record_registered(service: &str) {
    counter!("naming_registrations_total", "service" => service.to_string()).increment(1);
    gauge!("naming_active_leases").increment(1.0);
}

pub(crate) fn record_lease_released() {
    gauge!("naming_active_leases").decrement(1.0);
}

pub(crate) fn record_keepalive_ack() {
    counter!("naming_keepalive_acks_total").increment(1);
}

pub(crate) fn record_lease_lost(service: &str) {
    counter!("naming_lease_lost_total", "service" => service.to_string()).increment(1);
}

pub(crate) fn record_membership_update(service: &str, op: &'static str, count: usize) {
    counter!(
        "naming_membership_updates_total",
        "service" => service.to_string(),
        "op" => op
    )
    .increment(count as u64);
}

pub(crate) fn record_watch_error(service: &str) {
    counter!("naming_watch_errors_total", "service" => service.to_string()).increment(1);
}
