//! Metrics collection for backup and recovery
//!
//! Provides Prometheus-compatible counters and histograms for backups, restores,
//! retention sweeps, version-control commands and recovery attempts.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    /// Counter for backup attempts by kind and outcome
    static ref BACKUPS: IntCounterVec = register_int_counter_vec!(
        "statekeeper_backups_total",
        "Total number of backup attempts",
        &["kind", "status"]
    ).unwrap();

    /// Histogram for backup duration
    static ref BACKUP_DURATION: HistogramVec = register_histogram_vec!(
        "statekeeper_backup_duration_seconds",
        "Backup creation duration in seconds",
        &["kind"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    static ref RESTORES: IntCounterVec = register_int_counter_vec!(
        "statekeeper_restores_total",
        "Total number of restores from backup",
        &["mode", "status"]
    ).unwrap();

    static ref RETENTION_REMOVED: IntCounter = register_int_counter!(
        "statekeeper_retention_removed_total",
        "Backups removed by retention sweeps"
    ).unwrap();

    static ref VCS_COMMANDS: IntCounterVec = register_int_counter_vec!(
        "statekeeper_vcs_commands_total",
        "Version-control commands by operation and outcome",
        &["operation", "status"]
    ).unwrap();

    static ref RECOVERIES: IntCounterVec = register_int_counter_vec!(
        "statekeeper_recoveries_total",
        "Recovery attempts by strategy and outcome",
        &["strategy", "status"]
    ).unwrap();

    static ref RECOVERY_DURATION: HistogramVec = register_histogram_vec!(
        "statekeeper_recovery_duration_seconds",
        "Recovery duration in seconds",
        &["strategy"],
        vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
    ).unwrap();
}

pub fn record_backup(kind: &str, status: &str, duration: Duration) {
    BACKUPS.with_label_values(&[kind, status]).inc();
    BACKUP_DURATION
        .with_label_values(&[kind])
        .observe(duration.as_secs_f64());
}

pub fn record_restore(mode: &str, status: &str) {
    RESTORES.with_label_values(&[mode, status]).inc();
}

pub fn record_retention_removed(count: usize) {
    RETENTION_REMOVED.inc_by(count as u64);
}

pub fn record_vcs_command(operation: &str, status: &str) {
    VCS_COMMANDS.with_label_values(&[operation, status]).inc();
}

pub fn record_recovery(strategy: &str, status: &str, duration: Duration) {
    RECOVERIES.with_label_values(&[strategy, status]).inc();
    RECOVERY_DURATION
        .with_label_values(&[strategy])
        .observe(duration.as_secs_f64());
}

/// Export all metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
