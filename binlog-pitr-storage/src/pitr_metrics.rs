// Metric name constants for the collector, the manifest and the recoverer.
// The binary registers descriptions and installs the exporter.

#[derive(Debug, Clone, Copy)]
pub struct Metric {
    pub name: &'static str,
    pub description: &'static str,
}

// Collector metrics
pub const COLLECTOR_CYCLES_TOTAL: Metric = Metric {
    name: "pitr_collector_cycles_total",
    description: "Total number of collection cycles (result={committed,empty,error})",
};

pub const COLLECTOR_SEGMENTS_COMMITTED_TOTAL: Metric = Metric {
    name: "pitr_collector_segments_committed_total",
    description: "Total number of segments committed to object storage (provider)",
};

pub const COLLECTOR_SEGMENT_BYTES_TOTAL: Metric = Metric {
    name: "pitr_collector_segment_bytes_total",
    description: "Total payload bytes committed to object storage (provider)",
};

pub const COLLECTOR_EVENTS_TOTAL: Metric = Metric {
    name: "pitr_collector_events_total",
    description: "Total number of binlog events captured into committed segments",
};

pub const COLLECTOR_APPEND_RETRIES_TOTAL: Metric = Metric {
    name: "pitr_collector_append_retries_total",
    description: "Total number of segment append retries after transient storage errors",
};

pub const COLLECTOR_CYCLE_LATENCY_MS: Metric = Metric {
    name: "pitr_collector_cycle_latency_ms",
    description: "Wall time of one collection cycle, capture plus commit",
};

// Manifest metrics
pub const MANIFEST_LIST_TOTAL: Metric = Metric {
    name: "pitr_manifest_list_total",
    description: "Total number of manifest listings (provider)",
};

pub const MANIFEST_CONSISTENCY_ISSUES_TOTAL: Metric = Metric {
    name: "pitr_manifest_consistency_issues_total",
    description: "Total number of superseded segments found while selecting a chain",
};

// Recoverer metrics
pub const RECOVERY_SEGMENTS_APPLIED_TOTAL: Metric = Metric {
    name: "pitr_recovery_segments_applied_total",
    description: "Total number of segments downloaded and replayed",
};

pub const RECOVERY_EVENTS_APPLIED_TOTAL: Metric = Metric {
    name: "pitr_recovery_events_applied_total",
    description: "Total number of events handed to the apply sink",
};

pub const RECOVERY_SEGMENT_FETCH_LATENCY_MS: Metric = Metric {
    name: "pitr_recovery_segment_fetch_latency_ms",
    description: "Latency to download and verify one segment",
};

pub const RECOVERY_RUNS_TOTAL: Metric = Metric {
    name: "pitr_recovery_runs_total",
    description: "Total number of recovery runs (result={completed,partial,error})",
};

pub const COUNTERS: [Metric; 10] = [
    COLLECTOR_CYCLES_TOTAL,
    COLLECTOR_SEGMENTS_COMMITTED_TOTAL,
    COLLECTOR_SEGMENT_BYTES_TOTAL,
    COLLECTOR_EVENTS_TOTAL,
    COLLECTOR_APPEND_RETRIES_TOTAL,
    MANIFEST_LIST_TOTAL,
    MANIFEST_CONSISTENCY_ISSUES_TOTAL,
    RECOVERY_SEGMENTS_APPLIED_TOTAL,
    RECOVERY_EVENTS_APPLIED_TOTAL,
    RECOVERY_RUNS_TOTAL,
];

pub const HISTOGRAMS: [Metric; 2] = [COLLECTOR_CYCLE_LATENCY_MS, RECOVERY_SEGMENT_FETCH_LATENCY_MS];
