//! Curated dataset presets that drive counter deltas.
//!
//! Catalog content only; presentation belongs to the host UI.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Low,
    Medium,
    High,
}

/// One launchable encrypted workload.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetCard {
    pub id: u32,
    pub name: &'static str,
    pub category: &'static str,
    pub description: &'static str,
    pub size: &'static str,
    pub difficulty: Difficulty,
    pub expected_latency: &'static str,
    /// Signed counter delta this workload applies when run.
    pub delta: i64,
}

impl DatasetCard {
    /// Negative-delta presets exercise the rollback path.
    pub fn is_rollback(&self) -> bool {
        self.delta < 0
    }

    pub fn delta_label(&self) -> String {
        if self.delta >= 0 {
            format!("Δ = +{}", self.delta)
        } else {
            format!("Δ = {}", self.delta)
        }
    }
}

const PRESETS: &[DatasetCard] = &[
    DatasetCard {
        id: 1,
        name: "Credit risk profiles",
        category: "Institutional risk",
        description: "Anonymized credit behavior features for encrypted scoring pipelines.",
        size: "120K records",
        difficulty: Difficulty::Medium,
        expected_latency: "~8s",
        delta: 3,
    },
    DatasetCard {
        id: 2,
        name: "IoT telemetry streams",
        category: "Smart city telemetry",
        description: "Time-series sensor signals for encrypted anomaly detection.",
        size: "2.4M events",
        difficulty: Difficulty::High,
        expected_latency: "~14s",
        delta: 5,
    },
    DatasetCard {
        id: 3,
        name: "Healthcare outcomes",
        category: "Clinical research",
        description: "De-identified clinical metrics to benchmark encrypted analytics.",
        size: "38K patients",
        difficulty: Difficulty::Medium,
        expected_latency: "~10s",
        delta: 2,
    },
    DatasetCard {
        id: 4,
        name: "Private equity desk",
        category: "Finance simulation",
        description: "Encrypted trade deltas to stress-test the counter rollback path.",
        size: "12K positions",
        difficulty: Difficulty::Low,
        expected_latency: "~6s",
        delta: -4,
    },
    DatasetCard {
        id: 5,
        name: "Genomic pipelines",
        category: "Bio-compute",
        description: "Batch workloads that require heavier lattice parameters.",
        size: "4.8 TB",
        difficulty: Difficulty::High,
        expected_latency: "~18s",
        delta: 7,
    },
    DatasetCard {
        id: 6,
        name: "Retail ops",
        category: "Supply-chain",
        description: "Run encrypted demand planning and rollback test vectors.",
        size: "680K orders",
        difficulty: Difficulty::Low,
        expected_latency: "~5s",
        delta: -2,
    },
];

/// The built-in catalog.
pub fn presets() -> &'static [DatasetCard] {
    PRESETS
}

/// Look up a preset by id.
pub fn preset(id: u32) -> Option<&'static DatasetCard> {
    PRESETS.iter().find(|card| card.id == id)
}
