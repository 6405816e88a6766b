//! Deterministic endpoint scoring.
//!
//! The weights are part of the output contract: they are published in
//! `summary.json` so a consumer can reproduce every score from the
//! aggregates alone. The body-evidence factor multiplies the weighted sum,
//! suppressing endpoints that rarely produced a parseable JSON body.

use serde::{Deserialize, Serialize};

use crate::aggregate::EndpointAggregate;

pub const WEIGHT_FREQUENCY: f64 = 0.30;
pub const WEIGHT_PAYLOAD_SIZE: f64 = 0.30;
pub const WEIGHT_STRUCTURE: f64 = 0.20;
pub const WEIGHT_STABILITY: f64 = 0.20;

pub const BODY_EVIDENCE_SCALE: f64 = 1.5;
pub const BODY_EVIDENCE_MIN_FACTOR: f64 = 0.05;

/// Frequency saturates at one third of all captures; size at this many bytes.
const FREQUENCY_SATURATION: f64 = 3.0;
const SIZE_SATURATION_BYTES: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringWeights {
    pub frequency: f64,
    pub payload_size: f64,
    pub structure: f64,
    pub stability: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            frequency: WEIGHT_FREQUENCY,
            payload_size: WEIGHT_PAYLOAD_SIZE,
            structure: WEIGHT_STRUCTURE,
            stability: WEIGHT_STABILITY,
        }
    }
}

/// Published alongside the weights so the score formula is reproducible.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyEvidenceSpec {
    pub scale: f64,
    pub min_factor: f64,
}

impl Default for BodyEvidenceSpec {
    fn default() -> Self {
        Self {
            scale: BODY_EVIDENCE_SCALE,
            min_factor: BODY_EVIDENCE_MIN_FACTOR,
        }
    }
}

/// An aggregate plus its score, reasons, and derived averages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredEndpoint {
    #[serde(flatten)]
    pub aggregate: EndpointAggregate,
    pub score: f64,
    pub reasons: Vec<String>,
    pub avg_payload_size: f64,
    pub max_payload_size: u64,
    pub distinct_schemas: usize,
    pub body_available_rate: f64,
    pub body_rate: f64,
    pub body_evidence_factor: f64,
}

/// Score and rank all aggregates of a run. `total_captures` is the number of
/// persisted records across the run.
pub fn score_endpoints(
    aggregates: Vec<EndpointAggregate>,
    total_captures: u64,
) -> Vec<ScoredEndpoint> {
    let mut scored: Vec<ScoredEndpoint> = aggregates
        .into_iter()
        .map(|a| score_one(a, total_captures))
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(b.aggregate.count.cmp(&a.aggregate.count))
    });
    scored
}

fn score_one(aggregate: EndpointAggregate, total_captures: u64) -> ScoredEndpoint {
    let count = aggregate.count;
    let total = total_captures.max(1) as f64;
    let mut reasons = Vec::new();

    let frequency_ratio = count as f64 / total;
    let frequency_component = (frequency_ratio * FREQUENCY_SATURATION).min(1.0);
    let frequency_score = frequency_component * WEIGHT_FREQUENCY;
    if frequency_component >= 1.0 {
        reasons.push(format!(
            "high frequency ({count}/{total_captures}, {:.0}%)",
            frequency_ratio * 100.0
        ));
    }

    let avg_payload_size = if aggregate.payload_sizes.is_empty() {
        0.0
    } else {
        aggregate.payload_sizes.iter().sum::<u64>() as f64 / aggregate.payload_sizes.len() as f64
    };
    let max_payload_size = aggregate.payload_sizes.iter().copied().max().unwrap_or(0);
    let size_component = (avg_payload_size / SIZE_SATURATION_BYTES).min(1.0);
    let size_score = size_component * WEIGHT_PAYLOAD_SIZE;
    if size_component >= 1.0 {
        reasons.push(format!("large payloads (avg {:.0} bytes)", avg_payload_size));
    }

    let mut structure_component = 0.0;
    if aggregate.has_array_structure {
        structure_component += 0.5;
        reasons.push("has array structure".to_string());
    }
    if aggregate.has_data_flags {
        structure_component += 0.5;
        reasons.push("has data-like keys".to_string());
    }
    let structure_score = (structure_component * WEIGHT_STRUCTURE).min(WEIGHT_STRUCTURE);

    let distinct_schemas = aggregate.schema_hashes.len();
    let stability_component = if distinct_schemas == 0 {
        0.0
    } else {
        (1.0 - 0.2 * (distinct_schemas as f64 - 1.0)).max(0.2)
    };
    let stability_score = stability_component * WEIGHT_STABILITY;
    match distinct_schemas {
        0 => {}
        1 => reasons.push("stable schema (1 variant)".to_string()),
        n => reasons.push(format!("schema varies ({n} variants)")),
    }

    let raw = frequency_score + size_score + structure_score + stability_score;

    let body_rate = if count == 0 {
        0.0
    } else {
        aggregate.json_parse_success_count as f64 / count as f64
    };
    let body_available_rate = if count == 0 {
        0.0
    } else {
        aggregate.body_available_count as f64 / count as f64
    };
    let body_evidence_factor = (body_rate * BODY_EVIDENCE_SCALE)
        .min(1.0)
        .max(BODY_EVIDENCE_MIN_FACTOR);
    if body_evidence_factor >= 1.0 {
        reasons.push(format!(
            "strong JSON body evidence ({}/{count}, {:.0}%)",
            aggregate.json_parse_success_count,
            body_rate * 100.0
        ));
    } else if body_evidence_factor <= BODY_EVIDENCE_MIN_FACTOR {
        reasons.push(format!(
            "weak body evidence ({}/{count})",
            aggregate.json_parse_success_count
        ));
    }

    let score = (raw * body_evidence_factor).clamp(0.0, 1.0);

    ScoredEndpoint {
        aggregate,
        score,
        reasons,
        avg_payload_size,
        max_payload_size,
        distinct_schemas,
        body_available_rate,
        body_rate,
        body_evidence_factor,
    }
}
