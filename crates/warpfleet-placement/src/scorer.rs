//! Cluster scoring for placement decisions.
//!
//! Evaluates candidate clusters using a weighted combination of:
//! - **Affinity**: prefer clusters whose labels match the policy's preferred labels
//! - **Balance**: prefer clusters hosting fewer workloads than the fleet average

use std::collections::HashMap;

use warpfleet_state::ClusterName;

/// What the scorer knows about one eligible cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterCandidate {
    pub name: ClusterName,
    pub labels: HashMap<String, String>,
    /// Bindings currently targeting this cluster.
    pub workload_count: u32,
}

impl ClusterCandidate {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            labels: HashMap::new(),
            workload_count: 0,
        }
    }
}

/// Scored result for a single cluster.
#[derive(Debug, Clone)]
pub struct ClusterScore {
    pub name: ClusterName,
    /// Total composite score (higher = better). Range: 0.0..=100.0.
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Individual score components for debugging.
#[derive(Debug, Clone)]
pub struct ScoreBreakdown {
    pub affinity: f64,
    pub balance: f64,
}

/// Weights for the scoring components.
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub affinity: f64,
    pub balance: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            affinity: 0.6,
            balance: 0.4,
        }
    }
}

/// Score a single cluster.
pub fn score_cluster(
    candidate: &ClusterCandidate,
    preferred_labels: &HashMap<String, String>,
    weights: &ScoringWeights,
    fleet_avg_load: f64,
) -> ClusterScore {
    let total_preferred = preferred_labels.len();
    let matched = preferred_labels
        .iter()
        .filter(|(k, v)| candidate.labels.get(*k).is_some_and(|cv| cv == *v))
        .count();
    let affinity = if total_preferred > 0 {
        (matched as f64 / total_preferred as f64) * 100.0
    } else {
        50.0 // Neutral when no preferences.
    };

    // Full marks at or below the average, decaying with the excess.
    let load = f64::from(candidate.workload_count);
    let excess = (load - fleet_avg_load).max(0.0);
    let balance = 100.0 / (1.0 + excess);

    ClusterScore {
        name: candidate.name.clone(),
        score: weights.affinity * affinity + weights.balance * balance,
        breakdown: ScoreBreakdown { affinity, balance },
    }
}

/// Score all candidates and return them best first. Equal scores are
/// ordered by name so the ranking is deterministic.
pub fn rank_clusters(
    candidates: &[ClusterCandidate],
    preferred_labels: &HashMap<String, String>,
    weights: &ScoringWeights,
) -> Vec<ClusterScore> {
    let fleet_avg = if candidates.is_empty() {
        0.0
    } else {
        let total: f64 = candidates.iter().map(|c| f64::from(c.workload_count)).sum();
        total / candidates.len() as f64
    };

    let mut scores: Vec<ClusterScore> = candidates
        .iter()
        .map(|c| score_cluster(c, preferred_labels, weights, fleet_avg))
        .collect();

    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    scores
}
