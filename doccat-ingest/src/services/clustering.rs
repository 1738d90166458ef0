//! Clustering index
//!
//! Deterministic leader clustering: items are visited in input order, each
//! joins the most similar existing group whose centroid is at least
//! `similarity_threshold` away by cosine similarity (or starts a new group),
//! and the group's centroid is updated to the running mean. Groups that end
//! up smaller than `min_cluster_size` (never below two) are dissolved; their
//! members stay unclustered (Uncertain) for manual review.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{ClusteringPolicy, MIN_CLUSTER_SIZE};

/// Cosine similarity; 0.0 for mismatched lengths or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

/// Result of one clustering pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterPlan {
    /// Member ids per accepted group, in input order
    pub groups: Vec<Vec<Uuid>>,
    /// Items left unclustered
    pub uncertain: Vec<Uuid>,
}

struct Group {
    members: Vec<Uuid>,
    centroid: Vec<f64>,
}

impl Group {
    fn centroid_f32(&self) -> Vec<f32> {
        self.centroid.iter().map(|v| *v as f32).collect()
    }

    fn add(&mut self, id: Uuid, vector: &[f32]) {
        self.members.push(id);
        let n = self.members.len() as f64;
        for (c, v) in self.centroid.iter_mut().zip(vector) {
            *c += (*v as f64 - *c) / n;
        }
    }
}

/// Group `(id, vector)` items under `policy`
///
/// Pure function of its input order and values.
pub fn cluster_vectors(items: &[(Uuid, Vec<f32>)], policy: &ClusteringPolicy) -> ClusterPlan {
    let mut groups: Vec<Group> = Vec::new();

    for (id, vector) in items {
        let best = groups
            .iter()
            .enumerate()
            .map(|(idx, group)| (idx, cosine_similarity(vector, &group.centroid_f32())))
            .filter(|(_, sim)| *sim >= policy.similarity_threshold)
            // First group wins ties
            .fold(None::<(usize, f32)>, |best, (idx, sim)| match best {
                Some((_, best_sim)) if best_sim >= sim => best,
                _ => Some((idx, sim)),
            });

        match best {
            Some((idx, _)) => groups[idx].add(*id, vector),
            None => groups.push(Group {
                members: vec![*id],
                centroid: vector.iter().map(|v| *v as f64).collect(),
            }),
        }
    }

    let min_size = policy.min_cluster_size.max(MIN_CLUSTER_SIZE);
    let mut plan = ClusterPlan::default();
    for group in groups {
        if group.members.len() >= min_size {
            plan.groups.push(group.members);
        } else {
            plan.uncertain.extend(group.members);
        }
    }
    plan
}

/// Membership hash: SHA-256 over the sorted member ids
///
/// Identical membership gives the identical hash regardless of order.
pub fn membership_hash(ids: &[Uuid]) -> String {
    let mut sorted: Vec<Uuid> = ids.to_vec();
    sorted.sort();

    let mut hasher = Sha256::new();
    for id in sorted {
        hasher.update(id.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
