//! K-means partitioning of the vector space and example selection.
//!
//! # Algorithm
//!
//! 1. `k = min(n_clusters, corpus size)`.
//! 2. `n_init` runs of Lloyd's algorithm, each seeded with k-means++ from
//!    one ChaCha RNG, so the whole selection is reproducible for a seed.
//! 3. The run with the lowest inertia (within-cluster sum of squared
//!    distances) wins. A cluster that loses all its members keeps its
//!    previous centroid.
//! 4. For each non-empty cluster, the member with the highest cosine
//!    similarity to the centroid becomes the [`Example`]; its distance is
//!    `1 - similarity`. Empty clusters yield no example.

use anyhow::Result;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::PipelineError;
use crate::models::Example;
use crate::vector::{SparseVector, VectorSpaceModel};

/// Clustering settings.
#[derive(Debug, Clone, Copy)]
pub struct ClusterConfig {
    pub n_clusters: usize,
    pub seed: u64,
    pub n_init: usize,
    pub max_iter: usize,
    /// Convergence threshold on total squared centroid movement.
    pub tolerance: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            n_clusters: 25,
            seed: 42,
            n_init: 10,
            max_iter: 300,
            tolerance: 1e-8,
        }
    }
}

/// Result of one k-means run.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Cluster index per input vector.
    pub labels: Vec<usize>,
    /// Dense centroids, `k × dims`.
    pub centroids: Vec<Vec<f64>>,
    pub inertia: f64,
}

impl Partition {
    pub fn members(&self, cluster: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, &label)| label == cluster)
            .map(|(i, _)| i)
            .collect()
    }
}

fn squared_norm(dense: &[f64]) -> f64 {
    dense.iter().map(|v| v * v).sum()
}

/// Squared euclidean distance between a sparse point and a dense centroid.
fn squared_distance(x: &SparseVector, x_norm2: f64, c: &[f64], c_norm2: f64) -> f64 {
    (x_norm2 - 2.0 * x.dot_dense(c) + c_norm2).max(0.0)
}

fn densify(x: &SparseVector, dims: usize) -> Vec<f64> {
    let mut dense = vec![0.0; dims];
    for (i, v) in x.iter() {
        if i < dims {
            dense[i] = v as f64;
        }
    }
    dense
}

/// Seed `k` centroids: the first uniformly, the rest with probability
/// proportional to the squared distance to the nearest chosen centroid.
fn kmeans_plus_plus(
    points: &[SparseVector],
    norms: &[f64],
    dims: usize,
    k: usize,
    rng: &mut ChaCha8Rng,
) -> Vec<Vec<f64>> {
    let n = points.len();
    let mut centroids = Vec::with_capacity(k);
    centroids.push(densify(&points[rng.gen_range(0..n)], dims));

    let mut nearest = vec![f64::INFINITY; n];
    while centroids.len() < k {
        if let Some(last) = centroids.last() {
            let last_norm2 = squared_norm(last);
            for (i, point) in points.iter().enumerate() {
                let d = squared_distance(point, norms[i], last, last_norm2);
                if d < nearest[i] {
                    nearest[i] = d;
                }
            }
        }

        let total: f64 = nearest.iter().sum();
        let next = if total > 0.0 {
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = n - 1;
            for (i, d) in nearest.iter().enumerate() {
                if target < *d {
                    chosen = i;
                    break;
                }
                target -= d;
            }
            chosen
        } else {
            rng.gen_range(0..n)
        };
        centroids.push(densify(&points[next], dims));
    }
    centroids
}

fn assign(points: &[SparseVector], norms: &[f64], centroids: &[Vec<f64>]) -> (Vec<usize>, f64) {
    let centroid_norms: Vec<f64> = centroids.iter().map(|c| squared_norm(c)).collect();
    let mut inertia = 0.0;
    let labels = points
        .iter()
        .enumerate()
        .map(|(i, point)| {
            let mut best = 0;
            let mut best_d = f64::INFINITY;
            for (c, centroid) in centroids.iter().enumerate() {
                let d = squared_distance(point, norms[i], centroid, centroid_norms[c]);
                if d < best_d {
                    best = c;
                    best_d = d;
                }
            }
            inertia += best_d;
            best
        })
        .collect();
    (labels, inertia)
}

/// Recompute centroids in place; returns total squared movement.
fn update_centroids(points: &[SparseVector], labels: &[usize], centroids: &mut [Vec<f64>]) -> f64 {
    let dims = centroids.first().map(Vec::len).unwrap_or(0);
    let mut sums = vec![vec![0.0; dims]; centroids.len()];
    let mut counts = vec![0usize; centroids.len()];
    for (point, &label) in points.iter().zip(labels) {
        counts[label] += 1;
        for (i, v) in point.iter() {
            sums[label][i] += v as f64;
        }
    }

    let mut shift = 0.0;
    for ((centroid, sum), count) in centroids.iter_mut().zip(sums).zip(counts) {
        if count == 0 {
            continue;
        }
        let updated: Vec<f64> = sum.into_iter().map(|s| s / count as f64).collect();
        shift += centroid
            .iter()
            .zip(&updated)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>();
        *centroid = updated;
    }
    shift
}

/// Partition `points` into `k` clusters, keeping the best of
/// `config.n_init` seeded runs.
///
/// # Errors
///
/// [`PipelineError::EmptyCorpus`] if `points` is empty.
pub fn kmeans(points: &[SparseVector], dims: usize, k: usize, config: &ClusterConfig) -> Result<Partition> {
    if points.is_empty() {
        return Err(PipelineError::EmptyCorpus.into());
    }
    let k = k.clamp(1, points.len());
    let norms: Vec<f64> = points.iter().map(|p| p.norm().powi(2)).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);

    let mut best: Option<Partition> = None;
    for run in 0..config.n_init.max(1) {
        let mut centroids = kmeans_plus_plus(points, &norms, dims, k, &mut rng);
        let (mut labels, _) = assign(points, &norms, &centroids);

        for _ in 0..config.max_iter {
            let shift = update_centroids(points, &labels, &mut centroids);
            let (next, _) = assign(points, &norms, &centroids);
            let stable = next == labels;
            labels = next;
            if stable || shift <= config.tolerance {
                break;
            }
        }
        update_centroids(points, &labels, &mut centroids);
        let (labels, inertia) = assign(points, &norms, &centroids);

        tracing::trace!(run, inertia, "k-means run finished");
        if best.as_ref().map_or(true, |b| inertia < b.inertia) {
            best = Some(Partition {
                labels,
                centroids,
                inertia,
            });
        }
    }

    best.ok_or_else(|| PipelineError::EmptyCorpus.into())
}

/// Cluster the model's documents and pick one representative per
/// non-empty cluster, in cluster order.
pub fn select_examples(model: &VectorSpaceModel, config: &ClusterConfig) -> Result<Vec<Example>> {
    if model.is_empty() {
        return Err(PipelineError::EmptyCorpus.into());
    }
    let k = config.n_clusters.min(model.len()).max(1);
    let partition = kmeans(model.vectors(), model.feature_count(), k, config)?;

    let mut examples = Vec::new();
    for (cluster_id, centroid) in partition.centroids.iter().enumerate() {
        let members = partition.members(cluster_id);
        if members.is_empty() {
            tracing::debug!(cluster_id, "skipping empty cluster");
            continue;
        }

        let centroid_norm = squared_norm(centroid).sqrt();
        let mut best: Option<(usize, f64)> = None;
        for &i in &members {
            let vector = &model.vectors()[i];
            let denom = vector.norm() * centroid_norm;
            let similarity = if denom > 0.0 {
                vector.dot_dense(centroid) / denom
            } else {
                0.0
            };
            if best.map_or(true, |(_, s)| similarity > s) {
                best = Some((i, similarity));
            }
        }

        if let Some((i, similarity)) = best {
            examples.push(Example {
                document_id: model.document_ids()[i].clone(),
                cluster_id,
                distance_to_centroid: (1.0 - similarity) as f32,
            });
        }
    }

    tracing::info!(
        clusters = k,
        examples = examples.len(),
        inertia = partition.inertia,
        "examples selected"
    );
    Ok(examples)
}
