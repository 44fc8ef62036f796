use crate::error::GacError;
use crate::voting::PipelineContext;
use log::{debug, info};
use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use std::collections::BTreeMap;

const MAX_ITERATIONS: usize = 100;
// Fewer participants than this always form a single opinion group
const MIN_PARTICIPANTS_FOR_CLUSTERING: usize = 4;
const CENTROID_PERTURBATION: f64 = 1e-6;
const IDENTICAL_CENTROID_TOLERANCE: f64 = 1e-12;

/// Total mapping participant index -> cluster id, with ids `0..cluster_count()` all non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAssignment {
    labels: Vec<usize>,
    cluster_count: usize,
}

impl ClusterAssignment {
    /// Everyone in cluster 0.
    pub fn single(n_participants: usize) -> Self {
        Self {
            labels: vec![0; n_participants],
            cluster_count: usize::from(n_participants > 0),
        }
    }

    /// Relabel raw k-means output so cluster ids are contiguous and every cluster is non-empty.
    pub fn from_labels(raw: &[usize]) -> Self {
        let mut remap = BTreeMap::new();
        for &label in raw {
            remap.entry(label).or_insert(0usize);
        }
        for (next, id) in remap.values_mut().enumerate() {
            *id = next;
        }
        Self {
            labels: raw.iter().map(|label| remap[label]).collect(),
            cluster_count: remap.len(),
        }
    }

    #[cfg(test)]
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn label(&self, participant: usize) -> usize {
        self.labels[participant]
    }

    pub fn cluster_count(&self) -> usize {
        self.cluster_count
    }

    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.cluster_count];
        for &label in &self.labels {
            sizes[label] += 1;
        }
        sizes
    }
}

/// Upper bound on the number of opinion groups: `clamp(floor(sqrt(n / 4)), 2, 5)`.
pub fn max_clusters(n_participants: usize) -> usize {
    ((n_participants as f64 / 4.0).sqrt().floor() as usize).clamp(2, 5)
}

/// Smallest group worth treating as a distinct opinion: `max(2, floor(log2 n))`.
pub fn min_cluster_size(n_participants: usize) -> usize {
    if n_participants == 0 {
        return 2;
    }
    ((n_participants as f64).log2().floor() as usize).max(2)
}

/// Partition participants into opinion groups.
///
/// Tries k from `max_clusters(n)` down to 2 and accepts the first k whose groups all reach
/// `min_cluster_size(n)`. Each k gets `restarts` seeded k-means runs; among qualifying runs the
/// one with the best silhouette wins. Falls back to a single group when nothing qualifies.
pub fn cluster_participants(
    ctx: &PipelineContext,
    points: &[Vec<f64>],
    rng: &mut StdRng,
) -> ClusterAssignment {
    let n = points.len();
    if n < MIN_PARTICIPANTS_FOR_CLUSTERING {
        debug!("[{}] {} participants, using a single cluster", ctx.poll_id, n);
        return ClusterAssignment::single(n);
    }

    let max_k = max_clusters(n);
    let min_size = min_cluster_size(n);

    for k in (2..=max_k).rev() {
        let mut best: Option<(Vec<usize>, f64)> = None;

        for _ in 0..ctx.kmeans_restarts.max(1) {
            let labels = match kmeans(points, k, rng) {
                Ok(labels) => labels,
                Err(e) => {
                    debug!("[{}] k-means failed for k={}: {}", ctx.poll_id, k, e);
                    continue;
                }
            };

            let mut sizes = vec![0usize; k];
            for &label in &labels {
                sizes[label] += 1;
            }
            if sizes.iter().any(|&size| size < min_size) {
                debug!(
                    "[{}] k={} rejected, cluster sizes {:?} below minimum {}",
                    ctx.poll_id, k, sizes, min_size
                );
                continue;
            }

            let score = silhouette_score(points, &labels);
            debug!("[{}] silhouette for k={}: {:.4}", ctx.poll_id, k, score);
            if best.as_ref().is_none_or(|(_, s)| score > *s) {
                best = Some((labels, score));
            }
        }

        if let Some((labels, score)) = best {
            let assignment = ClusterAssignment::from_labels(&labels);
            info!(
                "[{}] using {} clusters (sizes {:?}, silhouette {:.4})",
                ctx.poll_id,
                assignment.cluster_count(),
                assignment.cluster_sizes(),
                score
            );
            return assignment;
        }
    }

    info!("[{}] no clustering met the size bounds, using a single cluster", ctx.poll_id);
    ClusterAssignment::single(n)
}

/// Lloyd's k-means over `points`, seeded from `rng`.
///
/// Starts from `k` distinct sampled points, reseeds empty clusters from random points and stops
/// once assignments repeat or after 100 rounds, returning the last assignment either way.
/// Labels may include empty clusters; callers decide whether that is acceptable.
pub fn kmeans(points: &[Vec<f64>], k: usize, rng: &mut StdRng) -> Result<Vec<usize>, GacError> {
    let n = points.len();
    if n == 0 {
        return Err(GacError::NumericDegeneracy("no points to cluster".to_string()));
    }
    let k = k.min(n);
    if k == 0 {
        return Err(GacError::NumericDegeneracy("k must be at least 1".to_string()));
    }
    let dim = points[0].len();
    if points.iter().any(|p| p.len() != dim) {
        return Err(GacError::NumericDegeneracy("points differ in dimension".to_string()));
    }

    let mut centroids: Vec<Vec<f64>> = sample(rng, n, k)
        .into_iter()
        .map(|i| points[i].clone())
        .collect();

    let all_identical = centroids.iter().all(|c| {
        c.iter()
            .zip(&centroids[0])
            .all(|(a, b)| (a - b).abs() <= IDENTICAL_CENTROID_TOLERANCE)
    });
    if all_identical && k > 1 {
        for centroid in centroids.iter_mut() {
            for x in centroid.iter_mut() {
                *x += rng.gen_range(-CENTROID_PERTURBATION..=CENTROID_PERTURBATION);
            }
        }
    }

    let mut previous: Option<Vec<usize>> = None;
    for _ in 0..MAX_ITERATIONS {
        let labels: Vec<usize> = points.iter().map(|p| nearest(p, &centroids)).collect();
        if previous.as_ref() == Some(&labels) {
            return Ok(labels);
        }

        let mut sums = vec![vec![0.0; dim]; k];
        let mut counts = vec![0usize; k];
        for (point, &label) in points.iter().zip(&labels) {
            counts[label] += 1;
            for (sum, x) in sums[label].iter_mut().zip(point) {
                *sum += x;
            }
        }
        for (c, centroid) in centroids.iter_mut().enumerate() {
            if counts[c] == 0 {
                *centroid = points[rng.gen_range(0..n)].clone();
            } else {
                *centroid = sums[c].iter().map(|s| s / counts[c] as f64).collect();
            }
        }

        previous = Some(labels);
    }

    debug!("k-means did not converge in {} rounds, keeping last assignment", MAX_ITERATIONS);
    Ok(previous.unwrap_or_else(|| vec![0; n]))
}

/// Mean silhouette `(b - a) / max(a, b)` over all points, with `0 / 0` read as 0.
///
/// `a` is the mean distance to the point's own cluster, `b` the smallest mean distance to
/// any other cluster (0 when there is none).
pub fn silhouette_score(points: &[Vec<f64>], labels: &[usize]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }

    let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        members.entry(label).or_default().push(i);
    }

    let mean_distance = |i: usize, group: &[usize]| -> f64 {
        group.iter().map(|&j| distance(&points[i], &points[j])).sum::<f64>() / group.len() as f64
    };

    let total: f64 = (0..points.len())
        .map(|i| {
            let own = labels[i];
            let a = mean_distance(i, &members[&own]);
            let b = members
                .iter()
                .filter(|&(&label, _)| label != own)
                .map(|(_, group)| mean_distance(i, group))
                .min_by(f64::total_cmp)
                .unwrap_or(0.0);
            let denom = a.max(b);
            if denom == 0.0 { 0.0 } else { (b - a) / denom }
        })
        .sum();

    total / points.len() as f64
}

fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (c, centroid) in centroids.iter().enumerate() {
        let d = distance(point, centroid);
        if d < best_distance {
            best = c;
            best_distance = d;
        }
    }
    best
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
