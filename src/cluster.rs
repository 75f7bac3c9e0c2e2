use std::collections::HashMap;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::annot::{Artifact, Column};
use crate::domain::ClusterAlgo;
use crate::error::OmicError;
use crate::reduce::pca;
use crate::store::OmicStore;

#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Target cluster count for k-means.
    pub n_clusters: usize,
    /// Neighborhood size for the kNN graph methods.
    pub n_neighbors: usize,
    pub max_iter: usize,
    pub seed: u64,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            n_clusters: 8,
            n_neighbors: 15,
            max_iter: 300,
            seed: 8,
        }
    }
}

/// Dimensionality used for clustering when a layer is wider than this;
/// distances degenerate in very high-dimensional count space.
const CLUSTER_PCS: usize = 50;

/// Cluster the cells of `layer` and attach the labels as a categorical
/// per-cell column (and label artifact) under `<layer>_<algo>`. Layer
/// matrices are never modified.
pub fn clustering(
    store: &mut OmicStore,
    layer: &str,
    algo: ClusterAlgo,
    options: &ClusterOptions,
) -> Result<Vec<usize>, OmicError> {
    let values = store.values(layer)?;
    let embedded = if values.ncols() > CLUSTER_PCS {
        pca(&values, CLUSTER_PCS, options.max_iter)?
    } else {
        values
    };

    let labels = match algo {
        ClusterAlgo::KMeans => kmeans(&embedded, options.n_clusters, options.max_iter, options.seed)?,
        ClusterAlgo::Knn => knn_components(&embedded, options.n_neighbors)?,
        ClusterAlgo::Louvain => louvain(&embedded, options.n_neighbors, options.max_iter)?,
    };

    let n_categories = labels.iter().copied().max().map_or(0, |m| m + 1);
    let key = format!("{layer}_{algo}");
    store.add_cell_column(
        &key,
        Column::Cat {
            codes: labels.iter().map(|&l| l as u32).collect(),
            categories: (0..n_categories).map(|c| c.to_string()).collect(),
        },
    )?;
    store.add_artifact(&key, Artifact::Labels(labels.clone()));
    Ok(labels)
}

/// Lloyd's algorithm with k-means++ seeding.
pub fn kmeans(
    data: &Array2<f32>,
    k: usize,
    max_iter: usize,
    seed: u64,
) -> Result<Vec<usize>, OmicError> {
    let n = data.nrows();
    let dim = data.ncols();
    if n == 0 || dim == 0 {
        return Err(OmicError::InvalidArgument("empty data".to_string()));
    }
    let k = k.min(n).max(1);

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = vec![0.0_f64; k * dim];
    let first = rng.gen_range(0..n);
    for d in 0..dim {
        centroids[d] = data[[first, d]] as f64;
    }
    for c in 1..k {
        let mut dists = vec![f64::INFINITY; n];
        for (i, dist) in dists.iter_mut().enumerate() {
            for prev in 0..c {
                let d = sq_dist_to_centroid(data, i, &centroids[prev * dim..(prev + 1) * dim]);
                if d < *dist {
                    *dist = d;
                }
            }
        }
        let total: f64 = dists.iter().sum();
        let choice = if total == 0.0 {
            rng.gen_range(0..n)
        } else {
            let mut target = rng.r#gen::<f64>() * total;
            let mut picked = n - 1;
            for (i, &d) in dists.iter().enumerate() {
                target -= d;
                if target <= 0.0 {
                    picked = i;
                    break;
                }
            }
            picked
        };
        for d in 0..dim {
            centroids[c * dim + d] = data[[choice, d]] as f64;
        }
    }

    let mut labels = vec![0usize; n];
    for _ in 0..max_iter {
        let mut changed = false;
        for i in 0..n {
            let mut best = 0;
            let mut best_dist = f64::INFINITY;
            for c in 0..k {
                let d = sq_dist_to_centroid(data, i, &centroids[c * dim..(c + 1) * dim]);
                if d < best_dist {
                    best_dist = d;
                    best = c;
                }
            }
            if labels[i] != best {
                labels[i] = best;
                changed = true;
            }
        }

        let mut sums = vec![0.0_f64; k * dim];
        let mut counts = vec![0usize; k];
        for i in 0..n {
            counts[labels[i]] += 1;
            for d in 0..dim {
                sums[labels[i] * dim + d] += data[[i, d]] as f64;
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                continue;
            }
            for d in 0..dim {
                centroids[c * dim + d] = sums[c * dim + d] / counts[c] as f64;
            }
        }
        if !changed {
            break;
        }
    }
    Ok(labels)
}

fn sq_dist_to_centroid(data: &Array2<f32>, row: usize, centroid: &[f64]) -> f64 {
    centroid
        .iter()
        .enumerate()
        .map(|(d, &c)| {
            let diff = data[[row, d]] as f64 - c;
            diff * diff
        })
        .sum()
}

/// Symmetrized kNN graph as a weighted adjacency list.
fn knn_graph(data: &Array2<f32>, k: usize) -> Vec<Vec<(usize, f64)>> {
    let n = data.nrows();
    let k = k.min(n.saturating_sub(1)).max(1);
    let dim = data.ncols();

    let mut neighbors: Vec<Vec<(usize, f64)>> = Vec::with_capacity(n);
    for i in 0..n {
        let mut dists: Vec<(usize, f64)> = (0..n)
            .filter(|&j| j != i)
            .map(|j| {
                let mut d = 0.0;
                for c in 0..dim {
                    let diff = data[[i, c]] as f64 - data[[j, c]] as f64;
                    d += diff * diff;
                }
                (j, d.sqrt())
            })
            .collect();
        dists.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        dists.truncate(k);
        neighbors.push(dists);
    }

    // Symmetrize with inverse-distance weights.
    let mut adjacency: Vec<HashMap<usize, f64>> = vec![HashMap::new(); n];
    for (i, near) in neighbors.iter().enumerate() {
        for &(j, d) in near {
            let w = 1.0 / (1.0 + d);
            adjacency[i].entry(j).and_modify(|e| *e = e.max(w)).or_insert(w);
            adjacency[j].entry(i).and_modify(|e| *e = e.max(w)).or_insert(w);
        }
    }
    adjacency
        .into_iter()
        .map(|row| row.into_iter().collect())
        .collect()
}

/// Connected components of the symmetrized kNN graph.
fn knn_components(data: &Array2<f32>, k: usize) -> Result<Vec<usize>, OmicError> {
    let n = data.nrows();
    if n == 0 {
        return Err(OmicError::InvalidArgument("empty data".to_string()));
    }
    let graph = knn_graph(data, k);
    let mut labels = vec![usize::MAX; n];
    let mut next = 0usize;
    for start in 0..n {
        if labels[start] != usize::MAX {
            continue;
        }
        let mut stack = vec![start];
        labels[start] = next;
        while let Some(node) = stack.pop() {
            for &(peer, _) in &graph[node] {
                if labels[peer] == usize::MAX {
                    labels[peer] = next;
                    stack.push(peer);
                }
            }
        }
        next += 1;
    }
    Ok(labels)
}

/// Louvain-style community detection: greedy modularity local moves over
/// the symmetrized kNN graph, repeated until no node moves.
fn louvain(data: &Array2<f32>, k: usize, max_iter: usize) -> Result<Vec<usize>, OmicError> {
    let n = data.nrows();
    if n == 0 {
        return Err(OmicError::InvalidArgument("empty data".to_string()));
    }
    let graph = knn_graph(data, k);
    let total_weight: f64 = graph
        .iter()
        .enumerate()
        .flat_map(|(i, row)| row.iter().filter(move |&&(j, _)| i < j))
        .map(|&(_, w)| w)
        .sum();
    let mut assignments: Vec<usize> = (0..n).collect();
    if total_weight == 0.0 {
        return Ok(assignments);
    }
    let m2 = total_weight * 2.0;
    let degrees: Vec<f64> = graph
        .iter()
        .map(|row| row.iter().map(|&(_, w)| w).sum())
        .collect();

    for _ in 0..max_iter {
        let mut moved = false;
        let mut community_degree: HashMap<usize, f64> = HashMap::new();
        for (node, &community) in assignments.iter().enumerate() {
            *community_degree.entry(community).or_insert(0.0) += degrees[node];
        }

        for node in 0..n {
            let current = assignments[node];
            let mut weight_to: HashMap<usize, f64> = HashMap::new();
            for &(peer, w) in &graph[node] {
                *weight_to.entry(assignments[peer]).or_insert(0.0) += w;
            }
            let k_i = degrees[node];
            let w_current = weight_to.get(&current).copied().unwrap_or(0.0);
            let sigma_current = community_degree.get(&current).copied().unwrap_or(0.0);

            let mut best = current;
            let mut best_gain = 0.0;
            for (&candidate, &w_in) in &weight_to {
                if candidate == current {
                    continue;
                }
                let sigma = community_degree.get(&candidate).copied().unwrap_or(0.0);
                let gain = (w_in - w_current) / m2
                    - k_i * (sigma - (sigma_current - k_i)) / (m2 * m2) * 2.0;
                if gain > best_gain {
                    best_gain = gain;
                    best = candidate;
                }
            }
            if best != current {
                *community_degree.entry(current).or_insert(0.0) -= k_i;
                *community_degree.entry(best).or_insert(0.0) += k_i;
                assignments[node] = best;
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }

    renumber(&mut assignments);
    Ok(assignments)
}

fn renumber(assignments: &mut [usize]) {
    let mut seen: Vec<usize> = Vec::new();
    for value in assignments.iter_mut() {
        *value = match seen.iter().position(|&c| c == *value) {
            Some(index) => index,
            None => {
                seen.push(*value);
                seen.len() - 1
            }
        };
    }
}
