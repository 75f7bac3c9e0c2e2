use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::annot::Artifact;
use crate::domain::ReduceAlgo;
use crate::error::OmicError;
use crate::store::OmicStore;

/// Configuration shared by the reduction strategies.
#[derive(Debug, Clone)]
pub struct ReduceOptions {
    pub n_components: usize,
    /// Power-iteration cap (PCA) or gradient steps (t-SNE).
    pub max_iter: usize,
    pub perplexity: f64,
    pub learning_rate: f64,
    pub seed: u64,
}

impl Default for ReduceOptions {
    fn default() -> Self {
        Self {
            n_components: 2,
            max_iter: 500,
            perplexity: 30.0,
            learning_rate: 200.0,
            seed: 8,
        }
    }
}

/// Compute a low-dimensional embedding of `layer` and attach it to the
/// store under `<layer>_<algo>`, together with an unstructured artifact of
/// the coordinates. The layer matrix itself is never modified.
pub fn dimension_reduce(
    store: &mut OmicStore,
    layer: &str,
    algo: ReduceAlgo,
    options: &ReduceOptions,
) -> Result<Array2<f32>, OmicError> {
    let values = store.values(layer)?;
    let embedding = match algo {
        ReduceAlgo::Pca => pca(&values, options.n_components, options.max_iter)?,
        // t-SNE is a visualization embedding; like the reference tooling it
        // always produces two components.
        ReduceAlgo::Tsne => tsne(&values, options)?,
    };
    let key = format!("{layer}_{algo}");
    store.add_cell_matrix(&key, embedding.clone())?;
    store.add_artifact(&key, Artifact::Matrix(embedding.clone()));
    Ok(embedding)
}

/// PCA via power iteration with deflation on the covariance matrix.
pub fn pca(values: &Array2<f32>, n_components: usize, max_iter: usize) -> Result<Array2<f32>, OmicError> {
    let n_samples = values.nrows();
    let n_features = values.ncols();
    if n_samples < 2 {
        return Err(OmicError::InvalidArgument(
            "need at least two cells for PCA".to_string(),
        ));
    }
    if n_components == 0 {
        return Err(OmicError::InvalidArgument(
            "n_components must be positive".to_string(),
        ));
    }
    let n_components = n_components.min(n_features).min(n_samples);

    // Center in f64 to keep the covariance accumulation stable.
    let mut centered = vec![0.0_f64; n_samples * n_features];
    let mut mean = vec![0.0_f64; n_features];
    for row in 0..n_samples {
        for col in 0..n_features {
            mean[col] += values[[row, col]] as f64;
        }
    }
    for value in mean.iter_mut() {
        *value /= n_samples as f64;
    }
    for row in 0..n_samples {
        for col in 0..n_features {
            centered[row * n_features + col] = values[[row, col]] as f64 - mean[col];
        }
    }

    let mut cov = vec![0.0_f64; n_features * n_features];
    for row in 0..n_samples {
        let r = &centered[row * n_features..(row + 1) * n_features];
        for i in 0..n_features {
            for j in i..n_features {
                let value = r[i] * r[j];
                cov[i * n_features + j] += value;
                if i != j {
                    cov[j * n_features + i] += value;
                }
            }
        }
    }
    let scale = (n_samples - 1) as f64;
    for value in cov.iter_mut() {
        *value /= scale;
    }

    let mut components = Vec::with_capacity(n_components * n_features);
    for _ in 0..n_components {
        let (eigenvalue, eigenvector) = power_iteration(&cov, n_features, max_iter);
        components.extend_from_slice(&eigenvector);
        for i in 0..n_features {
            for j in 0..n_features {
                cov[i * n_features + j] -= eigenvalue * eigenvector[i] * eigenvector[j];
            }
        }
    }

    let mut transformed = Array2::zeros((n_samples, n_components));
    for row in 0..n_samples {
        let r = &centered[row * n_features..(row + 1) * n_features];
        for comp in 0..n_components {
            let c = &components[comp * n_features..(comp + 1) * n_features];
            let dot: f64 = r.iter().zip(c).map(|(a, b)| a * b).sum();
            transformed[[row, comp]] = dot as f32;
        }
    }
    Ok(transformed)
}

fn power_iteration(matrix: &[f64], n: usize, max_iter: usize) -> (f64, Vec<f64>) {
    let mut v: Vec<f64> = (0..n).map(|i| 1.0 / (i + 1) as f64).collect();
    let norm: f64 = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        for value in v.iter_mut() {
            *value /= norm;
        }
    }
    let mut eigenvalue = 0.0;
    for _ in 0..max_iter {
        let mut w = vec![0.0; n];
        for i in 0..n {
            let mut sum = 0.0;
            for j in 0..n {
                sum += matrix[i * n + j] * v[j];
            }
            w[i] = sum;
        }
        let new_eigenvalue: f64 = v.iter().zip(&w).map(|(a, b)| a * b).sum();
        let wnorm: f64 = w.iter().map(|x| x * x).sum::<f64>().sqrt();
        if wnorm == 0.0 {
            break;
        }
        for value in w.iter_mut() {
            *value /= wnorm;
        }
        let diff: f64 = v
            .iter()
            .zip(&w)
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt();
        v = w;
        eigenvalue = new_eigenvalue;
        if diff < 1e-10 {
            break;
        }
    }
    (eigenvalue.abs(), v)
}

/// Exact t-SNE with adaptive gains and momentum. Always embeds into 2-D.
pub fn tsne(values: &Array2<f32>, options: &ReduceOptions) -> Result<Array2<f32>, OmicError> {
    const OUT_DIM: usize = 2;
    let n = values.nrows();
    let n_features = values.ncols();
    if n < 3 {
        return Err(OmicError::InvalidArgument(
            "need at least three cells for t-SNE".to_string(),
        ));
    }
    let perplexity = options.perplexity.min((n as f64 - 1.0) / 3.0).max(1.0);

    let mut sq_dists = vec![0.0_f64; n * n];
    for i in 0..n {
        for j in (i + 1)..n {
            let mut d = 0.0;
            for k in 0..n_features {
                let diff = values[[i, k]] as f64 - values[[j, k]] as f64;
                d += diff * diff;
            }
            sq_dists[i * n + j] = d;
            sq_dists[j * n + i] = d;
        }
    }
    let p = joint_probabilities(&sq_dists, n, perplexity);

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut y = vec![0.0_f64; n * OUT_DIM];
    for value in y.iter_mut() {
        *value = rng.r#gen::<f64>() * 0.01 - 0.005;
    }
    let mut gains = vec![1.0_f64; n * OUT_DIM];
    let mut velocities = vec![0.0_f64; n * OUT_DIM];
    let momentum_switch = 250;

    for iter in 0..options.max_iter {
        let momentum = if iter < momentum_switch { 0.5 } else { 0.8 };

        let mut q_num = vec![0.0_f64; n * n];
        let mut q_sum = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                let mut d2 = 0.0;
                for d in 0..OUT_DIM {
                    let diff = y[i * OUT_DIM + d] - y[j * OUT_DIM + d];
                    d2 += diff * diff;
                }
                let value = 1.0 / (1.0 + d2);
                q_num[i * n + j] = value;
                q_num[j * n + i] = value;
                q_sum += 2.0 * value;
            }
        }
        if q_sum == 0.0 {
            q_sum = 1.0;
        }

        let mut grad = vec![0.0_f64; n * OUT_DIM];
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let q_ij = (q_num[i * n + j] / q_sum).max(1e-12);
                let mult = 4.0 * (p[i * n + j] - q_ij) * q_num[i * n + j];
                for d in 0..OUT_DIM {
                    grad[i * OUT_DIM + d] += mult * (y[i * OUT_DIM + d] - y[j * OUT_DIM + d]);
                }
            }
        }

        for index in 0..y.len() {
            let sign_match = (grad[index] > 0.0) == (velocities[index] > 0.0);
            gains[index] = if sign_match {
                (gains[index] * 0.8).max(0.01)
            } else {
                gains[index] + 0.2
            };
            velocities[index] =
                momentum * velocities[index] - options.learning_rate * gains[index] * grad[index];
            y[index] += velocities[index];
        }

        for d in 0..OUT_DIM {
            let mean: f64 = (0..n).map(|i| y[i * OUT_DIM + d]).sum::<f64>() / n as f64;
            for i in 0..n {
                y[i * OUT_DIM + d] -= mean;
            }
        }
    }

    let mut embedding = Array2::zeros((n, OUT_DIM));
    for i in 0..n {
        for d in 0..OUT_DIM {
            embedding[[i, d]] = y[i * OUT_DIM + d] as f32;
        }
    }
    Ok(embedding)
}

fn joint_probabilities(sq_dists: &[f64], n: usize, perplexity: f64) -> Vec<f64> {
    let target_entropy = perplexity.ln();
    let mut p = vec![0.0_f64; n * n];

    for i in 0..n {
        let mut lo = 1e-10_f64;
        let mut hi = 1e4_f64;
        let mut sigma = 1.0;
        for _ in 0..50 {
            sigma = (lo + hi) / 2.0;
            let beta = 1.0 / (2.0 * sigma * sigma);
            let mut sum_exp = 0.0;
            for j in 0..n {
                if j != i {
                    sum_exp += (-beta * sq_dists[i * n + j]).exp();
                }
            }
            if sum_exp == 0.0 {
                lo = sigma;
                continue;
            }
            let mut entropy = 0.0;
            for j in 0..n {
                if j == i {
                    continue;
                }
                let pj = (-beta * sq_dists[i * n + j]).exp() / sum_exp;
                if pj > 1e-12 {
                    entropy -= pj * pj.ln();
                }
            }
            if entropy > target_entropy {
                hi = sigma;
            } else {
                lo = sigma;
            }
        }

        let beta = 1.0 / (2.0 * sigma * sigma);
        let mut sum_exp = 0.0;
        for j in 0..n {
            if j != i {
                sum_exp += (-beta * sq_dists[i * n + j]).exp();
            }
        }
        if sum_exp > 0.0 {
            for j in 0..n {
                if j != i {
                    p[i * n + j] = (-beta * sq_dists[i * n + j]).exp() / sum_exp;
                }
            }
        }
    }

    let scale = 1.0 / (2.0 * n as f64);
    let mut sym = vec![0.0_f64; n * n];
    for i in 0..n {
        for j in (i + 1)..n {
            let value = ((p[i * n + j] + p[j * n + i]) * scale).max(1e-12);
            sym[i * n + j] = value;
            sym[j * n + i] = value;
        }
    }
    sym
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;
    use crate::store::OmicStore;

    fn toy_store(n: usize, f: usize) -> OmicStore {
        let values =
            Array2::from_shape_fn((n, f), |(i, j)| ((i * 13 + j * 5) % 9) as f32 + i as f32);
        OmicStore::new(
            "toy",
            (0..n).map(|i| format!("c{i}")).collect(),
            "transcriptomic",
            values,
            (0..f).map(|j| format!("g{j}")).collect(),
        )
        .unwrap()
    }

    #[test]
    fn pca_shapes_and_variance_order() {
        let values = Array2::from_shape_fn((10, 4), |(i, j)| {
            if j == 0 {
                (i as f32) * 10.0
            } else {
                (i as f32) * 0.1 + j as f32
            }
        });
        let embedding = pca(&values, 2, 500).unwrap();
        assert_eq!(embedding.dim(), (10, 2));
        // Variance captured by the first component dominates.
        let var = |c: usize| -> f32 {
            let mean: f32 = (0..10).map(|i| embedding[[i, c]]).sum::<f32>() / 10.0;
            (0..10)
                .map(|i| (embedding[[i, c]] - mean).powi(2))
                .sum::<f32>()
        };
        assert!(var(0) > var(1));
    }

    #[test]
    fn pca_caps_components_at_feature_count() {
        let values = Array2::from_shape_fn((6, 2), |(i, j)| (i + j) as f32);
        let embedding = pca(&values, 5, 200).unwrap();
        assert_eq!(embedding.ncols(), 2);
    }

    #[test]
    fn tsne_embeds_into_two_dimensions() {
        let values = Array2::from_shape_fn((12, 5), |(i, j)| {
            (if i < 6 { 0.0 } else { 10.0 }) + ((i * j) % 3) as f32 * 0.1
        });
        let options = ReduceOptions {
            max_iter: 120,
            perplexity: 3.0,
            ..Default::default()
        };
        let embedding = tsne(&values, &options).unwrap();
        assert_eq!(embedding.dim(), (12, 2));
        assert!(embedding.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn dimension_reduce_attaches_without_mutating_layer() {
        let mut store = toy_store(15, 6);
        let before = store.values("transcriptomic").unwrap();
        let embedding = dimension_reduce(
            &mut store,
            "transcriptomic",
            ReduceAlgo::Pca,
            &ReduceOptions {
                n_components: 3,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(embedding.dim(), (15, 3));
        assert_eq!(store.values("transcriptomic").unwrap(), before);
        assert!(store.cell_matrix("transcriptomic_pca").is_some());
        assert!(store.artifact("transcriptomic_pca").is_some());
    }

    #[test]
    fn dimension_reduce_tsne_is_always_2d() {
        let mut store = toy_store(10, 4);
        let embedding = dimension_reduce(
            &mut store,
            "transcriptomic",
            ReduceAlgo::Tsne,
            &ReduceOptions {
                n_components: 3,
                max_iter: 60,
                perplexity: 2.0,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(embedding.ncols(), 2);
        assert!(store.cell_matrix("transcriptomic_tsne").is_some());
    }
}
