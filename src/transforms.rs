use ndarray::Axis;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Binomial, Distribution};
use tracing::debug;

use crate::domain::CorruptionKind;
use crate::error::OmicError;
use crate::store::OmicStore;

/// Default seed shared by corruption and splitting so repeated runs over
/// the same dataset stay comparable.
pub const DEFAULT_SEED: u64 = 8;

#[derive(Debug, Clone)]
pub struct CorruptOptions {
    /// Probability that an entry is dropped (or the thinning rate).
    pub dropout_rate: f64,
    pub distribution: CorruptionKind,
    pub seed: u64,
}

impl Default for CorruptOptions {
    fn default() -> Self {
        Self {
            dropout_rate: 0.25,
            distribution: CorruptionKind::Uniform,
            seed: DEFAULT_SEED,
        }
    }
}

/// Inject synthetic dropout into the named layers, each corrupted
/// independently at the same rate. Reproducible for a fixed seed, and the
/// measured sparsity of each layer grows with the rate.
pub fn corrupt(
    store: &OmicStore,
    layers: &[&str],
    options: &CorruptOptions,
) -> Result<OmicStore, OmicError> {
    let mut corrupted = store.copy();
    corrupt_inplace(&mut corrupted, layers, options)?;
    Ok(corrupted)
}

pub fn corrupt_inplace(
    store: &mut OmicStore,
    layers: &[&str],
    options: &CorruptOptions,
) -> Result<(), OmicError> {
    if !(0.0..=1.0).contains(&options.dropout_rate) {
        return Err(OmicError::InvalidArgument(format!(
            "dropout rate {} outside [0, 1]",
            options.dropout_rate
        )));
    }
    for (offset, layer) in layers.iter().enumerate() {
        // Per-layer seed offset: layers are corrupted independently but
        // the whole operation stays reproducible.
        let mut rng = StdRng::seed_from_u64(options.seed.wrapping_add(offset as u64));
        let values = store.values_mut(layer)?;
        match options.distribution {
            CorruptionKind::Uniform => {
                for value in values.iter_mut() {
                    if rng.r#gen::<f64>() < options.dropout_rate {
                        *value = 0.0;
                    }
                }
            }
            CorruptionKind::Binomial => {
                let keep = 1.0 - options.dropout_rate;
                for value in values.iter_mut() {
                    let count = value.round().max(0.0) as u64;
                    if count == 0 {
                        continue;
                    }
                    let thinned = Binomial::new(count, keep)
                        .map_err(|err| OmicError::InvalidArgument(err.to_string()))?
                        .sample(&mut rng);
                    *value = thinned as f32;
                }
            }
        }
        debug!(layer, rate = options.dropout_rate, "corrupted layer");
    }
    store.assert_aligned()
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    /// Divide each cell's row by its total count.
    pub total: bool,
    /// Apply log(1 + x) elementwise.
    pub log1p: bool,
    /// Standardize each feature column to zero mean, unit variance.
    pub scale: bool,
}

/// Normalize one layer. Sub-steps apply in a fixed order (total-count
/// scaling, then log1p, then feature standardization) and each is
/// independently toggleable.
pub fn normalize(
    store: &OmicStore,
    layer: &str,
    options: &NormalizeOptions,
) -> Result<OmicStore, OmicError> {
    let mut normalized = store.copy();
    normalize_inplace(&mut normalized, layer, options)?;
    Ok(normalized)
}

pub fn normalize_inplace(
    store: &mut OmicStore,
    layer: &str,
    options: &NormalizeOptions,
) -> Result<(), OmicError> {
    let values = store.values_mut(layer)?;
    if options.total {
        for mut row in values.rows_mut() {
            let sum: f32 = row.iter().sum();
            if sum > 0.0 {
                row.mapv_inplace(|v| v / sum);
            }
        }
    }
    if options.log1p {
        values.mapv_inplace(|v| (1.0 + v).ln());
    }
    if options.scale {
        let n = values.nrows() as f32;
        for mut column in values.columns_mut() {
            let mean = column.iter().sum::<f32>() / n;
            let variance = column.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
            let std = variance.sqrt();
            if std > 0.0 {
                column.mapv_inplace(|v| (v - mean) / std);
            } else {
                column.mapv_inplace(|v| v - mean);
            }
        }
    }
    store.assert_aligned()
}

/// Apply exp(x) - 1 elementwise, the inverse of the log1p sub-step.
pub fn expm1(store: &OmicStore, layer: &str) -> Result<OmicStore, OmicError> {
    let mut out = store.copy();
    out.values_mut(layer)?.mapv_inplace(|v| v.exp_m1());
    out.assert_aligned()?;
    Ok(out)
}

/// Partition cells into two disjoint covering view stores. The partition
/// is a pure function of `(n_samples, train_ratio, seed)`: repeated calls
/// with equal parameters return identical memberships.
pub fn split(
    store: &OmicStore,
    train_ratio: f64,
    seed: u64,
) -> Result<(OmicStore, OmicStore), OmicError> {
    if !(0.0..1.0).contains(&train_ratio) || train_ratio == 0.0 {
        return Err(OmicError::InvalidArgument(format!(
            "train ratio {train_ratio} outside (0, 1)"
        )));
    }
    let n = store.n_samples();
    if n < 2 {
        return Err(OmicError::InvalidArgument(
            "cannot split fewer than two cells".to_string(),
        ));
    }
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    let n_train = ((n as f64 * train_ratio).round() as usize).clamp(1, n - 1);
    let mut train_indices = order[..n_train].to_vec();
    let mut test_indices = order[n_train..].to_vec();
    // Keep each partition in the original cell order.
    train_indices.sort_unstable();
    test_indices.sort_unstable();

    let train = store.filter_samples(&train_indices)?;
    let test = store.filter_samples(&test_indices)?;
    Ok((train, test))
}

/// Keep features of `layer` whose total count is at least `min_counts`.
/// Returns a view; the cell axis is untouched.
pub fn filter_genes(
    store: &OmicStore,
    layer: &str,
    min_counts: f32,
) -> Result<OmicStore, OmicError> {
    let values = store.values(layer)?;
    let sums = values.sum_axis(Axis(0));
    let keep: Vec<usize> = sums
        .iter()
        .enumerate()
        .filter(|&(_, &sum)| sum >= min_counts)
        .map(|(index, _)| index)
        .collect();
    store.filter_features(layer, &keep)
}

/// Keep cells whose total count in `layer` is at least `min_counts`. The
/// selection applies identically to every layer, preserving alignment.
pub fn filter_cells(
    store: &OmicStore,
    layer: &str,
    min_counts: f32,
) -> Result<OmicStore, OmicError> {
    let values = store.values(layer)?;
    let sums = values.sum_axis(Axis(1));
    let keep: Vec<usize> = sums
        .iter()
        .enumerate()
        .filter(|&(_, &sum)| sum >= min_counts)
        .map(|(index, _)| index)
        .collect();
    store.filter_samples(&keep)
}
