use ndarray::Array2;

use crate::annot::Artifact;
use crate::error::OmicError;
use crate::store::OmicStore;

/// Keeps posteriors strictly inside (0, 1) so downstream log-likelihoods
/// stay finite.
const PROB_EPS: f32 = 1e-6;

const EM_ITERATIONS: usize = 60;

/// Fit a two-component Gaussian mixture to every feature of `layer` and
/// attach, per cell, the posterior probability of the high-expression
/// component (`<layer>_prob`) and its binarization (`<layer>_bin`).
///
/// Surface-protein counts are bimodal (background vs. expressing cells);
/// the posterior turns raw counts into a soft on/off signal. The layer
/// matrix itself is never modified.
pub fn probabilistic_embedding(
    store: &mut OmicStore,
    layer: &str,
) -> Result<(Array2<f32>, Array2<f32>), OmicError> {
    let values = store.values(layer)?;
    let n_cells = values.nrows();
    if n_cells < 2 {
        return Err(OmicError::InvalidArgument(
            "need at least two cells for a mixture fit".to_string(),
        ));
    }

    let mut prob = Array2::zeros((n_cells, values.ncols()));
    for (column_index, column) in values.columns().into_iter().enumerate() {
        let data: Vec<f64> = column.iter().map(|&v| v as f64).collect();
        let posterior = fit_two_component(&data);
        for (row, &p) in posterior.iter().enumerate() {
            prob[[row, column_index]] = (p as f32).clamp(PROB_EPS, 1.0 - PROB_EPS);
        }
    }
    let bin = prob.mapv(|p| if p > 0.5 { 1.0 } else { 0.0 });

    store.add_cell_matrix(&format!("{layer}_prob"), prob.clone())?;
    store.add_cell_matrix(&format!("{layer}_bin"), bin.clone())?;
    store.add_artifact(&format!("{layer}_prob"), Artifact::Matrix(prob.clone()));
    Ok((prob, bin))
}

/// EM for a 1-D mixture of two Gaussians; returns the posterior of the
/// higher-mean component per observation.
fn fit_two_component(data: &[f64]) -> Vec<f64> {
    let n = data.len();
    let min = data.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = data.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !(max > min) {
        // Constant feature: no signal either way.
        return vec![0.5; n];
    }

    let mean: f64 = data.iter().sum::<f64>() / n as f64;
    let variance = (data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64).max(1e-6);

    let mut mu = [min, max];
    let mut var = [variance, variance];
    let mut pi = [0.5_f64, 0.5];
    let mut responsibility = vec![0.5_f64; n];

    for _ in 0..EM_ITERATIONS {
        // E step: responsibility of the high component.
        for (i, &x) in data.iter().enumerate() {
            let p0 = pi[0] * gaussian(x, mu[0], var[0]);
            let p1 = pi[1] * gaussian(x, mu[1], var[1]);
            responsibility[i] = if p0 + p1 > 0.0 { p1 / (p0 + p1) } else { 0.5 };
        }

        // M step.
        let r1: f64 = responsibility.iter().sum();
        let r0 = n as f64 - r1;
        if r0 < 1e-9 || r1 < 1e-9 {
            break;
        }
        mu[0] = data
            .iter()
            .zip(&responsibility)
            .map(|(x, r)| x * (1.0 - r))
            .sum::<f64>()
            / r0;
        mu[1] = data
            .iter()
            .zip(&responsibility)
            .map(|(x, r)| x * r)
            .sum::<f64>()
            / r1;
        var[0] = (data
            .iter()
            .zip(&responsibility)
            .map(|(x, r)| (x - mu[0]).powi(2) * (1.0 - r))
            .sum::<f64>()
            / r0)
            .max(1e-6);
        var[1] = (data
            .iter()
            .zip(&responsibility)
            .map(|(x, r)| (x - mu[1]).powi(2) * r)
            .sum::<f64>()
            / r1)
            .max(1e-6);
        pi[1] = r1 / n as f64;
        pi[0] = 1.0 - pi[1];
    }

    if mu[1] >= mu[0] {
        responsibility
    } else {
        responsibility.into_iter().map(|r| 1.0 - r).collect()
    }
}

fn gaussian(x: f64, mu: f64, var: f64) -> f64 {
    let d = x - mu;
    (-d * d / (2.0 * var)).exp() / (2.0 * std::f64::consts::PI * var).sqrt()
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;
    use crate::store::OmicStore;

    fn bimodal_store() -> OmicStore {
        // Half the cells express each protein strongly, half barely.
        let values = Array2::from_shape_fn((40, 2), |(i, j)| {
            let on = (i + j) % 2 == 0;
            if on {
                50.0 + (i % 5) as f32
            } else {
                1.0 + (i % 3) as f32 * 0.1
            }
        });
        OmicStore::new(
            "adt",
            (0..40).map(|i| format!("c{i}")).collect(),
            "proteomic",
            values,
            vec!["CD3".into(), "CD19".into()],
        )
        .unwrap()
    }

    #[test]
    fn posteriors_are_strictly_inside_unit_interval() {
        let mut store = bimodal_store();
        let (prob, bin) = probabilistic_embedding(&mut store, "proteomic").unwrap();
        assert!(prob.iter().all(|&p| 0.0 < p && p < 1.0));
        assert!(bin.iter().all(|&b| b == 0.0 || b == 1.0));
    }

    #[test]
    fn high_counts_map_to_high_posterior() {
        let mut store = bimodal_store();
        let (prob, _) = probabilistic_embedding(&mut store, "proteomic").unwrap();
        let values = store.values("proteomic").unwrap();
        for row in 0..values.nrows() {
            for col in 0..values.ncols() {
                if values[[row, col]] > 40.0 {
                    assert!(prob[[row, col]] > 0.5);
                } else {
                    assert!(prob[[row, col]] < 0.5);
                }
            }
        }
    }

    #[test]
    fn embedding_attaches_slots_and_leaves_layer_alone() {
        let mut store = bimodal_store();
        let before = store.values("proteomic").unwrap();
        probabilistic_embedding(&mut store, "proteomic").unwrap();
        assert_eq!(store.values("proteomic").unwrap(), before);
        assert!(store.cell_matrix("proteomic_prob").is_some());
        assert!(store.cell_matrix("proteomic_bin").is_some());
    }

    #[test]
    fn constant_feature_is_uninformative() {
        let values = Array2::from_elem((10, 1), 3.0_f32);
        let mut store = OmicStore::new(
            "flat",
            (0..10).map(|i| format!("c{i}")).collect(),
            "proteomic",
            values,
            vec!["CD3".into()],
        )
        .unwrap();
        let (prob, _) = probabilistic_embedding(&mut store, "proteomic").unwrap();
        assert!(prob.iter().all(|&p| (p - 0.5).abs() < 1e-4));
    }
}
