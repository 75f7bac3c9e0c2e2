use std::collections::BTreeSet;

use ndarray::Array2;

use omicbank::cluster::{ClusterOptions, clustering};
use omicbank::domain::{ClusterAlgo, CorruptionKind, ReduceAlgo};
use omicbank::embedding::probabilistic_embedding;
use omicbank::reduce::{ReduceOptions, dimension_reduce};
use omicbank::store::OmicStore;
use omicbank::transforms::{
    CorruptOptions, NormalizeOptions, corrupt, filter_genes, normalize, split,
};

/// A small two-layer dataset with enough cells for splitting and
/// clustering: two populations with distinct expression programs.
fn two_population_store() -> OmicStore {
    let n = 60;
    // Twelve program genes split across two expression programs, plus two
    // rarely-detected genes with tiny total counts.
    let genes = Array2::from_shape_fn((n, 14), |(i, j)| {
        if j >= 12 {
            return if i % 13 == 0 { 2.0 } else { 0.0 };
        }
        let program_a = i < n / 2;
        let base = if program_a == (j < 6) { 20.0 } else { 0.0 };
        base + ((i * 17 + j * 5) % 4) as f32
    });
    let proteins = Array2::from_shape_fn((n, 3), |(i, j)| {
        if (i < n / 2) == (j == 0) {
            45.0 + (i % 6) as f32
        } else {
            1.0 + (i % 2) as f32
        }
    });
    let mut store = OmicStore::new(
        "two_pop",
        (0..n).map(|i| format!("cell_{i:03}")).collect(),
        "transcriptomic",
        genes,
        (0..14).map(|j| format!("gene_{j}")).collect(),
    )
    .unwrap();
    store
        .add_layer(
            "proteomic",
            proteins,
            vec!["CD4".into(), "CD8".into(), "CD19".into()],
        )
        .unwrap();
    store
}

#[test]
fn split_then_copy_then_split_again_is_stable() {
    let store = two_population_store();

    let (train, test) = split(&store, 0.8, 8).unwrap();
    let train_ids: BTreeSet<_> = train.cell_ids().iter().cloned().collect();
    let test_ids: BTreeSet<_> = test.cell_ids().iter().cloned().collect();
    let all: BTreeSet<_> = store.cell_ids().iter().cloned().collect();
    assert!(train_ids.is_disjoint(&test_ids));
    assert_eq!(
        train_ids.union(&test_ids).cloned().collect::<BTreeSet<_>>(),
        all
    );

    // Copying a view yields an equal, independent store.
    let copied = train.copy();
    train.assert_matching_cells(&copied).unwrap();
    for layer in ["transcriptomic", "proteomic"] {
        assert_eq!(copied.values(layer).unwrap(), train.values(layer).unwrap());
    }

    // Splitting again with the same parameters gives identical membership.
    let (train_again, test_again) = split(&store, 0.8, 8).unwrap();
    train.assert_matching_cells(&train_again).unwrap();
    test.assert_matching_cells(&test_again).unwrap();
}

#[test]
fn corruption_rates_order_sparsity_per_layer() {
    let store = two_population_store();

    let quarter = corrupt(
        &store,
        &["transcriptomic"],
        &CorruptOptions {
            dropout_rate: 0.25,
            ..Default::default()
        },
    )
    .unwrap();
    let half = corrupt(
        &store,
        &["transcriptomic"],
        &CorruptOptions {
            dropout_rate: 0.5,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(
        store.sparsity("transcriptomic").unwrap() < quarter.sparsity("transcriptomic").unwrap()
    );
    assert!(
        quarter.sparsity("transcriptomic").unwrap() < half.sparsity("transcriptomic").unwrap()
    );

    // Corrupting only the proteomic layer raises only its sparsity.
    let proteins_only = corrupt(
        &store,
        &["proteomic"],
        &CorruptOptions {
            dropout_rate: 0.5,
            distribution: CorruptionKind::Uniform,
            seed: 42,
        },
    )
    .unwrap();
    assert!(proteins_only.sparsity("proteomic").unwrap() > store.sparsity("proteomic").unwrap());
    assert_eq!(
        proteins_only.values("transcriptomic").unwrap(),
        store.values("transcriptomic").unwrap()
    );

    // Corrupting both layers raises both sparsities.
    let both = corrupt(
        &store,
        &["transcriptomic", "proteomic"],
        &CorruptOptions {
            dropout_rate: 0.5,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(both.sparsity("transcriptomic").unwrap() > store.sparsity("transcriptomic").unwrap());
    assert!(both.sparsity("proteomic").unwrap() > store.sparsity("proteomic").unwrap());
}

#[test]
fn normalization_targets_one_layer_at_a_time() {
    let store = two_population_store();
    let log_genes = normalize(
        &store,
        "transcriptomic",
        &NormalizeOptions {
            log1p: true,
            ..Default::default()
        },
    )
    .unwrap();

    let before = store.values("transcriptomic").unwrap();
    let after = log_genes.values("transcriptomic").unwrap();
    for (a, b) in after.iter().zip(before.iter()) {
        assert!((a - (1.0 + b).ln()).abs() < 1e-6);
    }
    assert_eq!(
        log_genes.values("proteomic").unwrap(),
        store.values("proteomic").unwrap()
    );
}

#[test]
fn probabilistic_embedding_yields_probabilities_and_binaries() {
    let mut store = two_population_store();
    let (prob, bin) = probabilistic_embedding(&mut store, "proteomic").unwrap();
    assert!(prob.iter().all(|&p| 0.0 < p && p < 1.0));
    let distinct: BTreeSet<_> = bin.iter().map(|&b| b as u8).collect();
    assert_eq!(distinct, BTreeSet::from([0u8, 1u8]));
}

#[test]
fn dimension_reduce_attaches_keyed_embeddings() {
    let mut store = two_population_store();
    let n = store.n_samples();

    for algo in [ReduceAlgo::Pca, ReduceAlgo::Tsne] {
        let options = ReduceOptions {
            n_components: 3,
            max_iter: if algo == ReduceAlgo::Tsne { 80 } else { 500 },
            perplexity: 5.0,
            ..Default::default()
        };
        let genes = dimension_reduce(&mut store, "transcriptomic", algo, &options).unwrap();
        let proteins = dimension_reduce(&mut store, "proteomic", algo, &options).unwrap();
        match algo {
            ReduceAlgo::Pca => {
                assert_eq!(genes.dim(), (n, 3));
                assert_eq!(proteins.dim(), (n, 3));
            }
            ReduceAlgo::Tsne => {
                assert_eq!(genes.dim(), (n, 2));
                assert_eq!(proteins.dim(), (n, 2));
            }
        }
        for layer in ["transcriptomic", "proteomic"] {
            let key = format!("{layer}_{algo}");
            assert!(store.cell_matrix(&key).is_some(), "missing obsm {key}");
            assert!(store.artifact(&key).is_some(), "missing artifact {key}");
        }
    }
}

#[test]
fn clustering_recovers_the_two_populations() {
    let mut store = two_population_store();
    let n = store.n_samples();

    let labels = clustering(
        &mut store,
        "transcriptomic",
        ClusterAlgo::KMeans,
        &ClusterOptions {
            n_clusters: 2,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(labels.len(), n);
    assert!(labels[..n / 2].iter().all(|&l| l == labels[0]));
    assert!(labels[n / 2..].iter().all(|&l| l == labels[n - 1]));
    assert_ne!(labels[0], labels[n - 1]);

    let knn_labels = clustering(
        &mut store,
        "transcriptomic",
        ClusterAlgo::Knn,
        &ClusterOptions {
            n_neighbors: 5,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(knn_labels.len(), n);
    assert!(store.cell_column("transcriptomic_knn").is_some());
    assert!(store.cell_column("transcriptomic_kmeans").is_some());
}

#[test]
fn filtering_and_views_keep_layers_aligned() {
    let store = two_population_store();
    let filtered = filter_genes(&store, "transcriptomic", 300.0).unwrap();
    assert_eq!(filtered.n_samples(), store.n_samples());
    // The two rarely-detected genes fall below the threshold.
    assert_eq!(filtered.layer("transcriptomic").unwrap().n_features(), 12);
    // The untouched layer still lines up with the shared cell axis.
    assert_eq!(
        filtered.values("proteomic").unwrap().nrows(),
        filtered.n_samples()
    );

    let view = filtered.filter_samples(&[0, 5, 9]).unwrap();
    view.assert_aligned().unwrap();
    for batch in view.batches(2) {
        let rows = batch.cell_ids.len();
        for (_, matrix) in &batch.layers {
            assert_eq!(matrix.nrows(), rows);
        }
    }
}
