use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ndarray::{Array2, Axis};

use crate::annot::{AnnotationSlots, Artifact, Column};
use crate::error::OmicError;

/// One measurement modality: a matrix arena shared between a store and its
/// views, an optional feature-axis subset into it, and the per-feature
/// annotation namespaces that follow the feature axis.
#[derive(Debug, Clone)]
pub struct Layer {
    arena: Arc<Array2<f32>>,
    cols: Option<Arc<Vec<usize>>>,
    feature_ids: Vec<String>,
    feature_columns: BTreeMap<String, Column>,
    feature_matrices: BTreeMap<String, Array2<f32>>,
}

impl Layer {
    fn owned(matrix: Array2<f32>, feature_ids: Vec<String>) -> Self {
        Self {
            arena: Arc::new(matrix),
            cols: None,
            feature_ids,
            feature_columns: BTreeMap::new(),
            feature_matrices: BTreeMap::new(),
        }
    }

    pub fn n_features(&self) -> usize {
        self.feature_ids.len()
    }

    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    pub fn feature_column(&self, key: &str) -> Option<&Column> {
        self.feature_columns.get(key)
    }

    pub fn feature_matrix(&self, key: &str) -> Option<&Array2<f32>> {
        self.feature_matrices.get(key)
    }

    /// Materialize this layer's matrix for the given store-level row
    /// subset. `None` means all arena rows in order.
    fn gather(&self, rows: Option<&[usize]>) -> Array2<f32> {
        let with_rows = match rows {
            Some(indices) => self.arena.select(Axis(0), indices),
            None => self.arena.as_ref().clone(),
        };
        match &self.cols {
            Some(indices) => with_rows.select(Axis(1), indices),
            None => with_rows,
        }
    }

    fn is_view(&self) -> bool {
        self.cols.is_some()
    }
}

/// Multi-omic container: one primary matrix plus named auxiliary matrices,
/// every layer indexed by the same ordered cell-identity axis.
///
/// A store is either `owned` (exclusive arenas) or a `view` (row/column
/// index lists into another store's arenas, no data duplication). Any
/// mutation first promotes the store to owned via copy-on-write, so views
/// can never write through to shared storage.
#[derive(Debug, Clone)]
pub struct OmicStore {
    name: String,
    cell_ids: Vec<String>,
    rows: Option<Arc<Vec<usize>>>,
    layers: BTreeMap<String, Layer>,
    active: String,
    slots: AnnotationSlots,
}

impl OmicStore {
    pub fn new(
        name: impl Into<String>,
        cell_ids: Vec<String>,
        layer_name: &str,
        matrix: Array2<f32>,
        feature_ids: Vec<String>,
    ) -> Result<Self, OmicError> {
        let unique: BTreeSet<&String> = cell_ids.iter().collect();
        if unique.len() != cell_ids.len() {
            return Err(OmicError::InvalidArgument(
                "duplicate cell identities".to_string(),
            ));
        }
        let mut store = Self {
            name: name.into(),
            cell_ids,
            rows: None,
            layers: BTreeMap::new(),
            active: layer_name.to_string(),
            slots: AnnotationSlots::default(),
        };
        store.add_layer(layer_name, matrix, feature_ids)?;
        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_samples(&self) -> usize {
        self.cell_ids.len()
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    pub fn has_layer(&self, layer: &str) -> bool {
        self.layers.contains_key(layer)
    }

    pub fn layer(&self, layer: &str) -> Result<&Layer, OmicError> {
        self.layers
            .get(layer)
            .ok_or_else(|| OmicError::UnknownLayer(layer.to_string()))
    }

    pub fn active_layer(&self) -> &str {
        &self.active
    }

    pub fn set_active(&mut self, layer: &str) -> Result<(), OmicError> {
        if !self.layers.contains_key(layer) {
            return Err(OmicError::UnknownLayer(layer.to_string()));
        }
        self.active = layer.to_string();
        Ok(())
    }

    pub fn is_view(&self) -> bool {
        self.rows.is_some() || self.layers.values().any(Layer::is_view)
    }

    /// Register an auxiliary layer. The matrix's rows must line up one to
    /// one with the store's cell identities.
    pub fn add_layer(
        &mut self,
        name: &str,
        matrix: Array2<f32>,
        feature_ids: Vec<String>,
    ) -> Result<(), OmicError> {
        if matrix.nrows() != self.cell_ids.len() {
            return Err(OmicError::ShapeMismatch {
                layer: name.to_string(),
                rows: matrix.nrows(),
                cells: self.cell_ids.len(),
            });
        }
        if feature_ids.len() != matrix.ncols() {
            return Err(OmicError::InvalidArgument(format!(
                "layer {name}: {} feature ids for {} columns",
                feature_ids.len(),
                matrix.ncols()
            )));
        }
        // The shared row-index list cannot address a matrix sized to the
        // view, so adding a layer is a write: promote to owned first.
        self.materialize();
        self.layers.insert(name.to_string(), Layer::owned(matrix, feature_ids));
        self.assert_aligned()
    }

    /// Materialized copy of a layer's matrix, `n_samples x n_features`.
    pub fn values(&self, layer: &str) -> Result<Array2<f32>, OmicError> {
        let layer = self.layer(layer)?;
        Ok(layer.gather(self.rows.as_deref().map(Vec::as_slice)))
    }

    /// Materialized copy of the active layer's matrix.
    pub fn x(&self) -> Array2<f32> {
        self.layer(&self.active)
            .expect("active layer always registered")
            .gather(self.rows.as_deref().map(Vec::as_slice))
    }

    /// Fraction of zero entries in a layer.
    pub fn sparsity(&self, layer: &str) -> Result<f64, OmicError> {
        let values = self.values(layer)?;
        let total = values.len();
        if total == 0 {
            return Ok(0.0);
        }
        let zeros = values.iter().filter(|&&v| v == 0.0).count();
        Ok(zeros as f64 / total as f64)
    }

    /// Promote a view to owned storage: resolve all index lists into fresh
    /// arenas. No-op for an already-owned store.
    pub fn materialize(&mut self) {
        if !self.is_view() {
            return;
        }
        let rows = self.rows.take();
        for layer in self.layers.values_mut() {
            let gathered = layer.gather(rows.as_deref().map(Vec::as_slice));
            layer.arena = Arc::new(gathered);
            layer.cols = None;
        }
    }

    /// Exclusive access to a layer's matrix. Promotes the store to owned
    /// and clones any arena still shared with another store, so the write
    /// can never leak into a view or the viewed original.
    pub(crate) fn values_mut(&mut self, layer: &str) -> Result<&mut Array2<f32>, OmicError> {
        self.materialize();
        let layer = self
            .layers
            .get_mut(layer)
            .ok_or_else(|| OmicError::UnknownLayer(layer.to_string()))?;
        Ok(Arc::make_mut(&mut layer.arena))
    }

    /// Deep copy with independently-backed matrices. Mutating the copy
    /// never affects the original, regardless of either one's backing.
    pub fn copy(&self) -> OmicStore {
        let rows = self.rows.as_deref().map(Vec::as_slice);
        let layers = self
            .layers
            .iter()
            .map(|(name, layer)| {
                let mut owned = layer.clone();
                owned.arena = Arc::new(layer.gather(rows));
                owned.cols = None;
                (name.clone(), owned)
            })
            .collect();
        OmicStore {
            name: self.name.clone(),
            cell_ids: self.cell_ids.clone(),
            rows: None,
            layers,
            active: self.active.clone(),
            slots: self.slots.clone(),
        }
    }

    /// View of a subset of cells, applied identically to every layer. The
    /// returned store shares this store's arenas.
    pub fn filter_samples(&self, indices: &[usize]) -> Result<OmicStore, OmicError> {
        for &index in indices {
            if index >= self.cell_ids.len() {
                return Err(OmicError::InvalidArgument(format!(
                    "cell index {index} out of bounds for {} cells",
                    self.cell_ids.len()
                )));
            }
        }
        let composed: Vec<usize> = match &self.rows {
            Some(existing) => indices.iter().map(|&i| existing[i]).collect(),
            None => indices.to_vec(),
        };
        let cell_ids = indices.iter().map(|&i| self.cell_ids[i].clone()).collect();
        let store = OmicStore {
            name: self.name.clone(),
            cell_ids,
            rows: Some(Arc::new(composed)),
            layers: self.layers.clone(),
            active: self.active.clone(),
            slots: self.slots.select_cells(indices),
        };
        store.assert_aligned()?;
        Ok(store)
    }

    /// View of a subset of cells selected by predicate over cell identity.
    pub fn filter_samples_by(
        &self,
        predicate: impl Fn(&str) -> bool,
    ) -> Result<OmicStore, OmicError> {
        let indices: Vec<usize> = self
            .cell_ids
            .iter()
            .enumerate()
            .filter(|(_, id)| predicate(id))
            .map(|(index, _)| index)
            .collect();
        self.filter_samples(&indices)
    }

    /// View with a subset of one layer's features; the cell axis and all
    /// other layers are untouched.
    pub fn filter_features(&self, layer: &str, indices: &[usize]) -> Result<OmicStore, OmicError> {
        let current = self.layer(layer)?;
        for &index in indices {
            if index >= current.n_features() {
                return Err(OmicError::InvalidArgument(format!(
                    "feature index {index} out of bounds for {} features",
                    current.n_features()
                )));
            }
        }
        let composed: Vec<usize> = match &current.cols {
            Some(existing) => indices.iter().map(|&i| existing[i]).collect(),
            None => indices.to_vec(),
        };
        let mut layers = self.layers.clone();
        let target = layers.get_mut(layer).expect("layer checked above");
        target.feature_ids = indices
            .iter()
            .map(|&i| current.feature_ids[i].clone())
            .collect();
        target.feature_columns = current
            .feature_columns
            .iter()
            .map(|(key, column)| (key.clone(), column.select(indices)))
            .collect();
        target.feature_matrices = current
            .feature_matrices
            .iter()
            .map(|(key, matrix)| (key.clone(), matrix.select(Axis(0), indices)))
            .collect();
        target.cols = Some(Arc::new(composed));

        let store = OmicStore {
            name: self.name.clone(),
            cell_ids: self.cell_ids.clone(),
            rows: self.rows.clone(),
            layers,
            active: self.active.clone(),
            slots: self.slots.clone(),
        };
        store.assert_aligned()?;
        Ok(store)
    }

    /// View with the features of `layer` selected by predicate over
    /// feature identity.
    pub fn filter_features_by(
        &self,
        layer: &str,
        predicate: impl Fn(&str) -> bool,
    ) -> Result<OmicStore, OmicError> {
        let indices: Vec<usize> = self
            .layer(layer)?
            .feature_ids()
            .iter()
            .enumerate()
            .filter(|(_, id)| predicate(id))
            .map(|(index, _)| index)
            .collect();
        self.filter_features(layer, &indices)
    }

    /// Check the cross-layer alignment invariant. Called at construction
    /// and after every mutating operation; a failure means a bug upstream
    /// tried to desynchronize the cell axis.
    pub fn assert_aligned(&self) -> Result<(), OmicError> {
        let expected = match &self.rows {
            Some(indices) => {
                if indices.len() != self.cell_ids.len() {
                    return Err(OmicError::AlignmentViolation(format!(
                        "view holds {} row indices for {} cells",
                        indices.len(),
                        self.cell_ids.len()
                    )));
                }
                None
            }
            None => Some(self.cell_ids.len()),
        };
        for (name, layer) in &self.layers {
            if let Some(expected_rows) = expected {
                if layer.arena.nrows() != expected_rows {
                    return Err(OmicError::AlignmentViolation(format!(
                        "layer {name} holds {} rows for {} cells",
                        layer.arena.nrows(),
                        expected_rows
                    )));
                }
            } else if let Some(indices) = &self.rows {
                if let Some(&max) = indices.iter().max() {
                    if max >= layer.arena.nrows() {
                        return Err(OmicError::AlignmentViolation(format!(
                            "view index {max} out of bounds for layer {name} with {} rows",
                            layer.arena.nrows()
                        )));
                    }
                }
            }
            let visible_cols = match &layer.cols {
                Some(indices) => indices.len(),
                None => layer.arena.ncols(),
            };
            if layer.feature_ids.len() != visible_cols {
                return Err(OmicError::AlignmentViolation(format!(
                    "layer {name} lists {} feature ids for {} columns",
                    layer.feature_ids.len(),
                    visible_cols
                )));
            }
        }
        Ok(())
    }

    /// Fail unless `other` lists exactly the same cells in the same order.
    pub fn assert_matching_cells(&self, other: &OmicStore) -> Result<(), OmicError> {
        if self.cell_ids != other.cell_ids {
            return Err(OmicError::AlignmentViolation(format!(
                "stores {} and {} do not list the same cells",
                self.name, other.name
            )));
        }
        Ok(())
    }

    // Annotation slots -----------------------------------------------------

    pub fn add_cell_column(&mut self, key: &str, column: Column) -> Result<(), OmicError> {
        self.slots
            .insert_cell_column(self.cell_ids.len(), key, column)
    }

    pub fn add_cell_matrix(&mut self, key: &str, matrix: Array2<f32>) -> Result<(), OmicError> {
        self.slots
            .insert_cell_matrix(self.cell_ids.len(), key, matrix)
    }

    pub fn add_artifact(&mut self, key: &str, artifact: Artifact) {
        self.slots.insert_artifact(key, artifact);
    }

    pub fn cell_column(&self, key: &str) -> Option<&Column> {
        self.slots.cell_column(key)
    }

    pub fn cell_matrix(&self, key: &str) -> Option<&Array2<f32>> {
        self.slots.cell_matrix(key)
    }

    pub fn artifact(&self, key: &str) -> Option<&Artifact> {
        self.slots.artifact(key)
    }

    pub fn slots(&self) -> &AnnotationSlots {
        &self.slots
    }

    pub fn add_feature_column(
        &mut self,
        layer: &str,
        key: &str,
        column: Column,
    ) -> Result<(), OmicError> {
        let target = self
            .layers
            .get_mut(layer)
            .ok_or_else(|| OmicError::UnknownLayer(layer.to_string()))?;
        if column.len() != target.feature_ids.len() {
            return Err(OmicError::AlignmentViolation(format!(
                "feature annotation {key} has {} entries for {} features of {layer}",
                column.len(),
                target.feature_ids.len()
            )));
        }
        target.feature_columns.insert(key.to_string(), column);
        Ok(())
    }

    pub fn add_feature_matrix(
        &mut self,
        layer: &str,
        key: &str,
        matrix: Array2<f32>,
    ) -> Result<(), OmicError> {
        let target = self
            .layers
            .get_mut(layer)
            .ok_or_else(|| OmicError::UnknownLayer(layer.to_string()))?;
        if matrix.nrows() != target.feature_ids.len() {
            return Err(OmicError::AlignmentViolation(format!(
                "feature matrix {key} has {} rows for {} features of {layer}",
                matrix.nrows(),
                target.feature_ids.len()
            )));
        }
        target.feature_matrices.insert(key.to_string(), matrix);
        Ok(())
    }

    /// Per-cell quality metrics of one layer: total counts and the number
    /// of detected features. Read-only; attach the result via the
    /// annotation slots if it should travel with the store.
    pub fn quality_metrics(&self, layer: &str) -> Result<QcMetrics, OmicError> {
        let values = self.values(layer)?;
        let mut total_counts = Vec::with_capacity(values.nrows());
        let mut n_features = Vec::with_capacity(values.nrows());
        for row in values.rows() {
            total_counts.push(row.iter().sum::<f32>());
            n_features.push(row.iter().filter(|&&v| v > 0.0).count());
        }
        Ok(QcMetrics {
            total_counts,
            n_features,
        })
    }

    // Model contract -------------------------------------------------------

    /// Iterate aligned fixed-size row blocks over every layer, so a
    /// training step never sees out-of-sync layers.
    pub fn batches(&self, batch_size: usize) -> Batches<'_> {
        Batches {
            store: self,
            batch_size: batch_size.max(1),
            position: 0,
        }
    }
}

/// Per-cell quality control metrics for one layer.
#[derive(Debug, Clone)]
pub struct QcMetrics {
    pub total_counts: Vec<f32>,
    pub n_features: Vec<usize>,
}

/// One aligned batch: the covered cell range and each layer's rows for it.
#[derive(Debug)]
pub struct Batch {
    pub cell_ids: Vec<String>,
    pub layers: Vec<(String, Array2<f32>)>,
}

pub struct Batches<'a> {
    store: &'a OmicStore,
    batch_size: usize,
    position: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.store.n_samples() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.store.n_samples());
        let indices: Vec<usize> = (self.position..end).collect();
        let cell_ids = indices
            .iter()
            .map(|&i| self.store.cell_ids[i].clone())
            .collect();
        let arena_rows: Vec<usize> = match &self.store.rows {
            Some(existing) => indices.iter().map(|&i| existing[i]).collect(),
            None => indices,
        };
        let layers = self
            .store
            .layers
            .iter()
            .map(|(name, layer)| (name.clone(), layer.gather(Some(&arena_rows))))
            .collect();
        self.position = end;
        Some(Batch { cell_ids, layers })
    }
}
