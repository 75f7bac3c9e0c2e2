use std::collections::BTreeMap;

use ndarray::{Array2, Axis};

use crate::error::OmicError;

/// A typed per-cell or per-feature metadata column.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Str(Vec<String>),
    Num(Vec<f32>),
    /// Categorical data stored as codes indexing into a category list.
    Cat {
        codes: Vec<u32>,
        categories: Vec<String>,
    },
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Str(values) => values.len(),
            Column::Num(values) => values.len(),
            Column::Cat { codes, .. } => codes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_str(&self) -> Option<&[String]> {
        match self {
            Column::Str(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<&[f32]> {
        match self {
            Column::Num(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_cat(&self) -> Option<(&[u32], &[String])> {
        match self {
            Column::Cat { codes, categories } => Some((codes, categories)),
            _ => None,
        }
    }

    pub(crate) fn select(&self, indices: &[usize]) -> Column {
        match self {
            Column::Str(values) => {
                Column::Str(indices.iter().map(|&i| values[i].clone()).collect())
            }
            Column::Num(values) => Column::Num(indices.iter().map(|&i| values[i]).collect()),
            Column::Cat { codes, categories } => Column::Cat {
                codes: indices.iter().map(|&i| codes[i]).collect(),
                categories: categories.clone(),
            },
        }
    }
}

/// An unstructured derived artifact attached to a store: cluster labels,
/// embedding coordinates, quality-metric tables. Excluded from persistence
/// and integrity checks.
#[derive(Debug, Clone)]
pub enum Artifact {
    Matrix(Array2<f32>),
    Labels(Vec<usize>),
    Metrics(BTreeMap<String, f64>),
    Text(String),
}

/// Per-cell annotation namespaces plus the unstructured result slot.
/// Per-feature namespaces live on each layer, since their length follows
/// that layer's feature axis.
#[derive(Debug, Clone, Default)]
pub struct AnnotationSlots {
    cell_columns: BTreeMap<String, Column>,
    cell_matrices: BTreeMap<String, Array2<f32>>,
    artifacts: BTreeMap<String, Artifact>,
}

impl AnnotationSlots {
    pub fn insert_cell_column(
        &mut self,
        n_cells: usize,
        key: &str,
        column: Column,
    ) -> Result<(), OmicError> {
        if column.len() != n_cells {
            return Err(OmicError::AlignmentViolation(format!(
                "cell annotation {key} has {} entries for {n_cells} cells",
                column.len()
            )));
        }
        self.cell_columns.insert(key.to_string(), column);
        Ok(())
    }

    pub fn insert_cell_matrix(
        &mut self,
        n_cells: usize,
        key: &str,
        matrix: Array2<f32>,
    ) -> Result<(), OmicError> {
        if matrix.nrows() != n_cells {
            return Err(OmicError::AlignmentViolation(format!(
                "cell matrix {key} has {} rows for {n_cells} cells",
                matrix.nrows()
            )));
        }
        self.cell_matrices.insert(key.to_string(), matrix);
        Ok(())
    }

    pub fn insert_artifact(&mut self, key: &str, artifact: Artifact) {
        self.artifacts.insert(key.to_string(), artifact);
    }

    pub fn cell_column(&self, key: &str) -> Option<&Column> {
        self.cell_columns.get(key)
    }

    pub fn cell_matrix(&self, key: &str) -> Option<&Array2<f32>> {
        self.cell_matrices.get(key)
    }

    pub fn artifact(&self, key: &str) -> Option<&Artifact> {
        self.artifacts.get(key)
    }

    pub fn cell_columns(&self) -> &BTreeMap<String, Column> {
        &self.cell_columns
    }

    pub fn cell_matrices(&self) -> &BTreeMap<String, Array2<f32>> {
        &self.cell_matrices
    }

    pub fn artifacts(&self) -> &BTreeMap<String, Artifact> {
        &self.artifacts
    }

    /// Subset every per-cell slot to the given row indices. Artifacts are
    /// carried over untouched; they describe the store they were computed
    /// on, not a row range.
    pub(crate) fn select_cells(&self, indices: &[usize]) -> AnnotationSlots {
        let cell_columns = self
            .cell_columns
            .iter()
            .map(|(key, column)| (key.clone(), column.select(indices)))
            .collect();
        let cell_matrices = self
            .cell_matrices
            .iter()
            .map(|(key, matrix)| (key.clone(), matrix.select(Axis(0), indices)))
            .collect();
        AnnotationSlots {
            cell_columns,
            cell_matrices,
            artifacts: self.artifacts.clone(),
        }
    }
}
