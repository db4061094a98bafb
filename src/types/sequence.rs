//! Fixed-shape windowed sequences and the per-entity output bundle.

use super::edge::EntityId;
use super::index::Label;

/// Row-major `rows x cols` matrix of `f64`.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl SequenceMatrix {
    #[must_use]
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Wrap existing row-major data; `None` if the length does not match the shape.
    #[must_use]
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Option<Self> {
        (data.len() == rows * cols).then_some(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[must_use]
    pub fn row(&self, index: usize) -> &[f64] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }

    pub fn row_mut(&mut self, index: usize) -> &mut [f64] {
        &mut self.data[index * self.cols..(index + 1) * self.cols]
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|value| *value == 0.0)
    }

    /// The last column: the normalised temporal proxy of each row.
    pub fn temporal_column(&self) -> impl Iterator<Item = f64> + '_ {
        self.data.chunks_exact(self.cols).map(|row| row[row.len() - 1])
    }
}

/// Everything emitted for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceBundle {
    pub entity_id: EntityId,
    pub label: Label,
    pub in_flow: SequenceMatrix,
    pub out_flow: SequenceMatrix,
    /// Inbound records before windowing.
    pub n_in: u64,
    /// Outbound records before windowing.
    pub n_out: u64,
}

impl SequenceBundle {
    /// `true` for rows of `in_flow` that hold real records rather than padding.
    #[must_use]
    pub fn in_mask(&self) -> Vec<bool> {
        padding_mask(self.in_flow.rows(), self.n_in)
    }

    #[must_use]
    pub fn out_mask(&self) -> Vec<bool> {
        padding_mask(self.out_flow.rows(), self.n_out)
    }
}

fn padding_mask(window: usize, original: u64) -> Vec<bool> {
    let real = usize::try_from(original).map_or(window, |n| n.min(window));
    (0..window).map(|row| row >= window - real).collect()
}
