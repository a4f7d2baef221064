//! Block-sparse constraint Jacobians.
//!
//! A constraint removing `dof` degrees of freedom owns `dof` consecutive rows
//! and touches at most two bodies, so each constraint stores one `dof × 6`
//! block per participating body. Every other column of its rows is zero and
//! never stored.

use nalgebra::{DMatrix, DVector};

use super::states::BODY_DOF;

/// The blocks owned by one constraint
#[derive(Debug, Clone)]
pub struct BlockRow {
    pub row: usize, // first global row
    pub dof: usize, // number of rows
    pub bodies: Vec<usize>, // body index per block
    pub blocks: Vec<DMatrix<f64>>, // dof x 6 each, same order as `bodies`
}

/// A `rows × 6n` Jacobian stored as per-constraint column blocks
#[derive(Debug, Clone)]
pub struct BlockJacobian {
    rows: Vec<BlockRow>,
    nrows: usize,
    ncols: usize,
}

impl BlockJacobian {
    /// Allocate zeroed blocks for the given `(dof, bodies)` layout, one entry per constraint
    pub fn new(layout: &[(usize, Vec<usize>)], body_count: usize) -> Self {
        let mut row = 0;
        let rows = layout
            .iter()
            .map(|(dof, bodies)| {
                let block_row = BlockRow {
                    row,
                    dof: *dof,
                    bodies: bodies.clone(),
                    blocks: bodies.iter().map(|_| DMatrix::zeros(*dof, BODY_DOF)).collect(),
                };
                row += dof;
                block_row
            })
            .collect();

        Self {
            rows,
            nrows: row,
            ncols: BODY_DOF * body_count,
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn rows(&self) -> &[BlockRow] {
        &self.rows
    }

    /// Blocks of constraint `constraint`, mutable
    pub fn blocks_mut(&mut self, constraint: usize) -> &mut [DMatrix<f64>] {
        &mut self.rows[constraint].blocks
    }

    /// `out = J * v`
    pub fn mul_vec(&self, v: &DVector<f64>, out: &mut DVector<f64>) {
        out.fill(0.0);
        for r in &self.rows {
            let mut dst = out.rows_mut(r.row, r.dof);
            for (body, block) in r.bodies.iter().zip(&r.blocks) {
                dst.gemv(1.0, block, &v.rows(BODY_DOF * body, BODY_DOF), 1.0);
            }
        }
    }

    /// `out = Jᵀ * lambda`
    pub fn tr_mul_vec(&self, lambda: &DVector<f64>, out: &mut DVector<f64>) {
        out.fill(0.0);
        for r in &self.rows {
            let l = lambda.rows(r.row, r.dof);
            for (body, block) in r.bodies.iter().zip(&r.blocks) {
                out.rows_mut(BODY_DOF * body, BODY_DOF).gemv_tr(1.0, block, &l, 1.0);
            }
        }
    }

    /// Dense copy, mostly for inspection and tests
    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.nrows, self.ncols);
        for r in &self.rows {
            for (body, block) in r.bodies.iter().zip(&r.blocks) {
                dense
                    .view_mut((r.row, BODY_DOF * body), (r.dof, BODY_DOF))
                    .copy_from(block);
            }
        }
        dense
    }
}
