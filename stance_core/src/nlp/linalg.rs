// stance_core/src/nlp/linalg.rs

//! Symmetric linear systems with the shape collocation produces.
//!
//! Node `j` couples only to nodes `j - 1` and `j + 1` through the constraints,
//! while the free parameters couple to every node. Ordered node-major with the
//! parameters last, the matrix is block tridiagonal with a dense border:
//!
//! ```text
//! [ D0   E0              W0 ]
//! [ E0'  D1   E1         W1 ]
//! [      E1'  D2  ...    W2 ]
//! [           ...        .. ]
//! [ W0'  W1'  W2' ...    Q  ]
//! ```

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

use crate::nlp::options::LinearSolver;

#[derive(Debug, Clone, PartialEq)]
pub struct BorderedBlockTridiagonal {
    block_size: usize,
    border_size: usize,
    /// `D_j`, one `n x n` block per node.
    pub diagonal: Vec<DMatrix<f64>>,
    /// `E_j`, the `(j, j + 1)` coupling blocks.
    pub off_diagonal: Vec<DMatrix<f64>>,
    /// `W_j`, `n x p` node-to-parameter blocks.
    pub border: Vec<DMatrix<f64>>,
    /// `Q`, `p x p`.
    pub corner: DMatrix<f64>,
}

impl BorderedBlockTridiagonal {
    pub fn zeros(num_nodes: usize, block_size: usize, border_size: usize) -> Self {
        Self {
            block_size,
            border_size,
            diagonal: vec![DMatrix::zeros(block_size, block_size); num_nodes],
            off_diagonal: vec![DMatrix::zeros(block_size, block_size); num_nodes.saturating_sub(1)],
            border: vec![DMatrix::zeros(block_size, border_size); num_nodes],
            corner: DMatrix::zeros(border_size, border_size),
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.diagonal.len()
    }

    pub fn dim(&self) -> usize {
        self.num_nodes() * self.block_size + self.border_size
    }

    /// Adds `mu * max(a_ii, floor)` to every diagonal entry.
    pub fn damped(&self, mu: f64, floor: f64) -> Self {
        let mut damped = self.clone();
        for block in damped.diagonal.iter_mut() {
            for i in 0..self.block_size {
                block[(i, i)] += mu * block[(i, i)].max(floor);
            }
        }
        for i in 0..self.border_size {
            damped.corner[(i, i)] += mu * damped.corner[(i, i)].max(floor);
        }
        damped
    }

    /// Decouples state `i` of `node`, leaving a unit row and column.
    pub fn fix_state(&mut self, node: usize, i: usize) {
        let block = &mut self.diagonal[node];
        block.row_mut(i).fill(0.0);
        block.column_mut(i).fill(0.0);
        block[(i, i)] = 1.0;
        if node + 1 < self.num_nodes() {
            self.off_diagonal[node].row_mut(i).fill(0.0);
        }
        if node > 0 {
            self.off_diagonal[node - 1].column_mut(i).fill(0.0);
        }
        self.border[node].row_mut(i).fill(0.0);
    }

    /// Decouples border variable `q`, leaving a unit row and column.
    pub fn fix_parameter(&mut self, q: usize) {
        self.corner.row_mut(q).fill(0.0);
        self.corner.column_mut(q).fill(0.0);
        self.corner[(q, q)] = 1.0;
        for block in self.border.iter_mut() {
            block.column_mut(q).fill(0.0);
        }
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let (n, p, nodes) = (self.block_size, self.border_size, self.num_nodes());
        let offset = nodes * n;
        let mut dense = DMatrix::zeros(self.dim(), self.dim());
        for j in 0..nodes {
            dense.view_mut((j * n, j * n), (n, n)).copy_from(&self.diagonal[j]);
            dense.view_mut((j * n, offset), (n, p)).copy_from(&self.border[j]);
            dense
                .view_mut((offset, j * n), (p, n))
                .copy_from(&self.border[j].transpose());
        }
        for (j, block) in self.off_diagonal.iter().enumerate() {
            dense.view_mut((j * n, (j + 1) * n), (n, n)).copy_from(block);
            dense
                .view_mut(((j + 1) * n, j * n), (n, n))
                .copy_from(&block.transpose());
        }
        dense.view_mut((offset, offset), (p, p)).copy_from(&self.corner);
        dense
    }

    /// Solves `A x = rhs` with `rhs` ordered node-major, parameters last.
    /// Returns `None` when the matrix is not positive definite.
    pub fn solve(&self, rhs: &DVector<f64>, backend: LinearSolver) -> Option<DVector<f64>> {
        match backend {
            LinearSolver::Banded => self.solve_banded(rhs),
            LinearSolver::Dense => Cholesky::new(self.to_dense()).map(|chol| chol.solve(rhs)),
        }
    }

    fn solve_banded(&self, rhs: &DVector<f64>) -> Option<DVector<f64>> {
        let (n, p, nodes) = (self.block_size, self.border_size, self.num_nodes());

        // Forward elimination of the tridiagonal part on [rhs | W] at once.
        let mut factors: Vec<Cholesky<f64, Dyn>> = Vec::with_capacity(nodes);
        let mut reduced: Vec<DMatrix<f64>> = Vec::with_capacity(nodes);
        for j in 0..nodes {
            let mut pivot = self.diagonal[j].clone();
            let mut columns = DMatrix::zeros(n, 1 + p);
            columns.column_mut(0).copy_from(&rhs.rows(j * n, n));
            columns.columns_mut(1, p).copy_from(&self.border[j]);
            if j > 0 {
                let coupling = &self.off_diagonal[j - 1];
                let previous = &factors[j - 1];
                pivot -= coupling.transpose() * previous.solve(coupling);
                columns -= coupling.transpose() * previous.solve(&reduced[j - 1]);
            }
            factors.push(Cholesky::new(pivot)?);
            reduced.push(columns);
        }

        // Back substitution gives T^-1 [rhs | W].
        let mut solved = vec![DMatrix::zeros(n, 1 + p); nodes];
        for j in (0..nodes).rev() {
            solved[j] = if j + 1 < nodes {
                let columns = &reduced[j] - &self.off_diagonal[j] * &solved[j + 1];
                factors[j].solve(&columns)
            } else {
                factors[j].solve(&reduced[j])
            };
        }

        // Schur complement on the parameters.
        let mut parameters = DVector::zeros(p);
        if p > 0 {
            let mut schur = self.corner.clone();
            let mut reduced_rhs = rhs.rows(nodes * n, p).clone_owned();
            for (border, block) in self.border.iter().zip(&solved) {
                let border_t = border.transpose();
                schur -= &border_t * block.columns(1, p);
                reduced_rhs -= &border_t * block.column(0);
            }
            parameters = Cholesky::new(schur)?.solve(&reduced_rhs);
        }

        let mut x = DVector::zeros(self.dim());
        for (j, block) in solved.iter().enumerate() {
            let node = block.column(0) - block.columns(1, p) * &parameters;
            x.rows_mut(j * n, n).copy_from(&node);
        }
        x.rows_mut(nodes * n, p).copy_from(&parameters);
        Some(x)
    }
}
