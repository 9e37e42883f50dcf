//! In-place sparse LU factorization with pivot perturbation and iterative
//! refinement.
//!
//! The factorization is row-oriented Gaussian elimination over a fixed,
//! structurally symmetric pattern whose fill-ins are pre-allocated. Entries
//! can be scalars or dense blocks (see [`LuEntry`]); per diagonal block a
//! full-pivot dense LU runs first and its permutations are applied to the
//! off-diagonal entries of the pivot row and column.

use std::sync::Arc;

use num_traits::Zero;
use tracing::debug;

use super::entry::LuEntry;
use super::{
    SparseMatrixError, SparsePattern, CAP_BACK_ERROR_DENOMINATOR, EPSILON_PERTURBATION,
    MAX_ITERATIVE_REFINEMENT,
};

/// Sparse LU factorizer over a shared symbolic pattern.
///
/// The solver owns no matrix values. `prefactorize` turns the caller's data
/// into `L \ U` in place (unit diagonal of `L` implicit, diagonal of `U`
/// stored at the pattern's diagonal positions), and the solve entry points
/// run forward/backward substitution against that storage. When a pivot had
/// to be perturbed during factorization, solves transparently run iterative
/// refinement against a retained copy of the original matrix.
#[derive(Debug)]
pub struct SparseLUSolver<T: LuEntry> {
    size: usize,
    nnz: usize,
    pattern: Arc<SparsePattern>,
    // factorization state for the perturbation/refinement path
    has_pivot_perturbation: bool,
    matrix_norm: f64,
    original_matrix: Option<Vec<T>>,
}

impl<T: LuEntry> SparseLUSolver<T> {
    /// Creates a factorizer for the given pattern. No numerical work happens
    /// here; the pattern is shared, not copied.
    pub fn new(pattern: Arc<SparsePattern>) -> Self {
        Self {
            size: pattern.size(),
            nnz: pattern.nnz(),
            pattern,
            has_pivot_perturbation: false,
            matrix_norm: 0.0,
            original_matrix: None,
        }
    }

    /// Matrix dimension (in blocks).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Stored entries (in blocks), fill-ins included.
    pub fn nnz(&self) -> usize {
        self.nnz
    }

    /// Whether the most recent factorization perturbed a pivot.
    pub fn has_pivot_perturbation(&self) -> bool {
        self.has_pivot_perturbation
    }

    /// Factorizes and solves in one call.
    pub fn prefactorize_and_solve(
        &mut self,
        data: &mut [T],
        block_perm: &mut [T::Perm],
        rhs: &[T::Vector],
        x: &mut [T::Vector],
        use_pivot_perturbation: bool,
    ) -> Result<(), SparseMatrixError> {
        self.prefactorize(data, block_perm, use_pivot_perturbation)?;
        self.solve_with_prefactorized(data, block_perm, rhs, x)
    }

    /// Factorizes `data` in place into `L * U` over the fixed pattern.
    ///
    /// `block_perm` receives the per-diagonal-block permutations. With
    /// `use_pivot_perturbation`, pivots smaller than
    /// `1e-13 * ||A||_off` are clamped onto that threshold and the original
    /// matrix is retained so subsequent solves can refine.
    ///
    /// # Errors
    ///
    /// [`SparseMatrixError::SingularPivot`] when a pivot is non-finite, or
    /// too small while perturbation is disabled.
    pub fn prefactorize(
        &mut self,
        data: &mut [T],
        block_perm: &mut [T::Perm],
        use_pivot_perturbation: bool,
    ) -> Result<(), SparseMatrixError> {
        assert_eq!(data.len(), self.nnz, "matrix data does not match pattern");
        assert_eq!(block_perm.len(), self.size, "one block permutation per row");

        self.reset_matrix_cache();
        if use_pivot_perturbation {
            self.initialize_pivot_perturbation(data);
        }
        let perturb_threshold = EPSILON_PERTURBATION * self.matrix_norm;
        let mut has_pivot_perturbation = false;

        let pattern = self.pattern.clone();
        let row_indptr = pattern.row_indptr();
        let col_indices = pattern.col_indices();
        let diag_idx = pattern.diag_idx();

        // per-row scan position, exploiting the symmetric nonzero pattern:
        // col_position_idx[r] always points at the next column of row r whose
        // mirror entry has not yet served as pivot row
        let mut col_position_idx: Vec<usize> = row_indptr[..self.size].to_vec();

        for pivot_row_col in 0..self.size {
            let pivot_idx = diag_idx[pivot_row_col];

            // dense full-pivot LU of the diagonal block, in place
            data[pivot_idx].factorize_pivot(
                &mut block_perm[pivot_row_col],
                perturb_threshold,
                use_pivot_perturbation,
                &mut has_pivot_perturbation,
            )?;
            let perm = block_perm[pivot_row_col];
            let pivot = data[pivot_idx];

            // permute rows of L entries left of the pivot and, through the
            // symmetric pattern, columns of U entries above the pivot
            for l_idx in row_indptr[pivot_row_col]..pivot_idx {
                data[l_idx].permute_rows(&perm);
                let u_row = col_indices[l_idx];
                let u_idx = col_position_idx[u_row];
                debug_assert_eq!(col_indices[u_idx], pivot_row_col);
                data[u_idx].permute_cols(&perm);
                col_position_idx[u_row] += 1;
            }

            // U entries right of the pivot: U_p,k = lower_solve(P * A_p,k)
            for u_idx in pivot_idx + 1..row_indptr[pivot_row_col + 1] {
                data[u_idx].permute_rows(&perm);
                data[u_idx].solve_lower_rows(&pivot);
            }

            // L entries below the pivot and the Schur complement update;
            // the symmetric pattern makes the columns right of the diagonal
            // double as the row indices below it
            for l_ref_idx in pivot_idx + 1..row_indptr[pivot_row_col + 1] {
                let l_row = col_indices[l_ref_idx];
                let l_idx = col_position_idx[l_row];
                debug_assert_eq!(col_indices[l_idx], pivot_row_col);

                // L_k,p = (A_k,p * Q) / U_p
                data[l_idx].permute_cols(&perm);
                data[l_idx].solve_upper_cols(&pivot);
                let l = data[l_idx];

                // A_k,c -= L_k,p * U_p,c for all stored c > p; the target
                // position always exists because fill-ins are pre-allocated
                let mut a_idx = l_idx;
                for u_idx in pivot_idx + 1..row_indptr[pivot_row_col + 1] {
                    let u_col = col_indices[u_idx];
                    let row_end = row_indptr[l_row + 1];
                    a_idx += col_indices[a_idx..row_end].partition_point(|&c| c < u_col);
                    debug_assert!(a_idx < row_end);
                    debug_assert_eq!(col_indices[a_idx], u_col);
                    let u = data[u_idx];
                    data[a_idx].sub_mul(&l, &u);
                }
                col_position_idx[l_row] += 1;
            }
            col_position_idx[pivot_row_col] += 1;
        }

        self.has_pivot_perturbation = has_pivot_perturbation;
        if has_pivot_perturbation {
            debug!(
                matrix_norm = self.matrix_norm,
                "pivot perturbation triggered during factorization"
            );
        } else {
            // clean factorization, the original matrix is not needed
            self.reset_matrix_cache();
        }
        Ok(())
    }

    /// Solves `A * x = rhs` with previously factorized data.
    ///
    /// Runs plain forward/backward substitution, or iterative refinement if
    /// the factorization perturbed a pivot.
    ///
    /// # Errors
    ///
    /// [`SparseMatrixError::RefinementDiverge`] when refinement does not
    /// reach a backward error of `1e-13` within the iteration cap.
    pub fn solve_with_prefactorized(
        &mut self,
        data: &[T],
        block_perm: &[T::Perm],
        rhs: &[T::Vector],
        x: &mut [T::Vector],
    ) -> Result<(), SparseMatrixError> {
        if self.has_pivot_perturbation {
            self.solve_with_refinement(data, block_perm, rhs, x)
        } else {
            x.copy_from_slice(rhs);
            self.solve_once(data, block_perm, x);
            Ok(())
        }
    }

    /// One forward/backward substitution pass; `x` holds the right-hand side
    /// on entry and the solution on return.
    fn solve_once(&self, data: &[T], block_perm: &[T::Perm], x: &mut [T::Vector]) {
        let row_indptr = self.pattern.row_indptr();
        let col_indices = self.pattern.col_indices();
        let diag_idx = self.pattern.diag_idx();

        // forward substitution with L
        for row in 0..self.size {
            let mut xr = T::permute_vector(&x[row], &block_perm[row]);
            for l_idx in row_indptr[row]..diag_idx[row] {
                let col = col_indices[l_idx];
                debug_assert!(col < row);
                data[l_idx].sub_mul_vector(&mut xr, &x[col]);
            }
            data[diag_idx[row]].solve_lower_vector(&mut xr);
            x[row] = xr;
        }

        // backward substitution with U
        for row in (0..self.size).rev() {
            let mut xr = x[row];
            for u_idx in diag_idx[row] + 1..row_indptr[row + 1] {
                let col = col_indices[u_idx];
                debug_assert!(col > row);
                data[u_idx].sub_mul_vector(&mut xr, &x[col]);
            }
            data[diag_idx[row]].solve_upper_vector(&mut xr);
            x[row] = T::unpermute_vector(&xr, &block_perm[row]);
        }
    }

    fn solve_with_refinement(
        &mut self,
        data: &[T],
        block_perm: &[T::Perm],
        rhs: &[T::Vector],
        x: &mut [T::Vector],
    ) -> Result<(), SparseMatrixError> {
        // x starts at zero, so the first residual is the right-hand side
        for xi in x.iter_mut() {
            *xi = T::Vector::zero();
        }
        let mut residual = rhs.to_vec();
        let mut dx = vec![T::Vector::zero(); self.size];

        let mut backward_error = f64::MAX;
        let mut num_iter = 0usize;
        // the convergence target is the same threshold that triggered the
        // perturbation in the first place
        while backward_error > EPSILON_PERTURBATION {
            if num_iter == MAX_ITERATIVE_REFINEMENT + 1 {
                return Err(SparseMatrixError::RefinementDiverge);
            }
            num_iter += 1;
            dx.copy_from_slice(&residual);
            self.solve_once(data, block_perm, &mut dx);
            backward_error = self.iterate_and_backward_error(rhs, &residual, &dx, x);
            self.calculate_residual(rhs, x, &mut residual);
        }
        debug!(refinement_steps = num_iter, backward_error, "iterative refinement converged");
        Ok(())
    }

    /// `residual = rhs - A * x` against the retained original matrix.
    fn calculate_residual(&self, rhs: &[T::Vector], x: &[T::Vector], residual: &mut [T::Vector]) {
        let row_indptr = self.pattern.row_indptr();
        let col_indices = self.pattern.col_indices();
        let original_matrix = self.original_matrix.as_ref().expect("refinement without cache");
        for row in 0..self.size {
            let mut r = rhs[row];
            for idx in row_indptr[row]..row_indptr[row + 1] {
                original_matrix[idx].sub_mul_vector(&mut r, &x[col_indices[idx]]);
            }
            residual[row] = r;
        }
    }

    /// Applies `x += dx` and returns the componentwise backward error
    /// `max_r |residual_r| / max(|rhs_r| + (|A| |x|)_r, floor)` with the
    /// denominator floored at `1e-4` of its largest row value.
    fn iterate_and_backward_error(
        &self,
        rhs: &[T::Vector],
        residual: &[T::Vector],
        dx: &[T::Vector],
        x: &mut [T::Vector],
    ) -> f64 {
        let row_indptr = self.pattern.row_indptr();
        let col_indices = self.pattern.col_indices();
        let original_matrix = self.original_matrix.as_ref().expect("refinement without cache");

        let mut all_denominators = Vec::with_capacity(self.size);
        let mut max_denominator = 0.0f64;
        for row in 0..self.size {
            let mut denominator = T::abs_vector(&rhs[row]);
            for idx in row_indptr[row]..row_indptr[row + 1] {
                original_matrix[idx].abs_mul_add(&mut denominator, &x[col_indices[idx]]);
            }
            max_denominator = max_denominator.max(T::max_abs(&denominator));
            all_denominators.push(denominator);
        }
        let min_denominator = CAP_BACK_ERROR_DENOMINATOR * max_denominator;

        let mut max_berr = 0.0f64;
        for row in 0..self.size {
            let numerator = T::abs_vector(&residual[row]);
            let berr = T::backward_error(&numerator, &all_denominators[row], min_denominator);
            max_berr = max_berr.max(berr);
            x[row] += dx[row];
        }
        max_berr
    }

    /// Retains the original matrix and computes the block-wise off-diagonal
    /// infinity norm that scales the perturbation threshold.
    fn initialize_pivot_perturbation(&mut self, data: &[T]) {
        self.original_matrix = Some(data.to_vec());
        let row_indptr = self.pattern.row_indptr();
        let col_indices = self.pattern.col_indices();
        let mut matrix_norm = 0.0f64;
        for row in 0..self.size {
            let mut row_norm = 0.0f64;
            for idx in row_indptr[row]..row_indptr[row + 1] {
                if col_indices[idx] == row {
                    continue;
                }
                row_norm += data[idx].inf_norm();
            }
            matrix_norm = matrix_norm.max(row_norm);
        }
        self.matrix_norm = matrix_norm;
    }

    fn reset_matrix_cache(&mut self) {
        self.has_pivot_perturbation = false;
        self.matrix_norm = 0.0;
        self.original_matrix = None;
    }
}
