//! Entry types of the block-sparse factorizer.
//!
//! [`LuEntry`] is the seam between the sparse elimination and the arithmetic
//! of a single stored entry. Two families implement it: plain scalars
//! (`f64`, `Complex64`) for the symmetric model, and fixed-size dense blocks
//! (`SMatrix`) for anything with internal structure — 3x3 complex blocks for
//! three-phase admittance, 2x2 and 6x6 real blocks for power-flow Jacobians.

use std::fmt::Debug;
use std::ops::AddAssign;

use nalgebra::{ComplexField, SMatrix, SVector};
use num_complex::Complex64;
use num_traits::Zero;

use super::dense_lu::{
    factorize_block_in_place, perturb_pivot_if_needed, BlockPerm, LuScalar,
};
use super::SparseMatrixError;

/// One entry of a block-sparse matrix together with its vector and
/// permutation companions.
pub trait LuEntry: Copy + Debug + Zero + AddAssign + PartialEq + 'static {
    /// Right-hand-side / solution entry matching this matrix entry.
    type Vector: Copy + Debug + Zero + AddAssign + 'static;
    /// Per-block permutation recorded by full pivoting; `()` for scalars.
    type Perm: Copy + Debug + Default;
    /// Elementwise magnitudes of a vector entry, for backward error bounds.
    type Abs: Copy + Zero;

    const BLOCK_SIZE: usize;

    /// Full-pivot LU of the diagonal entry, in place.
    fn factorize_pivot(
        &mut self,
        perm: &mut Self::Perm,
        perturb_threshold: f64,
        use_pivot_perturbation: bool,
        has_pivot_perturbation: &mut bool,
    ) -> Result<(), SparseMatrixError>;

    /// `P * self`: row permutation of the pivot block. No-op for scalars.
    fn permute_rows(&mut self, perm: &Self::Perm);
    /// `self * Q`: column permutation of the pivot block. No-op for scalars.
    fn permute_cols(&mut self, perm: &Self::Perm);

    /// Forward substitution of the pivot's unit lower triangle through the
    /// rows of `self` (update of a `U` entry right of the pivot).
    fn solve_lower_rows(&mut self, pivot: &Self);
    /// Column-wise solve against the pivot's upper triangle, including the
    /// diagonal division (update of an `L` entry below the pivot). Plain
    /// division for scalars.
    fn solve_upper_cols(&mut self, pivot: &Self);

    /// Schur-complement update `self -= l * u`.
    fn sub_mul(&mut self, l: &Self, u: &Self);

    /// `self * v`.
    fn mul_vector(&self, v: &Self::Vector) -> Self::Vector;
    /// `x -= self * y`.
    fn sub_mul_vector(&self, x: &mut Self::Vector, y: &Self::Vector);

    /// Infinity norm: maximum absolute row sum.
    fn inf_norm(&self) -> f64;

    /// `P * v` with the pivot's row permutation.
    fn permute_vector(v: &Self::Vector, perm: &Self::Perm) -> Self::Vector;
    /// `Q * v` with the pivot's column permutation, restoring solution order.
    fn unpermute_vector(v: &Self::Vector, perm: &Self::Perm) -> Self::Vector;

    /// In-block forward substitution with the unit lower triangle of `self`.
    fn solve_lower_vector(&self, x: &mut Self::Vector);
    /// In-block backward substitution with the upper triangle of `self`.
    fn solve_upper_vector(&self, x: &mut Self::Vector);

    /// Elementwise magnitudes of a vector entry.
    fn abs_vector(v: &Self::Vector) -> Self::Abs;
    /// `acc += |self| * |y|`, elementwise magnitudes.
    fn abs_mul_add(&self, acc: &mut Self::Abs, y: &Self::Vector);
    /// Largest component of an elementwise magnitude.
    fn max_abs(a: &Self::Abs) -> f64;
    /// Largest component of `num / max(den, min_den)`.
    fn backward_error(num: &Self::Abs, den: &Self::Abs, min_den: f64) -> f64;
}

macro_rules! impl_scalar_lu_entry {
    ($scalar:ty) => {
        impl LuEntry for $scalar {
            type Vector = $scalar;
            type Perm = ();
            type Abs = f64;

            const BLOCK_SIZE: usize = 1;

            fn factorize_pivot(
                &mut self,
                _perm: &mut (),
                perturb_threshold: f64,
                use_pivot_perturbation: bool,
                has_pivot_perturbation: &mut bool,
            ) -> Result<(), SparseMatrixError> {
                if use_pivot_perturbation {
                    let mut abs_pivot = ComplexField::modulus(*self);
                    perturb_pivot_if_needed(
                        perturb_threshold,
                        self,
                        &mut abs_pivot,
                        has_pivot_perturbation,
                    );
                }
                if !ComplexField::modulus(*self).is_normal() {
                    return Err(SparseMatrixError::SingularPivot);
                }
                Ok(())
            }

            fn permute_rows(&mut self, _perm: &()) {}
            fn permute_cols(&mut self, _perm: &()) {}
            fn solve_lower_rows(&mut self, _pivot: &Self) {}

            fn solve_upper_cols(&mut self, pivot: &Self) {
                *self = *self / *pivot;
            }

            fn sub_mul(&mut self, l: &Self, u: &Self) {
                *self -= *l * *u;
            }

            fn mul_vector(&self, v: &Self::Vector) -> Self::Vector {
                *self * *v
            }

            fn sub_mul_vector(&self, x: &mut Self::Vector, y: &Self::Vector) {
                *x -= *self * *y;
            }

            fn inf_norm(&self) -> f64 {
                ComplexField::modulus(*self)
            }

            fn permute_vector(v: &Self::Vector, _perm: &()) -> Self::Vector {
                *v
            }

            fn unpermute_vector(v: &Self::Vector, _perm: &()) -> Self::Vector {
                *v
            }

            fn solve_lower_vector(&self, _x: &mut Self::Vector) {}

            fn solve_upper_vector(&self, x: &mut Self::Vector) {
                *x = *x / *self;
            }

            fn abs_vector(v: &Self::Vector) -> f64 {
                ComplexField::modulus(*v)
            }

            fn abs_mul_add(&self, acc: &mut f64, y: &Self::Vector) {
                *acc += ComplexField::modulus(*self) * ComplexField::modulus(*y);
            }

            fn max_abs(a: &f64) -> f64 {
                *a
            }

            fn backward_error(num: &f64, den: &f64, min_den: f64) -> f64 {
                *num / den.max(min_den)
            }
        }
    };
}

impl_scalar_lu_entry!(f64);
impl_scalar_lu_entry!(Complex64);

impl<T: LuScalar, const N: usize> LuEntry for SMatrix<T, N, N> {
    type Vector = SVector<T, N>;
    type Perm = BlockPerm<N>;
    type Abs = SVector<f64, N>;

    const BLOCK_SIZE: usize = N;

    fn factorize_pivot(
        &mut self,
        perm: &mut Self::Perm,
        perturb_threshold: f64,
        use_pivot_perturbation: bool,
        has_pivot_perturbation: &mut bool,
    ) -> Result<(), SparseMatrixError> {
        factorize_block_in_place(
            self,
            perm,
            perturb_threshold,
            use_pivot_perturbation,
            has_pivot_perturbation,
        )
    }

    fn permute_rows(&mut self, perm: &Self::Perm) {
        let original = *self;
        for r in 0..N {
            for c in 0..N {
                self[(r, c)] = original[(perm.p[r], c)];
            }
        }
    }

    fn permute_cols(&mut self, perm: &Self::Perm) {
        let original = *self;
        for c in 0..N {
            for r in 0..N {
                self[(r, c)] = original[(r, perm.q[c])];
            }
        }
    }

    fn solve_lower_rows(&mut self, pivot: &Self) {
        for block_row in 1..N {
            for block_col in 0..block_row {
                let factor = pivot[(block_row, block_col)];
                for k in 0..N {
                    let delta = factor * self[(block_col, k)];
                    self[(block_row, k)] -= delta;
                }
            }
        }
    }

    fn solve_upper_cols(&mut self, pivot: &Self) {
        for block_col in 0..N {
            for block_row in 0..block_col {
                let factor = pivot[(block_row, block_col)];
                for k in 0..N {
                    let delta = factor * self[(k, block_row)];
                    self[(k, block_col)] -= delta;
                }
            }
            let diag = pivot[(block_col, block_col)];
            for k in 0..N {
                self[(k, block_col)] = self[(k, block_col)] / diag;
            }
        }
    }

    fn sub_mul(&mut self, l: &Self, u: &Self) {
        *self -= l * u;
    }

    fn mul_vector(&self, v: &Self::Vector) -> Self::Vector {
        self * v
    }

    fn sub_mul_vector(&self, x: &mut Self::Vector, y: &Self::Vector) {
        *x -= self * y;
    }

    fn inf_norm(&self) -> f64 {
        let mut norm = 0.0f64;
        for r in 0..N {
            let mut row_sum = 0.0;
            for c in 0..N {
                row_sum += self[(r, c)].modulus();
            }
            norm = norm.max(row_sum);
        }
        norm
    }

    fn permute_vector(v: &Self::Vector, perm: &Self::Perm) -> Self::Vector {
        let mut out = Self::Vector::zero();
        for i in 0..N {
            out[i] = v[perm.p[i]];
        }
        out
    }

    fn unpermute_vector(v: &Self::Vector, perm: &Self::Perm) -> Self::Vector {
        let mut out = Self::Vector::zero();
        for j in 0..N {
            out[perm.q[j]] = v[j];
        }
        out
    }

    fn solve_lower_vector(&self, x: &mut Self::Vector) {
        for block_row in 1..N {
            for block_col in 0..block_row {
                let delta = self[(block_row, block_col)] * x[block_col];
                x[block_row] -= delta;
            }
        }
    }

    fn solve_upper_vector(&self, x: &mut Self::Vector) {
        for block_row in (0..N).rev() {
            for block_col in block_row + 1..N {
                let delta = self[(block_row, block_col)] * x[block_col];
                x[block_row] -= delta;
            }
            x[block_row] = x[block_row] / self[(block_row, block_row)];
        }
    }

    fn abs_vector(v: &Self::Vector) -> Self::Abs {
        let mut out = Self::Abs::zero();
        for i in 0..N {
            out[i] = v[i].modulus();
        }
        out
    }

    fn abs_mul_add(&self, acc: &mut Self::Abs, y: &Self::Vector) {
        for r in 0..N {
            for c in 0..N {
                acc[r] += self[(r, c)].modulus() * y[c].modulus();
            }
        }
    }

    fn max_abs(a: &Self::Abs) -> f64 {
        let mut max = 0.0f64;
        for i in 0..N {
            max = max.max(a[i]);
        }
        max
    }

    fn backward_error(num: &Self::Abs, den: &Self::Abs, min_den: f64) -> f64 {
        let mut max = 0.0f64;
        for i in 0..N {
            max = max.max(num[i] / den[i].max(min_den));
        }
        max
    }
}
