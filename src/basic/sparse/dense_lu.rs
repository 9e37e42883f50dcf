//! Dense full-pivot LU factorization of a single diagonal block.
//!
//! The elimination follows the classic full-pivoting scheme (largest squared
//! magnitude in the remaining corner, ties broken by the first offset in
//! column-major scan order), extended with an optional pivot perturbation:
//! a pivot smaller than the given threshold is rescaled onto the threshold
//! circle while keeping its phase, and the caller is told so it can repair
//! the solution later with iterative refinement.

use nalgebra::{ComplexField, SMatrix};
use num_complex::Complex64;

use super::{SparseMatrixError, EPSILON};

/// Scalar entry of an LU-factorizable matrix: `f64` or `Complex64`.
pub trait LuScalar: ComplexField<RealField = f64> + Copy {}

impl LuScalar for f64 {}
impl LuScalar for Complex64 {}

/// Row and column permutation of one diagonal block.
///
/// `p` and `q` are forward selection maps: row `i` of the factorized block
/// is row `p[i]` of the original block, column `j` is column `q[j]`. With
/// `P`/`Q` the matching permutation matrices, the block satisfies
/// `P * A * Q = L * U` (unit diagonal of `L` implicit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPerm<const N: usize> {
    pub p: [usize; N],
    pub q: [usize; N],
}

impl<const N: usize> Default for BlockPerm<N> {
    fn default() -> Self {
        let mut identity = [0usize; N];
        for (i, e) in identity.iter_mut().enumerate() {
            *e = i;
        }
        Self {
            p: identity,
            q: identity,
        }
    }
}

/// Rescales `value` onto the perturbation threshold if its magnitude is
/// below it, preserving the phase. A zero pivot becomes `+threshold`.
/// `abs_value` and `has_perturbation` are updated alongside.
#[inline]
pub(crate) fn perturb_pivot_if_needed<T: LuScalar>(
    perturb_threshold: f64,
    value: &mut T,
    abs_value: &mut f64,
    has_perturbation: &mut bool,
) {
    if *abs_value < perturb_threshold {
        let scale = if *abs_value == 0.0 {
            T::one()
        } else {
            *value * T::from_real(1.0 / *abs_value)
        };
        *value = scale * T::from_real(perturb_threshold);
        *abs_value = perturb_threshold;
        *has_perturbation = true;
    }
}

/// Factorizes the block in place into `L * U` with full pivoting.
///
/// On return the strictly lower triangle holds `L` (unit diagonal implicit)
/// and the upper triangle holds `U`; `perm` receives the accumulated row and
/// column permutations.
///
/// # Errors
///
/// [`SparseMatrixError::SingularPivot`] when a diagonal pivot of `U` ends up
/// non-finite, or below `epsilon * max_pivot` while `use_pivot_perturbation`
/// is off.
pub(crate) fn factorize_block_in_place<T: LuScalar, const N: usize>(
    matrix: &mut SMatrix<T, N, N>,
    perm: &mut BlockPerm<N>,
    perturb_threshold: f64,
    use_pivot_perturbation: bool,
    has_pivot_perturbation: &mut bool,
) -> Result<(), SparseMatrixError> {
    *perm = BlockPerm::default();
    let mut max_pivot = 0.0f64;

    for pivot in 0..N {
        // biggest squared magnitude in the remaining bottom-right corner,
        // first linear offset wins on ties (column-major scan)
        let mut biggest_score = 0.0f64;
        let (mut row_biggest, mut col_biggest) = (pivot, pivot);
        for col in pivot..N {
            for row in pivot..N {
                let score = matrix[(row, col)].modulus_squared();
                if score > biggest_score {
                    biggest_score = score;
                    row_biggest = row;
                    col_biggest = col;
                }
            }
        }

        // structurally singular remainder and no perturbation allowed:
        // leave the remaining permutation as identity, fail in the final check
        if biggest_score == 0.0 && !use_pivot_perturbation {
            break;
        }

        let mut abs_pivot = biggest_score.sqrt();
        perturb_pivot_if_needed(
            perturb_threshold,
            &mut matrix[(row_biggest, col_biggest)],
            &mut abs_pivot,
            has_pivot_perturbation,
        );
        max_pivot = max_pivot.max(abs_pivot);

        if pivot != row_biggest {
            matrix.swap_rows(pivot, row_biggest);
            perm.p.swap(pivot, row_biggest);
        }
        if pivot != col_biggest {
            matrix.swap_columns(pivot, col_biggest);
            perm.q.swap(pivot, col_biggest);
        }

        // Gaussian elimination of the bottom-right corner
        if pivot + 1 < N {
            let diag = matrix[(pivot, pivot)];
            for row in pivot + 1..N {
                matrix[(row, pivot)] = matrix[(row, pivot)] / diag;
            }
            for col in pivot + 1..N {
                let u = matrix[(pivot, col)];
                for row in pivot + 1..N {
                    let l = matrix[(row, pivot)];
                    matrix[(row, col)] -= l * u;
                }
            }
        }
    }

    // condition check; skipped when perturbation already bounded the pivots
    let pivot_threshold = if *has_pivot_perturbation {
        0.0
    } else {
        EPSILON * max_pivot
    };
    for pivot in 0..N {
        let diag = matrix[(pivot, pivot)].modulus();
        if diag < pivot_threshold || !diag.is_normal() {
            return Err(SparseMatrixError::SingularPivot);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, SVector};

    fn reconstruct<const N: usize>(
        lu: &SMatrix<f64, N, N>,
        perm: &BlockPerm<N>,
    ) -> SMatrix<f64, N, N> {
        // A = P^-1 * L * U * Q^-1, with p/q as forward selection maps
        let mut l = SMatrix::<f64, N, N>::identity();
        let mut u = SMatrix::<f64, N, N>::zeros();
        for r in 0..N {
            for c in 0..N {
                if r > c {
                    l[(r, c)] = lu[(r, c)];
                } else {
                    u[(r, c)] = lu[(r, c)];
                }
            }
        }
        let prod = l * u;
        let mut a = SMatrix::<f64, N, N>::zeros();
        for r in 0..N {
            for c in 0..N {
                a[(perm.p[r], perm.q[c])] = prod[(r, c)];
            }
        }
        a
    }

    #[test]
    fn factorizes_well_conditioned_block() {
        let a = Matrix3::new(2.0, 1.0, 0.5, 1.0, 3.0, 0.25, 0.5, 0.25, 4.0);
        let mut lu = a;
        let mut perm = BlockPerm::default();
        let mut perturbed = false;
        factorize_block_in_place(&mut lu, &mut perm, 0.0, false, &mut perturbed).unwrap();
        assert!(!perturbed);
        let back = reconstruct(&lu, &perm);
        assert!(
            (back - a).norm() < 1e-14,
            "reconstruction error {}",
            (back - a).norm()
        );
    }

    #[test]
    fn permutations_are_valid() {
        let a = Matrix3::new(0.0, 1.0, 0.0, 0.0, 0.0, 2.0, 3.0, 0.0, 0.0);
        let mut lu = a;
        let mut perm = BlockPerm::default();
        let mut perturbed = false;
        factorize_block_in_place(&mut lu, &mut perm, 0.0, false, &mut perturbed).unwrap();
        let mut seen_p = [false; 3];
        let mut seen_q = [false; 3];
        for i in 0..3 {
            seen_p[perm.p[i]] = true;
            seen_q[perm.q[i]] = true;
        }
        assert!(seen_p.iter().all(|&s| s), "p is not a permutation: {:?}", perm.p);
        assert!(seen_q.iter().all(|&s| s), "q is not a permutation: {:?}", perm.q);
        let back = reconstruct(&lu, &perm);
        assert!((back - a).norm() < 1e-14);
    }

    #[test]
    fn singular_block_fails_without_perturbation() {
        // rank-1 block
        let a = Matrix3::new(1.0, 2.0, 3.0, 2.0, 4.0, 6.0, 3.0, 6.0, 9.0);
        let mut lu = a;
        let mut perm = BlockPerm::default();
        let mut perturbed = false;
        let result = factorize_block_in_place(&mut lu, &mut perm, 0.0, false, &mut perturbed);
        assert_eq!(result, Err(SparseMatrixError::SingularPivot));
    }

    #[test]
    fn singular_block_is_perturbed_on_request() {
        let a = Matrix3::new(1.0, 2.0, 3.0, 2.0, 4.0, 6.0, 3.0, 6.0, 9.0);
        let mut lu = a;
        let mut perm = BlockPerm::default();
        let mut perturbed = false;
        let threshold = 1e-13 * 10.0;
        factorize_block_in_place(&mut lu, &mut perm, threshold, true, &mut perturbed).unwrap();
        assert!(perturbed, "rank deficient block must trigger perturbation");
        for pivot in 0..3 {
            assert!(lu[(pivot, pivot)].abs() >= threshold * (1.0 - 1e-12));
        }
    }

    #[test]
    fn zero_pivot_is_replaced_by_positive_threshold() {
        let mut value = 0.0f64;
        let mut abs_value = 0.0f64;
        let mut has = false;
        perturb_pivot_if_needed(1e-10, &mut value, &mut abs_value, &mut has);
        assert_eq!(value, 1e-10);
        assert!(has);

        let mut value = Complex64::new(0.0, -1e-20);
        let mut abs_value = value.norm();
        let mut has = false;
        perturb_pivot_if_needed(1e-10, &mut value, &mut abs_value, &mut has);
        assert!((value.norm() - 1e-10).abs() < 1e-25, "phase-preserving rescale");
        assert!(value.im < 0.0, "sign of the perturbed pivot is kept");
    }

    #[test]
    fn solves_against_reference_vector() {
        // sanity: L U x = P A Q x' relation through a direct solve
        let a = Matrix3::new(4.0, -2.0, 1.0, -2.0, 4.0, -2.0, 1.0, -2.0, 4.0);
        let mut lu = a;
        let mut perm = BlockPerm::default();
        let mut perturbed = false;
        factorize_block_in_place(&mut lu, &mut perm, 0.0, false, &mut perturbed).unwrap();
        let b = SVector::<f64, 3>::new(1.0, 2.0, 3.0);
        // x~ = P b
        let mut x = SVector::<f64, 3>::zeros();
        for i in 0..3 {
            x[i] = b[perm.p[i]];
        }
        // forward then backward
        for r in 0..3 {
            for c in 0..r {
                let delta = lu[(r, c)] * x[c];
                x[r] -= delta;
            }
        }
        for r in (0..3).rev() {
            for c in r + 1..3 {
                let delta = lu[(r, c)] * x[c];
                x[r] -= delta;
            }
            x[r] /= lu[(r, r)];
        }
        // undo column permutation
        let mut solution = SVector::<f64, 3>::zeros();
        for j in 0..3 {
            solution[perm.q[j]] = x[j];
        }
        let residual = a * solution - b;
        assert!(residual.norm() < 1e-12, "residual {}", residual.norm());
    }
}
