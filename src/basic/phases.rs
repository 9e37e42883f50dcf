//! Symmetric and asymmetric phase models.
//!
//! Every nodal quantity of the power-flow problem comes in two shapes: a
//! scalar for the single-phase symmetric model, and a length-3 vector (with
//! 3x3 admittance blocks) for the three-phase asymmetric model. The
//! [`PhaseModel`] trait carries both shapes through the solver, so the
//! Newton-Raphson code is written once and monomorphized per model.

use std::f64::consts::FRAC_PI_3;
use std::fmt::Debug;
use std::ops::{AddAssign, Neg, SubAssign};

use nalgebra::{Matrix2, Matrix3, SMatrix, SVector, Vector2, Vector3};
use num_complex::Complex64;
use num_traits::Zero;

use super::sparse::LuEntry;

/// Phase-dependent value, tensor, and Jacobian shapes of the power-flow
/// problem, plus the small arithmetic the solver needs on them.
///
/// The Jacobian block is the 2x2 logical matrix `[[H, N], [M, L]]` of
/// partial derivatives of `(P, Q)` with respect to `(theta, V)` scaled by
/// `V`; in the asymmetric model each cell is itself 3x3, giving a 6x6 real
/// block. Mismatch and increment vectors share the same stacked layout:
/// `(P, Q)` respectively `(theta, V)` halves.
pub trait PhaseModel: Copy + Debug + Default + PartialEq + 'static {
    /// Nodal complex voltage / power: `Complex64` or `Vector3<Complex64>`.
    type ComplexValue: Copy + Debug + Zero + AddAssign + SubAssign + 'static;
    /// Admittance entry: `Complex64` or `Matrix3<Complex64>`.
    type ComplexTensor: LuEntry<Vector = Self::ComplexValue> + Neg<Output = Self::ComplexTensor>;
    /// Real per-phase value: `f64` or `Vector3<f64>`.
    type RealValue: Copy + Debug + Zero + AddAssign + SubAssign + Neg<Output = Self::RealValue>;
    /// Jacobian block: `Matrix2<f64>` or `SMatrix<f64, 6, 6>`.
    type JacBlock: LuEntry<Vector = Self::PolarVector> + AddAssign;
    /// Stacked `(theta, V)` / `(P, Q)` vector: `Vector2<f64>` or `SVector<f64, 6>`.
    type PolarVector: Copy + Debug + Zero + AddAssign + 'static;

    /// Number of phases.
    const N_PHASE: usize;

    /// Elementwise magnitude of a complex value.
    fn cabs(u: &Self::ComplexValue) -> Self::RealValue;
    /// Elementwise argument of a complex value.
    fn arg(u: &Self::ComplexValue) -> Self::RealValue;
    /// `V * exp(j * theta)`, elementwise.
    fn polar(v: &Self::RealValue, theta: &Self::RealValue) -> Self::ComplexValue;
    /// Elementwise complex conjugate.
    fn conj(u: &Self::ComplexValue) -> Self::ComplexValue;
    /// Largest phase magnitude of `a - b`.
    fn max_abs_diff(a: &Self::ComplexValue, b: &Self::ComplexValue) -> f64;

    /// Expands a scalar reference phasor to all phases; the asymmetric model
    /// produces the balanced positive-sequence set `[u, u*a^2, u*a]`.
    fn ref_voltage(u: Complex64) -> Self::ComplexValue;
    /// Expands a scalar admittance to the phase tensor (diagonal in the
    /// asymmetric model).
    fn ref_admittance(y: Complex64) -> Self::ComplexTensor;

    /// Real part, per phase.
    fn real(s: &Self::ComplexValue) -> Self::RealValue;
    /// Imaginary part, per phase.
    fn imag(s: &Self::ComplexValue) -> Self::RealValue;

    /// Elementwise product of real values.
    fn elem_mul(a: &Self::RealValue, b: &Self::RealValue) -> Self::RealValue;
    /// Real value scaled by a constant.
    fn scale(a: &Self::RealValue, factor: f64) -> Self::RealValue;

    /// Incomplete Jacobian block of the branch `(i, j)`:
    /// `S_ij = (u_i (x) conj(u_j)) .* conj(y_ij)`, then
    /// `H = Im(S)`, `N = Re(S)`, `M = -N`, `L = H`.
    fn hnml(
        yij: &Self::ComplexTensor,
        ui: &Self::ComplexValue,
        uj: &Self::ComplexValue,
    ) -> Self::JacBlock;

    /// Row sums of the `H` cell (per-phase reactive power contribution).
    fn sum_row_h(block: &Self::JacBlock) -> Self::RealValue;
    /// Row sums of the `N` cell (per-phase active power contribution).
    fn sum_row_n(block: &Self::JacBlock) -> Self::RealValue;

    /// `H += diag(v)`.
    fn add_diag_h(block: &mut Self::JacBlock, v: &Self::RealValue);
    /// `N += diag(v)`.
    fn add_diag_n(block: &mut Self::JacBlock, v: &Self::RealValue);
    /// `M += diag(v)`.
    fn add_diag_m(block: &mut Self::JacBlock, v: &Self::RealValue);
    /// `L += diag(v)`.
    fn add_diag_l(block: &mut Self::JacBlock, v: &Self::RealValue);

    /// Top half of a stacked vector (`theta` or `P`).
    fn top(x: &Self::PolarVector) -> Self::RealValue;
    /// Bottom half of a stacked vector (`V` or `Q`).
    fn bottom(x: &Self::PolarVector) -> Self::RealValue;
    /// Writes the top half.
    fn set_top(x: &mut Self::PolarVector, v: &Self::RealValue);
    /// Writes the bottom half.
    fn set_bottom(x: &mut Self::PolarVector, v: &Self::RealValue);
}

/// Single-phase symmetric model: every nodal quantity is a scalar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Symmetric;

/// Three-phase asymmetric model: length-3 values and 3x3 tensors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Asymmetric;

impl PhaseModel for Symmetric {
    type ComplexValue = Complex64;
    type ComplexTensor = Complex64;
    type RealValue = f64;
    type JacBlock = Matrix2<f64>;
    type PolarVector = Vector2<f64>;

    const N_PHASE: usize = 1;

    fn cabs(u: &Complex64) -> f64 {
        u.norm()
    }

    fn arg(u: &Complex64) -> f64 {
        u.arg()
    }

    fn polar(v: &f64, theta: &f64) -> Complex64 {
        Complex64::from_polar(*v, *theta)
    }

    fn conj(u: &Complex64) -> Complex64 {
        u.conj()
    }

    fn max_abs_diff(a: &Complex64, b: &Complex64) -> f64 {
        (a - b).norm()
    }

    fn ref_voltage(u: Complex64) -> Complex64 {
        u
    }

    fn ref_admittance(y: Complex64) -> Complex64 {
        y
    }

    fn real(s: &Complex64) -> f64 {
        s.re
    }

    fn imag(s: &Complex64) -> f64 {
        s.im
    }

    fn elem_mul(a: &f64, b: &f64) -> f64 {
        a * b
    }

    fn scale(a: &f64, factor: f64) -> f64 {
        a * factor
    }

    fn hnml(yij: &Complex64, ui: &Complex64, uj: &Complex64) -> Matrix2<f64> {
        let power_flow = ui * uj.conj() * yij.conj();
        let h = power_flow.im;
        let n = power_flow.re;
        Matrix2::new(h, n, -n, h)
    }

    fn sum_row_h(block: &Matrix2<f64>) -> f64 {
        block[(0, 0)]
    }

    fn sum_row_n(block: &Matrix2<f64>) -> f64 {
        block[(0, 1)]
    }

    fn add_diag_h(block: &mut Matrix2<f64>, v: &f64) {
        block[(0, 0)] += v;
    }

    fn add_diag_n(block: &mut Matrix2<f64>, v: &f64) {
        block[(0, 1)] += v;
    }

    fn add_diag_m(block: &mut Matrix2<f64>, v: &f64) {
        block[(1, 0)] += v;
    }

    fn add_diag_l(block: &mut Matrix2<f64>, v: &f64) {
        block[(1, 1)] += v;
    }

    fn top(x: &Vector2<f64>) -> f64 {
        x[0]
    }

    fn bottom(x: &Vector2<f64>) -> f64 {
        x[1]
    }

    fn set_top(x: &mut Vector2<f64>, v: &f64) {
        x[0] = *v;
    }

    fn set_bottom(x: &mut Vector2<f64>, v: &f64) {
        x[1] = *v;
    }
}

impl PhaseModel for Asymmetric {
    type ComplexValue = Vector3<Complex64>;
    type ComplexTensor = Matrix3<Complex64>;
    type RealValue = Vector3<f64>;
    type JacBlock = SMatrix<f64, 6, 6>;
    type PolarVector = SVector<f64, 6>;

    const N_PHASE: usize = 3;

    fn cabs(u: &Vector3<Complex64>) -> Vector3<f64> {
        u.map(|e| e.norm())
    }

    fn arg(u: &Vector3<Complex64>) -> Vector3<f64> {
        u.map(|e| e.arg())
    }

    fn polar(v: &Vector3<f64>, theta: &Vector3<f64>) -> Vector3<Complex64> {
        Vector3::from_fn(|p, _| Complex64::from_polar(v[p], theta[p]))
    }

    fn conj(u: &Vector3<Complex64>) -> Vector3<Complex64> {
        u.map(|e| e.conj())
    }

    fn max_abs_diff(a: &Vector3<Complex64>, b: &Vector3<Complex64>) -> f64 {
        let mut max = 0.0f64;
        for p in 0..3 {
            max = max.max((a[p] - b[p]).norm());
        }
        max
    }

    fn ref_voltage(u: Complex64) -> Vector3<Complex64> {
        // balanced positive sequence: phases shifted by -120 and +120 degrees
        let a = Complex64::from_polar(1.0, 2.0 * FRAC_PI_3);
        Vector3::new(u, u * a * a, u * a)
    }

    fn ref_admittance(y: Complex64) -> Matrix3<Complex64> {
        Matrix3::from_diagonal_element(y)
    }

    fn real(s: &Vector3<Complex64>) -> Vector3<f64> {
        s.map(|e| e.re)
    }

    fn imag(s: &Vector3<Complex64>) -> Vector3<f64> {
        s.map(|e| e.im)
    }

    fn elem_mul(a: &Vector3<f64>, b: &Vector3<f64>) -> Vector3<f64> {
        a.component_mul(b)
    }

    fn scale(a: &Vector3<f64>, factor: f64) -> Vector3<f64> {
        a * factor
    }

    fn hnml(
        yij: &Matrix3<Complex64>,
        ui: &Vector3<Complex64>,
        uj: &Vector3<Complex64>,
    ) -> SMatrix<f64, 6, 6> {
        let mut block = SMatrix::<f64, 6, 6>::zeros();
        for r in 0..3 {
            for c in 0..3 {
                // S_rc = u_i,r * conj(u_j,c) * conj(y_rc)
                let s = ui[r] * uj[c].conj() * yij[(r, c)].conj();
                let h = s.im;
                let n = s.re;
                block[(r, c)] = h;
                block[(r, 3 + c)] = n;
                block[(3 + r, c)] = -n;
                block[(3 + r, 3 + c)] = h;
            }
        }
        block
    }

    fn sum_row_h(block: &SMatrix<f64, 6, 6>) -> Vector3<f64> {
        Vector3::from_fn(|r, _| block[(r, 0)] + block[(r, 1)] + block[(r, 2)])
    }

    fn sum_row_n(block: &SMatrix<f64, 6, 6>) -> Vector3<f64> {
        Vector3::from_fn(|r, _| block[(r, 3)] + block[(r, 4)] + block[(r, 5)])
    }

    fn add_diag_h(block: &mut SMatrix<f64, 6, 6>, v: &Vector3<f64>) {
        for p in 0..3 {
            block[(p, p)] += v[p];
        }
    }

    fn add_diag_n(block: &mut SMatrix<f64, 6, 6>, v: &Vector3<f64>) {
        for p in 0..3 {
            block[(p, 3 + p)] += v[p];
        }
    }

    fn add_diag_m(block: &mut SMatrix<f64, 6, 6>, v: &Vector3<f64>) {
        for p in 0..3 {
            block[(3 + p, p)] += v[p];
        }
    }

    fn add_diag_l(block: &mut SMatrix<f64, 6, 6>, v: &Vector3<f64>) {
        for p in 0..3 {
            block[(3 + p, 3 + p)] += v[p];
        }
    }

    fn top(x: &SVector<f64, 6>) -> Vector3<f64> {
        Vector3::new(x[0], x[1], x[2])
    }

    fn bottom(x: &SVector<f64, 6>) -> Vector3<f64> {
        Vector3::new(x[3], x[4], x[5])
    }

    fn set_top(x: &mut SVector<f64, 6>, v: &Vector3<f64>) {
        for p in 0..3 {
            x[p] = v[p];
        }
    }

    fn set_bottom(x: &mut SVector<f64, 6>, v: &Vector3<f64>) {
        for p in 0..3 {
            x[3 + p] = v[p];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_hnml_matches_trigonometric_form() {
        // H = V_i V_j (G sin(t_ij) - B cos(t_ij)), N = V_i V_j (G cos + B sin)
        let y = Complex64::new(3.0, -9.0);
        let ui = Complex64::from_polar(1.02, 0.1);
        let uj = Complex64::from_polar(0.97, -0.05);
        let block = Symmetric::hnml(&y, &ui, &uj);
        let theta_ij: f64 = 0.1 - (-0.05);
        let vv = 1.02 * 0.97;
        let h = vv * (y.re * theta_ij.sin() - y.im * theta_ij.cos());
        let n = vv * (y.re * theta_ij.cos() + y.im * theta_ij.sin());
        assert!((block[(0, 0)] - h).abs() < 1e-12, "H: {} vs {}", block[(0, 0)], h);
        assert!((block[(0, 1)] - n).abs() < 1e-12, "N: {} vs {}", block[(0, 1)], n);
        assert!((block[(1, 0)] + n).abs() < 1e-12, "M must equal -N");
        assert!((block[(1, 1)] - h).abs() < 1e-12, "L must equal H");
    }

    #[test]
    fn asymmetric_hnml_diagonal_admittance_decouples_phases() {
        let y = Asymmetric::ref_admittance(Complex64::new(2.0, -5.0));
        let ui = Asymmetric::ref_voltage(Complex64::new(1.0, 0.0));
        let uj = Asymmetric::ref_voltage(Complex64::from_polar(0.98, -0.02));
        let block = Asymmetric::hnml(&y, &ui, &uj);
        // balanced voltages and diagonal admittance: each phase sees the
        // scalar problem
        let scalar = Symmetric::hnml(
            &Complex64::new(2.0, -5.0),
            &Complex64::new(1.0, 0.0),
            &Complex64::from_polar(0.98, -0.02),
        );
        for p in 0..3 {
            assert!((block[(p, p)] - scalar[(0, 0)]).abs() < 1e-12);
            assert!((block[(p, 3 + p)] - scalar[(0, 1)]).abs() < 1e-12);
            assert!((block[(3 + p, p)] - scalar[(1, 0)]).abs() < 1e-12);
            assert!((block[(3 + p, 3 + p)] - scalar[(1, 1)]).abs() < 1e-12);
        }
        // off-diagonal cells vanish for a diagonal admittance block
        assert_eq!(block[(0, 1)], 0.0);
        assert_eq!(block[(0, 4)], 0.0);
    }

    #[test]
    fn ref_voltage_is_balanced() {
        let u = Asymmetric::ref_voltage(Complex64::new(1.0, 0.0));
        for p in 0..3 {
            assert!((u[p].norm() - 1.0).abs() < 1e-15);
        }
        let sum = u[0] + u[1] + u[2];
        assert!(sum.norm() < 1e-14, "balanced set must sum to zero");
        // phase order a, b, c with b lagging a by 120 degrees
        assert!((u[1].arg() + 2.0 * FRAC_PI_3).abs() < 1e-12);
        assert!((u[2].arg() - 2.0 * FRAC_PI_3).abs() < 1e-12);
    }

    #[test]
    fn stacked_vector_halves_round_trip() {
        let mut x = SVector::<f64, 6>::zeros();
        Asymmetric::set_top(&mut x, &Vector3::new(0.1, 0.2, 0.3));
        Asymmetric::set_bottom(&mut x, &Vector3::new(1.0, 1.1, 1.2));
        assert_eq!(Asymmetric::top(&x), Vector3::new(0.1, 0.2, 0.3));
        assert_eq!(Asymmetric::bottom(&x), Vector3::new(1.0, 1.1, 1.2));
    }

    #[test]
    fn polar_round_trip() {
        let u = Vector3::new(
            Complex64::from_polar(1.01, 0.3),
            Complex64::from_polar(0.99, -1.8),
            Complex64::from_polar(1.0, 2.4),
        );
        let back = Asymmetric::polar(&Asymmetric::cabs(&u), &Asymmetric::arg(&u));
        assert!(Asymmetric::max_abs_diff(&u, &back) < 1e-14);
    }
}
