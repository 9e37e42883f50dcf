//! Newton-Raphson power flow.
//!
//! The solver iterates on the polar voltage state `x_i = (theta_i, V_i)`.
//! Each outer step assembles the power mismatch `del_pq` and the Jacobian
//! `J = [[H, N], [M, L]]` of the nodal power balance directly in the sparse
//! LU layout of the admittance matrix, solves `J * del_x = del_pq` in place,
//! and applies the increment `(del_theta, del_V / V)` to the state.
//!
//! The Jacobian blocks come from the complex power flow over each branch:
//! `S_ij = (U_i (x) conj(U_j)) .* conj(Y_ij)`, with `H = Im(S)`,
//! `N = Re(S)`, `M = -N`, `L = H`, followed by a diagonal correction with
//! the accumulated nodal injections. Loads enter the mismatch according to
//! their voltage dependence; a source is folded in as a fictitious two-bus
//! system against its reference voltage.

use std::mem;
use std::sync::Arc;

use num_traits::Zero;
use tracing::debug;

use super::phases::PhaseModel;
use super::solver::{IterativePFSolver, PowerFlowError};
use super::sparse::{LuEntry, SparseLUSolver};
use super::system::{LoadGenType, PowerFlowInput, SolverOutput, Topology, YBus};

/// Newton-Raphson power flow solver over one grid topology.
///
/// All working storage is sized at construction from `y_bus.nnz_lu()` and
/// `y_bus.size()` and reused across iterations. `del_x_pq` is dual purpose:
/// it accumulates the negated calculated injection during assembly, holds
/// the mismatch `del_pq` once specified powers are added, and is overwritten
/// by the increment `(del_theta, del_V / V)` after the linear solve.
pub struct NewtonRaphsonPFSolver<P: PhaseModel> {
    n_bus: usize,
    topology: Arc<Topology>,
    data_jac: Vec<P::JacBlock>,
    /// unknown state per bus, stacked `(theta, V)`
    x: Vec<P::PolarVector>,
    del_x_pq: Vec<P::PolarVector>,
    x_scratch: Vec<P::PolarVector>,
    sparse_solver: SparseLUSolver<P::JacBlock>,
    perm: Vec<<P::JacBlock as LuEntry>::Perm>,
}

impl<P: PhaseModel> NewtonRaphsonPFSolver<P> {
    /// Creates a solver shaped for the given Y-bus; no numerical work.
    pub fn new(y_bus: &YBus<P>, topology: Arc<Topology>) -> Self {
        assert_eq!(
            topology.n_bus,
            y_bus.size(),
            "topology and Y-bus disagree on the bus count"
        );
        let n_bus = y_bus.size();
        Self {
            n_bus,
            topology,
            data_jac: vec![P::JacBlock::zero(); y_bus.nnz_lu()],
            x: vec![P::PolarVector::zero(); n_bus],
            del_x_pq: vec![P::PolarVector::zero(); n_bus],
            x_scratch: vec![P::PolarVector::zero(); n_bus],
            sparse_solver: SparseLUSolver::new(y_bus.shared_pattern()),
            perm: vec![<P::JacBlock as LuEntry>::Perm::default(); n_bus],
        }
    }

    /// Load and generator contributions to mismatch and Jacobian diagonal.
    fn add_loads(&mut self, bus: usize, diagonal_position: usize, input: &PowerFlowInput<P>) {
        let topology = self.topology.clone();
        for &load in &topology.load_gens_per_bus[bus] {
            let s = input.s_injection[load];
            let v = P::bottom(&self.x[bus]);
            let (p_sp, q_sp) = match topology.load_gen_type[load] {
                // S_sp = S_base: no voltage sensitivity
                LoadGenType::ConstPq => (P::real(&s), P::imag(&s)),
                // S_sp = S_base * V: dS_sp/dV * V = S_base * V
                LoadGenType::ConstI => {
                    let p = P::elem_mul(&P::real(&s), &v);
                    let q = P::elem_mul(&P::imag(&s), &v);
                    P::add_diag_n(&mut self.data_jac[diagonal_position], &-p);
                    P::add_diag_l(&mut self.data_jac[diagonal_position], &-q);
                    (p, q)
                }
                // S_sp = S_base * V^2: dS_sp/dV * V = 2 * S_base * V^2
                LoadGenType::ConstY => {
                    let v2 = P::elem_mul(&v, &v);
                    let p = P::elem_mul(&P::real(&s), &v2);
                    let q = P::elem_mul(&P::imag(&s), &v2);
                    P::add_diag_n(&mut self.data_jac[diagonal_position], &P::scale(&p, -2.0));
                    P::add_diag_l(&mut self.data_jac[diagonal_position], &P::scale(&q, -2.0));
                    (p, q)
                }
            };
            let mut p = P::top(&self.del_x_pq[bus]);
            let mut q = P::bottom(&self.del_x_pq[bus]);
            p += p_sp;
            q += q_sp;
            P::set_top(&mut self.del_x_pq[bus], &p);
            P::set_bottom(&mut self.del_x_pq[bus], &q);
        }
    }

    /// Source contributions: a fictitious two-bus system between the bus and
    /// the reference voltage behind the source admittance.
    fn add_sources(
        &mut self,
        bus: usize,
        diagonal_position: usize,
        input: &PowerFlowInput<P>,
        u: &[P::ComplexValue],
    ) {
        let topology = self.topology.clone();
        for &source in &topology.sources_per_bus[bus] {
            let y_ref = P::ref_admittance(topology.source_y_ref[source]);
            let u_ref = P::ref_voltage(input.source[source]);
            let mut block_mm = P::hnml(&y_ref, &u[bus], &u[bus]);
            let block_ms = P::hnml(&(-y_ref), &u[bus], &u_ref);
            // P_cal = (N_mm + N_ms) * I, Q_cal = (H_mm + H_ms) * I
            let mut p_cal = P::sum_row_n(&block_mm);
            p_cal += P::sum_row_n(&block_ms);
            let mut q_cal = P::sum_row_h(&block_mm);
            q_cal += P::sum_row_h(&block_ms);
            // diagonal correction of the mm block
            P::add_diag_h(&mut block_mm, &-q_cal);
            P::add_diag_n(&mut block_mm, &p_cal);
            P::add_diag_m(&mut block_mm, &p_cal);
            P::add_diag_l(&mut block_mm, &q_cal);
            // the source power leaves the mismatch
            let mut p = P::top(&self.del_x_pq[bus]);
            let mut q = P::bottom(&self.del_x_pq[bus]);
            p -= p_cal;
            q -= q_cal;
            P::set_top(&mut self.del_x_pq[bus], &p);
            P::set_bottom(&mut self.del_x_pq[bus], &q);
            self.data_jac[diagonal_position] += block_mm;
        }
    }
}

impl<P: PhaseModel> IterativePFSolver<P> for NewtonRaphsonPFSolver<P> {
    /// Seeds the voltage state with one linear solve: loads approximated as
    /// constant current at the reference voltage, sources folded into the
    /// admittance diagonal and the right-hand side.
    fn initialize(
        &mut self,
        y_bus: &YBus<P>,
        input: &PowerFlowInput<P>,
        output: &mut SolverOutput<P>,
    ) -> Result<(), PowerFlowError> {
        let mut linear_solver = SparseLUSolver::<P::ComplexTensor>::new(y_bus.shared_pattern());
        let mut linear_mat = vec![P::ComplexTensor::zero(); y_bus.nnz_lu()];
        let mut linear_perm =
            vec![<P::ComplexTensor as LuEntry>::Perm::default(); y_bus.size()];
        y_bus.copy_admittance_lu(&mut linear_mat);

        let topology = self.topology.clone();
        let lu_diag = y_bus.lu_diag();
        for u in output.u.iter_mut() {
            *u = P::ComplexValue::zero();
        }
        // constant-current approximation of every load at nominal voltage
        for (bus, loads) in topology.load_gens_per_bus.iter().enumerate() {
            for &load in loads {
                output.u[bus] += P::conj(&input.s_injection[load]);
            }
        }
        // sources: Y_ref on the diagonal, Y_ref * U_ref as injected current
        for (bus, sources) in topology.sources_per_bus.iter().enumerate() {
            for &source in sources {
                let y_ref = P::ref_admittance(topology.source_y_ref[source]);
                linear_mat[lu_diag[bus]] += y_ref;
                output.u[bus] += y_ref.mul_vector(&P::ref_voltage(input.source[source]));
            }
        }
        let rhs = output.u.clone();
        linear_solver.prefactorize_and_solve(
            &mut linear_mat,
            &mut linear_perm,
            &rhs,
            &mut output.u,
            false,
        )?;

        for i in 0..self.n_bus {
            let theta = P::arg(&output.u[i]);
            let v = P::cabs(&output.u[i]);
            P::set_top(&mut self.x[i], &theta);
            P::set_bottom(&mut self.x[i], &v);
        }
        debug!(n_bus = self.n_bus, "seeded voltage state from linear solve");
        Ok(())
    }

    /// Assembles the Jacobian and the mismatch for the current voltages.
    fn prepare_matrix_and_rhs(
        &mut self,
        y_bus: &YBus<P>,
        input: &PowerFlowInput<P>,
        u: &[P::ComplexValue],
    ) {
        let indptr = y_bus.row_indptr_lu();
        let indices = y_bus.col_indices_lu();
        let map_lu_y_bus = y_bus.map_lu_y_bus();
        let bus_entry = y_bus.lu_diag();
        let ydata = y_bus.admittance();

        for row in 0..self.n_bus {
            // negative calculated injection accumulates here
            let mut p_neg = P::RealValue::zero();
            let mut q_neg = P::RealValue::zero();
            for k in indptr[row]..indptr[row + 1] {
                let k_y_bus = map_lu_y_bus[k];
                if k_y_bus < 0 {
                    // fill-in, present only in the LU pattern
                    self.data_jac[k] = P::JacBlock::zero();
                    continue;
                }
                let j = indices[k];
                let block = P::hnml(&ydata[k_y_bus as usize], &u[row], &u[j]);
                p_neg -= P::sum_row_n(&block);
                q_neg -= P::sum_row_h(&block);
                self.data_jac[k] = block;
            }
            P::set_top(&mut self.del_x_pq[row], &p_neg);
            P::set_bottom(&mut self.del_x_pq[row], &q_neg);

            // diagonal correction with the negated injection
            let k = bus_entry[row];
            let p_cal = -p_neg;
            let q_cal = -q_neg;
            P::add_diag_h(&mut self.data_jac[k], &q_neg);
            P::add_diag_n(&mut self.data_jac[k], &p_cal);
            P::add_diag_m(&mut self.data_jac[k], &p_cal);
            P::add_diag_l(&mut self.data_jac[k], &q_cal);
        }

        for bus in 0..self.n_bus {
            let diagonal_position = bus_entry[bus];
            self.add_loads(bus, diagonal_position, input);
            self.add_sources(bus, diagonal_position, input, u);
        }
    }

    /// Solves `J * del_x = del_pq` in place over `del_x_pq`.
    fn solve_matrix(&mut self, use_pivot_perturbation: bool) -> Result<(), PowerFlowError> {
        self.sparse_solver
            .prefactorize(&mut self.data_jac, &mut self.perm, use_pivot_perturbation)?;
        self.sparse_solver.solve_with_prefactorized(
            &self.data_jac,
            &self.perm,
            &self.del_x_pq,
            &mut self.x_scratch,
        )?;
        mem::swap(&mut self.del_x_pq, &mut self.x_scratch);
        Ok(())
    }

    /// Applies the increment to the polar state and rebuilds `U`; returns
    /// the largest phase deviation `max |U_new - U_old|`.
    fn iterate_unknown(&mut self, u: &mut [P::ComplexValue]) -> f64 {
        let mut max_dev = 0.0f64;
        for i in 0..self.n_bus {
            let mut theta = P::top(&self.x[i]);
            let mut v = P::bottom(&self.x[i]);
            theta += P::top(&self.del_x_pq[i]);
            // the increment carries del_V / V
            v += P::elem_mul(&v, &P::bottom(&self.del_x_pq[i]));
            P::set_top(&mut self.x[i], &theta);
            P::set_bottom(&mut self.x[i], &v);
            let u_new = P::polar(&v, &theta);
            max_dev = max_dev.max(P::max_abs_diff(&u_new, &u[i]));
            u[i] = u_new;
        }
        max_dev
    }

    fn used_pivot_perturbation(&self) -> bool {
        self.sparse_solver.has_pivot_perturbation()
    }
}
