//! Outer fixed-point driver for iterative power-flow solvers.
//!
//! The driver owns the convergence loop only: a solver implementing
//! [`IterativePFSolver`] is seeded once, then `prepare -> solve -> iterate`
//! repeats until the voltage deviation falls below the configured tolerance
//! or the iteration cap trips.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span};

use super::phases::PhaseModel;
use super::sparse::SparseMatrixError;
use super::system::{PowerFlowInput, SolverOutput, YBus};

/// Error raised by a power-flow calculation.
#[derive(Debug, Clone, PartialEq)]
pub enum PowerFlowError {
    /// The linear solver failed; fatal for this calculation.
    SparseMatrix(SparseMatrixError),
    /// An enum tag carried by the dataset has no known case.
    MissingCaseForEnum(&'static str, i64),
    /// The outer Newton-Raphson loop exceeded the iteration cap.
    IterationDiverge { max_iter: usize, max_dev: f64 },
}

impl fmt::Display for PowerFlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerFlowError::SparseMatrix(err) => write!(f, "Sparse solver failed: {}", err),
            PowerFlowError::MissingCaseForEnum(name, value) => {
                write!(f, "Missing case {} for enum {}", value, name)
            }
            PowerFlowError::IterationDiverge { max_iter, max_dev } => write!(
                f,
                "Power flow did not converge within {} iterations (deviation {:e})",
                max_iter, max_dev
            ),
        }
    }
}

impl std::error::Error for PowerFlowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PowerFlowError::SparseMatrix(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SparseMatrixError> for PowerFlowError {
    fn from(err: SparseMatrixError) -> Self {
        PowerFlowError::SparseMatrix(err)
    }
}

/// Configuration of the outer iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerFlowConfig {
    /// Convergence tolerance on the voltage deviation.
    pub tolerance: f64,
    /// Maximum outer iterations before giving up.
    pub max_iter: usize,
    /// Clamp near-singular pivots and repair with iterative refinement.
    pub use_pivot_perturbation: bool,
}

impl Default for PowerFlowConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iter: 20,
            use_pivot_perturbation: false,
        }
    }
}

impl PowerFlowConfig {
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_pivot_perturbation(mut self, enable: bool) -> Self {
        self.use_pivot_perturbation = enable;
        self
    }
}

/// An iterative power-flow solver the outer driver can run.
///
/// One call sequence per calculation: `initialize` seeds the voltage vector,
/// then `prepare_matrix_and_rhs`, `solve_matrix`, `iterate_unknown` repeat
/// until the returned deviation is within tolerance.
pub trait IterativePFSolver<P: PhaseModel> {
    /// Seeds `output.u` with a starting voltage estimate.
    fn initialize(
        &mut self,
        y_bus: &YBus<P>,
        input: &PowerFlowInput<P>,
        output: &mut SolverOutput<P>,
    ) -> Result<(), PowerFlowError>;

    /// Assembles matrix and right-hand side for the current voltages.
    fn prepare_matrix_and_rhs(
        &mut self,
        y_bus: &YBus<P>,
        input: &PowerFlowInput<P>,
        u: &[P::ComplexValue],
    );

    /// Solves the assembled linear system.
    fn solve_matrix(&mut self, use_pivot_perturbation: bool) -> Result<(), PowerFlowError>;

    /// Applies the solved increment to `u`; returns `max |U_new - U_old|`.
    fn iterate_unknown(&mut self, u: &mut [P::ComplexValue]) -> f64;

    /// Whether the last solve perturbed a pivot, for diagnostics.
    fn used_pivot_perturbation(&self) -> bool {
        false
    }
}

/// Runs the outer fixed-point loop to convergence.
///
/// # Errors
///
/// [`PowerFlowError::IterationDiverge`] past `config.max_iter`, or any error
/// surfaced by the solver's linear algebra.
pub fn run_power_flow<P: PhaseModel, S: IterativePFSolver<P>>(
    solver: &mut S,
    y_bus: &YBus<P>,
    input: &PowerFlowInput<P>,
    config: &PowerFlowConfig,
) -> Result<SolverOutput<P>, PowerFlowError> {
    let mut output = SolverOutput::new(y_bus.size());
    solver.initialize(y_bus, input, &mut output)?;

    let mut max_dev = f64::INFINITY;
    for iteration in 0..config.max_iter {
        let _span = debug_span!("newton_iter", iteration).entered();
        solver.prepare_matrix_and_rhs(y_bus, input, &output.u);
        solver.solve_matrix(config.use_pivot_perturbation)?;
        max_dev = solver.iterate_unknown(&mut output.u);
        output.used_pivot_perturbation |= solver.used_pivot_perturbation();
        debug!(max_dev, "applied voltage increment");
        if max_dev <= config.tolerance {
            output.iterations = iteration + 1;
            output.max_deviation = max_dev;
            return Ok(output);
        }
    }
    Err(PowerFlowError::IterationDiverge {
        max_iter: config.max_iter,
        max_dev,
    })
}
