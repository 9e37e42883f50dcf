pub mod basic;

pub mod prelude {
    pub use crate::basic::newtonpf::NewtonRaphsonPFSolver;
    pub use crate::basic::phases::{Asymmetric, PhaseModel, Symmetric};
    pub use crate::basic::solver::{
        run_power_flow, IterativePFSolver, PowerFlowConfig, PowerFlowError,
    };
    pub use crate::basic::sparse::{SparseLUSolver, SparseMatrixError, SparsePattern};
    pub use crate::basic::system::{
        LoadGenType, PowerFlowInput, SolverOutput, Topology, YBus,
    };
}
