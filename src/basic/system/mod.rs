//! Grid-side data consumed by the solver core: the admittance matrix in the
//! factorizer's sparse layout, the per-bus device topology, and the
//! input/output records of a power-flow calculation.

pub mod admittance;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use nalgebra_sparse::CsrMatrix;
use num_complex::Complex64;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

use super::phases::PhaseModel;
use super::solver::PowerFlowError;
use super::sparse::SparsePattern;

pub use admittance::{Admittance, Port2};

/// Represents the ground node in branch ports.
pub const GND: i64 = -1;

/// Represents a branch-level element with admittance and port information.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdmittanceBranch {
    /// The admittance value of the branch.
    pub y: Admittance,
    /// The two terminals; [`GND`] marks a shunt connection.
    pub port: Port2,
}

/// Voltage dependence of a load or generator injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadGenType {
    /// Constant power: `S = S_base`.
    ConstPq,
    /// Constant current: `S = S_base * V`.
    ConstI,
    /// Constant impedance: `S = S_base * V^2`.
    ConstY,
}

impl TryFrom<i64> for LoadGenType {
    type Error = PowerFlowError;

    /// Decodes the raw type tag used by dataset records.
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LoadGenType::ConstPq),
            1 => Ok(LoadGenType::ConstY),
            2 => Ok(LoadGenType::ConstI),
            other => Err(PowerFlowError::MissingCaseForEnum("LoadGenType", other)),
        }
    }
}

/// Per-bus device lists of the grid.
///
/// Loads/generators and sources are given by id; the per-bus vectors list
/// the ids attached to each bus. `source_y_ref` holds the series admittance
/// of each source (scalar; expanded per phase model).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    pub n_bus: usize,
    pub load_gens_per_bus: Vec<Vec<usize>>,
    pub load_gen_type: Vec<LoadGenType>,
    pub sources_per_bus: Vec<Vec<usize>>,
    pub source_y_ref: Vec<Complex64>,
}

/// Input of one power-flow calculation.
#[derive(Debug, Clone)]
pub struct PowerFlowInput<P: PhaseModel> {
    /// Base complex power per load/generator id; negative for consumption.
    pub s_injection: Vec<P::ComplexValue>,
    /// Reference voltage phasor per source id.
    pub source: Vec<Complex64>,
}

/// Output of one power-flow calculation.
#[derive(Debug, Clone)]
pub struct SolverOutput<P: PhaseModel> {
    /// Complex nodal voltage per bus.
    pub u: Vec<P::ComplexValue>,
    /// Outer Newton-Raphson iterations used.
    pub iterations: usize,
    /// Deviation of the final iteration.
    pub max_deviation: f64,
    /// Whether any factorization perturbed a pivot.
    pub used_pivot_perturbation: bool,
}

impl<P: PhaseModel> SolverOutput<P> {
    pub fn new(n_bus: usize) -> Self {
        Self {
            u: vec![P::ComplexValue::zero(); n_bus],
            iterations: 0,
            max_deviation: f64::INFINITY,
            used_pivot_perturbation: false,
        }
    }
}

/// Bus admittance matrix in the factorizer's sparse layout.
///
/// The symbolic pattern is symmetrized and contains every fill-in of the
/// natural-order elimination, so factorizations over it never reallocate.
/// Admittance values are stored without fill-ins; `map_lu_y_bus` maps each
/// LU position to its admittance position, `-1` marking a fill-in.
#[derive(Debug, Clone)]
pub struct YBus<P: PhaseModel> {
    pattern: Arc<SparsePattern>,
    admittance: Vec<P::ComplexTensor>,
    map_lu_y_bus: Vec<i64>,
}

impl<P: PhaseModel> YBus<P> {
    /// Builds the Y-bus from aggregated matrix entries `(row, col, y)`.
    ///
    /// Duplicate positions are summed. The symbolic analysis runs once here;
    /// the resulting pattern is shared by every solver over this topology.
    ///
    /// # Panics
    ///
    /// Panics if an index is out of range.
    pub fn from_triplets(
        n_bus: usize,
        entries: &[(usize, usize, P::ComplexTensor)],
    ) -> Self {
        // aggregate values and collect the structural pattern
        let mut values: BTreeMap<(usize, usize), P::ComplexTensor> = BTreeMap::new();
        let mut rows: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n_bus];
        for &(r, c, y) in entries {
            assert!(r < n_bus && c < n_bus, "entry ({}, {}) out of range", r, c);
            match values.get_mut(&(r, c)) {
                Some(v) => *v += y,
                None => {
                    values.insert((r, c), y);
                }
            }
            rows[r].insert(c);
            // keep the pattern structurally symmetric
            rows[c].insert(r);
        }
        // the factorization pivots on every diagonal position
        for (r, row) in rows.iter_mut().enumerate() {
            row.insert(r);
        }

        // symbolic elimination in natural order; fills from earlier pivots
        // feed later ones
        for pivot in 0..n_bus {
            let connected: Vec<usize> = rows[pivot]
                .range(pivot + 1..)
                .copied()
                .collect();
            for &r in &connected {
                for &c in &connected {
                    rows[r].insert(c);
                }
            }
        }

        // assemble the CSR arrays and the LU-to-Ybus map
        let mut row_indptr = Vec::with_capacity(n_bus + 1);
        let mut col_indices = Vec::new();
        let mut diag_idx = Vec::with_capacity(n_bus);
        let mut admittance = Vec::new();
        let mut map_lu_y_bus = Vec::new();
        row_indptr.push(0);
        for (r, row) in rows.iter().enumerate() {
            for &c in row {
                if c == r {
                    diag_idx.push(col_indices.len());
                }
                col_indices.push(c);
                match values.get(&(r, c)) {
                    Some(&y) => {
                        map_lu_y_bus.push(admittance.len() as i64);
                        admittance.push(y);
                    }
                    None => map_lu_y_bus.push(-1),
                }
            }
            row_indptr.push(col_indices.len());
        }

        Self {
            pattern: Arc::new(SparsePattern::new(row_indptr, col_indices, diag_idx)),
            admittance,
            map_lu_y_bus,
        }
    }

    /// Builds the Y-bus from branch-level elements.
    ///
    /// Each branch stamps the usual two-port pattern: `+y` on both terminal
    /// diagonals, `-y` on the mutual positions. A terminal at [`GND`] drops
    /// its stamps, leaving a shunt on the other terminal. Scalar branch
    /// admittances expand to the phase tensor of the model.
    pub fn from_branches(n_bus: usize, branches: &[AdmittanceBranch]) -> Self {
        let mut entries = Vec::with_capacity(4 * branches.len());
        for branch in branches {
            let y = P::ref_admittance(branch.y.0);
            let (f, t) = (branch.port.from_bus(), branch.port.to_bus());
            if f != GND {
                entries.push((f as usize, f as usize, y));
            }
            if t != GND {
                entries.push((t as usize, t as usize, y));
            }
            if f != GND && t != GND {
                entries.push((f as usize, t as usize, -y));
                entries.push((t as usize, f as usize, -y));
            }
        }
        Self::from_triplets(n_bus, &entries)
    }

    /// Builds the Y-bus from a CSR admittance matrix.
    pub fn from_csr(mat: &CsrMatrix<P::ComplexTensor>) -> Self {
        assert_eq!(mat.nrows(), mat.ncols(), "Y-bus must be square");
        let entries: Vec<_> = mat
            .triplet_iter()
            .map(|(r, c, v)| (r, c, *v))
            .collect();
        Self::from_triplets(mat.nrows(), &entries)
    }

    /// Number of buses.
    #[inline]
    pub fn size(&self) -> usize {
        self.pattern.size()
    }

    /// Stored LU entries, fill-ins included.
    #[inline]
    pub fn nnz_lu(&self) -> usize {
        self.pattern.nnz()
    }

    /// The shared symbolic pattern.
    #[inline]
    pub fn shared_pattern(&self) -> Arc<SparsePattern> {
        self.pattern.clone()
    }

    #[inline]
    pub fn row_indptr_lu(&self) -> &[usize] {
        self.pattern.row_indptr()
    }

    #[inline]
    pub fn col_indices_lu(&self) -> &[usize] {
        self.pattern.col_indices()
    }

    /// Diagonal positions in LU indexing, one per bus.
    #[inline]
    pub fn lu_diag(&self) -> &[usize] {
        self.pattern.diag_idx()
    }

    /// Admittance values in Y-bus indexing.
    #[inline]
    pub fn admittance(&self) -> &[P::ComplexTensor] {
        &self.admittance
    }

    /// LU position to Y-bus position; `-1` marks a fill-in.
    #[inline]
    pub fn map_lu_y_bus(&self) -> &[i64] {
        &self.map_lu_y_bus
    }

    /// Copies the admittance values into an LU-shaped buffer, zeroing the
    /// fill-in positions.
    pub fn copy_admittance_lu(&self, dst: &mut [P::ComplexTensor]) {
        assert_eq!(dst.len(), self.nnz_lu());
        for (idx, &map) in self.map_lu_y_bus.iter().enumerate() {
            dst[idx] = if map >= 0 {
                self.admittance[map as usize]
            } else {
                P::ComplexTensor::zero()
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::phases::Symmetric;
    use nalgebra_sparse::CooMatrix;

    fn star_ybus() -> YBus<Symmetric> {
        // star grid: bus 0 at the center, buses 1..=3 attached to it
        let y = Complex64::new(1.0, -3.0);
        let mut entries = Vec::new();
        for leaf in 1..4usize {
            entries.push((0, 0, y));
            entries.push((leaf, leaf, y));
            entries.push((0, leaf, -y));
            entries.push((leaf, 0, -y));
        }
        YBus::from_triplets(4, &entries)
    }

    #[test]
    fn star_topology_gets_leaf_fill_ins() {
        let ybus = star_ybus();
        // original pattern: 4 diagonals + 6 off-diagonals; eliminating the
        // center couples every leaf pair
        assert_eq!(ybus.nnz_lu(), 16);
        assert_eq!(ybus.admittance().len(), 10);
        let fills = ybus.map_lu_y_bus().iter().filter(|&&m| m < 0).count();
        assert_eq!(fills, 6, "leaf pairs (1,2), (1,3), (2,3) and mirrors");
        // fill-ins carry no admittance
        for (idx, &map) in ybus.map_lu_y_bus().iter().enumerate() {
            let row = ybus
                .row_indptr_lu()
                .partition_point(|&p| p <= idx)
                - 1;
            let col = ybus.col_indices_lu()[idx];
            let is_fill = row != col && row != 0 && col != 0;
            assert_eq!(map < 0, is_fill, "map at ({}, {})", row, col);
        }
    }

    #[test]
    fn duplicate_entries_are_summed() {
        let y = Complex64::new(2.0, -1.0);
        let ybus: YBus<Symmetric> =
            YBus::from_triplets(2, &[(0, 0, y), (0, 0, y), (1, 1, y), (0, 1, -y), (1, 0, -y)]);
        let diag0 = ybus.lu_diag()[0];
        let map = ybus.map_lu_y_bus()[diag0];
        assert!(map >= 0);
        assert_eq!(ybus.admittance()[map as usize], y * 2.0);
    }

    #[test]
    fn pattern_is_symmetrized() {
        // one-directional entry still yields a structurally symmetric pattern
        let y = Complex64::new(1.0, 0.0);
        let ybus: YBus<Symmetric> = YBus::from_triplets(2, &[(0, 0, y), (1, 1, y), (0, 1, y)]);
        assert_eq!(ybus.nnz_lu(), 4);
        let mirror = ybus.map_lu_y_bus()[ybus.lu_diag()[1] - 1];
        assert_eq!(mirror, -1, "(1, 0) exists structurally but holds no value");
    }

    #[test]
    fn from_csr_matches_from_triplets() {
        let y = Complex64::new(1.0, -3.0);
        let mut coo = CooMatrix::new(3, 3);
        coo.push(0, 0, y + y);
        coo.push(1, 1, y);
        coo.push(2, 2, y);
        coo.push(0, 1, -y);
        coo.push(1, 0, -y);
        coo.push(0, 2, -y);
        coo.push(2, 0, -y);
        let csr = CsrMatrix::from(&coo);
        let ybus: YBus<Symmetric> = YBus::from_csr(&csr);
        assert_eq!(ybus.size(), 3);
        // eliminating bus 0 fills (1,2) and (2,1)
        assert_eq!(ybus.nnz_lu(), 9);
    }

    #[test]
    fn copy_admittance_zeroes_fill_ins() {
        let ybus = star_ybus();
        let mut lu = vec![Complex64::zero(); ybus.nnz_lu()];
        ybus.copy_admittance_lu(&mut lu);
        for (idx, &map) in ybus.map_lu_y_bus().iter().enumerate() {
            if map < 0 {
                assert!(lu[idx].is_zero());
            } else {
                assert_eq!(lu[idx], ybus.admittance()[map as usize]);
            }
        }
    }

    #[test]
    fn branch_stamps_match_triplets() {
        let y = Complex64::new(10.0, -30.0);
        let from_branches: YBus<Symmetric> = YBus::from_branches(
            2,
            &[AdmittanceBranch {
                y: Admittance(y),
                port: Port2::new(0, 1),
            }],
        );
        let from_triplets: YBus<Symmetric> =
            YBus::from_triplets(2, &[(0, 0, y), (1, 1, y), (0, 1, -y), (1, 0, -y)]);
        assert_eq!(from_branches.nnz_lu(), from_triplets.nnz_lu());
        assert_eq!(from_branches.admittance(), from_triplets.admittance());
        assert_eq!(from_branches.col_indices_lu(), from_triplets.col_indices_lu());
    }

    #[test]
    fn grounded_branch_stamps_a_shunt() {
        let y = Complex64::new(0.0, 0.5);
        let ybus: YBus<Symmetric> = YBus::from_branches(
            2,
            &[
                AdmittanceBranch {
                    y: Admittance(Complex64::new(10.0, -30.0)),
                    port: Port2::new(0, 1),
                },
                AdmittanceBranch {
                    y: Admittance(y),
                    port: Port2::new(1, GND),
                },
            ],
        );
        let diag1 = ybus.lu_diag()[1];
        let map = ybus.map_lu_y_bus()[diag1];
        assert!(map >= 0);
        assert_eq!(
            ybus.admittance()[map as usize],
            Complex64::new(10.0, -30.0) + y
        );
    }

    #[test]
    fn load_gen_type_decodes_known_tags() {
        assert_eq!(LoadGenType::try_from(0).unwrap(), LoadGenType::ConstPq);
        assert_eq!(LoadGenType::try_from(1).unwrap(), LoadGenType::ConstY);
        assert_eq!(LoadGenType::try_from(2).unwrap(), LoadGenType::ConstI);
        assert!(LoadGenType::try_from(7).is_err());
    }

    #[test]
    fn topology_serde_round_trip() {
        let topology = Topology {
            n_bus: 2,
            load_gens_per_bus: vec![vec![], vec![0]],
            load_gen_type: vec![LoadGenType::ConstPq],
            sources_per_bus: vec![vec![0], vec![]],
            source_y_ref: vec![Complex64::new(1e6, 0.0)],
        };
        let json = serde_json::to_string(&topology).unwrap();
        let back: Topology = serde_json::from_str(&json).unwrap();
        assert_eq!(back.n_bus, 2);
        assert_eq!(back.load_gen_type, topology.load_gen_type);
        assert_eq!(back.source_y_ref, topology.source_y_ref);
    }
}
