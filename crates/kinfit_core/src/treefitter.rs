//! Kinematic fit of a decay tree hypothesis.
//!
//! On top of the global four-momentum balance every intermediate node of the
//! tree adds `M(Σ leaves below) - m(node) = 0`. The photons are tried in all
//! distinct assignments to the photon leaves; which photon sits in which
//! leaf is the only thing that changes between fits, the slots and
//! constraints stay the same.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FitError, Result};
use crate::fit_particle::FitParticle;
use crate::fitter::{BaryonMode, Fitter, MassTerm, GLOBAL_CONSTRAINTS};
use crate::lorentz::LorentzVec;
use crate::particle::{Particle, ParticleType};
use crate::settings::FitterSettings;
use crate::solver::{FitResult, Solver};
use crate::tree::{Leaf, NodeId, ParticleTypeNode, ParticleTypeTree};
use crate::uncertainty::UncertaintyModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeFitState {
    Idle,
    /// Event set, permutations queued, nothing fitted yet.
    Prepared,
    Iterating,
    Exhausted,
}

/// Per-node options, chosen once when the fitter is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSetup {
    /// Skip the invariant mass constraint of this node.
    pub excluded: bool,
}

/// Read-only state of one photon assignment before it is fitted.
pub struct TreeView<'a> {
    tree: &'a ParticleTypeTree,
    baryon: LorentzVec<f64>,
    photons: &'a [LorentzVec<f64>],
    permutation: &'a [usize],
}

impl<'a> TreeView<'a> {
    pub fn tree(&self) -> &'a ParticleTypeTree {
        self.tree
    }

    /// Photon index per photon leaf.
    pub fn permutation(&self) -> &'a [usize] {
        self.permutation
    }

    pub fn leaf_p4(&self, leaf: Leaf) -> LorentzVec<f64> {
        match leaf {
            Leaf::Baryon => self.baryon,
            Leaf::Photon(k) => self.photons[self.permutation[k]],
        }
    }

    /// Sum of the measured four-momenta of the leaves below `node`.
    pub fn p4(&self, node: NodeId) -> LorentzVec<f64> {
        self.tree
            .leaves_below(node)
            .into_iter()
            .map(|leaf| self.leaf_p4(leaf))
            .sum()
    }

    pub fn mass(&self, node: NodeId) -> f64 {
        self.p4(node).m()
    }
}

type AcceptFn = Box<dyn Fn(&TreeView<'_>) -> bool + Send>;
type RankFn = Box<dyn Fn(&TreeView<'_>) -> f64 + Send>;

/// Pruning of the photon assignments of one event.
///
/// Both parts are evaluated on the measured kinematics when the event is
/// prepared. Assignments failing `accept` are dropped first; the remaining
/// ones are ranked (higher is better, `NaN` drops the assignment) and only the
/// best `max_fits` are fitted, best first; `max_fits == 0` fits all ranked
/// assignments. Equal ranks keep the enumeration order.
#[derive(Default)]
pub struct IterationFilter {
    accept: Option<AcceptFn>,
    rank: Option<(RankFn, usize)>,
}

impl IterationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(mut self, accept: impl Fn(&TreeView<'_>) -> bool + Send + 'static) -> Self {
        self.accept = Some(Box::new(accept));
        self
    }

    pub fn keep_best(
        mut self,
        max_fits: usize,
        rank: impl Fn(&TreeView<'_>) -> f64 + Send + 'static,
    ) -> Self {
        self.rank = Some((Box::new(rank), max_fits));
        self
    }

    fn select<'v>(&self, views: impl Iterator<Item = (usize, TreeView<'v>)>) -> Vec<usize> {
        let accepted = views.filter(|(_, view)| self.accept.as_ref().map_or(true, |f| f(view)));
        match &self.rank {
            None => accepted.map(|(i, _)| i).collect(),
            Some((rank, max_fits)) => {
                let mut ranked: Vec<(usize, f64)> = accepted
                    .map(|(i, view)| (i, rank(&view)))
                    .filter(|(_, r)| !r.is_nan())
                    .collect();
                ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
                if *max_fits > 0 {
                    ranked.truncate(*max_fits);
                }
                ranked.into_iter().map(|(i, _)| i).collect()
            }
        }
    }
}

impl fmt::Debug for IterationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterationFilter")
            .field("accept", &self.accept.is_some())
            .field("max_fits", &self.rank.as_ref().map(|(_, k)| *k))
            .finish()
    }
}

/// Fitter for a [`ParticleTypeTree`] hypothesis.
///
/// Per event call [`TreeFitter::prepare_fits`], then [`TreeFitter::next_fit`]
/// until it returns `None`. The fitted accessors of [`Fitter`] refer to the
/// last fitted assignment, photons in leaf order.
pub struct TreeFitter {
    fitter: Fitter,
    tree: Arc<ParticleTypeTree>,
    mass_nodes: Vec<NodeId>,
    mass_terms: Vec<MassTerm>,
    permutations: Vec<Vec<usize>>,
    measured: Vec<FitParticle>,
    baryon_p4: LorentzVec<f64>,
    photon_p4s: Vec<LorentzVec<f64>>,
    filter: Option<IterationFilter>,
    queue: Vec<usize>,
    cursor: usize,
    current: Option<usize>,
    state: TreeFitState,
}

impl TreeFitter {
    pub fn new(
        name: &str,
        tree: Arc<ParticleTypeTree>,
        model: Arc<dyn UncertaintyModel>,
        settings: FitterSettings,
    ) -> Result<Self> {
        Self::build(name, tree, model, settings, false)
    }

    /// Like [`TreeFitter::new`], with the z vertex as additional variable.
    pub fn with_z_vertex(
        name: &str,
        tree: Arc<ParticleTypeTree>,
        model: Arc<dyn UncertaintyModel>,
        settings: FitterSettings,
    ) -> Result<Self> {
        Self::build(name, tree, model, settings, true)
    }

    fn build(
        name: &str,
        tree: Arc<ParticleTypeTree>,
        model: Arc<dyn UncertaintyModel>,
        settings: FitterSettings,
        z_vertex: bool,
    ) -> Result<Self> {
        let n_photons = tree.photon_count();
        let fitter = Fitter::new(name, n_photons, model, settings, z_vertex, BaryonMode::Measured)?;
        let permutations = tree.photon_permutations();
        let mut tree_fitter = Self {
            fitter,
            tree,
            mass_nodes: Vec::new(),
            mass_terms: Vec::new(),
            permutations,
            measured: (0..n_photons).map(|_| FitParticle::new()).collect(),
            baryon_p4: LorentzVec::zero(),
            photon_p4s: Vec::with_capacity(n_photons),
            filter: None,
            queue: Vec::new(),
            cursor: 0,
            current: None,
            state: TreeFitState::Idle,
        };
        tree_fitter.setup_nodes(|_, _| NodeSetup::default());
        Ok(tree_fitter)
    }

    /// Chooses per node whether its mass is constrained. The root is never
    /// constrained.
    pub fn with_node_setup(
        mut self,
        setup: impl Fn(NodeId, &ParticleTypeNode) -> NodeSetup,
    ) -> Self {
        self.setup_nodes(setup);
        self
    }

    pub fn with_solver(mut self, solver: Box<dyn Solver>) -> Self {
        self.fitter.set_solver(solver);
        self
    }

    fn setup_nodes(&mut self, setup: impl Fn(NodeId, &ParticleTypeNode) -> NodeSetup) {
        let root = self.tree.root();
        let (nodes, terms): (Vec<_>, Vec<_>) = self
            .tree
            .nodes()
            .filter(|&(id, node)| id != root && !node.is_leaf() && !setup(id, node).excluded)
            .map(|(id, node)| {
                let members = self
                    .tree
                    .leaves_below(id)
                    .into_iter()
                    .map(Leaf::slot)
                    .collect();
                (
                    id,
                    MassTerm {
                        members,
                        mass: node.ptype.mass(),
                    },
                )
            })
            .unzip();
        self.mass_nodes = nodes;
        self.mass_terms = terms;
        self.state = TreeFitState::Idle;

        info!(
            fitter = self.fitter.name(),
            tree = %self.tree,
            permutations = self.permutations.len(),
            constraints = GLOBAL_CONSTRAINTS + self.mass_terms.len(),
            "tree fitter set up"
        );
    }

    pub fn set_iteration_filter(&mut self, filter: IterationFilter) {
        self.filter = Some(filter);
        self.state = TreeFitState::Idle;
    }

    pub fn clear_iteration_filter(&mut self) {
        self.filter = None;
        self.state = TreeFitState::Idle;
    }

    /// Sets the z vertex sigma; see [`Fitter::set_z_vertex_sigma`].
    pub fn set_z_vertex_sigma(&mut self, sigma: f64) -> Result<()> {
        self.fitter.set_z_vertex_sigma(sigma)
    }

    pub fn tree(&self) -> &Arc<ParticleTypeTree> {
        &self.tree
    }

    pub fn state(&self) -> TreeFitState {
        self.state
    }

    /// Number of distinct photon assignments of the tree.
    pub fn permutation_count(&self) -> usize {
        self.permutations.len()
    }

    /// Assignments queued for the prepared event after filtering.
    pub fn queued_fits(&self) -> usize {
        self.queue.len()
    }

    /// Nodes carrying a mass constraint, in constraint order.
    pub fn constrained_nodes(&self) -> &[NodeId] {
        &self.mass_nodes
    }

    /// Sets the event and queues its photon assignments.
    pub fn prepare_fits(
        &mut self,
        beam_energy: f64,
        baryon: &Particle,
        photons: &[Particle],
    ) -> Result<()> {
        self.state = TreeFitState::Idle;
        self.queue.clear();
        self.cursor = 0;
        self.current = None;

        self.fitter.check_z_vertex()?;
        if photons.len() != self.measured.len() {
            return Err(FitError::PhotonCountMismatch {
                expected: self.measured.len(),
                got: photons.len(),
            });
        }
        self.fitter.set_beam_energy(beam_energy)?;
        self.fitter.set_baryon(baryon)?;
        for (slot, photon) in self.measured.iter_mut().zip(photons) {
            slot.set(photon, self.fitter.model())?;
        }

        let geometry = self.fitter.settings().geometry;
        self.photon_p4s.clear();
        for slot in &self.measured {
            self.photon_p4s.push(slot.lorentz_vec(&geometry, None)?);
        }
        self.baryon_p4 = self.fitter.baryon().lorentz_vec(&geometry, None)?;

        let views = self
            .permutations
            .iter()
            .enumerate()
            .map(|(i, permutation)| {
                (
                    i,
                    TreeView {
                        tree: &self.tree,
                        baryon: self.baryon_p4,
                        photons: &self.photon_p4s,
                        permutation,
                    },
                )
            });
        self.queue = match &self.filter {
            Some(filter) => filter.select(views),
            None => views.map(|(i, _)| i).collect(),
        };
        self.state = TreeFitState::Prepared;

        debug!(
            fitter = self.fitter.name(),
            queued = self.queue.len(),
            permutations = self.permutations.len(),
            "tree fits prepared"
        );
        Ok(())
    }

    /// Fits the next queued assignment. `Ok(None)` once all are done; a
    /// failed fit is reported in the result and does not stop the iteration.
    pub fn next_fit(&mut self) -> Result<Option<FitResult>> {
        if self.state == TreeFitState::Idle {
            return Err(FitError::NotConfigured("prepared event"));
        }
        let Some(&index) = self.queue.get(self.cursor) else {
            self.state = TreeFitState::Exhausted;
            return Ok(None);
        };

        let permutation = &self.permutations[index];
        self.fitter
            .assign_photons(permutation.iter().map(|&i| &self.measured[i]));
        let result = self.fitter.run(&self.mass_terms)?;
        self.cursor += 1;
        self.current = Some(index);
        self.state = TreeFitState::Iterating;
        Ok(Some(result))
    }

    /// Photon index per photon leaf of the assignment fitted last.
    pub fn current_permutation(&self) -> Option<&[usize]> {
        self.current.map(|i| self.permutations[i].as_slice())
    }

    /// Pre-fit view of the assignment fitted last.
    pub fn current_view(&self) -> Option<TreeView<'_>> {
        let permutation = self.current_permutation()?;
        Some(TreeView {
            tree: &self.tree,
            baryon: self.baryon_p4,
            photons: &self.photon_p4s,
            permutation,
        })
    }

    /// First node of the given type.
    pub fn tree_node(&self, ptype: ParticleType) -> Result<NodeId> {
        self.tree
            .find(ptype)
            .first()
            .copied()
            .ok_or_else(|| FitError::InvalidTree(format!("no {ptype} node in {}", self.tree)))
    }

    pub fn tree_nodes(&self, ptype: ParticleType) -> Vec<NodeId> {
        self.tree.find(ptype)
    }

    /// Fitted four-momentum of a node, valid after a successful fit.
    pub fn fitted_node(&self, node: NodeId) -> Result<LorentzVec<f64>> {
        self.fitter.require_success()?;
        self.tree
            .leaves_below(node)
            .into_iter()
            .map(|leaf| self.fitter.fitted_p4(leaf.slot()))
            .sum()
    }

    /// Pulls of all leaves below a node, four per leaf.
    pub fn node_pulls(&self, node: NodeId) -> Vec<f64> {
        self.tree
            .leaves_below(node)
            .into_iter()
            .flat_map(|leaf| match leaf {
                Leaf::Baryon => self.fitter.baryon().pulls(),
                Leaf::Photon(k) => self.fitter.photons()[k].pulls(),
            })
            .collect()
    }
}

impl Deref for TreeFitter {
    type Target = Fitter;

    fn deref(&self) -> &Fitter {
        &self.fitter
    }
}

impl fmt::Debug for TreeFitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeFitter")
            .field("fitter", &self.fitter)
            .field("tree", &self.tree.decay_string())
            .field("state", &self.state)
            .field("filter", &self.filter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SolverSettings;
    use crate::test_util::two_pi0_event;
    use crate::tree::Channel;
    use crate::uncertainty::ConstantRelativeE;

    const DEG: f64 = std::f64::consts::PI / 180.0;
    const BEAM: f64 = 700.0;

    fn tree_fitter(settings: FitterSettings) -> TreeFitter {
        let tree = Arc::new(Channel::TwoPi0To4g.tree().expect("valid channel"));
        let model = Arc::new(ConstantRelativeE::uniform(0.01, DEG, 0.01));
        TreeFitter::new("2pi0", tree, model, settings).expect("default settings are valid")
    }

    fn prepared(mut fitter: TreeFitter) -> TreeFitter {
        let (proton, photons) = two_pi0_event(BEAM);
        fitter
            .prepare_fits(BEAM, &proton, &photons)
            .expect("event matches the tree");
        fitter
    }

    fn drain(fitter: &mut TreeFitter) -> Vec<(Vec<usize>, FitResult)> {
        let mut fits = Vec::new();
        while let Some(result) = fitter.next_fit().expect("prepared") {
            let permutation = fitter.current_permutation().expect("just fitted").to_vec();
            fits.push((permutation, result));
        }
        fits
    }

    fn pi0_mass_distance(view: &TreeView<'_>) -> f64 {
        view.tree()
            .find(ParticleType::Pi0)
            .into_iter()
            .map(|node| (view.mass(node) - ParticleType::Pi0.mass()).abs())
            .sum()
    }

    #[test]
    fn two_identical_subtrees_give_three_fits() {
        let mut fitter = prepared(tree_fitter(FitterSettings::default()));
        assert_eq!(fitter.permutation_count(), 3);
        assert_eq!(fitter.state(), TreeFitState::Prepared);
        let fits = drain(&mut fitter);
        assert_eq!(fits.len(), 3);
        assert_eq!(fitter.state(), TreeFitState::Exhausted);
        assert_eq!(fitter.next_fit(), Ok(None));

        let permutations: Vec<_> = fits.iter().map(|(p, _)| p.clone()).collect();
        assert_eq!(
            permutations,
            vec![vec![0, 1, 2, 3], vec![0, 2, 1, 3], vec![0, 3, 1, 2]]
        );
    }

    #[test]
    fn true_assignment_fits_best() {
        let mut fitter = prepared(tree_fitter(FitterSettings::default()));
        let fits = drain(&mut fitter);
        let (best, result) = fits
            .iter()
            .filter(|(_, r)| r.is_success())
            .max_by(|a, b| a.1.probability.total_cmp(&b.1.probability))
            .expect("at least the true assignment converges");
        assert_eq!(best, &vec![0, 1, 2, 3]);
        assert_eq!(result.ndof, 6);
        assert!(result.chi_square < 1e-6);
        assert!(result.probability > 0.99);
    }

    #[test]
    fn fitted_nodes_satisfy_their_masses() {
        let mut fitter = prepared(tree_fitter(FitterSettings::default()));
        let result = fitter.next_fit().expect("prepared").expect("three queued");
        assert!(result.is_success());

        let pi0s = fitter.tree_nodes(ParticleType::Pi0);
        assert_eq!(pi0s.len(), 2);
        assert_eq!(fitter.constrained_nodes(), pi0s.as_slice());
        for node in pi0s {
            let p4 = fitter.fitted_node(node).expect("fit succeeded");
            assert!((p4.m() - ParticleType::Pi0.mass()).abs() < 1e-3);
            assert_eq!(fitter.node_pulls(node).len(), 8);
        }
        let view = fitter.current_view().expect("fitted once");
        assert!(pi0_mass_distance(&view) < 1e-6);
        assert!(matches!(
            fitter.tree_node(ParticleType::Eta),
            Err(FitError::InvalidTree(_))
        ));
    }

    #[test]
    fn excluded_nodes_lose_their_constraint() {
        let fitter = tree_fitter(FitterSettings::default()).with_node_setup(|_, node| NodeSetup {
            excluded: node.ptype == ParticleType::Pi0,
        });
        assert!(fitter.constrained_nodes().is_empty());
        let mut fitter = prepared(fitter);
        let result = fitter.next_fit().expect("prepared").expect("three queued");
        assert_eq!(result.ndof, 4);
    }

    #[test]
    fn failed_permutations_do_not_stop_the_iteration() {
        let settings = FitterSettings {
            solver: SolverSettings {
                max_iterations: 1,
                ..SolverSettings::default()
            },
            ..FitterSettings::default()
        };
        let mut fitter = prepared(tree_fitter(settings));
        let fits = drain(&mut fitter);
        assert_eq!(fits.len(), 3);
        assert!(fits.iter().any(|(_, r)| !r.is_success()));
    }

    #[test]
    fn accept_filter_skips_assignments() {
        let mut fitter = tree_fitter(FitterSettings::default());
        fitter.set_iteration_filter(
            IterationFilter::new().accept(|view| pi0_mass_distance(view) < 40.0),
        );
        let mut fitter = prepared(fitter);
        let fits = drain(&mut fitter);
        assert!(fits.iter().any(|(p, _)| p == &vec![0, 1, 2, 3]));
        assert_eq!(fits.len(), fitter.queued_fits());

        fitter.set_iteration_filter(IterationFilter::new().accept(|_| false));
        let mut fitter = prepared(fitter);
        assert_eq!(fitter.queued_fits(), 0);
        assert_eq!(fitter.next_fit(), Ok(None));
        assert_eq!(fitter.state(), TreeFitState::Exhausted);
    }

    #[test]
    fn ranking_keeps_best_in_descending_order() {
        let rank = |view: &TreeView<'_>| -pi0_mass_distance(view);
        let mut fitter = tree_fitter(FitterSettings::default());
        fitter.set_iteration_filter(IterationFilter::new().keep_best(2, rank));
        let mut fitter = prepared(fitter);
        assert_eq!(fitter.queued_fits(), 2);

        let mut ranks = Vec::new();
        while fitter.next_fit().expect("prepared").is_some() {
            ranks.push(rank(&fitter.current_view().expect("just fitted")));
        }
        assert_eq!(ranks.len(), 2);
        assert!(ranks[0] > ranks[1]);
        assert!(ranks[0] > -1e-6, "true assignment ranks first");
    }

    #[test]
    fn zero_max_fits_ranks_without_a_cap() {
        let rank = |view: &TreeView<'_>| -pi0_mass_distance(view);
        let mut fitter = tree_fitter(FitterSettings::default());
        fitter.set_iteration_filter(IterationFilter::new().keep_best(0, rank));
        let mut fitter = prepared(fitter);
        assert_eq!(fitter.queued_fits(), 3);

        let mut ranks = Vec::new();
        while fitter.next_fit().expect("prepared").is_some() {
            ranks.push(rank(&fitter.current_view().expect("just fitted")));
        }
        assert_eq!(ranks.len(), 3);
        assert!(ranks.windows(2).all(|w| w[0] >= w[1]), "{ranks:?}");
    }

    #[test]
    fn acceptance_applies_before_ranking() {
        let mut fitter = tree_fitter(FitterSettings::default());
        fitter.set_iteration_filter(
            IterationFilter::new()
                .accept(|view| view.permutation() != [0, 1, 2, 3])
                .keep_best(1, |view| -pi0_mass_distance(view)),
        );
        let mut fitter = prepared(fitter);
        let fits = drain(&mut fitter);
        assert_eq!(fits.len(), 1);
        assert_ne!(fits[0].0, vec![0, 1, 2, 3]);
    }

    #[test]
    fn configuration_errors() {
        let mut fitter = tree_fitter(FitterSettings::default());
        assert_eq!(
            fitter.next_fit(),
            Err(FitError::NotConfigured("prepared event"))
        );
        let (proton, photons) = two_pi0_event(BEAM);
        assert_eq!(
            fitter.prepare_fits(BEAM, &proton, &photons[..3]),
            Err(FitError::PhotonCountMismatch {
                expected: 4,
                got: 3
            })
        );
        assert_eq!(fitter.state(), TreeFitState::Idle);
    }

    #[test]
    fn unset_vertex_sigma_is_reported_when_preparing() {
        let tree = Arc::new(Channel::TwoPi0To4g.tree().expect("valid channel"));
        let model = Arc::new(ConstantRelativeE::uniform(0.01, DEG, 0.01));
        let mut fitter = TreeFitter::with_z_vertex("2pi0", tree, model, FitterSettings::default())
            .expect("default settings are valid");
        let (proton, photons) = two_pi0_event(BEAM);
        assert_eq!(
            fitter.prepare_fits(BEAM, &proton, &photons),
            Err(FitError::ZVertexSigmaUnset)
        );
        assert_eq!(fitter.state(), TreeFitState::Idle);

        fitter.set_z_vertex_sigma(0.0).expect("valid sigma");
        fitter
            .prepare_fits(BEAM, &proton, &photons)
            .expect("event matches the tree");
        assert_eq!(drain(&mut fitter).len(), 3);
    }

    #[test]
    fn preparing_again_restarts_the_iteration() {
        let mut fitter = prepared(tree_fitter(FitterSettings::default()));
        let first = drain(&mut fitter);
        let mut fitter = prepared(fitter);
        let second = drain(&mut fitter);
        assert_eq!(first.len(), second.len());
        for ((pa, ra), (pb, rb)) in first.iter().zip(&second) {
            assert_eq!(pa, pb);
            assert_eq!(ra.status, rb.status);
            assert_eq!(ra.chi_square.to_bits(), rb.chi_square.to_bits());
        }
    }
}
