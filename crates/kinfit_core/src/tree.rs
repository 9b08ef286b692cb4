//! Decay hypotheses as immutable, arena-indexed trees.
//!
//! A tree is described with nested [`Decay`] values, brought into a
//! canonical order and flattened into a [`ParticleTypeTree`]. Children are
//! stored as indices, there are no parent links, and the finished tree is
//! meant to be shared (`Arc`) between fitters.

use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::particle::ParticleType;

/// Nested description of a decay tree, used to build a [`ParticleTypeTree`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Decay {
    pub ptype: ParticleType,
    pub products: Vec<Decay>,
}

impl Decay {
    pub fn new(ptype: ParticleType, products: Vec<Decay>) -> Self {
        Self { ptype, products }
    }

    /// A directly observed particle.
    pub fn leaf(ptype: ParticleType) -> Self {
        Self::new(ptype, Vec::new())
    }

    /// Sorts products recursively so that identical subtrees become neighbours.
    fn canonicalize(&mut self) {
        for product in &mut self.products {
            product.canonicalize();
        }
        self.products.sort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// What a leaf is matched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Leaf {
    Baryon,
    /// The k-th photon leaf in tree order.
    Photon(usize),
}

impl Leaf {
    /// Fitter slot receiving this leaf (slot 0 is the baryon).
    pub fn slot(self) -> usize {
        match self {
            Leaf::Baryon => 0,
            Leaf::Photon(k) => k + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticleTypeNode {
    pub ptype: ParticleType,
    pub children: Vec<NodeId>,
    pub leaf: Option<Leaf>,
}

impl ParticleTypeNode {
    pub fn is_leaf(&self) -> bool {
        self.leaf.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleTypeTree {
    nodes: Vec<ParticleTypeNode>,
    photon_leaves: usize,
    /// Photon leaves below pairs of adjacent identical siblings.
    symmetric: Vec<(Vec<usize>, Vec<usize>)>,
}

impl ParticleTypeTree {
    /// Builds the canonical tree. The root must be [`ParticleType::BeamTarget`],
    /// exactly one leaf must be a baryon and all other leaves photons.
    pub fn new(mut decay: Decay) -> Result<Self> {
        if decay.ptype != ParticleType::BeamTarget {
            return Err(FitError::InvalidTree(format!(
                "root must be {}, got {}",
                ParticleType::BeamTarget,
                decay.ptype
            )));
        }
        decay.canonicalize();

        let mut tree = Self {
            nodes: Vec::new(),
            photon_leaves: 0,
            symmetric: Vec::new(),
        };
        let mut baryons = 0;
        tree.flatten(&decay, &mut baryons)?;
        if baryons != 1 {
            return Err(FitError::InvalidTree(format!(
                "expected exactly one baryon leaf, found {baryons}"
            )));
        }

        let mut symmetric = Vec::new();
        for node in &tree.nodes {
            for (a, b) in node.children.iter().tuple_windows() {
                if tree.same_shape(*a, *b) {
                    symmetric.push((tree.photons_below(*a), tree.photons_below(*b)));
                }
            }
        }
        tree.symmetric = symmetric;
        Ok(tree)
    }

    fn flatten(&mut self, decay: &Decay, baryons: &mut usize) -> Result<NodeId> {
        let id = NodeId(self.nodes.len());
        let leaf = if decay.products.is_empty() {
            if decay.ptype == ParticleType::Photon {
                self.photon_leaves += 1;
                Some(Leaf::Photon(self.photon_leaves - 1))
            } else if decay.ptype.is_baryon() {
                *baryons += 1;
                Some(Leaf::Baryon)
            } else {
                return Err(FitError::InvalidTree(format!(
                    "{} cannot be a final state particle",
                    decay.ptype
                )));
            }
        } else {
            None
        };
        self.nodes.push(ParticleTypeNode {
            ptype: decay.ptype,
            children: Vec::new(),
            leaf,
        });
        let children = decay
            .products
            .iter()
            .map(|product| self.flatten(product, baryons))
            .collect::<Result<Vec<_>>>()?;
        self.nodes[id.0].children = children;
        Ok(id)
    }

    fn same_shape(&self, a: NodeId, b: NodeId) -> bool {
        let (na, nb) = (self.node(a), self.node(b));
        na.ptype == nb.ptype
            && na.children.len() == nb.children.len()
            && na
                .children
                .iter()
                .zip(&nb.children)
                .all(|(ca, cb)| self.same_shape(*ca, *cb))
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &ParticleTypeNode {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &ParticleTypeNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn photon_count(&self) -> usize {
        self.photon_leaves
    }

    /// All nodes of the given type, in tree order.
    pub fn find(&self, ptype: ParticleType) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, n)| n.ptype == ptype)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn leaves_below(&self, id: NodeId) -> Vec<Leaf> {
        let node = self.node(id);
        match node.leaf {
            Some(leaf) => vec![leaf],
            None => node
                .children
                .iter()
                .flat_map(|child| self.leaves_below(*child))
                .collect(),
        }
    }

    fn photons_below(&self, id: NodeId) -> Vec<usize> {
        self.leaves_below(id)
            .into_iter()
            .filter_map(|leaf| match leaf {
                Leaf::Photon(k) => Some(k),
                Leaf::Baryon => None,
            })
            .collect()
    }

    /// Whether `permutation` (photon index per photon leaf) is the
    /// representative of its class under swaps of identical siblings: the
    /// earlier sibling holds the smallest photon index.
    pub fn is_canonical(&self, permutation: &[usize]) -> bool {
        let min_of = |leaves: &[usize]| leaves.iter().map(|&k| permutation[k]).min();
        self.symmetric
            .iter()
            .all(|(a, b)| min_of(a) < min_of(b))
    }

    /// All distinct photon-to-leaf assignments, identical sibling swaps
    /// counted once, in lexicographic order.
    pub fn photon_permutations(&self) -> Vec<Vec<usize>> {
        let n = self.photon_leaves;
        (0..n)
            .permutations(n)
            .filter(|p| self.is_canonical(p))
            .collect()
    }

    /// One line per decaying node, e.g. `(beam+target) -> p π0 ; π0 -> γ γ`.
    pub fn decay_string(&self) -> String {
        self.nodes
            .iter()
            .filter(|n| !n.children.is_empty())
            .map(|n| {
                let products = n
                    .children
                    .iter()
                    .map(|c| self.node(*c).ptype.name())
                    .join(" ");
                format!("{} -> {products}", n.ptype)
            })
            .join(" ; ")
    }
}

impl fmt::Display for ParticleTypeTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.decay_string())
    }
}

/// Prebuilt photoproduction hypotheses off a proton, all ending in photons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Pi0To2g,
    TwoPi0To4g,
    ThreePi0To6g,
    OmegaToGPi0,
    OmegaToGEta,
    EtaPrimeTo2g,
    EtaPrimeTo3Pi0,
    EtaPrimeTo2Pi0Eta,
    EtaPrimeToGOmega,
}

impl Channel {
    pub const ALL: [Channel; 9] = [
        Channel::Pi0To2g,
        Channel::TwoPi0To4g,
        Channel::ThreePi0To6g,
        Channel::OmegaToGPi0,
        Channel::OmegaToGEta,
        Channel::EtaPrimeTo2g,
        Channel::EtaPrimeTo3Pi0,
        Channel::EtaPrimeTo2Pi0Eta,
        Channel::EtaPrimeToGOmega,
    ];

    pub fn decay(self) -> Decay {
        use ParticleType::*;

        let gamma = || Decay::leaf(Photon);
        let two_gamma = |ptype| Decay::new(ptype, vec![gamma(), gamma()]);
        let pi0 = || two_gamma(Pi0);
        let eta = || two_gamma(Eta);

        let mesons = match self {
            Channel::Pi0To2g => vec![pi0()],
            Channel::TwoPi0To4g => vec![pi0(), pi0()],
            Channel::ThreePi0To6g => vec![pi0(), pi0(), pi0()],
            Channel::OmegaToGPi0 => vec![Decay::new(Omega, vec![gamma(), pi0()])],
            Channel::OmegaToGEta => vec![Decay::new(Omega, vec![gamma(), eta()])],
            Channel::EtaPrimeTo2g => vec![two_gamma(EtaPrime)],
            Channel::EtaPrimeTo3Pi0 => vec![Decay::new(EtaPrime, vec![pi0(), pi0(), pi0()])],
            Channel::EtaPrimeTo2Pi0Eta => vec![Decay::new(EtaPrime, vec![pi0(), pi0(), eta()])],
            Channel::EtaPrimeToGOmega => vec![Decay::new(
                EtaPrime,
                vec![gamma(), Decay::new(Omega, vec![gamma(), pi0()])],
            )],
        };
        let mut products = vec![Decay::leaf(Proton)];
        products.extend(mesons);
        Decay::new(BeamTarget, products)
    }

    pub fn tree(self) -> Result<ParticleTypeTree> {
        ParticleTypeTree::new(self.decay())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ParticleType::*;

    #[test]
    fn decay_string_is_canonical() {
        let tree = Channel::Pi0To2g.tree().expect("valid channel");
        assert_eq!(tree.decay_string(), "(beam+target) -> p π0 ; π0 -> γ γ");

        // product order in the description does not matter
        let shuffled = Decay::new(
            BeamTarget,
            vec![
                Decay::new(Pi0, vec![Decay::leaf(Photon), Decay::leaf(Photon)]),
                Decay::leaf(Proton),
            ],
        );
        let tree2 = ParticleTypeTree::new(shuffled).expect("valid tree");
        assert_eq!(tree, tree2);
    }

    #[test]
    fn leaves_are_numbered_in_tree_order() {
        let tree = Channel::OmegaToGPi0.tree().expect("valid channel");
        assert_eq!(tree.photon_count(), 3);
        let omega = tree.find(Omega)[0];
        let leaves = tree.leaves_below(omega);
        assert_eq!(
            leaves,
            vec![Leaf::Photon(0), Leaf::Photon(1), Leaf::Photon(2)]
        );
        let proton = tree
            .nodes()
            .find(|(_, n)| n.leaf == Some(Leaf::Baryon))
            .map(|(id, _)| id)
            .expect("one baryon leaf");
        assert_eq!(tree.node(proton).ptype, Proton);
        assert_eq!(Leaf::Baryon.slot(), 0);
        assert_eq!(Leaf::Photon(2).slot(), 3);
    }

    #[test]
    fn identical_subtrees_are_counted_once() {
        let two_pi0 = Channel::TwoPi0To4g.tree().expect("valid channel");
        let perms = two_pi0.photon_permutations();
        assert_eq!(perms.len(), 3);
        // every photon appears exactly once per permutation
        for p in &perms {
            let mut sorted = p.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![0, 1, 2, 3]);
        }
        assert_eq!(perms[0], vec![0, 1, 2, 3]);
    }

    #[test]
    fn permutation_counts_of_channels() {
        let expected = [
            (Channel::Pi0To2g, 1),
            (Channel::TwoPi0To4g, 3),
            (Channel::ThreePi0To6g, 15),
            (Channel::OmegaToGPi0, 3),
            (Channel::EtaPrimeTo2g, 1),
            (Channel::EtaPrimeTo2Pi0Eta, 45),
            (Channel::EtaPrimeToGOmega, 12),
        ];
        for (channel, count) in expected {
            let tree = channel.tree().expect("valid channel");
            assert_eq!(tree.photon_permutations().len(), count, "{channel:?}");
        }
        for channel in Channel::ALL {
            channel.tree().expect("all channels are valid");
        }
    }

    #[test]
    fn invalid_trees_are_rejected() {
        let no_root = Decay::new(Pi0, vec![Decay::leaf(Photon), Decay::leaf(Photon)]);
        assert!(matches!(
            ParticleTypeTree::new(no_root),
            Err(FitError::InvalidTree(_))
        ));

        let no_baryon = Decay::new(BeamTarget, vec![Decay::leaf(Photon)]);
        let err = ParticleTypeTree::new(no_baryon).expect_err("baryon missing");
        assert!(format!("{err}").contains("baryon"));

        let charged = Decay::new(BeamTarget, vec![Decay::leaf(Proton), Decay::leaf(PiPlus)]);
        assert!(ParticleTypeTree::new(charged).is_err());
    }
}
