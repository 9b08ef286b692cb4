//! Which candidate plays the baryon.

/// Walks through the candidates, letting each one in turn be the baryon and
/// the rest the photons.
///
/// Borrowing cursor over the caller's candidates: `proton()` and `photons()`
/// hand out references into the original slice, in input order.
///
/// ```
/// use kinfit_core::permutation::ProtonPermutation;
///
/// let candidates = ["a", "b", "c"];
/// let mut perm = ProtonPermutation::new(&candidates);
/// let mut protons = Vec::new();
/// while perm.good() {
///     protons.push(*perm.proton().unwrap());
///     perm.advance();
/// }
/// assert_eq!(protons, ["a", "b", "c"]);
/// ```
#[derive(Debug, Clone)]
pub struct ProtonPermutation<'a, T> {
    candidates: &'a [T],
    true_proton: Option<usize>,
    index: usize,
    photons: Vec<&'a T>,
}

impl<'a, T> ProtonPermutation<'a, T> {
    pub fn new(candidates: &'a [T]) -> Self {
        let mut perm = Self {
            candidates,
            true_proton: None,
            index: 0,
            photons: Vec::with_capacity(candidates.len().saturating_sub(1)),
        };
        perm.fill_photons();
        perm
    }

    /// Like [`ProtonPermutation::new`], remembering which candidate is the
    /// true baryon (simulation bookkeeping).
    pub fn with_true_proton(candidates: &'a [T], true_proton: usize) -> Self {
        let mut perm = Self::new(candidates);
        perm.true_proton = (true_proton < candidates.len()).then_some(true_proton);
        perm
    }

    fn fill_photons(&mut self) {
        self.photons.clear();
        if self.good() {
            let index = self.index;
            self.photons.extend(
                self.candidates
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != index)
                    .map(|(_, c)| c),
            );
        }
    }

    pub fn good(&self) -> bool {
        self.index < self.candidates.len()
    }

    /// Moves the baryon role to the next candidate.
    pub fn advance(&mut self) {
        if self.good() {
            self.index += 1;
            self.fill_photons();
        }
    }

    pub fn proton(&self) -> Option<&'a T> {
        self.candidates.get(self.index)
    }

    /// All candidates except the current baryon; empty once exhausted.
    pub fn photons(&self) -> &[&'a T] {
        &self.photons
    }

    /// Index of the current baryon in the input.
    pub fn proton_index(&self) -> Option<usize> {
        self.good().then_some(self.index)
    }

    /// Whether the current baryon is the known true one; `None` if no truth was given.
    pub fn is_true_proton(&self) -> Option<bool> {
        self.true_proton.map(|t| self.good() && t == self.index)
    }

    pub fn true_proton(&self) -> Option<&'a T> {
        self.true_proton.map(|t| &self.candidates[t])
    }

    /// Number of splits, one per candidate.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}
