//! Placement candidates and the discard filter.

use hive_state::NodeName;

/// Everything placement needs to know about one node for one object.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub node: NodeName,
    /// Position of the node in the object's configured node list.
    pub order: usize,
    pub frozen: bool,
    pub overloaded: bool,
    pub provisioned: bool,
    pub constraints_ok: bool,
    /// The local instance last reported `start failed`.
    pub start_failed: bool,
    pub load_15m: f64,
    /// Available memory, percent.
    pub mem_avail: f64,
    /// Available swap, percent.
    pub swap_avail: f64,
}

impl Candidate {
    /// A healthy, idle candidate. Mostly useful to build test fixtures.
    pub fn new(node: impl Into<NodeName>, order: usize) -> Self {
        Self {
            node: node.into(),
            order,
            frozen: false,
            overloaded: false,
            provisioned: true,
            constraints_ok: true,
            start_failed: false,
            load_15m: 0.0,
            mem_avail: 100.0,
            swap_avail: 100.0,
        }
    }
}

/// Which candidate conditions discard a node. Every flag defaults to on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateFilter {
    pub discard_frozen: bool,
    pub discard_overloaded: bool,
    pub discard_unprovisioned: bool,
    pub discard_constraints_violation: bool,
    pub discard_start_failed: bool,
}

impl Default for CandidateFilter {
    fn default() -> Self {
        Self {
            discard_frozen: true,
            discard_overloaded: true,
            discard_unprovisioned: true,
            discard_constraints_violation: true,
            discard_start_failed: true,
        }
    }
}

impl CandidateFilter {
    /// Keep every candidate.
    pub fn none() -> Self {
        Self {
            discard_frozen: false,
            discard_overloaded: false,
            discard_unprovisioned: false,
            discard_constraints_violation: false,
            discard_start_failed: false,
        }
    }

    pub fn with_frozen(mut self, discard: bool) -> Self {
        self.discard_frozen = discard;
        self
    }

    pub fn with_overloaded(mut self, discard: bool) -> Self {
        self.discard_overloaded = discard;
        self
    }

    pub fn with_unprovisioned(mut self, discard: bool) -> Self {
        self.discard_unprovisioned = discard;
        self
    }

    pub fn with_constraints_violation(mut self, discard: bool) -> Self {
        self.discard_constraints_violation = discard;
        self
    }

    pub fn with_start_failed(mut self, discard: bool) -> Self {
        self.discard_start_failed = discard;
        self
    }

    pub fn accepts(&self, c: &Candidate) -> bool {
        !(self.discard_frozen && c.frozen
            || self.discard_overloaded && c.overloaded
            || self.discard_unprovisioned && !c.provisioned
            || self.discard_constraints_violation && !c.constraints_ok
            || self.discard_start_failed && c.start_failed)
    }

    pub fn apply<'a>(&self, candidates: &'a [Candidate]) -> Vec<&'a Candidate> {
        candidates.iter().filter(|c| self.accepts(c)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_discards_everything_flagged() {
        let filter = CandidateFilter::default();
        let mut frozen = Candidate::new("n1", 0);
        frozen.frozen = true;
        let mut failed = Candidate::new("n2", 1);
        failed.start_failed = true;
        let mut unprov = Candidate::new("n3", 2);
        unprov.provisioned = false;
        let ok = Candidate::new("n4", 3);

        let candidates = vec![frozen, failed, unprov, ok];
        let kept = filter.apply(&candidates);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].node, "n4");
    }

    #[test]
    fn flags_toggle_independently() {
        let mut frozen = Candidate::new("n1", 0);
        frozen.frozen = true;
        frozen.overloaded = true;

        let filter = CandidateFilter::default().with_frozen(false);
        assert!(!filter.accepts(&frozen));
        let filter = filter.with_overloaded(false);
        assert!(filter.accepts(&frozen));
        assert!(CandidateFilter::none().accepts(&frozen));
    }
}
