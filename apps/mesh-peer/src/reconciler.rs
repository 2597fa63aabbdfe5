use std::collections::BTreeSet;

use mesh_protocol::PeerId;

/// Peers that appeared and disappeared since the previous observation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delta {
    pub added: Vec<PeerId>,
    pub removed: Vec<PeerId>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Turns successive observations of a room's peer set into deltas.
///
/// Only the full set is ever compared, so it does not matter whether the
/// observation came from a pushed event or a polled snapshot, or whether
/// it repeats one already seen.
#[derive(Debug)]
pub struct Reconciler {
    local: PeerId,
    known: BTreeSet<PeerId>,
}

impl Reconciler {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            known: BTreeSet::new(),
        }
    }

    pub fn known(&self) -> &BTreeSet<PeerId> {
        &self.known
    }

    pub fn reconcile<I>(&mut self, incoming: I) -> Delta
    where
        I: IntoIterator<Item = PeerId>,
    {
        let incoming: BTreeSet<PeerId> = incoming
            .into_iter()
            .filter(|peer| *peer != self.local)
            .collect();
        let delta = Delta {
            added: incoming.difference(&self.known).cloned().collect(),
            removed: self.known.difference(&incoming).cloned().collect(),
        };
        if !delta.is_empty() {
            self.known = incoming;
        }
        delta
    }

    /// Drops `peer` from the known set so its next observation counts as
    /// added again. Returns whether it was known.
    pub fn forget(&mut self, peer: &PeerId) -> bool {
        self.known.remove(peer)
    }
}
