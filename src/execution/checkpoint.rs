use crate::prelude::*;

use super::Phase;

/// Per-phase record of committed batch indices. The unit of recovery: a
/// re-invocation with the same iterator skips every batch recorded here.
/// Cleared when the schema or the iterator is replaced.
#[derive(Default)]
pub struct Checkpoint {
    phases: [Mutex<HashSet<usize>>; 2],
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_committed(&self, phase: Phase, batch_index: usize) -> bool {
        self.phases[phase.index()]
            .lock()
            .unwrap()
            .contains(&batch_index)
    }

    pub fn mark_committed(&self, phase: Phase, batch_index: usize) {
        self.phases[phase.index()]
            .lock()
            .unwrap()
            .insert(batch_index);
    }

    pub fn committed_count(&self, phase: Phase) -> usize {
        self.phases[phase.index()].lock().unwrap().len()
    }

    pub fn clear(&self) {
        for phase in &self.phases {
            phase.lock().unwrap().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_tracked_independently() {
        let checkpoint = Checkpoint::new();
        checkpoint.mark_committed(Phase::Nodes, 0);
        checkpoint.mark_committed(Phase::Nodes, 2);
        assert!(checkpoint.is_committed(Phase::Nodes, 0));
        assert!(!checkpoint.is_committed(Phase::Nodes, 1));
        assert!(!checkpoint.is_committed(Phase::Relationships, 0));
        assert_eq!(checkpoint.committed_count(Phase::Nodes), 2);
        assert_eq!(checkpoint.committed_count(Phase::Relationships), 0);

        checkpoint.clear();
        assert_eq!(checkpoint.committed_count(Phase::Nodes), 0);
    }
}
