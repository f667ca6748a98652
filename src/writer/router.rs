//! Slot table for cluster targets.

use super::WriterError;
use crate::commands::SLOT_COUNT;
use crate::connection::ClusterNode;

/// Maps every cluster slot to the index of the node serving it.
///
/// Built once from the topology and never mutated; a topology change means
/// building a new router.
#[derive(Debug, Clone)]
pub struct SlotRouter {
    owners: Box<[usize]>,
    nodes: usize,
}

impl SlotRouter {
    /// Fails unless every slot is served by exactly one node.
    pub fn new(nodes: &[ClusterNode]) -> Result<Self, WriterError> {
        if nodes.is_empty() {
            return Err(WriterError::NoMasters);
        }
        let mut owners: Vec<Option<usize>> = vec![None; SLOT_COUNT];
        for (index, node) in nodes.iter().enumerate() {
            for &(start, end) in &node.slots {
                for slot in start..=end {
                    let owner = &mut owners[slot as usize];
                    if owner.is_some() {
                        return Err(WriterError::SlotConflict { slot });
                    }
                    *owner = Some(index);
                }
            }
        }

        let owners = owners
            .into_iter()
            .enumerate()
            .map(|(slot, owner)| owner.ok_or(WriterError::SlotUncovered { slot: slot as u16 }))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            owners: owners.into_boxed_slice(),
            nodes: nodes.len(),
        })
    }

    pub fn route(&self, slot: u16) -> usize {
        self.owners[slot as usize % SLOT_COUNT]
    }

    pub fn node_count(&self) -> usize {
        self.nodes
    }
}
