use crate::node::EvaluationNode;
use serde::{Deserialize, Serialize};

/// Generational index into the node arena.
/// A freed slot bumps its generation, so stale ids are detected instead of
/// silently aliasing a newer node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub index: u32,
    pub generation: u32,
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    node: Option<EvaluationNode>,
}

/// Owns every evaluation node. Cross-node references are `NodeId`s.
#[derive(Default)]
pub struct NodeArena {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    live: usize,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, node: EvaluationNode) -> NodeId {
        self.live += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            NodeId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeId { index, generation: 0 }
        }
    }

    /// Free a slot, returning the node that lived there.
    pub fn free(&mut self, id: NodeId) -> Option<EvaluationNode> {
        if !self.is_valid(id) {
            return None;
        }
        let slot = &mut self.slots[id.index as usize];
        slot.generation += 1;
        self.free_list.push(id.index);
        self.live -= 1;
        slot.node.take()
    }

    pub fn is_valid(&self, id: NodeId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.generation == id.generation && slot.node.is_some())
    }

    pub fn get(&self, id: NodeId) -> Option<&EvaluationNode> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut EvaluationNode> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &EvaluationNode)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.node.as_ref().map(|node| {
                (
                    NodeId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    node,
                )
            })
        })
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvId;
    use crate::node::NodeKind;

    fn node(watcher_id: u64) -> EvaluationNode {
        EvaluationNode::new(watcher_id, None, EnvId::ROOT, NodeKind::Output, Default::default(), 0, 0)
    }

    #[test]
    fn alloc_and_free_reuses_slot_with_new_generation() {
        let mut arena = NodeArena::new();
        let a = arena.alloc(node(1));
        let b = arena.alloc(node(2));
        assert_ne!(a, b);
        assert_eq!(arena.len(), 2);

        assert!(arena.free(a).is_some());
        assert!(!arena.is_valid(a));
        assert!(arena.get(a).is_none());

        let c = arena.alloc(node(3));
        assert_eq!(c.index, a.index);
        assert_ne!(c.generation, a.generation);
        assert_eq!(arena.get(c).map(|n| n.watcher_id), Some(3));
    }

    #[test]
    fn double_free_is_ignored() {
        let mut arena = NodeArena::new();
        let a = arena.alloc(node(1));
        assert!(arena.free(a).is_some());
        assert!(arena.free(a).is_none());
        assert!(arena.is_empty());
    }
}
