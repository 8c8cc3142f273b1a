// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! Per-peer neighbor database.
//!
//! Holds everything a peer knows about its surroundings: parent, child
//! slots, the two adjacents on the horizontal line, the in-level routing
//! table on both sides and the children of routing table neighbors used as
//! routing shortcuts. Mutations validate the structural invariants and fan
//! out a [`NeighborChange`] to registered observers synchronously before
//! returning; that fan-out is the only channel by which the DSN handler
//! learns of cover-area changes.

use crate::error::{Error, Result};
use crate::peer::NodeInfo;
use crate::position::Position;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};

/// How a position relates to our own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Relationship {
    Parent,
    Child,
    AdjacentLeft,
    AdjacentRight,
    RoutingTable,
    RoutingTableChild,
    Unknown,
}

/// A mutation of one neighbor slot.
#[derive(Debug, Clone)]
pub struct NeighborChange {
    pub own: NodeInfo,
    pub relationship: Relationship,
    pub old: Option<NodeInfo>,
    pub new: Option<NodeInfo>,
}

type Observer = Box<dyn Fn(&NeighborChange) + Send + Sync>;

/// Serializable snapshot of a peer's routing state, handed over to the
/// replacement peer when a position changes its occupant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    pub node: NodeInfo,
    pub parent: Option<NodeInfo>,
    pub children: Vec<Option<NodeInfo>>,
    pub adjacent_left: Option<NodeInfo>,
    pub adjacent_right: Option<NodeInfo>,
    pub routing_table: Vec<NodeInfo>,
    pub routing_table_children: Vec<NodeInfo>,
}

impl RoutingSnapshot {
    /// Every reachable peer recorded in the snapshot.
    pub fn neighbors(&self) -> Vec<NodeInfo> {
        let mut all: Vec<NodeInfo> = self
            .parent
            .iter()
            .chain(self.children.iter().flatten())
            .chain(self.adjacent_left.iter())
            .chain(self.adjacent_right.iter())
            .chain(self.routing_table.iter())
            .chain(self.routing_table_children.iter())
            .copied()
            .collect();
        all.sort_by_key(|n| n.position());
        all.dedup_by_key(|n| n.position());
        all
    }
}

/// The neighbor database of one peer.
pub struct RoutingInformation {
    node: NodeInfo,
    treemapper_root: u16,
    parent: Option<NodeInfo>,
    children: Vec<Option<NodeInfo>>,
    adjacent_left: Option<NodeInfo>,
    adjacent_right: Option<NodeInfo>,
    rt_left: BTreeMap<u32, NodeInfo>,
    rt_right: BTreeMap<u32, NodeInfo>,
    rt_children: BTreeMap<Position, NodeInfo>,
    observers: Vec<Observer>,
}

impl Debug for RoutingInformation {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("RoutingInformation")
            .field("node", &self.node)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("adjacent_left", &self.adjacent_left)
            .field("adjacent_right", &self.adjacent_right)
            .field("rt_left", &self.rt_left)
            .field("rt_right", &self.rt_right)
            .field("rt_children", &self.rt_children)
            .finish()
    }
}

impl RoutingInformation {
    pub fn new(node: NodeInfo, treemapper_root: u16) -> Self {
        let fanout = node.position().fanout();
        Self {
            node,
            treemapper_root,
            parent: None,
            children: vec![None; usize::from(fanout)],
            adjacent_left: None,
            adjacent_right: None,
            rt_left: BTreeMap::new(),
            rt_right: BTreeMap::new(),
            rt_children: BTreeMap::new(),
            observers: Vec::new(),
        }
    }

    /// Registers an observer for neighbor changes. Observers run
    /// synchronously inside every mutation.
    pub fn register_observer(&mut self, observer: Observer) {
        self.observers.push(observer);
    }

    fn publish(&self, relationship: Relationship, old: Option<NodeInfo>, new: Option<NodeInfo>) {
        let change = NeighborChange {
            own: self.node,
            relationship,
            old,
            new,
        };
        for observer in &self.observers {
            observer(&change);
        }
    }

    pub fn node(&self) -> NodeInfo {
        self.node
    }

    pub fn treemapper_root(&self) -> u16 {
        self.treemapper_root
    }

    fn fanout(&self) -> u16 {
        self.node.position().fanout()
    }

    fn horizontal(&self, position: &Position) -> f64 {
        position.horizontal(self.treemapper_root)
    }

    pub fn parent(&self) -> Option<NodeInfo> {
        self.parent
    }

    pub fn children(&self) -> &[Option<NodeInfo>] {
        &self.children
    }

    pub fn child(&self, index: u16) -> Option<NodeInfo> {
        self.children.get(usize::from(index)).copied().flatten()
    }

    /// Index of the leftmost unoccupied child slot, if any.
    pub fn leftmost_empty_child_slot(&self) -> Option<u16> {
        self.children
            .iter()
            .position(Option::is_none)
            .map(|i| i as u16)
    }

    pub fn adjacent_left(&self) -> Option<NodeInfo> {
        self.adjacent_left
    }

    pub fn adjacent_right(&self) -> Option<NodeInfo> {
        self.adjacent_right
    }

    pub fn routing_table_left(&self) -> Vec<NodeInfo> {
        self.rt_left.values().copied().collect()
    }

    pub fn routing_table_right(&self) -> Vec<NodeInfo> {
        self.rt_right.values().copied().collect()
    }

    pub fn routing_table_children(&self) -> Vec<NodeInfo> {
        self.rt_children.values().copied().collect()
    }

    /// How `position` relates to us. Adjacency is a property of the current
    /// occupancy rather than the algebra, so it only matches the slots we
    /// actually hold.
    pub fn classify(&self, position: &Position) -> Relationship {
        match self.structural_slot(position) {
            slot @ (Relationship::Parent | Relationship::Child) => slot,
            slot => {
                if self.adjacent_left.map(|n| n.position()) == Some(*position) {
                    Relationship::AdjacentLeft
                } else if self.adjacent_right.map(|n| n.position()) == Some(*position) {
                    Relationship::AdjacentRight
                } else {
                    slot
                }
            }
        }
    }

    /// Looks a neighbor up by position, whatever slot it occupies.
    pub fn get(&self, position: &Position) -> Option<NodeInfo> {
        self.all_neighbors()
            .into_iter()
            .find(|n| n.position() == *position)
    }

    /// Every known neighbor, deduplicated by position.
    pub fn all_neighbors(&self) -> Vec<NodeInfo> {
        let mut all: Vec<NodeInfo> = self
            .parent
            .iter()
            .chain(self.children.iter().flatten())
            .chain(self.adjacent_left.iter())
            .chain(self.adjacent_right.iter())
            .chain(self.rt_left.values())
            .chain(self.rt_right.values())
            .chain(self.rt_children.values())
            .copied()
            .collect();
        all.sort_by_key(|n| n.position());
        all.dedup_by_key(|n| n.position());
        all
    }

    fn ensure_complete(&self, candidate: &NodeInfo, slot: &str) -> Result<()> {
        if !candidate.is_complete() {
            return Err(Error::InvalidRouting {
                candidate: candidate.position(),
                slot: slot.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_parent(&mut self, parent: NodeInfo) -> Result<()> {
        self.ensure_complete(&parent, "parent")?;
        if Some(parent.position()) != self.node.position().parent() {
            return Err(Error::InvalidRouting {
                candidate: parent.position(),
                slot: "parent".to_string(),
            });
        }
        let old = self.parent.replace(parent);
        if old.map(|o| o.same_occupant(&parent)) != Some(true) {
            self.publish(Relationship::Parent, old, Some(parent));
        }
        Ok(())
    }

    pub fn set_adjacent_left(&mut self, adjacent: Option<NodeInfo>) -> Result<()> {
        if let Some(candidate) = &adjacent {
            self.ensure_complete(candidate, "adjacent_left")?;
            let own_h = self.horizontal(&self.node.position());
            if self.horizontal(&candidate.position()) >= own_h {
                return Err(Error::InvalidRouting {
                    candidate: candidate.position(),
                    slot: "adjacent_left".to_string(),
                });
            }
        }
        let old = std::mem::replace(&mut self.adjacent_left, adjacent);
        if old != adjacent || !same_occupant_opt(&old, &adjacent) {
            self.publish(Relationship::AdjacentLeft, old, adjacent);
        }
        Ok(())
    }

    pub fn set_adjacent_right(&mut self, adjacent: Option<NodeInfo>) -> Result<()> {
        if let Some(candidate) = &adjacent {
            self.ensure_complete(candidate, "adjacent_right")?;
            let own_h = self.horizontal(&self.node.position());
            if self.horizontal(&candidate.position()) <= own_h {
                return Err(Error::InvalidRouting {
                    candidate: candidate.position(),
                    slot: "adjacent_right".to_string(),
                });
            }
        }
        let old = std::mem::replace(&mut self.adjacent_right, adjacent);
        if old != adjacent || !same_occupant_opt(&old, &adjacent) {
            self.publish(Relationship::AdjacentRight, old, adjacent);
        }
        Ok(())
    }

    /// The structural slot a position maps to, independent of the adjacency
    /// slots it may additionally occupy.
    fn structural_slot(&self, position: &Position) -> Relationship {
        let own = self.node.position();
        if Some(*position) == own.parent() {
            return Relationship::Parent;
        }
        if own.is_parent_of(position) {
            return Relationship::Child;
        }
        if position.level() == own.level()
            && (own.routing_table_left().contains(position)
                || own.routing_table_right().contains(position))
        {
            return Relationship::RoutingTable;
        }
        if let Some(rt_parent) = position.parent() {
            if rt_parent.level() == own.level()
                && (own.routing_table_left().contains(&rt_parent)
                    || own.routing_table_right().contains(&rt_parent))
            {
                return Relationship::RoutingTableChild;
            }
        }
        Relationship::Unknown
    }

    /// Inserts or replaces a neighbor in every slot its position maps to.
    /// Idempotent under an identical occupant; a change of endpoint or uuid
    /// at an occupied position replaces the occupant and notifies.
    pub fn update_neighbor(&mut self, neighbor: NodeInfo) -> Result<()> {
        let structural = self.structural_slot(&neighbor.position());
        let adjacent_left = self.adjacent_left.map(|n| n.position()) == Some(neighbor.position());
        let adjacent_right = self.adjacent_right.map(|n| n.position()) == Some(neighbor.position());
        if structural == Relationship::Unknown && !adjacent_left && !adjacent_right {
            return Err(Error::InvalidRouting {
                candidate: neighbor.position(),
                slot: "unknown".to_string(),
            });
        }

        match structural {
            Relationship::Parent => self.set_parent(neighbor)?,
            Relationship::Child => {
                self.ensure_complete(&neighbor, "child")?;
                let index = usize::from(
                    neighbor
                        .position()
                        .child_index()
                        .ok_or(Error::InvalidRouting {
                            candidate: neighbor.position(),
                            slot: "child".to_string(),
                        })?,
                );
                let old = self.children[index].replace(neighbor);
                if old.map(|o| o.same_occupant(&neighbor)) != Some(true) {
                    self.publish(Relationship::Child, old, Some(neighbor));
                }
            }
            Relationship::RoutingTable => {
                self.ensure_complete(&neighbor, "routing_table")?;
                let side = if neighbor.position().number() < self.node.position().number() {
                    &mut self.rt_left
                } else {
                    &mut self.rt_right
                };
                let old = side.insert(neighbor.position().number(), neighbor);
                if old.map(|o| o.same_occupant(&neighbor)) != Some(true) {
                    self.publish(Relationship::RoutingTable, old, Some(neighbor));
                }
            }
            Relationship::RoutingTableChild => {
                self.ensure_complete(&neighbor, "routing_table_child")?;
                let old = self.rt_children.insert(neighbor.position(), neighbor);
                if old.map(|o| o.same_occupant(&neighbor)) != Some(true) {
                    self.publish(Relationship::RoutingTableChild, old, Some(neighbor));
                }
            }
            _ => {}
        }
        if adjacent_left {
            self.set_adjacent_left(Some(neighbor))?;
        }
        if adjacent_right {
            self.set_adjacent_right(Some(neighbor))?;
        }
        Ok(())
    }

    /// Removes whatever occupies `position` from every slot holding it.
    /// Returns the removed neighbor.
    pub fn remove_neighbor(&mut self, position: &Position) -> Option<NodeInfo> {
        let mut removed = None;
        if self.parent.map(|n| n.position()) == Some(*position) {
            let old = self.parent.take();
            self.publish(Relationship::Parent, old, None);
            removed = removed.or(old);
        }
        if let Some(index) = position.child_index() {
            if self.node.position().is_parent_of(position) {
                if let Some(old) = self.children[usize::from(index)].take() {
                    self.publish(Relationship::Child, Some(old), None);
                    removed = removed.or(Some(old));
                }
            }
        }
        if self.adjacent_left.map(|n| n.position()) == Some(*position) {
            let old = self.adjacent_left.take();
            self.publish(Relationship::AdjacentLeft, old, None);
            removed = removed.or(old);
        }
        if self.adjacent_right.map(|n| n.position()) == Some(*position) {
            let old = self.adjacent_right.take();
            self.publish(Relationship::AdjacentRight, old, None);
            removed = removed.or(old);
        }
        if position.level() == self.node.position().level() {
            let side = if position.number() < self.node.position().number() {
                &mut self.rt_left
            } else {
                &mut self.rt_right
            };
            if let Some(old) = side.remove(&position.number()) {
                self.publish(Relationship::RoutingTable, Some(old), None);
                removed = removed.or(Some(old));
            }
        }
        if let Some(old) = self.rt_children.remove(position) {
            self.publish(Relationship::RoutingTableChild, Some(old), None);
            removed = removed.or(Some(old));
        }
        removed
    }

    /// A serializable copy of the whole neighbor set.
    pub fn snapshot(&self) -> RoutingSnapshot {
        RoutingSnapshot {
            node: self.node,
            parent: self.parent,
            children: self.children.clone(),
            adjacent_left: self.adjacent_left,
            adjacent_right: self.adjacent_right,
            routing_table: self
                .rt_left
                .values()
                .chain(self.rt_right.values())
                .copied()
                .collect(),
            routing_table_children: self.rt_children.values().copied().collect(),
        }
    }

    /// Replaces the whole neighbor set with a vacated peer's state, with
    /// ourselves as the new occupant of its position. Every slot fires a
    /// change notification so the DSN handler can rebuild its cover.
    /// Entries the invariants reject (stale snapshot data) are skipped.
    pub fn adopt_snapshot(&mut self, new_self: NodeInfo, snapshot: RoutingSnapshot) {
        self.node = new_self;
        self.parent = None;
        self.children = vec![None; usize::from(self.fanout())];
        self.adjacent_left = None;
        self.adjacent_right = None;
        self.rt_left.clear();
        self.rt_right.clear();
        self.rt_children.clear();
        self.publish(Relationship::Unknown, Some(snapshot.node), Some(new_self));

        if let Some(parent) = snapshot.parent {
            if let Err(error) = self.set_parent(parent) {
                debug!("skipping stale parent {}: {:?}", parent, error);
            }
        }
        if let Err(error) = self.set_adjacent_left(snapshot.adjacent_left) {
            debug!("skipping stale adjacent-left: {:?}", error);
        }
        if let Err(error) = self.set_adjacent_right(snapshot.adjacent_right) {
            debug!("skipping stale adjacent-right: {:?}", error);
        }
        for neighbor in snapshot
            .children
            .iter()
            .flatten()
            .chain(snapshot.routing_table.iter())
            .chain(snapshot.routing_table_children.iter())
        {
            if let Err(error) = self.update_neighbor(*neighbor) {
                debug!("skipping stale neighbor {}: {:?}", neighbor, error);
            }
        }
    }
}

fn same_occupant_opt(a: &Option<NodeInfo>, b: &Option<NodeInfo>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.same_occupant(b),
        (None, None) => true,
        _ => false,
    }
}
