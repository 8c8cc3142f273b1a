// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! Pure algebra over tree positions.
//!
//! A position is a `(level, number)` coordinate in an m-ary tree of fanout
//! `f`: level `L` holds up to `f^L` slots numbered `0..f^L`. All neighbor
//! relations of the overlay (parent, children, adjacents on the horizontal
//! line, in-level routing table, dominating-set cover areas) are derived
//! from these coordinates alone, so every peer can compute any other peer's
//! neighbor set without asking the network.

mod treemapper;

pub(crate) use treemapper::horizontal_value;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// A slot coordinate in the tree.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub struct Position {
    level: u32,
    number: u32,
    fanout: u16,
}

impl Display for Position {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.level, self.number)
    }
}

impl Position {
    /// Creates a position, failing on coordinates outside the tree.
    pub fn new(level: u32, number: u32, fanout: u16) -> Result<Self> {
        if fanout < 2 {
            return Err(Error::InvalidFanout(fanout));
        }
        if u128::from(number) >= capacity(level, fanout) {
            return Err(Error::InvalidPosition {
                level,
                number,
                fanout,
            });
        }
        Ok(Self {
            level,
            number,
            fanout,
        })
    }

    /// The root position `0:0`.
    pub fn root(fanout: u16) -> Result<Self> {
        Self::new(0, 0, fanout)
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn fanout(&self) -> u16 {
        self.fanout
    }

    pub fn is_root(&self) -> bool {
        self.level == 0
    }

    /// Number of slots on this position's level.
    pub fn level_capacity(&self) -> u128 {
        capacity(self.level, self.fanout)
    }

    /// The structural parent, `None` for the root.
    pub fn parent(&self) -> Option<Position> {
        if self.level == 0 {
            return None;
        }
        Some(Self {
            level: self.level - 1,
            number: self.number / u32::from(self.fanout),
            fanout: self.fanout,
        })
    }

    /// The `index`-th child slot, `0 <= index < fanout`.
    pub fn child(&self, index: u16) -> Result<Position> {
        if index >= self.fanout {
            return Err(Error::InvalidPosition {
                level: self.level + 1,
                number: self.number,
                fanout: self.fanout,
            });
        }
        let number = self
            .number
            .checked_mul(u32::from(self.fanout))
            .and_then(|n| n.checked_add(u32::from(index)))
            .ok_or(Error::InvalidPosition {
                level: self.level + 1,
                number: u32::MAX,
                fanout: self.fanout,
            })?;
        Ok(Self {
            level: self.level + 1,
            number,
            fanout: self.fanout,
        })
    }

    /// All child slots in order.
    pub fn children(&self) -> Vec<Position> {
        (0..self.fanout).filter_map(|j| self.child(j).ok()).collect()
    }

    /// Which child slot of our parent we occupy.
    pub fn child_index(&self) -> Option<u16> {
        if self.level == 0 {
            return None;
        }
        Some((self.number % u32::from(self.fanout)) as u16)
    }

    pub fn is_parent_of(&self, other: &Position) -> bool {
        other.parent().as_ref() == Some(self)
    }

    /// Whether `self` lies in the subtree rooted at `other`.
    pub fn is_descendant_of(&self, other: &Position) -> bool {
        if self.level <= other.level {
            return false;
        }
        let shift = capacity(self.level - other.level, self.fanout);
        u128::from(self.number) / shift == u128::from(other.number)
    }

    /// The horizontal value of this position for a given treemapper root.
    pub fn horizontal(&self, treemapper_root: u16) -> f64 {
        horizontal_value(self.level, self.number, self.fanout, treemapper_root)
    }

    /// In-level routing table neighbors to the left, ascending by number.
    ///
    /// These are the positions at distance `d * f^i` below our number, for
    /// `d` in `1..f` and every power `i` that stays on the level.
    pub fn routing_table_left(&self) -> Vec<Position> {
        let mut numbers: Vec<u32> = self
            .routing_table_offsets()
            .filter_map(|offset| u128::from(self.number).checked_sub(offset))
            .map(|n| n as u32)
            .collect();
        numbers.sort_unstable();
        numbers.dedup();
        numbers
            .into_iter()
            .map(|number| Self {
                level: self.level,
                number,
                fanout: self.fanout,
            })
            .collect()
    }

    /// In-level routing table neighbors to the right, ascending by number.
    pub fn routing_table_right(&self) -> Vec<Position> {
        let cap = self.level_capacity();
        let mut numbers: Vec<u32> = self
            .routing_table_offsets()
            .map(|offset| u128::from(self.number) + offset)
            .filter(|n| *n < cap)
            .map(|n| n as u32)
            .collect();
        numbers.sort_unstable();
        numbers.dedup();
        numbers
            .into_iter()
            .map(|number| Self {
                level: self.level,
                number,
                fanout: self.fanout,
            })
            .collect()
    }

    fn routing_table_offsets(&self) -> impl Iterator<Item = u128> + '_ {
        let fanout = u128::from(self.fanout);
        let cap = self.level_capacity();
        (0u32..)
            .map(move |i| fanout.pow(i))
            .take_while(move |power| *power < cap)
            .flat_map(move |power| (1..fanout).map(move |d| d * power))
    }

    /// Whether this position is a Dominating-Set Node position.
    ///
    /// The root is a DSN; on every other even level the positions
    /// `f, 3f, 5f, ...` (i.e. `number = f mod 2f`) are DSNs. Their cover
    /// areas tile the even level and the child level below it, so each
    /// position of the tree lies in at least one cover area.
    pub fn is_dsn(&self) -> bool {
        if self.level == 0 {
            return true;
        }
        if self.level % 2 != 0 {
            return false;
        }
        let f = u32::from(self.fanout);
        self.number % (2 * f) == f
    }

    /// In-level extent `[lo, hi]` of this DSN's cover area, `None` when the
    /// position is not a DSN.
    ///
    /// The natural extent is `[number - f, number + f - 1]`; the last DSN of
    /// a level stretches to the end of the level so the tail positions with
    /// no DSN of their own stay covered.
    pub fn cover_extent(&self) -> Option<(u32, u32)> {
        if !self.is_dsn() {
            return None;
        }
        if self.level == 0 {
            return Some((0, 0));
        }
        let f = u32::from(self.fanout);
        let cap = self.level_capacity();
        let level_end = (cap - 1).min(u128::from(u32::MAX)) as u32;
        let lo = self.number - f;
        let mut hi = self.number.saturating_add(f - 1);
        if u128::from(self.number) + u128::from(2 * f) >= cap {
            hi = level_end;
        }
        Some((lo, hi.min(level_end)))
    }

    /// All positions of this DSN's cover area: the in-level extent without
    /// the DSN itself, plus every child slot of the extent.
    pub fn cover_area(&self) -> Vec<Position> {
        let (lo, hi) = match self.cover_extent() {
            Some(extent) => extent,
            None => return Vec::new(),
        };
        let mut area = Vec::new();
        for number in lo..=hi {
            let in_level = Self {
                level: self.level,
                number,
                fanout: self.fanout,
            };
            if in_level != *self {
                area.push(in_level);
            }
            area.extend(in_level.children());
        }
        area
    }

    /// Whether `other` lies within this DSN's cover area.
    pub fn covers(&self, other: &Position) -> bool {
        let (lo, hi) = match self.cover_extent() {
            Some(extent) => extent,
            None => return false,
        };
        if other.level == self.level {
            return other.number >= lo && other.number <= hi && other != self;
        }
        if other.level == self.level + 1 {
            let parent_number = other.number / u32::from(self.fanout);
            return parent_number >= lo && parent_number <= hi;
        }
        false
    }

    /// The DSN position responsible for indexing this position's attributes.
    ///
    /// A DSN answers for itself; everything else resolves to the cover area
    /// it falls into: even-level positions to their in-level DSN, odd-level
    /// positions through their parent.
    pub fn responsible_dsn(&self) -> Position {
        if self.is_dsn() {
            return *self;
        }
        if self.level % 2 == 0 {
            return self.in_level_dsn();
        }
        let parent = self
            .parent()
            .expect("level is odd, so a parent exists");
        if parent.is_dsn() {
            parent
        } else {
            parent.in_level_dsn()
        }
    }

    /// The DSN on this (even) level whose cover extent contains `number`.
    fn in_level_dsn(&self) -> Position {
        debug_assert!(self.level % 2 == 0);
        if self.level == 0 {
            return *self;
        }
        let f = u32::from(self.fanout);
        let mut dsn_number = f + 2 * f * (self.number / (2 * f));
        if u128::from(dsn_number) >= self.level_capacity() {
            // tail of the level, covered by the previous DSN
            dsn_number -= 2 * f;
        }
        Self {
            level: self.level,
            number: dsn_number,
            fanout: self.fanout,
        }
    }

    /// The DSN two levels down that continues a full-tree query fan-out,
    /// if that level exists within `u32` coordinates.
    pub fn next_dsn_level_down(&self) -> Option<Position> {
        let f = u32::from(self.fanout);
        let descendant = self.number.checked_mul(f)?.checked_mul(f)?;
        let down = Self {
            level: self.level + 2,
            number: descendant,
            fanout: self.fanout,
        };
        Some(down.in_level_dsn())
    }

    /// The neighboring DSN on this level in the given horizontal direction.
    pub fn dsn_neighbor(&self, left: bool) -> Option<Position> {
        if !self.is_dsn() || self.level == 0 {
            return None;
        }
        let f = u32::from(self.fanout);
        let number = if left {
            self.number.checked_sub(2 * f)?
        } else {
            self.number + 2 * f
        };
        if u128::from(number) >= self.level_capacity() {
            return None;
        }
        Some(Self {
            level: self.level,
            number,
            fanout: self.fanout,
        })
    }
}

/// `fanout^level`, exact.
pub(crate) fn capacity(level: u32, fanout: u16) -> u128 {
    u128::from(fanout).saturating_pow(level)
}
