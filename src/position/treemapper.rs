// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! The treemapper embeds the tree on a 1-D number line so that inorder
//! traversal is strictly monotone in the horizontal value.
//!
//! The root owns the open interval `(0, 2 * root_value)` and sits at
//! `root_value`. A node with interval `(a, b)` hands each child the j-th of
//! `f` equal sub-intervals and itself sits on the boundary after the first
//! `ceil(f/2)` of them, which places half of every node's children to its
//! left and half to its right. The adjacent-left and adjacent-right
//! neighbors of a position are its inorder predecessor and successor under
//! this embedding.

use super::capacity;

/// Horizontal value of `(level, number)` at the given fanout, derived from
/// the configured root value.
pub(crate) fn horizontal_value(level: u32, number: u32, fanout: u16, root_value: u16) -> f64 {
    let f = f64::from(fanout);
    let split = f64::from((fanout + 1) / 2);

    let mut lower = 0.0;
    let mut width = 2.0 * f64::from(root_value);
    for step in 1..=level {
        let digit = child_digit(level, number, fanout, step);
        width /= f;
        lower += f64::from(digit) * width;
    }
    lower + split * width / f
}

/// The child index taken at `step` (1-based, from the root) on the path from
/// the root down to `(level, number)`.
fn child_digit(level: u32, number: u32, fanout: u16, step: u32) -> u32 {
    let shift = capacity(level - step, fanout);
    ((u128::from(number) / shift) % u128::from(fanout)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Position;
    use proptest::prelude::*;

    const ROOT: u16 = 100;

    fn h(level: u32, number: u32, fanout: u16) -> f64 {
        horizontal_value(level, number, fanout, ROOT)
    }

    #[test]
    fn fanout_two_reference_values() {
        assert_eq!(h(0, 0, 2), 100.0);
        assert_eq!(h(1, 0, 2), 50.0);
        assert_eq!(h(1, 1, 2), 150.0);
        assert_eq!(h(2, 0, 2), 25.0);
        assert_eq!(h(2, 1, 2), 75.0);
        assert_eq!(h(2, 2, 2), 125.0);
        assert_eq!(h(2, 3, 2), 175.0);
    }

    #[test]
    fn scales_with_the_configured_root_value() {
        assert_eq!(horizontal_value(1, 0, 2, 500), 250.0);
        assert_eq!(horizontal_value(1, 1, 2, 500), 750.0);
    }

    /// Inorder traversal of the complete subtree below `position`, bounded
    /// by `max_level`: the first `ceil(f/2)` child subtrees, the node, then
    /// the remaining subtrees.
    fn inorder(position: Position, max_level: u32, out: &mut Vec<Position>) {
        let split = (position.fanout() + 1) / 2;
        let children = if position.level() < max_level {
            position.children()
        } else {
            Vec::new()
        };
        for child in children.iter().take(split as usize) {
            inorder(*child, max_level, out);
        }
        out.push(position);
        for child in children.iter().skip(split as usize) {
            inorder(*child, max_level, out);
        }
    }

    #[test]
    fn inorder_traversal_is_monotone() {
        for fanout in [2u16, 3, 5] {
            let mut sequence = Vec::new();
            inorder(
                Position::root(fanout).expect("root"),
                3,
                &mut sequence,
            );
            let values: Vec<f64> = sequence.iter().map(|p| p.horizontal(ROOT)).collect();
            for pair in values.windows(2) {
                assert!(
                    pair[0] < pair[1],
                    "fanout {}: {} !< {}",
                    fanout,
                    pair[0],
                    pair[1]
                );
            }
        }
    }

    #[test]
    fn level_order_prefix_sorted_by_horizontal_matches_inorder() {
        // The first 22 positions in level order, sorted by horizontal value,
        // must equal the inorder traversal restricted to those positions.
        let fanout = 2u16;
        let mut occupied = Vec::new();
        'outer: for level in 0..5u32 {
            for number in 0..capacity(level, fanout) as u32 {
                occupied.push(Position::new(level, number, fanout).expect("valid"));
                if occupied.len() == 22 {
                    break 'outer;
                }
            }
        }

        let mut by_horizontal = occupied.clone();
        by_horizontal.sort_by(|a, b| {
            a.horizontal(ROOT)
                .partial_cmp(&b.horizontal(ROOT))
                .expect("finite")
        });

        let mut full_inorder = Vec::new();
        inorder(Position::root(fanout).expect("root"), 4, &mut full_inorder);
        let restricted: Vec<Position> = full_inorder
            .into_iter()
            .filter(|p| occupied.contains(p))
            .collect();

        assert_eq!(by_horizontal, restricted);
    }

    proptest! {
        #[test]
        fn proptest_distinct_positions_distinct_values(
            fanout in 2u16..5,
            a_level in 0u32..6,
            b_level in 0u32..6,
            seed_a in 0u32..100_000,
            seed_b in 0u32..100_000,
        ) {
            let a = Position::new(a_level, seed_a % capacity(a_level, fanout) as u32, fanout)
                .expect("valid");
            let b = Position::new(b_level, seed_b % capacity(b_level, fanout) as u32, fanout)
                .expect("valid");
            if a != b {
                prop_assert_ne!(a.horizontal(ROOT), b.horizontal(ROOT));
            }
        }
    }
}
