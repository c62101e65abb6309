//! Quadtree constants & adjacency tables: the `Child`/`Side` enums, the
//! fixed `NEIGHBOUR`/`OPPART`/`OPSIDE` lookup tables used by
//! [`crate::node::equal_neighbor`], and the per-frame traversal states.

use derive_more::Display;

/// Which of a parent's four quadrants a node occupies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display)]
#[repr(u8)]
pub enum Child {
    #[display("NW")]
    Nw = 0,
    #[display("NE")]
    Ne = 1,
    #[display("SW")]
    Sw = 2,
    #[display("SE")]
    Se = 3,
}

impl Child {
    pub const ALL: [Child; 4] = [Child::Nw, Child::Ne, Child::Sw, Child::Se];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Self {
        Self::ALL[i]
    }
}

/// Which edge of a node's extent. Also used to index per-side arrays
/// (`hasNeighbor`, `sideSize`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display)]
#[repr(u8)]
pub enum Side {
    #[display("N")]
    N = 0,
    #[display("E")]
    E = 1,
    #[display("S")]
    S = 2,
    #[display("W")]
    W = 3,
}

impl Side {
    pub const ALL: [Side; 4] = [Side::N, Side::E, Side::S, Side::W];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Self {
        Self::ALL[i]
    }
}

/// `OPSIDE[side]`: the opposite side.
pub const OPSIDE: [Side; 4] = [Side::S, Side::W, Side::N, Side::E];

pub fn opposite_side(side: Side) -> Side {
    OPSIDE[side.index()]
}

/// `NEIGHBOUR[side][partId]`: the sibling sharing `side` with `partId` inside
/// the same parent, or `None` when that neighbor lies outside the parent and
/// the search must continue up the tree (spec §4.6).
pub const NEIGHBOUR: [[Option<Child>; 4]; 4] = [
    // N
    [None, None, Some(Child::Nw), Some(Child::Ne)],
    // E
    [Some(Child::Ne), None, Some(Child::Se), None],
    // S
    [Some(Child::Sw), Some(Child::Se), None, None],
    // W
    [None, Some(Child::Nw), None, Some(Child::Sw)],
];

/// `OPPART[side][partId]`: the mirror of `partId` across `side`, used to walk
/// back down a recorded path once an ancestor's same-side neighbor has been
/// found (spec §4.6). Mirroring across N or S both flip the north/south row,
/// and mirroring across E or W both flip the east/west column, so the table
/// only has two distinct rows.
pub const OPPART: [[Child; 4]; 4] = [
    // N: flip row
    [Child::Sw, Child::Se, Child::Nw, Child::Ne],
    // E: flip column
    [Child::Ne, Child::Nw, Child::Se, Child::Sw],
    // S: flip row
    [Child::Sw, Child::Se, Child::Nw, Child::Ne],
    // W: flip column
    [Child::Ne, Child::Nw, Child::Se, Child::Sw],
];

/// The three per-frame traversal states of a node (spec §2, §8 property 7).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum TraversalState {
    #[default]
    Walkthrough,
    Rendering,
    NotRendering,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opside_is_involutive() {
        for side in Side::ALL {
            assert_eq!(opposite_side(opposite_side(side)), side);
        }
    }

    #[test]
    fn neighbour_table_s6_walk_up_case() {
        // NE-child asking for side E: NEIGHBOUR[E][NE] = None (spec S6).
        assert_eq!(NEIGHBOUR[Side::E.index()][Child::Ne.index()], None);
        // SW-child asking for side E: same-parent neighbor is SE.
        assert_eq!(NEIGHBOUR[Side::E.index()][Child::Sw.index()], Some(Child::Se));
    }

    #[test]
    fn oppart_mirrors_ne_across_e_to_nw() {
        // Mirroring NE across E (spec S6: "mirror of NE across E" -> NW).
        assert_eq!(OPPART[Side::E.index()][Child::Ne.index()], Child::Nw);
    }

    #[test]
    fn oppart_is_involutive() {
        for side in Side::ALL {
            for child in Child::ALL {
                let mirrored = OPPART[side.index()][child.index()];
                let back = OPPART[side.index()][mirrored.index()];
                assert_eq!(back, child);
            }
        }
    }
}
