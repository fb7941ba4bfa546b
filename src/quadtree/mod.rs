//! Quadtree path addressing (spec §4.4, §3).

mod path;

pub use path::{QuadtreePath, BRANCH_SPACING, MAX_LEVEL};
