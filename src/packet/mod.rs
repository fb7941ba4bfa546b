//! Quadtree packet parsing: the legacy binary format (C5) and the
//! TimeMachine group-wire protobuf format (C6), unified behind one data
//! model (spec §4.5, §4.6).

pub mod binary;
pub mod model;
pub mod protobuf;
pub mod varint;

pub use model::{Channel, DatedTile, Layer, Node, QuadtreePacket};
pub use varint::Cursor;
