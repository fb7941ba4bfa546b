//! Shared packet data model produced by both the legacy binary parser (C5)
//! and the group-wire protobuf parser (C6), so C7 can traverse either
//! source uniformly (spec §4.5, §4.6).

use std::collections::BTreeMap;

use crate::dates::PackedDate;

/// A snapshot of a quadtree subtree: a packet epoch and a sparse map from
/// sub-index to node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuadtreePacket {
    pub packet_epoch: u64,
    pub nodes: BTreeMap<u32, Node>,
}

impl QuadtreePacket {
    pub fn node(&self, sub_index: u32) -> Option<&Node> {
        self.nodes.get(&sub_index)
    }
}

/// A single quadtree node. `channels` is populated only by the legacy
/// binary format (C5); `layers` is populated by both sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub cache_node_epoch: u64,
    pub channels: Vec<Channel>,
    pub layers: Vec<Layer>,
}

impl Node {
    /// Whether this node's subtree has been superseded and must be
    /// re-fetched as a fresh packet (spec §4.7).
    pub fn needs_child_packet(&self) -> bool {
        self.cache_node_epoch != 0
    }

    /// The epoch to use for a current-imagery tile fetch: prefer a
    /// channel of type 2, falling back to an imagery-type layer.
    pub fn imagery_epoch(&self) -> Option<u64> {
        self.channels
            .iter()
            .find(|c| c.channel_type == 2)
            .map(|c| c.epoch)
            .or_else(|| {
                self.layers.iter().find_map(|l| match l {
                    Layer::Imagery { layer_epoch } => Some(*layer_epoch),
                    _ => None,
                })
            })
    }

    /// The imagery-history layer's dated tiles, if this node carries one.
    pub fn imagery_history(&self) -> Option<&[DatedTile]> {
        self.layers.iter().find_map(|l| match l {
            Layer::ImageryHistory { dates, .. } => Some(dates.as_slice()),
            _ => None,
        })
    }
}

/// A current-imagery channel record, from the legacy binary format only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub channel_type: u32,
    pub epoch: u64,
}

/// A node's layer. `type` 0-3 maps to imagery/terrain/vector/imagery-history;
/// unknown types are kept opaque rather than dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    Imagery { layer_epoch: u64 },
    Terrain { layer_epoch: u64 },
    Vector { layer_epoch: u64 },
    ImageryHistory { layer_epoch: u64, dates: Vec<DatedTile> },
    Unknown { type_id: u32, layer_epoch: u64 },
}

/// One entry in an imagery-history layer: a date this tile has imagery for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatedTile {
    pub packed_date: u32,
    pub dated_tile_epoch: u64,
    pub provider: u32,
}

impl DatedTile {
    /// The decoded calendar date, or `None` if the packed value is in the
    /// invalid domain (`<= 545`, spec §4.2) — such entries should be
    /// filtered rather than surfaced.
    pub fn date(&self) -> Option<PackedDate> {
        crate::dates::decode(self.packed_date)
    }

    pub fn hex_date(&self) -> String {
        crate::dates::to_hex(self.packed_date)
    }
}
