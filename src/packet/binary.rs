//! Legacy current-imagery binary packet parser (spec §4.5).
//!
//! Unlike the TimeMachine packets (§4.6), current-imagery packets predate
//! the group-wire protobuf format entirely: a flat, fixed-layout binary
//! record stream. There is no historical-dates concept at this layer — only
//! a node's channels and non-history layers — but the output shape is the
//! same `{sub-index -> Node}` map C6 produces, so C7 can traverse either
//! packet source with one code path.
//!
//! Record layout, little-endian, all counts/epochs as varints unless noted:
//! `node_count:varint, then for each node: sub_index:varint,
//! cache_node_epoch:varint, channel_count:u8,
//! [channel_type:u8, epoch:varint]*, layer_count:u8, [type:u8, layer_epoch:varint]*`.

use crate::error::{Error, Result};
use crate::packet::model::{Channel, Layer, Node, QuadtreePacket};
use crate::packet::varint::Cursor;

pub fn parse_packet(buf: &[u8]) -> Result<QuadtreePacket> {
    let mut cursor = Cursor::new(buf);
    let mut packet = QuadtreePacket::default();

    let node_count = cursor.read_varint()?;
    for _ in 0..node_count {
        let sub_index = cursor.read_varint()? as u32;
        let node = parse_node(&mut cursor)?;
        packet.nodes.insert(sub_index, node);
    }

    Ok(packet)
}

fn parse_node(cursor: &mut Cursor) -> Result<Node> {
    let cache_node_epoch = cursor.read_varint()?;

    let channel_count = cursor.read_u8()?;
    let mut channels = Vec::with_capacity(channel_count as usize);
    for _ in 0..channel_count {
        let channel_type = cursor.read_u8()? as u32;
        let epoch = cursor.read_varint()?;
        channels.push(Channel { channel_type, epoch });
    }

    let layer_count = cursor.read_u8()?;
    let mut layers = Vec::with_capacity(layer_count as usize);
    for _ in 0..layer_count {
        let type_id = cursor.read_u8()? as u32;
        let layer_epoch = cursor.read_varint()?;
        layers.push(match type_id {
            0 => Layer::Imagery { layer_epoch },
            1 => Layer::Terrain { layer_epoch },
            2 => Layer::Vector { layer_epoch },
            other => Layer::Unknown {
                type_id: other,
                layer_epoch,
            },
        });
    }

    Ok(Node {
        cache_node_epoch,
        channels,
        layers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_varint(mut value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                return out;
            }
            out.push(byte | 0x80);
        }
    }

    #[test]
    fn parses_empty_packet() {
        let buf = encode_varint(0);
        let packet = parse_packet(&buf).unwrap();
        assert!(packet.nodes.is_empty());
    }

    #[test]
    fn parses_node_with_channel_and_layer() {
        let mut buf = encode_varint(1); // node_count
        buf.extend(encode_varint(5)); // sub_index
        buf.extend(encode_varint(10)); // cache_node_epoch
        buf.push(1); // channel_count
        buf.push(2); // channel_type = 2 (preferred imagery channel)
        buf.extend(encode_varint(555)); // channel epoch
        buf.push(1); // layer_count
        buf.push(0); // layer type = imagery
        buf.extend(encode_varint(7)); // layer_epoch

        let packet = parse_packet(&buf).unwrap();
        let node = packet.node(5).unwrap();
        assert_eq!(node.cache_node_epoch, 10);
        assert_eq!(node.imagery_epoch(), Some(555));
    }

    #[test]
    fn falls_back_to_layer_imagery_epoch_without_preferred_channel() {
        let mut buf = encode_varint(1);
        buf.extend(encode_varint(0));
        buf.extend(encode_varint(0));
        buf.push(1);
        buf.push(9); // some other channel type, not 2
        buf.extend(encode_varint(999));
        buf.push(1);
        buf.push(0); // imagery layer
        buf.extend(encode_varint(42));

        let packet = parse_packet(&buf).unwrap();
        let node = packet.node(0).unwrap();
        assert_eq!(node.imagery_epoch(), Some(42));
    }

    #[test]
    fn rejects_truncated_input() {
        let buf = encode_varint(1); // claims one node, but no body follows
        assert!(parse_packet(&buf).is_err());
    }
}
