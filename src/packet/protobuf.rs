//! Group-wire protobuf parser for TimeMachine quadtree packets (spec §4.6).
//!
//! `prost` only understands the four modern wire types; TimeMachine packets
//! still use the deprecated group wire types 3 (start) and 4 (end) for
//! every nested message, so this parser is hand-rolled directly over the
//! tag stream. Field numbers below are this crate's own assignment — the
//! wire format predates any published `.proto` — and are applied
//! consistently between encoder-side expectations (none; we only ever
//! decode) and this decoder.
//!
//! Field layout:
//! - Packet: 1 = packet_epoch (varint), 2 = sparse node entry (group, repeated)
//!   - entry: 1 = index (varint), 2 = node (group)
//! - Node: 1 = cache_node_epoch (varint), 2 = layer (group, repeated)
//! - Layer: 1 = type (varint), 2 = layer_epoch (varint), 3 = dates-layer (group)
//! - Dates-layer: 1 = dated-tile (group, repeated)
//! - DatedTile: 1 = date (varint), 2 = dated_tile_epoch (varint), 3 = provider (varint)
//!
//! Unknown fields and wire types are skipped without corrupting nesting;
//! a group end must match the field number of its start or parsing fails.

use crate::error::{Error, Result};
use crate::packet::model::{Channel, DatedTile, Layer, Node, QuadtreePacket};
use crate::packet::varint::Cursor;

const WIRE_VARINT: u8 = 0;
const WIRE_64BIT: u8 = 1;
const WIRE_LENGTH_DELIMITED: u8 = 2;
const WIRE_GROUP_START: u8 = 3;
const WIRE_GROUP_END: u8 = 4;
const WIRE_32BIT: u8 = 5;

fn read_tag(cursor: &mut Cursor) -> Result<(u32, u8)> {
    let tag = cursor.read_varint()?;
    let field_number = (tag >> 3) as u32;
    let wire_type = (tag & 0x7) as u8;
    Ok((field_number, wire_type))
}

/// Skip a single field's value of the given wire type. For `WIRE_GROUP_START`
/// this recursively skips until the matching end-group tag for `field_number`.
fn skip_value(cursor: &mut Cursor, wire_type: u8, field_number: u32) -> Result<()> {
    match wire_type {
        WIRE_VARINT => {
            cursor.read_varint()?;
        }
        WIRE_64BIT => cursor.skip(8)?,
        WIRE_LENGTH_DELIMITED => {
            let len = cursor.read_varint()? as usize;
            cursor.read_bytes(len)?;
        }
        WIRE_GROUP_START => skip_group(cursor, field_number)?,
        WIRE_32BIT => cursor.skip(4)?,
        WIRE_GROUP_END => {
            return Err(Error::parse("packet: unexpected end-group while skipping"));
        }
        other => return Err(Error::parse(format!("packet: unknown wire type {other}"))),
    }
    Ok(())
}

/// Consume fields until the end-group tag matching `field_number` is found.
fn skip_group(cursor: &mut Cursor, field_number: u32) -> Result<()> {
    loop {
        if cursor.is_empty() {
            return Err(Error::parse("packet: unterminated group"));
        }
        let (field, wire_type) = read_tag(cursor)?;
        if wire_type == WIRE_GROUP_END {
            if field != field_number {
                return Err(Error::parse(
                    "packet: end-group field number does not match start",
                ));
            }
            return Ok(());
        }
        skip_value(cursor, wire_type, field)?;
    }
}

/// Parse a TimeMachine quadtree packet from decrypted, decompressed bytes.
pub fn parse_packet(buf: &[u8]) -> Result<QuadtreePacket> {
    let mut cursor = Cursor::new(buf);
    let mut packet = QuadtreePacket::default();

    while !cursor.is_empty() {
        let (field, wire_type) = read_tag(&mut cursor)?;
        match (field, wire_type) {
            (1, WIRE_VARINT) => packet.packet_epoch = cursor.read_varint()?,
            (2, WIRE_GROUP_START) => {
                let (index, node) = parse_sparse_node_entry(&mut cursor, field)?;
                packet.nodes.insert(index, node);
            }
            (_, WIRE_GROUP_END) => {
                return Err(Error::parse("packet: stray end-group at top level"));
            }
            _ => skip_value(&mut cursor, wire_type, field)?,
        }
    }

    Ok(packet)
}

fn parse_sparse_node_entry(cursor: &mut Cursor, group_field: u32) -> Result<(u32, Node)> {
    let mut index = 0u32;
    let mut node = Node::default();

    loop {
        let (field, wire_type) = read_tag(cursor)?;
        if wire_type == WIRE_GROUP_END {
            if field != group_field {
                return Err(Error::parse("packet: mismatched sparse-node-entry end-group"));
            }
            return Ok((index, node));
        }

        match (field, wire_type) {
            (1, WIRE_VARINT) => index = cursor.read_varint()? as u32,
            (2, WIRE_GROUP_START) => node = parse_node(cursor, field)?,
            _ => skip_value(cursor, wire_type, field)?,
        }
    }
}

fn parse_node(cursor: &mut Cursor, group_field: u32) -> Result<Node> {
    let mut node = Node::default();

    loop {
        let (field, wire_type) = read_tag(cursor)?;
        if wire_type == WIRE_GROUP_END {
            if field != group_field {
                return Err(Error::parse("packet: mismatched node end-group"));
            }
            return Ok(node);
        }

        match (field, wire_type) {
            (1, WIRE_VARINT) => node.cache_node_epoch = cursor.read_varint()?,
            (2, WIRE_GROUP_START) => node.layers.push(parse_layer(cursor, field)?),
            _ => skip_value(cursor, wire_type, field)?,
        }
    }
}

fn parse_layer(cursor: &mut Cursor, group_field: u32) -> Result<Layer> {
    let mut type_id: u32 = 0;
    let mut layer_epoch: u64 = 0;
    let mut dates: Option<Vec<DatedTile>> = None;

    loop {
        let (field, wire_type) = read_tag(cursor)?;
        if wire_type == WIRE_GROUP_END {
            if field != group_field {
                return Err(Error::parse("packet: mismatched layer end-group"));
            }
            break;
        }

        match (field, wire_type) {
            (1, WIRE_VARINT) => type_id = cursor.read_varint()? as u32,
            (2, WIRE_VARINT) => layer_epoch = cursor.read_varint()?,
            (3, WIRE_GROUP_START) => dates = Some(parse_dates_layer(cursor, field)?),
            _ => skip_value(cursor, wire_type, field)?,
        }
    }

    Ok(match type_id {
        0 => Layer::Imagery { layer_epoch },
        1 => Layer::Terrain { layer_epoch },
        2 => Layer::Vector { layer_epoch },
        3 => Layer::ImageryHistory {
            layer_epoch,
            dates: dates.unwrap_or_default(),
        },
        other => Layer::Unknown {
            type_id: other,
            layer_epoch,
        },
    })
}

fn parse_dates_layer(cursor: &mut Cursor, group_field: u32) -> Result<Vec<DatedTile>> {
    let mut dates = Vec::new();

    loop {
        let (field, wire_type) = read_tag(cursor)?;
        if wire_type == WIRE_GROUP_END {
            if field != group_field {
                return Err(Error::parse("packet: mismatched dates-layer end-group"));
            }
            return Ok(dates);
        }

        match (field, wire_type) {
            (1, WIRE_GROUP_START) => dates.push(parse_dated_tile(cursor, field)?),
            _ => skip_value(cursor, wire_type, field)?,
        }
    }
}

fn parse_dated_tile(cursor: &mut Cursor, group_field: u32) -> Result<DatedTile> {
    let mut packed_date = 0u32;
    let mut dated_tile_epoch = 0u64;
    let mut provider = 0u32;

    loop {
        let (field, wire_type) = read_tag(cursor)?;
        if wire_type == WIRE_GROUP_END {
            if field != group_field {
                return Err(Error::parse("packet: mismatched dated-tile end-group"));
            }
            return Ok(DatedTile {
                packed_date,
                dated_tile_epoch,
                provider,
            });
        }

        match (field, wire_type) {
            (1, WIRE_VARINT) => packed_date = cursor.read_varint()? as u32,
            (2, WIRE_VARINT) => dated_tile_epoch = cursor.read_varint()?,
            (3, WIRE_VARINT) => provider = cursor.read_varint()? as u32,
            _ => skip_value(cursor, wire_type, field)?,
        }
    }
}

fn tag_bytes(field_number: u32, wire_type: u8) -> Vec<u8> {
    encode_varint(((field_number as u64) << 3) | wire_type as u64)
}

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

#[cfg(test)]
mod tests {
    use super::*;
    #[allow(unused_imports)]
    use crate::packet::model::Channel as _Channel;

    fn push_varint_field(buf: &mut Vec<u8>, field: u32, value: u64) {
        buf.extend(tag_bytes(field, WIRE_VARINT));
        buf.extend(encode_varint(value));
    }

    fn group(field: u32, body: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut buf = tag_bytes(field, WIRE_GROUP_START);
        body(&mut buf);
        buf.extend(tag_bytes(field, WIRE_GROUP_END));
        buf
    }

    #[test]
    fn parses_packet_epoch_only() {
        let mut buf = Vec::new();
        push_varint_field(&mut buf, 1, 42);
        let packet = parse_packet(&buf).unwrap();
        assert_eq!(packet.packet_epoch, 42);
        assert!(packet.nodes.is_empty());
    }

    #[test]
    fn parses_single_node_with_imagery_layer() {
        let mut buf = Vec::new();
        let entry = group(2, |buf| {
            push_varint_field(buf, 1, 7); // index
            let node = group(2, |buf| {
                push_varint_field(buf, 1, 99); // cache_node_epoch
                let layer = group(2, |buf| {
                    push_varint_field(buf, 1, 0); // type = imagery
                    push_varint_field(buf, 2, 123); // layer_epoch
                });
                buf.extend(layer);
            });
            buf.extend(node);
        });
        buf.extend(entry);

        let packet = parse_packet(&buf).unwrap();
        let node = packet.node(7).unwrap();
        assert_eq!(node.cache_node_epoch, 99);
        assert_eq!(node.imagery_epoch(), Some(123));
    }

    #[test]
    fn parses_imagery_history_layer_with_dated_tiles() {
        let mut buf = Vec::new();
        let dated_tile = group(1, |buf| {
            push_varint_field(buf, 1, 0xfd2be); // packed date (2025-01-30)
            push_varint_field(buf, 2, 360); // epoch
            push_varint_field(buf, 3, 1); // provider
        });
        let dates_layer = group(3, |buf| buf.extend(dated_tile));
        let layer = group(2, |buf| {
            push_varint_field(buf, 1, 3); // type = imagery-history
            push_varint_field(buf, 2, 5); // layer_epoch
            buf.extend(dates_layer);
        });
        let node = group(2, |buf| buf.extend(layer));
        let entry = group(2, |buf| {
            push_varint_field(buf, 1, 0);
            buf.extend(node);
        });
        buf.extend(entry);

        let packet = parse_packet(&buf).unwrap();
        let node = packet.node(0).unwrap();
        let history = node.imagery_history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].dated_tile_epoch, 360);
        assert_eq!(history[0].date().unwrap().to_iso(), "2025-01-30");
    }

    #[test]
    fn unknown_fields_and_group_are_skipped() {
        let mut buf = Vec::new();
        // an unknown varint field
        push_varint_field(&mut buf, 99, 12345);
        // an unknown length-delimited field
        buf.extend(tag_bytes(98, WIRE_LENGTH_DELIMITED));
        buf.extend(encode_varint(3));
        buf.extend([1, 2, 3]);
        // an unknown nested group, itself containing an unknown varint
        let unknown_group = group(97, |buf| push_varint_field(buf, 1, 1));
        buf.extend(unknown_group);
        push_varint_field(&mut buf, 1, 7);

        let packet = parse_packet(&buf).unwrap();
        assert_eq!(packet.packet_epoch, 7);
    }

    #[test]
    fn mismatched_end_group_is_an_error() {
        let mut buf = tag_bytes(2, WIRE_GROUP_START);
        buf.extend(tag_bytes(3, WIRE_GROUP_END)); // wrong field number
        assert!(parse_packet(&buf).is_err());
    }
}
