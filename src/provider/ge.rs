//! Google Earth TimeMachine protocol client (C7, spec §4.7).
//!
//! Two independent database contexts are held as explicit values rather
//! than shared mutable fields on one client struct, so using the
//! current-imagery key against a TimeMachine payload (the historic
//! reference bug, spec §4.1) is unrepresentable here: each fetch always
//! takes the context it needs as an argument, never reaches for a key
//! cached somewhere else.

use tokio::sync::RwLock;

use crate::codec;
use crate::dates::{self, PackedDate};
use crate::error::{Error, Result, TraversalError};
use crate::packet::{binary, protobuf, DatedTile, QuadtreePacket};
use crate::quadtree::QuadtreePath;

/// The two database contexts this client can traverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Database {
    /// The legacy current-imagery database (`kh.google.com`, binary packets).
    Current,
    /// The TimeMachine database (`khmdb.google.com?db=tm`, group-wire protobuf).
    TimeMachine,
}

/// A database's encryption key and root epoch, populated once by
/// initialization and shared-read afterward (spec §5).
#[derive(Debug, Clone)]
pub struct DbContext {
    pub encryption_key: Vec<u8>,
    pub root_epoch: u64,
}

/// One entry from a tile's imagery-history layer, with its date decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatedTileInfo {
    pub date: PackedDate,
    pub epoch: u64,
    pub provider: u32,
}

impl DatedTileInfo {
    pub fn hex_date(&self) -> String {
        dates::to_hex(self.date.pack())
    }
}

/// A default newest-first list of epochs observed to serve tiles for date
/// ranges the metadata doesn't advertise (spec §4.7 step 4, §9 open
/// question: the reference uses different lists at different call sites;
/// this crate exposes one configurable sequence rather than pinning values).
pub fn default_known_good_epochs() -> Vec<u64> {
    vec![396, 385, 377, 368, 360, 359, 350, 341, 330]
}

const CURRENT_DB_ROOT_URL: &str = "https://khmdb.google.com/dbRoot.v5?&hl=en&gl=us&output=proto";
const TM_DB_ROOT_URL: &str = "https://khmdb.google.com/dbRoot.v5?db=tm&hl=en&gl=us&output=proto";

/// The Google Earth client (C7).
pub struct GeClient {
    http: reqwest::Client,
    current_db: RwLock<Option<DbContext>>,
    tm_db: RwLock<Option<DbContext>>,
    known_good_epochs: Vec<u64>,
}

impl GeClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            current_db: RwLock::new(None),
            tm_db: RwLock::new(None),
            known_good_epochs: default_known_good_epochs(),
        }
    }

    pub fn with_known_good_epochs(mut self, epochs: Vec<u64>) -> Self {
        self.known_good_epochs = epochs;
        self
    }

    /// Fetch and parse the encrypted dbRoot for `db`, populating its
    /// context. Idempotent: re-initializing simply refreshes the context.
    pub async fn initialize(&self, db: Database) -> Result<()> {
        let url = match db {
            Database::Current => CURRENT_DB_ROOT_URL,
            Database::TimeMachine => TM_DB_ROOT_URL,
        };

        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::network(format!(
                "dbRoot fetch for {db:?} failed with status {}",
                response.status()
            )));
        }
        let body = response.bytes().await?;

        let (encryption_key, encrypted_envelope) = parse_db_root_envelope(&body)?;
        let decoded = codec::decrypt_and_decompress(&encryption_key, &encrypted_envelope)?;
        let root_epoch = parse_root_epoch(&decoded)?;

        let context = DbContext {
            encryption_key,
            root_epoch,
        };

        match db {
            Database::Current => *self.current_db.write().await = Some(context),
            Database::TimeMachine => *self.tm_db.write().await = Some(context),
        }
        tracing::info!("initialized {db:?} database, root_epoch={root_epoch}");
        Ok(())
    }

    async fn context(&self, db: Database) -> Result<DbContext> {
        let lock = match db {
            Database::Current => &self.current_db,
            Database::TimeMachine => &self.tm_db,
        };
        lock.read()
            .await
            .clone()
            .ok_or_else(|| Error::validation(format!("{db:?} database not initialized")))
    }

    fn packet_url(db: Database, path: &QuadtreePath, epoch: u64) -> String {
        match db {
            Database::Current => format!(
                "https://kh.google.com/flatfile?q2-{}-q.{}",
                path.as_str(),
                epoch
            ),
            Database::TimeMachine => format!(
                "https://khmdb.google.com/flatfile?db=tm&qp-{}-q.{}",
                path.as_str(),
                epoch
            ),
        }
    }

    async fn fetch_packet_at(
        &self,
        db: Database,
        path: &QuadtreePath,
        epoch: u64,
        key: &[u8],
    ) -> Result<QuadtreePacket> {
        let url = Self::packet_url(db, path, epoch);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| TraversalError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(TraversalError::PacketMissing(path.as_str().to_string()).into());
        }
        if !response.status().is_success() {
            return Err(TraversalError::Network(format!(
                "packet fetch returned {}",
                response.status()
            ))
            .into());
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TraversalError::Network(e.to_string()))?;
        let decoded = codec::decrypt_and_decompress(key, &body)?;

        match db {
            Database::Current => binary::parse_packet(&decoded),
            Database::TimeMachine => protobuf::parse_packet(&decoded),
        }
    }

    /// Traverse from root to the packet covering `path`, following
    /// cache-node-epoch pointers at each packet boundary (spec §4.7).
    /// Returns the final packet and the sub-index of `path` within it.
    async fn traverse(&self, db: Database, path: &QuadtreePath) -> Result<(QuadtreePacket, u32)> {
        let context = self.context(db).await?;
        let root_path = QuadtreePath::parse("0")?;
        let mut packet = self.fetch_packet_at(db, &root_path, context.root_epoch, &context.encryption_key).await?;

        for prefix in path.traversal_paths() {
            let sub_index = prefix.sub_index();
            let node = packet
                .node(sub_index)
                .ok_or_else(|| TraversalError::NodeMissingAtPath(prefix.as_str().to_string()))?;

            if node.needs_child_packet() {
                let epoch = node.cache_node_epoch;
                packet = self
                    .fetch_packet_at(db, &prefix, epoch, &context.encryption_key)
                    .await?;
            }
        }

        let sub_index = path.sub_index();
        Ok((packet, sub_index))
    }

    /// Dates of imagery available for this specific tile (spec §4.7).
    pub async fn available_dates(&self, path: &QuadtreePath) -> Result<Vec<DatedTileInfo>> {
        let (packet, sub_index) = self.traverse(Database::TimeMachine, path).await?;
        let node = packet
            .node(sub_index)
            .ok_or_else(|| TraversalError::NodeMissingAtPath(path.as_str().to_string()))?;

        let history = node.imagery_history().unwrap_or(&[]);
        Ok(history
            .iter()
            .filter_map(dated_tile_info)
            .collect())
    }

    /// Fetch current (non-historical) imagery for `path` (spec §4.7).
    pub async fn fetch_current_tile(&self, path: &QuadtreePath) -> Result<Vec<u8>> {
        let (packet, sub_index) = self.traverse(Database::Current, path).await?;
        let node = packet
            .node(sub_index)
            .ok_or_else(|| TraversalError::NodeMissingAtPath(path.as_str().to_string()))?;
        let epoch = node
            .imagery_epoch()
            .ok_or_else(|| Error::TileUnavailable {
                tile: path.as_str().to_string(),
                date: None,
            })?;

        let context = self.context(Database::Current).await?;
        let url = format!(
            "https://kh.google.com/flatfile?f1-{}-i.{}",
            path.as_str(),
            epoch
        );
        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::TileUnavailable {
                tile: path.as_str().to_string(),
                date: None,
            });
        }
        if !response.status().is_success() {
            return Err(Error::network(format!(
                "current tile fetch returned {}",
                response.status()
            )));
        }

        let mut body = response.bytes().await?.to_vec();
        codec::xor_decrypt(&context.encryption_key, &mut body);
        Ok(body)
    }

    async fn try_historical_fetch(
        &self,
        path: &QuadtreePath,
        epoch: u64,
        hex_date: &str,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let url = format!(
            "https://khmdb.google.com/flatfile?db=tm&f1-{}-i.{}-{}",
            path.as_str(),
            epoch,
            hex_date
        );
        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::network(format!(
                "historical tile fetch returned {}",
                response.status()
            )));
        }
        let mut body = response.bytes().await?.to_vec();
        codec::xor_decrypt(key, &mut body);
        Ok(Some(body))
    }

    /// Historical tile fetch with epoch negotiation (spec §4.7): the
    /// metadata epoch is often wrong, so this tries the advertised epoch,
    /// then other epochs seen for this tile ranked by frequency, then a
    /// static known-good fallback list, before giving up.
    pub async fn fetch_historical_tile(
        &self,
        path: &QuadtreePath,
        requested_hex_date: &str,
    ) -> Result<Vec<u8>> {
        let context = self.context(Database::TimeMachine).await?;
        let requested_packed =
            dates::from_hex(requested_hex_date).ok_or_else(|| Error::validation("bad hex date"))?;

        let history = self.available_dates(path).await?;

        let matching = history
            .iter()
            .find(|d| d.hex_date() == requested_hex_date)
            .copied();

        let nearest = matching.or_else(|| {
            history
                .iter()
                .min_by_key(|d| (d.date.pack() as i64 - requested_packed as i64).abs())
                .copied()
        });

        if let Some(candidate) = nearest {
            if let Some(bytes) = self
                .try_historical_fetch(path, candidate.epoch, requested_hex_date, &context.encryption_key)
                .await?
            {
                return Ok(bytes);
            }
        }

        let mut tried: Vec<u64> = nearest.map(|c| c.epoch).into_iter().collect();

        // Step 3: other epochs seen for this tile, most-common-first.
        let mut counts: std::collections::HashMap<u64, u32> = std::collections::HashMap::new();
        for d in &history {
            *counts.entry(d.epoch).or_insert(0) += 1;
        }
        let mut by_frequency: Vec<(u64, u32)> = counts.into_iter().collect();
        by_frequency.sort_by(|a, b| b.1.cmp(&a.1));

        for (epoch, _) in by_frequency {
            if tried.contains(&epoch) {
                continue;
            }
            tried.push(epoch);
            if let Some(bytes) = self
                .try_historical_fetch(path, epoch, requested_hex_date, &context.encryption_key)
                .await?
            {
                return Ok(bytes);
            }
        }

        // Step 4: static known-good fallback list, newest first.
        for &epoch in &self.known_good_epochs {
            if tried.contains(&epoch) {
                continue;
            }
            tried.push(epoch);
            if let Some(bytes) = self
                .try_historical_fetch(path, epoch, requested_hex_date, &context.encryption_key)
                .await?
            {
                return Ok(bytes);
            }
        }

        Err(Error::TileUnavailable {
            tile: path.as_str().to_string(),
            date: Some(requested_hex_date.to_string()),
        })
    }
}

fn dated_tile_info(tile: &DatedTile) -> Option<DatedTileInfo> {
    let date = tile.date()?;
    Some(DatedTileInfo {
        date,
        epoch: tile.dated_tile_epoch,
        provider: tile.provider,
    })
}

/// Parse the outer dbRoot envelope: a standard (non-group) protobuf message
/// with field 2 = encryption key (length-delimited) and field 3 = the
/// encrypted+compressed DbRootProto payload (length-delimited). The exact
/// schema is unpublished; this crate assigns these field numbers itself
/// from observed wire shapes, exactly as `packet::protobuf` does for the
/// TimeMachine packet format.
fn parse_db_root_envelope(buf: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    use crate::packet::varint::Cursor;

    let mut cursor = Cursor::new(buf);
    let mut key: Option<Vec<u8>> = None;
    let mut payload: Option<Vec<u8>> = None;

    while !cursor.is_empty() {
        let tag = cursor.read_varint()?;
        let field = (tag >> 3) as u32;
        let wire_type = (tag & 0x7) as u8;

        match (field, wire_type) {
            (2, 2) => {
                let len = cursor.read_varint()? as usize;
                key = Some(cursor.read_bytes(len)?.to_vec());
            }
            (3, 2) => {
                let len = cursor.read_varint()? as usize;
                payload = Some(cursor.read_bytes(len)?.to_vec());
            }
            (_, 0) => {
                cursor.read_varint()?;
            }
            (_, 2) => {
                let len = cursor.read_varint()? as usize;
                cursor.read_bytes(len)?;
            }
            (_, 1) => cursor.skip(8)?,
            (_, 5) => cursor.skip(4)?,
            _ => return Err(Error::parse("dbRoot: unsupported wire type at top level")),
        }
    }

    let key = key.ok_or_else(|| Error::parse("dbRoot: missing encryption key field"))?;
    let payload = payload.ok_or_else(|| Error::parse("dbRoot: missing encrypted payload field"))?;
    Ok((key, payload))
}

/// Extract the root quadtree version from a decrypted, decompressed
/// DbRootProto. Field 1 is this crate's own assignment for the root
/// epoch, matching the convention in [`parse_db_root_envelope`].
fn parse_root_epoch(buf: &[u8]) -> Result<u64> {
    use crate::packet::varint::Cursor;

    let mut cursor = Cursor::new(buf);
    while !cursor.is_empty() {
        let tag = cursor.read_varint()?;
        let field = (tag >> 3) as u32;
        let wire_type = (tag & 0x7) as u8;

        match (field, wire_type) {
            (1, 0) => return cursor.read_varint(),
            (_, 0) => {
                cursor.read_varint()?;
            }
            (_, 2) => {
                let len = cursor.read_varint()? as usize;
                cursor.read_bytes(len)?;
            }
            (_, 1) => cursor.skip(8)?,
            (_, 5) => cursor.skip(4)?,
            _ => return Err(Error::parse("DbRootProto: unsupported wire type")),
        }
    }
    Err(Error::parse("DbRootProto: root epoch field not present"))
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

    fn tag(field: u32, wire: u8) -> Vec<u8> {
        encode_varint(((field as u64) << 3) | wire as u64)
    }

    #[test]
    fn parses_db_root_envelope() {
        let mut buf = Vec::new();
        buf.extend(tag(2, 2));
        buf.extend(encode_varint(3));
        buf.extend([1, 2, 3]);
        buf.extend(tag(3, 2));
        buf.extend(encode_varint(2));
        buf.extend([9, 9]);

        let (key, payload) = parse_db_root_envelope(&buf).unwrap();
        assert_eq!(key, vec![1, 2, 3]);
        assert_eq!(payload, vec![9, 9]);
    }

    #[test]
    fn parses_root_epoch() {
        let mut buf = Vec::new();
        buf.extend(tag(1, 0));
        buf.extend(encode_varint(777));
        assert_eq!(parse_root_epoch(&buf).unwrap(), 777);
    }

    #[test]
    fn known_good_epochs_list_is_newest_first_and_non_empty() {
        let epochs = default_known_good_epochs();
        assert!(!epochs.is_empty());
        assert!(epochs.windows(2).all(|w| w[0] >= w[1]));
    }
}
