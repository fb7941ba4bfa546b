//! Esri Wayback WMTS client (C8, spec §4.8).

use chrono::{NaiveDate, TimeZone, Utc};
use quick_xml::events::Event;
use quick_xml::reader::Reader as XmlReader;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::tile::XyzTile;

const CAPABILITIES_URL: &str = "https://wayback.maptiles.arcgis.com/arcgis/rest/services/world_imagery/mapserver/wmts/1.0.0/wmtscapabilities.xml";

/// One Wayback layer, parsed from the WMTS capabilities document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsriLayer {
    pub id: u32,
    pub title: String,
    pub date: NaiveDate,
    pub identifier: String,
    pub tile_url_template: String,
    pub matrix_set: String,
}

impl EsriLayer {
    pub fn tile_url(&self, z: u8, x: u32, y: u32) -> String {
        self.tile_url_template
            .replace("{level}", &z.to_string())
            .replace("{z}", &z.to_string())
            .replace("{row}", &y.to_string())
            .replace("{y}", &y.to_string())
            .replace("{col}", &x.to_string())
            .replace("{x}", &x.to_string())
    }

    fn tilemap_url(&self, z: u8, x: u32, y: u32) -> String {
        format!(
            "https://wayback.maptiles.arcgis.com/arcgis/rest/services/world_imagery/mapserver/tilemap/{}/{}/{}/{}",
            self.id, z, y, x
        )
    }
}

/// A (tile, layer, layer-date, capture-date) record produced by walking
/// layers newest->oldest (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsriDatedTile {
    pub layer_id: u32,
    pub layer_date: NaiveDate,
    pub capture_date: NaiveDate,
}

#[derive(Debug, Deserialize)]
struct TilemapResponse {
    data: Vec<u8>,
    #[serde(default)]
    select: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct IdentifyResponse {
    #[serde(default)]
    results: Vec<IdentifyResult>,
}

#[derive(Debug, Deserialize)]
struct IdentifyResult {
    #[serde(default)]
    attributes: serde_json::Value,
}

/// The Esri Wayback client (C8).
pub struct EsriClient {
    http: reqwest::Client,
    layers: RwLock<Vec<EsriLayer>>,
}

impl EsriClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            layers: RwLock::new(Vec::new()),
        }
    }

    /// Fetch and parse WMTS capabilities, storing layers sorted newest-date-first.
    pub async fn initialize(&self) -> Result<()> {
        let response = self.http.get(CAPABILITIES_URL).send().await?;
        if !response.status().is_success() {
            return Err(Error::network(format!(
                "WMTS capabilities fetch failed with status {}",
                response.status()
            )));
        }
        let body = response.text().await?;
        let mut layers = parse_capabilities(&body)?;
        layers.sort_by(|a, b| b.date.cmp(&a.date));

        tracing::info!("parsed {} Esri Wayback layers", layers.len());
        *self.layers.write().await = layers;
        Ok(())
    }

    pub async fn layers(&self) -> Vec<EsriLayer> {
        self.layers.read().await.clone()
    }

    /// The newest layer whose date is on or before `date`, matching the
    /// Wayback "as of this date" semantics.
    pub async fn layer_for_date(&self, date: NaiveDate) -> Option<EsriLayer> {
        self.layers
            .read()
            .await
            .iter()
            .find(|l| l.date <= date)
            .cloned()
    }

    /// Walk layers newest->oldest consulting the tilemap availability
    /// bitmap and the point-query metadata service, emitting a dated-tile
    /// entry whenever the capture date changes from the previous entry
    /// (spec §4.8; deduplicates runs of identical imagery across layers).
    pub async fn available_dates(&self, tile: XyzTile) -> Result<Vec<EsriDatedTile>> {
        let layers = self.layers.read().await.clone();
        let mut out = Vec::new();
        let mut last_capture_date: Option<NaiveDate> = None;

        let mut index = 0usize;
        while index < layers.len() {
            let layer = &layers[index];
            let tilemap = self.fetch_tilemap(layer, tile).await?;

            if tilemap.data.first().copied().unwrap_or(0) != 1 {
                index = match tilemap.select {
                    Some(next_id) => layers
                        .iter()
                        .position(|l| l.id == next_id)
                        .unwrap_or(index + 1),
                    None => index + 1,
                };
                continue;
            }

            let capture_date = self
                .point_query_capture_date(layer, tile)
                .await
                .unwrap_or(layer.date);

            if last_capture_date != Some(capture_date) {
                out.push(EsriDatedTile {
                    layer_id: layer.id,
                    layer_date: layer.date,
                    capture_date,
                });
                last_capture_date = Some(capture_date);
            }

            index = match tilemap.select {
                Some(next_id) => layers
                    .iter()
                    .position(|l| l.id == next_id)
                    .unwrap_or(index + 1),
                None => index + 1,
            };
        }

        Ok(out)
    }

    async fn fetch_tilemap(&self, layer: &EsriLayer, tile: XyzTile) -> Result<TilemapResponse> {
        let url = layer.tilemap_url(tile.z, tile.x, tile.y);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::network(format!(
                "tilemap fetch returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// Best-effort capture-date lookup via the layer's point-query metadata
    /// endpoint (field `SRC_DATE2`, ms since epoch). Falls back silently to
    /// the layer's own date on any failure.
    async fn point_query_capture_date(&self, layer: &EsriLayer, tile: XyzTile) -> Option<NaiveDate> {
        let (lon, lat) = crate::tile::xyz_tile_center_to_lonlat(tile.x, tile.y, tile.z);
        let url = format!(
            "https://wayback.maptiles.arcgis.com/arcgis/rest/services/world_imagery/mapserver/{}/identify",
            layer.id
        );
        let response = self
            .http
            .get(&url)
            .query(&[
                ("geometry", format!("{lon},{lat}")),
                ("geometryType", "esriGeometryPoint".to_string()),
                ("sr", "4326".to_string()),
                ("tolerance", "1".to_string()),
                ("mapExtent", format!("{lon},{lat},{lon},{lat}")),
                ("imageDisplay", "1,1,96".to_string()),
                ("returnGeometry", "false".to_string()),
                ("f", "json".to_string()),
            ])
            .send()
            .await
            .ok()?;

        let parsed: IdentifyResponse = response.json().await.ok()?;
        let attrs = parsed.results.first()?.attributes.as_object()?;
        let millis = attrs.get("SRC_DATE2")?.as_i64()?;
        Utc.timestamp_millis_opt(millis).single().map(|dt| dt.date_naive())
    }

    /// Fetch JPEG bytes for a tile from a specific layer (spec §4.8: no
    /// decryption, Esri already serves plain JPEG).
    pub async fn fetch_tile(&self, layer: &EsriLayer, tile: XyzTile) -> Result<Vec<u8>> {
        let url = layer.tile_url(tile.z, tile.x, tile.y);
        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::TileUnavailable {
                tile: format!("{}/{}/{}", tile.z, tile.x, tile.y),
                date: Some(layer.date.to_string()),
            });
        }
        if !response.status().is_success() {
            return Err(Error::network(format!("esri tile fetch returned {}", response.status())));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Parse `Layer` elements out of the WMTS capabilities XML. Date is parsed
/// from the title's `(Wayback YYYY-MM-DD)` suffix.
fn parse_capabilities(xml: &str) -> Result<Vec<EsriLayer>> {
    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut layers = Vec::new();
    let mut buf = Vec::new();

    let mut in_layer = false;
    let mut title: Option<String> = None;
    let mut identifier: Option<String> = None;
    let mut tile_url_template: Option<String> = None;
    let mut matrix_set: Option<String> = None;
    let mut text_target: Option<&'static str> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"Layer" => {
                    in_layer = true;
                    title = None;
                    identifier = None;
                    tile_url_template = None;
                    matrix_set = None;
                }
                b"Title" if in_layer => text_target = Some("title"),
                b"Identifier" if in_layer => text_target = Some("identifier"),
                b"TileMatrixSet" if in_layer => text_target = Some("matrix_set"),
                b"ResourceURL" if in_layer => {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"template" {
                            tile_url_template =
                                Some(String::from_utf8_lossy(&attr.value).to_string());
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if let Some(target) = text_target {
                    let text = e.unescape().unwrap_or_default().to_string();
                    match target {
                        "title" => title = Some(text),
                        "identifier" => identifier = Some(text),
                        "matrix_set" => matrix_set = Some(text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                text_target = None;
                if e.local_name().as_ref() == b"Layer" && in_layer {
                    in_layer = false;
                    if let (Some(title), Some(identifier)) = (title.clone(), identifier.clone()) {
                        if let Some(date) = parse_wayback_date(&title) {
                            let id = identifier
                                .rsplit(|c: char| !c.is_ascii_digit())
                                .find(|s| !s.is_empty())
                                .and_then(|s| s.parse::<u32>().ok())
                                .unwrap_or(0);
                            layers.push(EsriLayer {
                                id,
                                title,
                                date,
                                identifier,
                                tile_url_template: tile_url_template.clone().unwrap_or_default(),
                                matrix_set: matrix_set.clone().unwrap_or_default(),
                            });
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(layers)
}

/// Parse a date out of a title formatted like `"... (Wayback 2023-05-01)"`.
fn parse_wayback_date(title: &str) -> Option<NaiveDate> {
    let start = title.rfind('(')?;
    let end = title.rfind(')')?;
    let inner = &title[start + 1..end];
    let date_str = inner.strip_prefix("Wayback ")?.trim();
    NaiveDate::parse_from_str(date_str, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wayback_date_from_title() {
        let date = parse_wayback_date("World Imagery (Wayback 2023-05-01)").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2023, 5, 1).unwrap());
    }

    #[test]
    fn rejects_title_without_date() {
        assert!(parse_wayback_date("World Imagery").is_none());
    }

    #[test]
    fn parses_minimal_capabilities_document() {
        let xml = r#"<Capabilities>
          <Contents>
            <Layer>
              <ows:Title>World Imagery (Wayback 2023-05-01)</ows:Title>
              <ows:Identifier>WB_2023_R01</ows:Identifier>
              <ResourceURL format="image/jpeg" resourceType="tile"
                template="https://wayback.maptiles.arcgis.com/arcgis/rest/services/world_imagery/mapserver/tile/10/{level}/{row}/{col}"/>
              <TileMatrixSet>default028mm</TileMatrixSet>
            </Layer>
            <Layer>
              <ows:Title>World Imagery (Wayback 2022-01-15)</ows:Title>
              <ows:Identifier>WB_2022_R01</ows:Identifier>
              <ResourceURL format="image/jpeg" resourceType="tile"
                template="https://wayback.maptiles.arcgis.com/arcgis/rest/services/world_imagery/mapserver/tile/9/{level}/{row}/{col}"/>
              <TileMatrixSet>default028mm</TileMatrixSet>
            </Layer>
          </Contents>
        </Capabilities>"#;

        let layers = parse_capabilities(xml).unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].identifier, "WB_2023_R01");
        assert_eq!(layers[0].date, NaiveDate::from_ymd_opt(2023, 5, 1).unwrap());
    }

    #[test]
    fn layer_tile_url_substitutes_placeholders() {
        let layer = EsriLayer {
            id: 10,
            title: "x".into(),
            date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            identifier: "WB_2023_R01".into(),
            tile_url_template:
                "https://host/mapserver/tile/10/{level}/{row}/{col}".to_string(),
            matrix_set: "default028mm".into(),
        };
        assert_eq!(
            layer.tile_url(12, 100, 200),
            "https://host/mapserver/tile/10/12/200/100"
        );
    }
}
