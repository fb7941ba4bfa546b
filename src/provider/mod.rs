//! Provider clients: the Google Earth TimeMachine protocol (C7) and the
//! Esri Wayback WMTS service (C8).

pub mod esri;
pub mod ge;

pub use esri::EsriClient;
pub use ge::GeClient;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CONNECTION, USER_AGENT};
use std::time::Duration;

/// Build the shared, connection-pooled HTTP client used by both provider
/// clients, with the exact headers Google Earth Pro sends (spec §6).
/// Every request carries an explicit deadline so no handler thread can be
/// suspended indefinitely (spec §5).
pub fn build_http_client(deadline: Duration) -> reqwest::Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static("GoogleEarth/7.3.6.9796(Win;Intel)"),
    );
    headers.insert(ACCEPT, HeaderValue::from_static("image/*, */*"));
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,*"));
    headers.insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(deadline)
        .build()
}

/// The default request deadline (spec §5).
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
