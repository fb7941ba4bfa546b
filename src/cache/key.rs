//! Cache key identity: (provider, z, x, y, date) (spec §4.9, §3).

use std::fmt;

/// The two imagery providers the cache stores tiles for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    GoogleEarth,
    EsriWayback,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::GoogleEarth => "google_earth",
            Provider::EsriWayback => "esri_wayback",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sentinel directory name used for the empty ("current") date.
pub const CURRENT_DATE_DIR: &str = "_current";

/// A cache entry's identity. `date` is the ISO-8601 human date, or `None`
/// for the provider's "current" imagery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub provider: Provider,
    pub z: u8,
    pub x: u32,
    pub y: u32,
    pub date: Option<String>,
}

impl CacheKey {
    pub fn new(provider: Provider, z: u8, x: u32, y: u32, date: Option<String>) -> Self {
        CacheKey { provider, z, x, y, date }
    }

    /// The index map key: a single string uniquely identifying this entry.
    pub fn index_key(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.provider.as_str(),
            self.date_dir(),
            self.z,
            self.x,
            self.y
        )
    }

    /// The directory name for this key's date, mapping the empty/absent
    /// date to the `_current` sentinel.
    pub fn date_dir(&self) -> &str {
        match &self.date {
            Some(d) if !d.is_empty() => d.as_str(),
            _ => CURRENT_DATE_DIR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_date_maps_to_sentinel_dir() {
        let key = CacheKey::new(Provider::GoogleEarth, 10, 1, 2, None);
        assert_eq!(key.date_dir(), "_current");

        let key = CacheKey::new(Provider::GoogleEarth, 10, 1, 2, Some(String::new()));
        assert_eq!(key.date_dir(), "_current");
    }

    #[test]
    fn index_key_is_stable() {
        let key = CacheKey::new(
            Provider::EsriWayback,
            12,
            100,
            200,
            Some("2024-05-01".to_string()),
        );
        assert_eq!(key.index_key(), "esri_wayback/2024-05-01/12/100/200");
    }
}
