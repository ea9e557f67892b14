//! Dataset registry.
//!
//! Each remote dataset is described once, at process start, by a
//! [`DatasetDescriptor`]. The registry is built up front and then shared
//! read-only (typically behind an `Arc`) by the fetcher and any UI code.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use foundation::geo::GeoField;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cache lifetime for descriptors that do not override it.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

pub const SF_OPEN_DATA_BASE_URL: &str = "https://data.sfgov.org";

/// Placeholder in endpoint templates replaced by the registry base URL.
pub const BASE_PLACEHOLDER: &str = "{base}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    PublicSafety,
    Transportation,
    #[default]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetDescriptor {
    /// Registry key used by callers (`fireIncidents`).
    pub key: String,
    /// Stable remote identifier (`wr8u-xric`). Cache keys embed it.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Endpoint template, e.g. `{base}/resource/wr8u-xric.json`.
    pub endpoint: String,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub geo: Option<GeoField>,
    #[serde(default)]
    pub default_sort: Option<String>,
    #[serde(default)]
    pub cache_ttl_ms: Option<u64>,
}

impl DatasetDescriptor {
    /// Descriptor for a Socrata resource served under `{base}/resource/<id>.json`.
    pub fn socrata(key: impl Into<String>, id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            key: key.into(),
            endpoint: format!("{BASE_PLACEHOLDER}/resource/{id}.json"),
            id,
            name: name.into(),
            description: String::new(),
            category: Category::Other,
            geo: None,
            default_sort: None,
            cache_ttl_ms: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn with_geo(mut self, geo: GeoField) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn with_default_sort(mut self, order: impl Into<String>) -> Self {
        self.default_sort = Some(order.into());
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_ms = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl_or(DEFAULT_CACHE_TTL)
    }

    /// This descriptor's TTL override, or `default` when it has none.
    pub fn cache_ttl_or(&self, default: Duration) -> Duration {
        self.cache_ttl_ms.map(Duration::from_millis).unwrap_or(default)
    }

    pub fn has_geo(&self) -> bool {
        self.geo.is_some()
    }

    pub fn resolve_endpoint(&self, base_url: &str) -> String {
        self.endpoint
            .replace(BASE_PLACEHOLDER, base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("dataset registered twice: {0}")]
    Duplicate(String),

    #[error("invalid registry document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read registry {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// On-disk registry document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryDocument {
    #[serde(default)]
    pub base_url: Option<String>,
    pub datasets: Vec<DatasetDescriptor>,
}

#[derive(Debug, Clone)]
pub struct Registry {
    base_url: String,
    entries: BTreeMap<String, DatasetDescriptor>,
}

impl Registry {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            entries: BTreeMap::new(),
        }
    }

    /// The San Francisco open data feeds the explorer ships with.
    pub fn sf_open_data() -> Self {
        let mut registry = Self::new(SF_OPEN_DATA_BASE_URL);
        for d in sf_open_data_descriptors() {
            registry.entries.insert(d.key.clone(), d);
        }
        registry
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn register(&mut self, descriptor: DatasetDescriptor) -> Result<(), CatalogError> {
        if self.entries.contains_key(&descriptor.key) {
            return Err(CatalogError::Duplicate(descriptor.key));
        }
        self.entries.insert(descriptor.key.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&DatasetDescriptor> {
        self.entries.get(key)
    }

    pub fn require(&self, key: &str) -> Result<&DatasetDescriptor, CatalogError> {
        self.get(key)
            .ok_or_else(|| CatalogError::UnknownDataset(key.to_string()))
    }

    pub fn endpoint(&self, key: &str) -> Result<String, CatalogError> {
        Ok(self.require(key)?.resolve_endpoint(&self.base_url))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &DatasetDescriptor> {
        self.entries.values()
    }

    /// Adds the descriptors of a registry document. A document base URL
    /// replaces the current one.
    pub fn extend_from_document(&mut self, doc: RegistryDocument) -> Result<(), CatalogError> {
        if let Some(base_url) = doc.base_url {
            self.base_url = base_url;
        }
        for d in doc.datasets {
            self.register(d)?;
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let doc: RegistryDocument = serde_json::from_str(json)?;
        let mut registry = Self::new(SF_OPEN_DATA_BASE_URL);
        registry.extend_from_document(doc)?;
        tracing::debug!(datasets = registry.len(), "parsed registry document");
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }
}

fn sf_open_data_descriptors() -> Vec<DatasetDescriptor> {
    vec![
        DatasetDescriptor::socrata("fireIncidents", "wr8u-xric", "Fire Incidents")
            .with_description("Non-medical fire incidents with response details and outcomes")
            .with_category(Category::PublicSafety)
            .with_geo(GeoField::point("point"))
            .with_default_sort("alarm_dttm DESC"),
        DatasetDescriptor::socrata("fireEMSDispatch", "nuek-vuh3", "Fire/EMS Dispatched Calls")
            .with_description("Per-unit dispatch records with full response timeline")
            .with_category(Category::PublicSafety)
            .with_geo(GeoField::point("case_location"))
            .with_default_sort("received_dttm DESC"),
        DatasetDescriptor::socrata(
            "policeIncidents",
            "wg3w-h783",
            "Police Incident Reports (2018+)",
        )
        .with_description("SFPD incident reports with crime categories and resolutions")
        .with_category(Category::PublicSafety)
        .with_geo(GeoField::point("point"))
        .with_default_sort("incident_datetime DESC"),
        DatasetDescriptor::socrata("dispatch911Realtime", "gnap-fj3t", "911 Dispatch (Real-Time)")
            .with_description("Live 911 dispatched calls, rolling 48-hour window")
            .with_category(Category::PublicSafety)
            .with_default_sort("received_datetime DESC")
            .with_cache_ttl(Duration::from_secs(60)),
        DatasetDescriptor::socrata(
            "dispatch911Historical",
            "2zdj-bwza",
            "911 Dispatch (Historical)",
        )
        .with_description("Closed law enforcement dispatched calls")
        .with_category(Category::PublicSafety)
        .with_default_sort("received_datetime DESC"),
        DatasetDescriptor::socrata("parkingRevenue", "imvp-dq3v", "Parking Meter Revenue")
            .with_description("Per-transaction parking meter payments")
            .with_category(Category::Transportation)
            .with_default_sort("session_start_dt DESC"),
        DatasetDescriptor::socrata("parkingMeters", "8vzz-qzz9", "Parking Meter Inventory")
            .with_description("All parking meters with locations and attributes")
            .with_category(Category::Transportation)
            .with_geo(GeoField::lat_lng("latitude", "longitude"))
            .with_cache_ttl(Duration::from_secs(60 * 60)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;

    #[test]
    fn builtin_registry_resolves_endpoints() {
        let r = Registry::sf_open_data();
        assert_eq!(r.len(), 7);
        assert_eq!(
            r.endpoint("fireIncidents").unwrap(),
            "https://data.sfgov.org/resource/wr8u-xric.json"
        );

        let r = r.with_base_url("http://127.0.0.1:9000/");
        assert_eq!(
            r.endpoint("parkingMeters").unwrap(),
            "http://127.0.0.1:9000/resource/8vzz-qzz9.json"
        );
    }

    #[test]
    fn ttl_overrides_and_default() {
        let r = Registry::sf_open_data();
        assert_eq!(
            r.get("dispatch911Realtime").unwrap().cache_ttl(),
            Duration::from_secs(60)
        );
        assert_eq!(
            r.get("parkingMeters").unwrap().cache_ttl(),
            Duration::from_secs(3600)
        );
        assert_eq!(r.get("fireIncidents").unwrap().cache_ttl(), DEFAULT_CACHE_TTL);
        assert_eq!(
            r.get("fireIncidents").unwrap().cache_ttl_or(Duration::from_secs(30)),
            Duration::from_secs(30)
        );
        assert_eq!(
            r.get("parkingMeters").unwrap().cache_ttl_or(Duration::from_secs(30)),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn unknown_key_is_an_error() {
        let r = Registry::sf_open_data();
        assert!(matches!(
            r.require("nope"),
            Err(CatalogError::UnknownDataset(k)) if k == "nope"
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut r = Registry::new("http://x");
        r.register(DatasetDescriptor::socrata("a", "aaaa-0000", "A"))
            .unwrap();
        assert!(matches!(
            r.register(DatasetDescriptor::socrata("a", "bbbb-1111", "B")),
            Err(CatalogError::Duplicate(_))
        ));
    }

    #[test]
    fn loads_registry_document_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "baseUrl": "https://data.example.org",
                "datasets": [{{
                    "key": "trees",
                    "id": "tree-0001",
                    "name": "Street Trees",
                    "endpoint": "{{base}}/resource/tree-0001.json",
                    "category": "other",
                    "geo": {{"kind": "lat_lng", "lat": "latitude", "lng": "longitude"}},
                    "cacheTtlMs": 3600000
                }}]
            }}"#
        )
        .unwrap();

        let r = Registry::load(file.path()).unwrap();
        assert_eq!(r.base_url(), "https://data.example.org");
        let d = r.require("trees").unwrap();
        assert_eq!(d.geo, Some(GeoField::lat_lng("latitude", "longitude")));
        assert_eq!(d.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(
            r.endpoint("trees").unwrap(),
            "https://data.example.org/resource/tree-0001.json"
        );
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Registry::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, CatalogError::Io { .. }));
        assert!(err.to_string().contains("here.json"));
    }
}
