//! Helpers behind the `datadiver` binary.

use std::path::Path;
use std::time::Duration;

use catalog::{CatalogError, Registry};
use clap::Args;
use foundation::bounds::LngLatBounds;
use foundation::geo::FeatureCollection;
use serde::Serialize;
use streaming::QuerySpec;

/// SoQL clauses accepted by the data commands.
#[derive(Args, Debug, Clone, Default)]
pub struct QueryArgs {
    /// `$select` clause
    #[arg(long)]
    pub select: Option<String>,

    /// `$where` clause, e.g. "battalion = 'B02'"
    #[arg(long = "where")]
    pub filter: Option<String>,

    /// `$group` clause
    #[arg(long)]
    pub group: Option<String>,

    /// `$having` clause
    #[arg(long)]
    pub having: Option<String>,

    /// `$order` clause (defaults to the dataset's sort)
    #[arg(long)]
    pub order: Option<String>,

    /// `$limit` (page size)
    #[arg(long)]
    pub limit: Option<u32>,

    /// `$offset`
    #[arg(long)]
    pub offset: Option<u64>,

    /// Full-text search (`$q`)
    #[arg(long = "q")]
    pub search: Option<String>,
}

impl QueryArgs {
    pub fn to_query(&self) -> QuerySpec {
        QuerySpec {
            select: self.select.clone(),
            filter: self.filter.clone(),
            group: self.group.clone(),
            having: self.having.clone(),
            order: self.order.clone(),
            limit: self.limit,
            offset: self.offset,
            search: self.search.clone(),
        }
    }
}

/// Built-in registry, optionally replaced by a JSON registry document and
/// rebased onto another host.
pub fn load_registry(path: Option<&Path>, base_url: Option<&str>) -> Result<Registry, CatalogError> {
    let registry = match path {
        Some(path) => Registry::load(path)?,
        None => Registry::sf_open_data(),
    };
    Ok(match base_url {
        Some(base) => registry.with_base_url(base.trim_end_matches('/')),
        None => registry,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetRow {
    pub key: String,
    pub id: String,
    pub name: String,
    pub ttl_secs: u64,
    pub geo: bool,
    pub endpoint: String,
}

/// One row per dataset. `default_ttl` is the TTL the fetcher applies to
/// descriptors without an override.
pub fn dataset_rows(registry: &Registry, default_ttl: Duration) -> Vec<DatasetRow> {
    registry
        .iter()
        .map(|d| DatasetRow {
            key: d.key.clone(),
            id: d.id.clone(),
            name: d.name.clone(),
            ttl_secs: d.cache_ttl_or(default_ttl).as_secs(),
            geo: d.has_geo(),
            endpoint: d.resolve_endpoint(registry.base_url()),
        })
        .collect()
}

/// What `overlay` reports once the synchronizer settles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlaySummary {
    pub dataset: String,
    pub rows: usize,
    pub features: usize,
    pub skipped: usize,
    pub bounds: Option<LngLatBounds>,
    pub state: String,
    pub layers: Vec<String>,
}

impl OverlaySummary {
    pub fn new(dataset: &str, rows: usize, features: &FeatureCollection) -> Self {
        Self {
            dataset: dataset.to_string(),
            rows,
            features: features.len(),
            skipped: rows.saturating_sub(features.len()),
            bounds: features.bounds(),
            state: String::new(),
            layers: Vec::new(),
        }
    }
}
