use serde::{Deserialize, Serialize};

/// Structured SoQL-style query parameters.
///
/// Every field is optional; unset fields and empty strings are left out of
/// the serialized query. Filter expressions are passed through verbatim, the
/// remote service is the one that validates them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub select: Option<String>,
    #[serde(rename = "where")]
    pub filter: Option<String>,
    pub group: Option<String>,
    pub having: Option<String>,
    pub order: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u64>,
    /// Full-text search (`$q`).
    pub search: Option<String>,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, v: impl Into<String>) -> Self {
        self.select = Some(v.into());
        self
    }

    pub fn filter(mut self, v: impl Into<String>) -> Self {
        self.filter = Some(v.into());
        self
    }

    pub fn group(mut self, v: impl Into<String>) -> Self {
        self.group = Some(v.into());
        self
    }

    pub fn having(mut self, v: impl Into<String>) -> Self {
        self.having = Some(v.into());
        self
    }

    pub fn order(mut self, v: impl Into<String>) -> Self {
        self.order = Some(v.into());
        self
    }

    pub fn limit(mut self, v: u32) -> Self {
        self.limit = Some(v);
        self
    }

    pub fn offset(mut self, v: u64) -> Self {
        self.offset = Some(v);
        self
    }

    pub fn search(mut self, v: impl Into<String>) -> Self {
        self.search = Some(v.into());
        self
    }

    /// Overlays `self` on `defaults`: any entry set here wins.
    ///
    /// An empty string counts as unset, so it never masks a default.
    pub fn merged_over(&self, defaults: &QuerySpec) -> QuerySpec {
        fn pick(ours: &Option<String>, theirs: &Option<String>) -> Option<String> {
            match ours {
                Some(v) if !v.is_empty() => Some(v.clone()),
                _ => theirs.clone(),
            }
        }
        QuerySpec {
            select: pick(&self.select, &defaults.select),
            filter: pick(&self.filter, &defaults.filter),
            group: pick(&self.group, &defaults.group),
            having: pick(&self.having, &defaults.having),
            order: pick(&self.order, &defaults.order),
            limit: self.limit.or(defaults.limit),
            offset: self.offset.or(defaults.offset),
            search: pick(&self.search, &defaults.search),
        }
    }

    /// `(name, value)` pairs in canonical order, empty entries dropped.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let text = [
            ("$select", &self.select),
            ("$where", &self.filter),
            ("$group", &self.group),
            ("$having", &self.having),
            ("$order", &self.order),
        ];

        let mut out: Vec<(&'static str, String)> = text
            .into_iter()
            .filter_map(|(k, v)| match v {
                Some(v) if !v.is_empty() => Some((k, v.clone())),
                _ => None,
            })
            .collect();

        if let Some(limit) = self.limit {
            out.push(("$limit", limit.to_string()));
        }
        if let Some(offset) = self.offset {
            out.push(("$offset", offset.to_string()));
        }
        if let Some(q) = self.search.as_ref().filter(|q| !q.is_empty()) {
            out.push(("$q", q.clone()));
        }
        out
    }

    /// Form-urlencoded query string, the same encoding a browser
    /// `URLSearchParams` produces.
    pub fn to_query_string(&self) -> String {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in self.params() {
            ser.append_pair(k, &v);
        }
        ser.finish()
    }
}

/// Cache key and request URL for one query against one endpoint.
pub fn request_url(endpoint: &str, query: &QuerySpec) -> String {
    let qs = query.to_query_string();
    if qs.is_empty() {
        endpoint.to_string()
    } else {
        format!("{endpoint}?{qs}")
    }
}
