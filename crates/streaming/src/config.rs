use std::str::FromStr;
use std::time::Duration;

use catalog::DEFAULT_CACHE_TTL;
use serde::{Deserialize, Serialize};

/// Page size used when the caller sets no `$limit`.
pub const DEFAULT_LIMIT: u32 = 1000;
/// Largest page the data service hands out in one response.
pub const MAX_LIMIT: u32 = 50_000;

pub const ENV_APP_TOKEN: &str = "DATADIVER_APP_TOKEN";
pub const ENV_APP_TOKEN_FALLBACK: &str = "SOCRATA_APP_TOKEN";
pub const ENV_AUTH_SCHEME: &str = "DATADIVER_AUTH_SCHEME";
pub const ENV_DEFAULT_LIMIT: &str = "DATADIVER_DEFAULT_LIMIT";

/// How the application token is presented to the data service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthScheme {
    /// `X-App-Token: <token>`
    #[default]
    AppToken,
    /// `Authorization: Bearer <token>`
    Bearer,
}

impl AuthScheme {
    pub fn header(self, token: &str) -> (&'static str, String) {
        match self {
            AuthScheme::AppToken => ("X-App-Token", token.to_string()),
            AuthScheme::Bearer => ("Authorization", format!("Bearer {token}")),
        }
    }
}

impl FromStr for AuthScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "app-token" | "apptoken" | "x-app-token" => Ok(AuthScheme::AppToken),
            "bearer" => Ok(AuthScheme::Bearer),
            other => Err(format!("unknown auth scheme: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetcherConfig {
    pub app_token: Option<String>,
    pub auth_scheme: AuthScheme,
    pub default_limit: u32,
    pub max_limit: u32,
    /// TTL for descriptors without an override.
    pub default_ttl: Duration,
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            app_token: None,
            auth_scheme: AuthScheme::default(),
            default_limit: DEFAULT_LIMIT,
            max_limit: MAX_LIMIT,
            default_ttl: DEFAULT_CACHE_TTL,
            user_agent: concat!("datadiver/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl FetcherConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from an arbitrary variable source. Unparseable values
    /// fall back to the defaults with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        cfg.app_token = non_empty(ENV_APP_TOKEN).or_else(|| non_empty(ENV_APP_TOKEN_FALLBACK));

        if let Some(raw) = non_empty(ENV_AUTH_SCHEME) {
            match raw.parse() {
                Ok(scheme) => cfg.auth_scheme = scheme,
                Err(e) => tracing::warn!(%e, "ignoring {ENV_AUTH_SCHEME}"),
            }
        }

        if let Some(raw) = non_empty(ENV_DEFAULT_LIMIT) {
            match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => cfg.default_limit = n.min(cfg.max_limit),
                _ => tracing::warn!(value = %raw, "ignoring {ENV_DEFAULT_LIMIT}"),
            }
        }
        cfg
    }

    pub fn with_app_token(mut self, token: impl Into<String>) -> Self {
        self.app_token = Some(token.into());
        self
    }

    pub fn with_auth_scheme(mut self, scheme: AuthScheme) -> Self {
        self.auth_scheme = scheme;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_default_limit(mut self, limit: u32) -> Self {
        self.default_limit = limit.clamp(1, self.max_limit);
        self
    }

    /// The auth header to attach, if a token is configured.
    pub fn auth_header(&self) -> Option<(&'static str, String)> {
        self.app_token
            .as_deref()
            .map(|token| self.auth_scheme.header(token))
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthScheme, DEFAULT_LIMIT, FetcherConfig};
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = FetcherConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg, FetcherConfig::default());
        assert_eq!(cfg.default_limit, DEFAULT_LIMIT);
        assert!(cfg.auth_header().is_none());
    }

    #[test]
    fn token_falls_back_to_socrata_variable() {
        let cfg = FetcherConfig::from_lookup(lookup(&[("SOCRATA_APP_TOKEN", "abc")]));
        assert_eq!(cfg.auth_header(), Some(("X-App-Token", "abc".to_string())));

        let cfg = FetcherConfig::from_lookup(lookup(&[
            ("DATADIVER_APP_TOKEN", "primary"),
            ("SOCRATA_APP_TOKEN", "abc"),
            ("DATADIVER_AUTH_SCHEME", "bearer"),
        ]));
        assert_eq!(cfg.auth_scheme, AuthScheme::Bearer);
        assert_eq!(
            cfg.auth_header(),
            Some(("Authorization", "Bearer primary".to_string()))
        );
    }

    #[test]
    fn bad_values_keep_defaults() {
        let cfg = FetcherConfig::from_lookup(lookup(&[
            ("DATADIVER_AUTH_SCHEME", "kerberos"),
            ("DATADIVER_DEFAULT_LIMIT", "lots"),
        ]));
        assert_eq!(cfg.auth_scheme, AuthScheme::AppToken);
        assert_eq!(cfg.default_limit, DEFAULT_LIMIT);

        let cfg = FetcherConfig::from_lookup(lookup(&[("DATADIVER_DEFAULT_LIMIT", "999999")]));
        assert_eq!(cfg.default_limit, 50_000);
    }
}
