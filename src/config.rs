use anyhow::{Context, Result};
use std::env;

use crate::backend::{RouteSet, StreamEndpoint};
use crate::stream::AppendPolicy;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

/// Client configuration injected into the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub backend_base_url: String,
    pub current_user_id: Option<String>,
    pub routes: RouteSet,
    /// Overrides the route set's per-endpoint default when set.
    pub append_policy: Option<AppendPolicy>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_base_url: DEFAULT_BACKEND_URL.to_string(),
            current_user_id: None,
            routes: RouteSet::default(),
            append_policy: None,
        }
    }
}

impl ClientConfig {
    pub fn new(backend_base_url: impl Into<String>) -> Self {
        Self {
            backend_base_url: normalize_base_url(&backend_base_url.into()),
            ..Self::default()
        }
    }

    /// Reads configuration from the environment.
    ///
    /// - `MEDISENSE_BACKEND_URL` - backend base URL (default `http://localhost:8000`)
    /// - `MEDISENSE_USER_ID` - current user id
    /// - `MEDISENSE_ROUTES` - `scoped` or `flat`
    /// - `MEDISENSE_APPEND_POLICY` - `fixup` or `delta`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let backend_base_url = lookup("MEDISENSE_BACKEND_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
        let current_user_id = lookup("MEDISENSE_USER_ID").filter(|v| !v.trim().is_empty());
        let routes = match lookup("MEDISENSE_ROUTES") {
            Some(raw) => raw
                .parse::<RouteSet>()
                .map_err(anyhow::Error::msg)
                .context("invalid MEDISENSE_ROUTES")?,
            None => RouteSet::default(),
        };
        let append_policy = match lookup("MEDISENSE_APPEND_POLICY") {
            Some(raw) => Some(
                raw.parse::<AppendPolicy>()
                    .map_err(anyhow::Error::msg)
                    .context("invalid MEDISENSE_APPEND_POLICY")?,
            ),
            None => None,
        };

        Ok(Self {
            backend_base_url: normalize_base_url(&backend_base_url),
            current_user_id,
            routes,
            append_policy,
        })
    }

    pub fn with_routes(mut self, routes: RouteSet) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.current_user_id = Some(user_id.into());
        self
    }

    pub fn with_append_policy(mut self, policy: AppendPolicy) -> Self {
        self.append_policy = Some(policy);
        self
    }

    pub fn policy_for(&self, endpoint: StreamEndpoint) -> AppendPolicy {
        self.append_policy
            .unwrap_or_else(|| self.routes.default_policy(endpoint))
    }
}

fn normalize_base_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}
