//! Inbound call routing.
//!
//! Two-phase matching: a coarse, index-friendly database prefilter on the
//! to/from users, then the full in-process predicate (including SIP header
//! matchers) applied in priority order. Candidate lists are cached per
//! (to_user, from_user) pair when a cache is configured.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::db::CallStore;
use crate::models::Route;

#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("no matching route for to={to_user} from={from_user}")]
    NoMatch { to_user: String, from_user: String },

    #[error("route lookup failed: {0}")]
    Store(#[from] sqlx::Error),
}

/// Resolves inbound call attributes to an agent endpoint
pub struct Router {
    store: Arc<dyn CallStore>,
    cache: Option<Arc<Cache>>,
    default_websocket_url: String,
}

impl Router {
    pub fn new(
        store: Arc<dyn CallStore>,
        cache: Option<Arc<Cache>>,
        default_websocket_url: String,
    ) -> Self {
        Self {
            store,
            cache,
            default_websocket_url,
        }
    }

    /// Best matching route for an inbound call, or the synthesized default
    /// when one is configured. Cache errors degrade to misses; store errors
    /// propagate.
    pub async fn find_route(
        &self,
        to_user: &str,
        from_user: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Route, RoutingError> {
        let mut candidates: Option<Vec<Route>> = None;

        if let Some(cache) = &self.cache {
            match cache.get_cached_routes(to_user, from_user).await {
                Ok(hit) => candidates = hit,
                Err(e) => warn!("route cache read failed, falling back to store: {e}"),
            }
        }

        let candidates = match candidates {
            Some(routes) => routes,
            None => {
                let routes = self.store.find_matching_routes(to_user, from_user).await?;
                if let Some(cache) = &self.cache {
                    if !routes.is_empty() {
                        if let Err(e) = cache.cache_routes(to_user, from_user, &routes).await {
                            warn!("route cache write failed: {e}");
                        }
                    }
                }
                routes
            }
        };

        if let Some(route) = select_route(&candidates, to_user, from_user, headers) {
            debug!("route matched: {} -> {}", route.name, route.websocket_url);
            return Ok(route.clone());
        }

        if !self.default_websocket_url.is_empty() {
            debug!("no route matched, using default agent endpoint");
            return Ok(Route::fallback(&self.default_websocket_url));
        }

        Err(RoutingError::NoMatch {
            to_user: to_user.to_string(),
            from_user: from_user.to_string(),
        })
    }

    /// Drop all cached candidate lists; called by the admin API on any
    /// route mutation.
    pub async fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.invalidate_routes().await {
                warn!("route cache invalidation failed: {e}");
            }
        }
    }
}

/// First candidate passing the full predicate. Candidates are expected in
/// priority-descending, name-ascending order, which makes selection
/// deterministic for a stable candidate set.
pub fn select_route<'a>(
    candidates: &'a [Route],
    to_user: &str,
    from_user: &str,
    headers: &HashMap<String, String>,
) -> Option<&'a Route> {
    candidates
        .iter()
        .find(|route| route.matches(to_user, from_user, headers))
}
