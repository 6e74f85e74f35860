//! Route and active-call caching backed by Valkey.
//!
//! The cache is an optional collaborator: every caller holds an
//! `Option<Arc<Cache>>` and treats errors as misses. Nothing on the call
//! path may fail because the cache is down.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::debug;

use crate::models::Route;

const ACTIVE_CALL_TTL_SECS: i64 = 3600;

/// Valkey-backed cache for route lookups and active-call tracking
pub struct Cache {
    conn: ConnectionManager,
    route_ttl: Duration,
}

impl Cache {
    /// Connect and ping the server
    pub async fn connect(url: &str, route_ttl: Duration) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!("valkey ping: {pong}");
        Ok(Self { conn, route_ttl })
    }

    fn route_key(to_user: &str, from_user: &str) -> String {
        format!("route:{to_user}:{from_user}")
    }

    fn active_call_key(call_id: &str) -> String {
        format!("call:active:{call_id}")
    }

    /// Cache the candidate list for a (to, from) lookup
    pub async fn cache_routes(
        &self,
        to_user: &str,
        from_user: &str,
        routes: &[Route],
    ) -> Result<(), redis::RedisError> {
        let key = Self::route_key(to_user, from_user);
        let data = serde_json::to_string(routes).map_err(|e| {
            redis::RedisError::from((redis::ErrorKind::TypeError, "route encode", e.to_string()))
        })?;
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, data, self.route_ttl.as_secs()).await?;
        Ok(())
    }

    /// Cached candidate list, or None on miss
    pub async fn get_cached_routes(
        &self,
        to_user: &str,
        from_user: &str,
    ) -> Result<Option<Vec<Route>>, redis::RedisError> {
        let key = Self::route_key(to_user, from_user);
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.get(key).await?;
        match data {
            Some(json) => {
                let routes: Vec<Route> = serde_json::from_str(&json).map_err(|e| {
                    redis::RedisError::from((
                        redis::ErrorKind::TypeError,
                        "route decode",
                        e.to_string(),
                    ))
                })?;
                Ok(Some(routes))
            }
            None => Ok(None),
        }
    }

    /// Drop every cached route entry; called on any route mutation
    pub async fn invalidate_routes(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys("route:*").await?;
        if keys.is_empty() {
            return Ok(());
        }
        let _: () = conn.del(keys).await?;
        Ok(())
    }

    /// Mark a call active, storing every provided field
    pub async fn set_active_call(
        &self,
        call_id: &str,
        fields: &[(&str, String)],
    ) -> Result<(), redis::RedisError> {
        if fields.is_empty() {
            return Ok(());
        }
        let key = Self::active_call_key(call_id);
        let pairs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(&key, &pairs).await?;
        let _: () = conn.expire(&key, ACTIVE_CALL_TTL_SECS).await?;
        Ok(())
    }

    /// Remove a call from the active set
    pub async fn remove_active_call(&self, call_id: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::active_call_key(call_id)).await?;
        Ok(())
    }

    /// Count of calls currently tracked as active
    pub async fn active_call_count(&self) -> Result<usize, redis::RedisError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys("call:active:*").await?;
        Ok(keys.len())
    }
}
