//! Database access layer using sqlx with PostgreSQL.
//!
//! The SIP core only sees the narrow [`CallStore`] trait; the admin API uses
//! the full [`PgStore`] CRUD surface directly.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{Account, CallLog, CallStatus, NewCallLog, Route, Trunk};

/// The persistence operations the call path depends on. Call-log failures
/// are logged by callers and never abort a call; route lookup failures are
/// fatal to call setup.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Active routes whose to/from matchers are empty or equal to the given
    /// users, ordered by priority descending then name ascending.
    async fn find_matching_routes(
        &self,
        to_user: &str,
        from_user: &str,
    ) -> Result<Vec<Route>, sqlx::Error>;

    /// Open a call log row with status `initiated`.
    async fn create_call_log(&self, log: NewCallLog) -> Result<CallLog, sqlx::Error>;

    /// Advance the call status, stamping the matching timestamp column and
    /// computing the duration on terminal transitions.
    async fn update_call_status(
        &self,
        call_id: &str,
        status: CallStatus,
    ) -> Result<(), sqlx::Error>;
}

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and verify the pool
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Run pending schema migrations
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ===== Accounts =====

    /// Validate an API key; only active accounts authenticate
    pub async fn validate_api_key(
        &self,
        account_id: Uuid,
        api_key: &str,
    ) -> Result<Option<Account>, sqlx::Error> {
        sqlx::query_as::<_, Account>(
            r#"
            SELECT id, name, api_key, active, created_at, updated_at
            FROM accounts
            WHERE id = $1 AND api_key = $2 AND active = TRUE
            "#,
        )
        .bind(account_id)
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await
    }

    // ===== Routes =====

    pub async fn list_routes(&self, account_id: Uuid) -> Result<Vec<Route>, sqlx::Error> {
        sqlx::query_as::<_, Route>(
            r#"
            SELECT id, account_id, name, priority,
                   match_to_user, match_from_user, match_sip_header, match_sip_header_value,
                   websocket_url, custom_data, active, created_at, updated_at
            FROM sip_routes
            WHERE account_id = $1
            ORDER BY priority DESC, name ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn get_route(
        &self,
        account_id: Uuid,
        route_id: Uuid,
    ) -> Result<Option<Route>, sqlx::Error> {
        sqlx::query_as::<_, Route>(
            r#"
            SELECT id, account_id, name, priority,
                   match_to_user, match_from_user, match_sip_header, match_sip_header_value,
                   websocket_url, custom_data, active, created_at, updated_at
            FROM sip_routes
            WHERE id = $1 AND account_id = $2
            "#,
        )
        .bind(route_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn create_route(
        &self,
        account_id: Uuid,
        name: &str,
        priority: i32,
        match_to_user: Option<&str>,
        match_from_user: Option<&str>,
        match_sip_header: Option<&str>,
        match_sip_header_value: Option<&str>,
        websocket_url: &str,
        custom_data: serde_json::Value,
    ) -> Result<Route, sqlx::Error> {
        sqlx::query_as::<_, Route>(
            r#"
            INSERT INTO sip_routes (account_id, name, priority, match_to_user, match_from_user,
                                    match_sip_header, match_sip_header_value, websocket_url, custom_data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, account_id, name, priority,
                      match_to_user, match_from_user, match_sip_header, match_sip_header_value,
                      websocket_url, custom_data, active, created_at, updated_at
            "#,
        )
        .bind(account_id)
        .bind(name)
        .bind(priority)
        .bind(match_to_user)
        .bind(match_from_user)
        .bind(match_sip_header)
        .bind(match_sip_header_value)
        .bind(websocket_url)
        .bind(custom_data)
        .fetch_one(&self.pool)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_route(
        &self,
        account_id: Uuid,
        route_id: Uuid,
        name: &str,
        priority: i32,
        match_to_user: Option<&str>,
        match_from_user: Option<&str>,
        match_sip_header: Option<&str>,
        match_sip_header_value: Option<&str>,
        websocket_url: &str,
        custom_data: serde_json::Value,
        active: bool,
    ) -> Result<Option<Route>, sqlx::Error> {
        sqlx::query_as::<_, Route>(
            r#"
            UPDATE sip_routes
            SET name = $3, priority = $4, match_to_user = $5, match_from_user = $6,
                match_sip_header = $7, match_sip_header_value = $8, websocket_url = $9,
                custom_data = $10, active = $11, updated_at = now()
            WHERE id = $1 AND account_id = $2
            RETURNING id, account_id, name, priority,
                      match_to_user, match_from_user, match_sip_header, match_sip_header_value,
                      websocket_url, custom_data, active, created_at, updated_at
            "#,
        )
        .bind(route_id)
        .bind(account_id)
        .bind(name)
        .bind(priority)
        .bind(match_to_user)
        .bind(match_from_user)
        .bind(match_sip_header)
        .bind(match_sip_header_value)
        .bind(websocket_url)
        .bind(custom_data)
        .bind(active)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn delete_route(&self, account_id: Uuid, route_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sip_routes WHERE id = $1 AND account_id = $2")
            .bind(route_id)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ===== Trunks =====

    pub async fn list_trunks(&self, account_id: Uuid) -> Result<Vec<Trunk>, sqlx::Error> {
        sqlx::query_as::<_, Trunk>(
            r#"
            SELECT id, account_id, name, host, port, transport,
                   username, password, from_user, from_host,
                   register, register_interval, active, created_at, updated_at
            FROM sip_trunks
            WHERE account_id = $1
            ORDER BY name ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn get_trunk(
        &self,
        account_id: Uuid,
        trunk_id: Uuid,
    ) -> Result<Option<Trunk>, sqlx::Error> {
        sqlx::query_as::<_, Trunk>(
            r#"
            SELECT id, account_id, name, host, port, transport,
                   username, password, from_user, from_host,
                   register, register_interval, active, created_at, updated_at
            FROM sip_trunks
            WHERE id = $1 AND account_id = $2
            "#,
        )
        .bind(trunk_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_trunk(
        &self,
        account_id: Uuid,
        name: &str,
        host: &str,
        port: i32,
        transport: &str,
        username: Option<&str>,
        password: Option<&str>,
        from_user: Option<&str>,
        from_host: Option<&str>,
        register: bool,
        register_interval: i32,
    ) -> Result<Trunk, sqlx::Error> {
        sqlx::query_as::<_, Trunk>(
            r#"
            INSERT INTO sip_trunks (account_id, name, host, port, transport,
                                    username, password, from_user, from_host,
                                    register, register_interval)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id, account_id, name, host, port, transport,
                      username, password, from_user, from_host,
                      register, register_interval, active, created_at, updated_at
            "#,
        )
        .bind(account_id)
        .bind(name)
        .bind(host)
        .bind(port)
        .bind(transport)
        .bind(username)
        .bind(password)
        .bind(from_user)
        .bind(from_host)
        .bind(register)
        .bind(register_interval)
        .fetch_one(&self.pool)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_trunk(
        &self,
        account_id: Uuid,
        trunk_id: Uuid,
        name: &str,
        host: &str,
        port: i32,
        transport: &str,
        username: Option<&str>,
        password: Option<&str>,
        from_user: Option<&str>,
        from_host: Option<&str>,
        register: bool,
        register_interval: i32,
        active: bool,
    ) -> Result<Option<Trunk>, sqlx::Error> {
        sqlx::query_as::<_, Trunk>(
            r#"
            UPDATE sip_trunks
            SET name = $3, host = $4, port = $5, transport = $6,
                username = $7, password = $8, from_user = $9, from_host = $10,
                register = $11, register_interval = $12, active = $13, updated_at = now()
            WHERE id = $1 AND account_id = $2
            RETURNING id, account_id, name, host, port, transport,
                      username, password, from_user, from_host,
                      register, register_interval, active, created_at, updated_at
            "#,
        )
        .bind(trunk_id)
        .bind(account_id)
        .bind(name)
        .bind(host)
        .bind(port)
        .bind(transport)
        .bind(username)
        .bind(password)
        .bind(from_user)
        .bind(from_host)
        .bind(register)
        .bind(register_interval)
        .bind(active)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn delete_trunk(&self, account_id: Uuid, trunk_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sip_trunks WHERE id = $1 AND account_id = $2")
            .bind(trunk_id)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ===== Call logs =====

    pub async fn list_calls(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CallLog>, sqlx::Error> {
        let limit = if limit <= 0 { 100 } else { limit };
        sqlx::query_as::<_, CallLog>(
            r#"
            SELECT id, account_id, call_id, direction, from_uri, to_uri,
                   from_user, to_user, route_id, trunk_id, websocket_url,
                   status, initiated_at, ringing_at, answered_at, ended_at,
                   duration_seconds, hangup_cause, hangup_party, custom_data, created_at
            FROM call_logs
            WHERE account_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn get_call(
        &self,
        account_id: Uuid,
        id: Uuid,
    ) -> Result<Option<CallLog>, sqlx::Error> {
        sqlx::query_as::<_, CallLog>(
            r#"
            SELECT id, account_id, call_id, direction, from_uri, to_uri,
                   from_user, to_user, route_id, trunk_id, websocket_url,
                   status, initiated_at, ringing_at, answered_at, ended_at,
                   duration_seconds, hangup_cause, hangup_party, custom_data, created_at
            FROM call_logs
            WHERE id = $1 AND account_id = $2
            "#,
        )
        .bind(id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
    }
}

#[async_trait]
impl CallStore for PgStore {
    async fn find_matching_routes(
        &self,
        to_user: &str,
        from_user: &str,
    ) -> Result<Vec<Route>, sqlx::Error> {
        sqlx::query_as::<_, Route>(
            r#"
            SELECT id, account_id, name, priority,
                   match_to_user, match_from_user, match_sip_header, match_sip_header_value,
                   websocket_url, custom_data, active, created_at, updated_at
            FROM sip_routes
            WHERE active = TRUE
              AND (match_to_user IS NULL OR match_to_user = '' OR match_to_user = $1)
              AND (match_from_user IS NULL OR match_from_user = '' OR match_from_user = $2)
            ORDER BY priority DESC, name ASC
            "#,
        )
        .bind(to_user)
        .bind(from_user)
        .fetch_all(&self.pool)
        .await
    }

    async fn create_call_log(&self, log: NewCallLog) -> Result<CallLog, sqlx::Error> {
        sqlx::query_as::<_, CallLog>(
            r#"
            INSERT INTO call_logs (account_id, call_id, direction, from_uri, to_uri,
                                   from_user, to_user, route_id, websocket_url,
                                   status, custom_data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'initiated', $10)
            RETURNING id, account_id, call_id, direction, from_uri, to_uri,
                      from_user, to_user, route_id, trunk_id, websocket_url,
                      status, initiated_at, ringing_at, answered_at, ended_at,
                      duration_seconds, hangup_cause, hangup_party, custom_data, created_at
            "#,
        )
        .bind(log.account_id)
        .bind(&log.call_id)
        .bind(log.direction)
        .bind(&log.from_uri)
        .bind(&log.to_uri)
        .bind(&log.from_user)
        .bind(&log.to_user)
        .bind(log.route_id)
        .bind(&log.websocket_url)
        .bind(log.custom_data)
        .fetch_one(&self.pool)
        .await
    }

    async fn update_call_status(
        &self,
        call_id: &str,
        status: CallStatus,
    ) -> Result<(), sqlx::Error> {
        let query = match status {
            CallStatus::Ringing => {
                "UPDATE call_logs SET status = $1, ringing_at = now() WHERE call_id = $2"
            }
            CallStatus::Answered => {
                "UPDATE call_logs SET status = $1, answered_at = now() WHERE call_id = $2"
            }
            CallStatus::Completed | CallStatus::Failed | CallStatus::Cancelled => {
                r#"
                UPDATE call_logs
                SET status = $1, ended_at = now(),
                    duration_seconds = EXTRACT(EPOCH FROM (now() - COALESCE(answered_at, initiated_at)))::INT
                WHERE call_id = $2
                "#
            }
            CallStatus::Initiated => "UPDATE call_logs SET status = $1 WHERE call_id = $2",
        };

        sqlx::query(query)
            .bind(status)
            .bind(call_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
