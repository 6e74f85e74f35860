//! Domain models shared by the SIP core, persistence layer, and admin API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Tenant account; owns routes, trunks, and call logs
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    /// Never exposed through the API
    #[serde(skip_serializing)]
    pub api_key: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Inbound routing rule mapping call attributes to an agent endpoint
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Route {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    /// Higher priority wins; ties broken by name ascending
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_to_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_from_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_sip_header: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_sip_header_value: Option<String>,
    pub websocket_url: String,
    pub custom_data: serde_json::Value,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Route {
    /// Full match predicate. An unset or empty matcher field is always true;
    /// a set header matcher requires the header to be present, and a set
    /// header value additionally requires exact equality.
    pub fn matches(
        &self,
        to_user: &str,
        from_user: &str,
        headers: &HashMap<String, String>,
    ) -> bool {
        if let Some(want) = non_empty(&self.match_to_user) {
            if to_user != want {
                return false;
            }
        }

        if let Some(want) = non_empty(&self.match_from_user) {
            if from_user != want {
                return false;
            }
        }

        if let Some(header) = non_empty(&self.match_sip_header) {
            let Some(value) = headers.get(header) else {
                return false;
            };
            if let Some(want) = non_empty(&self.match_sip_header_value) {
                if value != want {
                    return false;
                }
            }
        }

        true
    }

    /// Synthesized catch-all route pointing at the configured default agent
    pub fn fallback(websocket_url: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::nil(),
            account_id: Uuid::nil(),
            name: "default".to_string(),
            priority: 0,
            match_to_user: None,
            match_from_user: None,
            match_sip_header: None,
            match_sip_header_value: None,
            websocket_url: websocket_url.to_string(),
            custom_data: serde_json::json!({}),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

/// Outbound SIP peering configuration. Dialing through a trunk is not
/// implemented; the model exists for the admin CRUD surface.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Trunk {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub transport: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Never exposed through the API
    #[serde(skip_serializing)]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_host: Option<String>,
    pub register: bool,
    pub register_interval: i32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Call lifecycle status; transitions are monotonic along
/// initiated → ringing → answered → completed, with failed and cancelled
/// as terminal alternatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "call_status", rename_all = "lowercase")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Answered,
    Completed,
    Failed,
    Cancelled,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed | CallStatus::Failed | CallStatus::Cancelled
        )
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "call_direction", rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Call detail record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CallLog {
    pub id: Uuid,
    pub account_id: Option<Uuid>,
    pub call_id: String,
    pub direction: CallDirection,
    pub from_uri: String,
    pub to_uri: String,
    pub from_user: String,
    pub to_user: String,
    pub route_id: Option<Uuid>,
    pub trunk_id: Option<Uuid>,
    pub websocket_url: String,
    pub status: CallStatus,
    pub initiated_at: DateTime<Utc>,
    pub ringing_at: Option<DateTime<Utc>>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub hangup_cause: Option<String>,
    pub hangup_party: Option<String>,
    pub custom_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to open a call log row; the store fills in the rest
#[derive(Debug, Clone)]
pub struct NewCallLog {
    pub account_id: Option<Uuid>,
    pub call_id: String,
    pub direction: CallDirection,
    pub from_uri: String,
    pub to_uri: String,
    pub from_user: String,
    pub to_user: String,
    pub route_id: Option<Uuid>,
    pub websocket_url: String,
    pub custom_data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(
        to: Option<&str>,
        from: Option<&str>,
        header: Option<&str>,
        value: Option<&str>,
    ) -> Route {
        Route {
            match_to_user: to.map(str::to_string),
            match_from_user: from.map(str::to_string),
            match_sip_header: header.map(str::to_string),
            match_sip_header_value: value.map(str::to_string),
            ..Route::fallback("ws://agent/ws")
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_matchers_match_anything() {
        let r = route(None, None, None, None);
        assert!(r.matches("1000", "alice", &headers(&[])));
        assert!(r.matches("", "", &headers(&[("X-Foo", "bar")])));
    }

    #[test]
    fn empty_string_matcher_is_wildcard() {
        let r = route(Some(""), Some(""), None, None);
        assert!(r.matches("anyone", "anywhere", &headers(&[])));
    }

    #[test]
    fn to_user_must_equal() {
        let r = route(Some("1000"), None, None, None);
        assert!(r.matches("1000", "alice", &headers(&[])));
        assert!(!r.matches("2000", "alice", &headers(&[])));
    }

    #[test]
    fn from_user_must_equal() {
        let r = route(None, Some("alice"), None, None);
        assert!(r.matches("1000", "alice", &headers(&[])));
        assert!(!r.matches("1000", "bob", &headers(&[])));
    }

    #[test]
    fn header_presence_required() {
        let r = route(None, None, Some("X-Customer-Tier"), None);
        assert!(r.matches("1000", "alice", &headers(&[("X-Customer-Tier", "vip")])));
        assert!(!r.matches("1000", "alice", &headers(&[])));
    }

    #[test]
    fn header_value_must_equal_when_set() {
        let r = route(None, None, Some("X-Customer-Tier"), Some("vip"));
        assert!(r.matches("1000", "alice", &headers(&[("X-Customer-Tier", "vip")])));
        assert!(!r.matches("1000", "alice", &headers(&[("X-Customer-Tier", "standard")])));
    }

    #[test]
    fn all_matchers_must_pass() {
        let r = route(Some("1000"), Some("alice"), Some("X-Env"), Some("prod"));
        let h = headers(&[("X-Env", "prod")]);
        assert!(r.matches("1000", "alice", &h));
        assert!(!r.matches("1000", "bob", &h));
        assert!(!r.matches("1000", "alice", &headers(&[("X-Env", "staging")])));
    }

    #[test]
    fn status_terminal_classification() {
        assert!(CallStatus::Completed.is_terminal());
        assert!(CallStatus::Failed.is_terminal());
        assert!(CallStatus::Cancelled.is_terminal());
        assert!(!CallStatus::Initiated.is_terminal());
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Answered.is_terminal());
    }

    #[test]
    fn api_key_is_not_serialized() {
        let account = Account {
            id: Uuid::nil(),
            name: "acme".to_string(),
            api_key: "super-secret".to_string(),
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&account).unwrap();
        assert!(!json.contains("super-secret"));
    }
}
