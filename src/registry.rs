//! Process-wide registry of active sessions keyed by Call-ID.
//!
//! The registry is the only path to a session from outside the session's
//! own tasks, and the only place terminal bookkeeping (call-log status,
//! active-call cache entry, map removal) happens.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::Cache;
use crate::db::CallStore;
use crate::models::{CallDirection, CallStatus, NewCallLog, Route};
use crate::rtp::{PortPool, RtpEndpoint, RtpError};
use crate::session::{CallInfo, CallSession};
use crate::sip::ServerTransaction;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session already exists for call {0}")]
    Duplicate(String),

    #[error(transparent)]
    Rtp(#[from] RtpError),
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<CallSession>>>,
    store: Arc<dyn CallStore>,
    cache: Option<Arc<Cache>>,
    ports: PortPool,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn CallStore>, cache: Option<Arc<Cache>>, ports: PortPool) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            cache,
            ports,
        })
    }

    /// Create and register a session for an inbound call. Refuses to
    /// overwrite an existing Call-ID. Allocates the RTP port, opens the
    /// call-log row (status initiated), and tracks the call in the cache.
    pub async fn create_session(
        self: &Arc<Self>,
        info: CallInfo,
        route: Route,
        tx: ServerTransaction,
    ) -> Result<Arc<CallSession>, SessionError> {
        if self.sessions.read().await.contains_key(&info.call_id) {
            return Err(SessionError::Duplicate(info.call_id));
        }

        let (socket, port) = self.ports.allocate().await?;
        let endpoint = RtpEndpoint::new(socket, port);
        let stream_sid = Uuid::new_v4().to_string();
        let call_id = info.call_id.clone();

        let log = NewCallLog {
            account_id: (!route.account_id.is_nil()).then_some(route.account_id),
            call_id: call_id.clone(),
            direction: CallDirection::Inbound,
            from_uri: info.from_uri.clone(),
            to_uri: info.to_uri.clone(),
            from_user: info.from_user.clone(),
            to_user: info.to_user.clone(),
            route_id: (!route.id.is_nil()).then_some(route.id),
            websocket_url: route.websocket_url.clone(),
            custom_data: route.custom_data.clone(),
        };

        let session = Arc::new(CallSession::new(
            info,
            stream_sid,
            route,
            endpoint,
            tx,
            Arc::clone(&self.store),
            Arc::downgrade(self),
        ));

        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&call_id) {
                // Lost the race; the freshly bound RTP socket is dropped
                // and the port released.
                return Err(SessionError::Duplicate(call_id));
            }
            sessions.insert(call_id.clone(), Arc::clone(&session));
        }

        if let Err(e) = self.store.create_call_log(log).await {
            // A missing CDR must not abort the call.
            warn!("failed to create call log for {call_id}: {e}");
        }

        if let Some(cache) = &self.cache {
            let fields = [
                ("from", session.from_user.clone()),
                ("to", session.to_user.clone()),
                ("status", CallStatus::Initiated.to_string()),
            ];
            if let Err(e) = cache.set_active_call(&call_id, &fields).await {
                warn!("failed to track active call {call_id}: {e}");
            }
        }

        info!("session created: {call_id} (rtp port {port})");
        Ok(session)
    }

    pub async fn get(&self, call_id: &str) -> Option<Arc<CallSession>> {
        self.sessions.read().await.get(call_id).cloned()
    }

    /// Remove and close a session, recording the terminal status. Safe to
    /// call from any task, including a session's own pumps; a Call-ID that
    /// is no longer registered is a no-op.
    pub async fn remove(&self, call_id: &str, status: CallStatus) {
        let session = self.sessions.write().await.remove(call_id);
        let Some(session) = session else {
            return;
        };

        session.close().await;

        if let Err(e) = self.store.update_call_status(call_id, status).await {
            warn!("failed to update call status for {call_id}: {e}");
        }

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.remove_active_call(call_id).await {
                warn!("failed to remove active call {call_id} from cache: {e}");
            }
        }

        info!("session removed: {call_id} ({status})");
    }

    /// Close every session; used at process shutdown. The map is drained
    /// under the lock and the closes run after it is released, so a session
    /// concurrently closing itself cannot deadlock against us.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<CallSession>> = {
            let mut map = self.sessions.write().await;
            map.drain().map(|(_, session)| session).collect()
        };

        for session in sessions {
            session.close().await;
        }

        info!("all sessions closed");
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
