//! Permission broker gating side-effecting tool calls.
//!
//! A request is published on the bus and the caller suspends until the UI
//! resolves it by id, or until the caller's token is cancelled. Grants
//! recorded as "always" (process-wide) or "for session" short-circuit later
//! requests without a round trip.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::pubsub::{Broker, EventKind, Subscription};

/// A pending approval as shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    /// Human summary from the tool's `describe`.
    pub description: String,
    pub action: String,
    pub params: Value,
    /// Working-directory scope of the action.
    pub path: Option<PathBuf>,
}

/// Caller-side request; the broker assigns the id.
#[derive(Debug, Clone)]
pub struct CreatePermissionRequest {
    pub session_id: String,
    pub tool_name: String,
    pub description: String,
    pub action: String,
    pub params: Value,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Granted,
    GrantedForSession,
    GrantedAlways,
    Denied,
}

impl PermissionDecision {
    #[must_use]
    pub fn is_granted(self) -> bool {
        !matches!(self, Self::Denied)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PermissionError {
    #[error("permission request cancelled")]
    Cancelled,
    #[error("permission request dropped without a decision")]
    Closed,
}

struct Pending {
    session_id: String,
    tool_name: String,
    respond: oneshot::Sender<PermissionDecision>,
}

#[derive(Default)]
struct GrantState {
    always: RwLock<HashSet<String>>,
    for_session: RwLock<HashSet<(String, String)>>,
    auto_sessions: RwLock<HashSet<String>>,
}

/// Broker shared by the engine (requests) and the UI (decisions).
#[derive(Clone)]
pub struct PermissionService {
    broker: Broker<PermissionRequest>,
    pending: Arc<Mutex<HashMap<String, Pending>>>,
    grants: Arc<GrantState>,
}

impl PermissionService {
    #[must_use]
    pub fn new(broker: Broker<PermissionRequest>) -> Self {
        Self {
            broker,
            pending: Arc::new(Mutex::new(HashMap::new())),
            grants: Arc::new(GrantState::default()),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> Subscription<PermissionRequest> {
        self.broker.subscribe()
    }

    /// Ask for approval and wait for the decision.
    pub async fn request(
        &self,
        request: CreatePermissionRequest,
        cancel: &CancellationToken,
    ) -> Result<PermissionDecision, PermissionError> {
        if cancel.is_cancelled() {
            return Err(PermissionError::Cancelled);
        }
        if self.is_pre_granted(&request.session_id, &request.tool_name) {
            tracing::debug!(tool = %request.tool_name, session = %request.session_id, "permission pre-granted");
            return Ok(PermissionDecision::Granted);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(
            id.clone(),
            Pending {
                session_id: request.session_id.clone(),
                tool_name: request.tool_name.clone(),
                respond: tx,
            },
        );
        self.broker.publish(
            EventKind::Created,
            PermissionRequest {
                id: id.clone(),
                session_id: request.session_id,
                tool_name: request.tool_name,
                description: request.description,
                action: request.action,
                params: request.params,
                path: request.path,
            },
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                lock(&self.pending).remove(&id);
                Err(PermissionError::Cancelled)
            }
            decision = rx => decision.map_err(|_| PermissionError::Closed),
        }
    }

    /// Approve once. Returns false if `id` is unknown or already resolved.
    pub fn grant(&self, id: &str) -> bool {
        self.resolve(id, PermissionDecision::Granted)
    }

    /// Approve and skip future prompts for this tool in this session.
    pub fn grant_for_session(&self, id: &str) -> bool {
        self.resolve(id, PermissionDecision::GrantedForSession)
    }

    /// Approve and skip future prompts for this tool in every session.
    pub fn grant_always(&self, id: &str) -> bool {
        self.resolve(id, PermissionDecision::GrantedAlways)
    }

    pub fn deny(&self, id: &str) -> bool {
        self.resolve(id, PermissionDecision::Denied)
    }

    /// Approve every request from `session_id` without prompting.
    pub fn auto_approve_session(&self, session_id: &str) {
        write(&self.grants.auto_sessions).insert(session_id.to_string());
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    fn is_pre_granted(&self, session_id: &str, tool_name: &str) -> bool {
        read(&self.grants.auto_sessions).contains(session_id)
            || read(&self.grants.always).contains(tool_name)
            || read(&self.grants.for_session)
                .contains(&(session_id.to_string(), tool_name.to_string()))
    }

    fn resolve(&self, id: &str, decision: PermissionDecision) -> bool {
        let Some(pending) = lock(&self.pending).remove(id) else {
            tracing::debug!(id, "ignoring decision for unknown or resolved permission request");
            return false;
        };
        match decision {
            PermissionDecision::GrantedForSession => {
                write(&self.grants.for_session).insert((pending.session_id, pending.tool_name));
            }
            PermissionDecision::GrantedAlways => {
                write(&self.grants.always).insert(pending.tool_name);
            }
            PermissionDecision::Granted | PermissionDecision::Denied => {}
        }
        // The requester may have been cancelled in between.
        let _ = pending.respond.send(decision);
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("permission grant lock poisoned; continuing with inner state");
            poisoned.into_inner()
        }
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("permission grant lock poisoned; continuing with inner state");
            poisoned.into_inner()
        }
    }
}
