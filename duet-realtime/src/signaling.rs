//! Stateless relay for call control and WebRTC signaling.
//!
//! The server never carries media and never interprets SDP or ICE
//! payloads. It looks up the target user in the registry and forwards
//! one event; call state lives only in the two browsers.
//!
//! ```text
//! caller ── call:initiate ──► relay ── call:incoming ──► callee
//! caller ◄─ call:accepted ─── relay ◄── call:accept ──── callee
//! caller ── webrtc:offer ───► relay ── offer-received ─► callee
//!        ◄─ answer-received ─       ◄── webrtc:answer ──
//!        ◄► ice-candidate(s) ◄►     ◄►                ◄►
//! ```

use serde_json::Value;
use std::sync::Arc;
use std::time::SystemTime;

use crate::protocol::{CallType, ServerEvent, UserId};
use crate::registry::ConnectionRegistry;

/// Human-debuggable correlation id: `<from>-<to>-<epoch millis>`.
pub type CallId = String;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RelayError {
    #[error("User {0} is offline")]
    PeerUnavailable(UserId),
    #[error("Connection has not joined as a user yet")]
    NotIdentified,
}

pub struct SignalingRelay {
    registry: Arc<ConnectionRegistry>,
}

impl SignalingRelay {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Ring `to`. Fails fast with `PeerUnavailable` if `to` is offline.
    pub async fn initiate_call(
        &self,
        from: &UserId,
        to: &UserId,
        call_type: CallType,
    ) -> Result<CallId, RelayError> {
        let call_id = mint_call_id(from, to);
        self.relay(
            "call:incoming",
            from,
            to,
            ServerEvent::CallIncoming {
                call_id: call_id.clone(),
                from_user_id: from.clone(),
                call_type,
            },
        )
        .await?;
        Ok(call_id)
    }

    pub async fn accept_call(&self, call_id: &str, from: &UserId, to: &UserId) -> Result<(), RelayError> {
        let event = ServerEvent::CallAccepted {
            call_id: call_id.to_string(),
            from_user_id: from.clone(),
        };
        self.relay("call:accepted", from, to, event).await
    }

    pub async fn reject_call(&self, call_id: &str, from: &UserId, to: &UserId) -> Result<(), RelayError> {
        let event = ServerEvent::CallRejected {
            call_id: call_id.to_string(),
            from_user_id: from.clone(),
        };
        self.relay("call:rejected", from, to, event).await
    }

    pub async fn forward_offer(
        &self,
        from: &UserId,
        to: &UserId,
        payload: Value,
        call_id: Option<String>,
    ) -> Result<(), RelayError> {
        let event = ServerEvent::OfferReceived {
            from_user_id: from.clone(),
            payload,
            call_id,
        };
        self.relay("webrtc:offer-received", from, to, event).await
    }

    pub async fn forward_answer(
        &self,
        from: &UserId,
        to: &UserId,
        payload: Value,
        call_id: Option<String>,
    ) -> Result<(), RelayError> {
        let event = ServerEvent::AnswerReceived {
            from_user_id: from.clone(),
            payload,
            call_id,
        };
        self.relay("webrtc:answer-received", from, to, event).await
    }

    pub async fn forward_ice_candidate(
        &self,
        from: &UserId,
        to: &UserId,
        payload: Value,
        call_id: Option<String>,
    ) -> Result<(), RelayError> {
        let event = ServerEvent::IceCandidateReceived {
            from_user_id: from.clone(),
            payload,
            call_id,
        };
        self.relay("webrtc:ice-candidate-received", from, to, event).await
    }

    /// Advisory. If `to` is offline the hang-up is simply not delivered.
    pub async fn end_call(&self, from: &UserId, to: &UserId, call_id: Option<String>) -> Result<(), RelayError> {
        let event = ServerEvent::CallEnded {
            from_user_id: from.clone(),
            call_id,
        };
        self.relay("call:ended", from, to, event).await
    }

    async fn relay(&self, name: &str, from: &UserId, to: &UserId, event: ServerEvent) -> Result<(), RelayError> {
        let Some(target) = self.registry.resolve(to).await else {
            log::debug!("{name} from {from} not relayed: {to} offline");
            return Err(RelayError::PeerUnavailable(to.clone()));
        };
        log::debug!("Relaying {name} {from} -> {to}");
        target.deliver(Arc::new(event));
        Ok(())
    }
}

fn mint_call_id(from: &UserId, to: &UserId) -> CallId {
    let millis = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("{from}-{to}-{millis}")
}
