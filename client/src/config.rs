use crate::channel::BackoffPolicy;
use crate::peer::SubscriptionRetry;
use crate::reconciler::ReconcilerConfig;
use convoy_shared::{ParticipantId, SessionId};
use std::time::Duration;

/// Everything a [`PresenceClient`](crate::PresenceClient) needs to join a
/// session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server root, e.g. `ws://127.0.0.1:8080`
    pub server_url: String,
    pub session: SessionId,
    pub participant_id: ParticipantId,
    pub display_name: Option<String>,
    /// Route samples over the alternate transport whenever it is available
    pub prefer_alternate: bool,
    pub backoff: BackoffPolicy,
    pub subscription: SubscriptionRetry,
    pub heartbeat_interval: Duration,
    pub reconciler: ReconcilerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080".to_string(),
            session: "lobby".to_string(),
            participant_id: uuid::Uuid::new_v4().to_string(),
            display_name: None,
            prefer_alternate: true,
            backoff: BackoffPolicy::default(),
            subscription: SubscriptionRetry::default(),
            heartbeat_interval: Duration::from_secs(2),
            reconciler: ReconcilerConfig::default(),
        }
    }
}

impl ClientConfig {
    fn base(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    pub fn presence_endpoint(&self) -> String {
        format!("{}/presence/{}", self.base(), self.session)
    }

    pub fn broker_endpoint(&self) -> String {
        format!("{}/broker/{}", self.base(), self.session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_shared::presence::is_valid_id;

    #[test]
    fn test_endpoints() {
        let config = ClientConfig {
            server_url: "ws://example.org:9000/".to_string(),
            session: "room-1".to_string(),
            ..Default::default()
        };
        assert_eq!(config.presence_endpoint(), "ws://example.org:9000/presence/room-1");
        assert_eq!(config.broker_endpoint(), "ws://example.org:9000/broker/room-1");
    }

    #[test]
    fn test_generated_ids_are_valid_and_unique() {
        let a = ClientConfig::default();
        let b = ClientConfig::default();
        assert!(is_valid_id(&a.participant_id));
        assert_ne!(a.participant_id, b.participant_id);
    }
}
