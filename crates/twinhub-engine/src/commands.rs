//! NATS request/reply intake for entity commands.
//!
//! Requests arrive on `{prefix}.commands` as a JSON [`Command`]. The reply
//! is `{"ok": Response}` or `{"rejected": Rejection}`. Each request is
//! handled on its own task; the router keeps commands for one entity in
//! order and lets different entities proceed in parallel.

use std::sync::Arc;

use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use twinhub_core::EntityRouter;
use twinhub_types::{Command, Rejection, Response};

use crate::error::EngineError;

/// Queue group shared by engine instances so each request is served once.
const QUEUE_GROUP: &str = "twinhub-engine";

/// Reply envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandReply {
    /// The command succeeded.
    Ok(Response),
    /// The command was refused.
    Rejected(Rejection),
}

impl From<Result<Response, Rejection>> for CommandReply {
    fn from(result: Result<Response, Rejection>) -> Self {
        match result {
            Ok(response) => Self::Ok(response),
            Err(rejection) => Self::Rejected(rejection),
        }
    }
}

/// Decode one request body and run it through `router`.
pub async fn handle_request(router: &EntityRouter, body: &[u8]) -> CommandReply {
    let command: Command = match serde_json::from_slice(body) {
        Ok(command) => command,
        Err(e) => {
            return CommandReply::Rejected(Rejection::validation(format!(
                "malformed command: {e}"
            )));
        }
    };
    let entity_id = command.entity_id.clone();
    let command_type = command.command_type();
    let result = router.dispatch(command).await;
    match &result {
        Ok(response) => {
            debug!(entity_id = %entity_id, command = ?command_type, revision = response.revision, "command handled");
        }
        Err(rejection) => {
            debug!(entity_id = %entity_id, command = ?command_type, kind = ?rejection.kind, "command rejected");
        }
    }
    result.into()
}

/// Serves command requests until shutdown.
pub struct CommandListener {
    client: async_nats::Client,
    router: Arc<EntityRouter>,
    subject: String,
}

impl CommandListener {
    /// Listen on `{prefix}.commands`.
    pub fn new(client: async_nats::Client, router: Arc<EntityRouter>, prefix: &str) -> Self {
        Self {
            client,
            router,
            subject: format!("{prefix}.commands"),
        }
    }

    /// Subscribe and serve until `shutdown` turns true.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Nats`] if the subscription cannot be made.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        let mut subscriber = self
            .client
            .queue_subscribe(self.subject.clone(), QUEUE_GROUP.to_owned())
            .await
            .map_err(|e| EngineError::Nats {
                message: format!("failed to subscribe to {}: {e}", self.subject),
            })?;
        info!(subject = %self.subject, "command listener started");

        loop {
            tokio::select! {
                message = subscriber.next() => {
                    let Some(message) = message else {
                        warn!(subject = %self.subject, "command subscription closed");
                        break;
                    };
                    let Some(reply_to) = message.reply.clone() else {
                        debug!(subject = %message.subject, "dropping command without reply subject");
                        continue;
                    };
                    let router = Arc::clone(&self.router);
                    let client = self.client.clone();
                    tokio::spawn(async move {
                        let reply = handle_request(&router, &message.payload).await;
                        match serde_json::to_vec(&reply) {
                            Ok(body) => {
                                if let Err(e) = client.publish(reply_to, body.into()).await {
                                    warn!(error = %e, "failed to publish command reply");
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to serialize command reply"),
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = subscriber.unsubscribe().await {
            warn!(error = %e, "failed to unsubscribe command listener");
        }
        info!("command listener stopped");
        Ok(())
    }
}

impl std::fmt::Debug for CommandListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandListener")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use twinhub_core::{ActorSettings, Strategies};
    use twinhub_db::MemoryJournal;
    use twinhub_types::{RejectionKind, ResponseBody};

    use super::*;

    fn router() -> EntityRouter {
        EntityRouter::new(
            Arc::new(MemoryJournal::new()),
            Arc::new(Strategies::standard()),
            ActorSettings::default(),
        )
    }

    #[tokio::test]
    async fn create_then_retrieve_over_json() {
        let router = router();
        let create = serde_json::json!({
            "entity_id": {"kind": "thing", "key": "plant:pump-1"},
            "type": "create_thing",
            "thing": {"policy_id": "plant:default", "attributes": {"rpm": 1200}, "features": {}}
        });
        let reply = handle_request(&router, create.to_string().as_bytes()).await;
        let CommandReply::Ok(response) = reply else {
            panic!("create was rejected: {reply:?}");
        };
        assert_eq!(response.revision, 1);

        let retrieve = serde_json::json!({
            "entity_id": {"kind": "thing", "key": "plant:pump-1"},
            "type": "retrieve_thing"
        });
        let reply = handle_request(&router, retrieve.to_string().as_bytes()).await;
        assert!(matches!(
            reply,
            CommandReply::Ok(Response {
                revision: 1,
                result: ResponseBody::State(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn garbage_is_a_validation_rejection() {
        let reply = handle_request(&router(), b"not json").await;
        let CommandReply::Rejected(rejection) = reply else {
            panic!("garbage was accepted");
        };
        assert_eq!(rejection.kind, RejectionKind::Validation);
    }

    #[test]
    fn envelope_shape() {
        let reply = CommandReply::Rejected(Rejection::conflict("stale"));
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["rejected"]["kind"], "conflict");
    }
}
