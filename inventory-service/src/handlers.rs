use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Message, Offset};
use shared::*;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{InventoryError, StoreError};
use crate::events::MessageSink;
use crate::models::CommandOrigin;
use crate::reservations::{CreateReservation, ReservationOrchestrator};
use crate::service::{stock_update_result, InventoryService};
use crate::store::InventoryStore;

/// Executes inventory commands from the command topic and answers each one on
/// the reply topic.
pub struct CommandHandler {
    orchestrator: Arc<ReservationOrchestrator>,
    service: Arc<InventoryService>,
    store: Arc<dyn InventoryStore>,
    sink: Arc<dyn MessageSink>,
    clock: Arc<dyn Clock>,
    reply_topic: String,
}

impl CommandHandler {
    pub fn new(
        orchestrator: Arc<ReservationOrchestrator>,
        service: Arc<InventoryService>,
        store: Arc<dyn InventoryStore>,
        sink: Arc<dyn MessageSink>,
        clock: Arc<dyn Clock>,
        reply_topic: String,
    ) -> Self {
        Self {
            orchestrator,
            service,
            store,
            sink,
            clock,
            reply_topic,
        }
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            let m = match message {
                Ok(m) => m,
                Err(e) => {
                    error!("Error receiving message: {}", e);
                    continue;
                }
            };

            let result = match m.payload_view::<str>() {
                Some(Ok(json_str)) => match serde_json::from_str::<Command>(json_str) {
                    Ok(command) => self.process(command).await,
                    Err(e) => {
                        warn!(offset = m.offset(), "Discarding undecodable command: {}", e);
                        Ok(())
                    }
                },
                Some(Err(e)) => {
                    error!("Error parsing payload: {}", e);
                    Ok(())
                }
                None => Ok(()),
            };

            match result {
                Ok(()) => {
                    if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                        error!("Error committing message: {}", e);
                    }
                }
                Err(e) => {
                    error!(offset = m.offset(), "Error handling command, will be redelivered: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    if let Err(e) = consumer.seek(
                        m.topic(),
                        m.partition(),
                        Offset::Offset(m.offset()),
                        Duration::from_secs(5),
                    ) {
                        error!("Error seeking back to failed command: {}", e);
                    }
                }
            }
        }
    }

    /// Handle one command and publish its reply.
    pub async fn process(&self, command: Command) -> Result<()> {
        let reply = self.handle_command(command).await?;
        self.send_reply(&reply).await
    }

    /// Execute `command` unless its idempotency key was seen before, in which
    /// case the recorded reply is returned.
    ///
    /// A command that changes state commits its reply in the same transaction
    /// as the change, so a redelivery never runs it twice. Domain failures
    /// become failed replies; store failures are returned as errors.
    pub async fn handle_command(&self, command: Command) -> Result<CommandReply, InventoryError> {
        if let Some(existing) = self.store.find_processed_command(&command.idempotency_key).await? {
            return self.replay(&command, existing);
        }

        let origin = CommandOrigin::new(command.idempotency_key.clone(), command.id);
        let reply = match self.execute(&command.action, &origin).await {
            Ok(result) => CommandReply::success(command.id, Some(result)),
            // Another delivery of the same command committed first.
            Err(InventoryError::Store(StoreError::DuplicateCommand(key))) => {
                return match self.store.find_processed_command(&key).await? {
                    Some(existing) => self.replay(&command, existing),
                    None => Err(StoreError::DuplicateCommand(key).into()),
                };
            }
            Err(e) if e.is_domain() => {
                warn!(command_id = %command.id, kind = e.kind(), "Command rejected: {}", e);
                CommandReply::failed(command.id, e.kind(), e.to_string())
            }
            Err(e) => return Err(e),
        };

        // A conflict is retryable, so the key stays free for the retry.
        if reply.error_kind.as_deref() == Some("VersionConflict") {
            return Ok(reply);
        }

        // Answers that changed nothing. A reply committed with a write is kept.
        let recorded = serde_json::to_value(&reply)
            .map_err(|e| StoreError::Corrupt(format!("reply: {e}")))?;
        self.store
            .record_processed_command(&command.idempotency_key, command.id, &recorded, self.clock.now())
            .await?;

        Ok(reply)
    }

    fn replay(&self, command: &Command, existing: serde_json::Value) -> Result<CommandReply, InventoryError> {
        info!(
            command_id = %command.id,
            idempotency_key = %command.idempotency_key,
            "Command already processed, returning recorded reply"
        );
        let mut reply: CommandReply = serde_json::from_value(existing)
            .map_err(|e| StoreError::Corrupt(format!("recorded reply: {e}")))?;
        reply.id = Uuid::new_v4();
        reply.command_id = command.id;
        reply.created_at = self.clock.now();
        Ok(reply)
    }

    async fn execute(
        &self,
        action: &CommandAction,
        origin: &CommandOrigin,
    ) -> Result<serde_json::Value, InventoryError> {
        let origin = Some(origin);
        let value = match action.clone() {
            CommandAction::CreateReservation {
                item_id,
                customer_id,
                quantity,
                timeout_minutes,
                planned_start,
                planned_end,
                notes,
            } => {
                let request = CreateReservation {
                    item_id,
                    customer_id,
                    quantity,
                    timeout_minutes,
                    planned_start,
                    planned_end,
                    notes,
                };
                let reservation = self.orchestrator.create(request, origin).await?;
                to_value(&reservation)?
            }
            CommandAction::ConfirmReservation { reservation_id } => {
                to_value(&self.orchestrator.confirm(&reservation_id, origin).await?)?
            }
            CommandAction::CancelReservation { reservation_id, reason } => {
                to_value(&self.orchestrator.cancel(&reservation_id, reason, origin).await?)?
            }
            CommandAction::ExtendReservation {
                reservation_id,
                additional_minutes,
                reason,
            } => to_value(
                &self
                    .orchestrator
                    .extend(&reservation_id, additional_minutes, reason, origin)
                    .await?,
            )?,
            CommandAction::UpdateStock { item_id, delta, reason } => {
                let updated = self
                    .service
                    .adjust_stock(item_id, delta, reason.as_deref(), origin)
                    .await?;
                stock_update_result(item_id, updated)
            }
        };
        Ok(value)
    }

    async fn send_reply(&self, reply: &CommandReply) -> Result<()> {
        let json = serde_json::to_string(reply)?;
        let key = reply.command_id.to_string();
        self.sink.send(&self.reply_topic, &key, json).await
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, InventoryError> {
    serde_json::to_value(value)
        .map_err(|e| InventoryError::from(StoreError::Corrupt(format!("reply payload: {e}"))))
}
