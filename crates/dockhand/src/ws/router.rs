//! Routes decoded frames to their family's handler group.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;

use super::dispatch::{ExecMode, HandlerGroup, run_guarded};
use super::registry::{CancelHandle, SessionHandle};
use super::types::{
    Envelope, Family, InboundEnvelope, MessageType, RoutingError, classify, validate_routing_table,
};
use crate::ops::{self, OperationContext, Services};

#[derive(Debug, thiserror::Error)]
pub enum RouterSetupError {
    #[error("routing table is not exhaustive: {0:?}")]
    Table(Vec<RoutingError>),

    #[error("no handler group for family {0}")]
    MissingGroup(Family),

    #[error("{kind} is registered in the {group} group but belongs to {family}")]
    Misplaced {
        kind: MessageType,
        group: Family,
        family: Family,
    },

    #[error("client message {0} has no executor")]
    MissingExecutor(MessageType),

    #[error("event-only message {0} has an executor")]
    EventExecutor(MessageType),
}

/// Entry point for every inbound frame.
pub struct MessageRouter {
    groups: HashMap<Family, HandlerGroup>,
    services: Arc<Services>,
}

impl MessageRouter {
    /// Router over the standard handler groups.
    pub fn new(services: Arc<Services>) -> Result<Self, RouterSetupError> {
        Self::with_groups(
            services,
            vec![
                ops::container::handler_group(),
                ops::image::handler_group(),
                ops::app::handler_group(),
                ops::system::handler_group(),
            ],
        )
    }

    /// Build and check a router. Every client tag must reach exactly one
    /// executor in the group of its own family.
    pub fn with_groups(
        services: Arc<Services>,
        groups: Vec<HandlerGroup>,
    ) -> Result<Self, RouterSetupError> {
        validate_routing_table().map_err(RouterSetupError::Table)?;

        let groups: HashMap<Family, HandlerGroup> =
            groups.into_iter().map(|g| (g.family(), g)).collect();
        for family in Family::ALL {
            if !groups.contains_key(family) {
                return Err(RouterSetupError::MissingGroup(*family));
            }
        }
        for group in groups.values() {
            for kind in group.kinds() {
                if kind.family() != group.family() {
                    return Err(RouterSetupError::Misplaced {
                        kind,
                        group: group.family(),
                        family: kind.family(),
                    });
                }
                if !kind.is_inbound() {
                    return Err(RouterSetupError::EventExecutor(kind));
                }
            }
        }
        for kind in MessageType::ALL {
            let registered = groups
                .get(&kind.family())
                .is_some_and(|g| g.get(*kind).is_some());
            if kind.is_inbound() && !registered {
                return Err(RouterSetupError::MissingExecutor(*kind));
            }
        }

        Ok(Self { groups, services })
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Handle one text frame. Never fails: problems are reported to the
    /// session as `ERROR` envelopes.
    pub async fn route(&self, session: &SessionHandle, text: &str) {
        let inbound = match InboundEnvelope::decode(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Malformed frame on session {}: {}", session.id(), e);
                session
                    .send(Envelope::error(format!("malformed envelope: {e}"), None))
                    .await;
                return;
            }
        };
        let operation_id = inbound.operation_id();
        let correlation_id = inbound.correlation_id.clone();

        let kind: MessageType = match inbound.kind.parse() {
            Ok(kind) => kind,
            Err(message) => {
                // Report whether the prefix was at least recognizable.
                let message = match classify(&inbound.kind) {
                    Ok(family) => format!("{message} in {family} family"),
                    Err(_) => message,
                };
                warn!("Session {}: {}", session.id(), message);
                session
                    .send(rejection(message, operation_id.as_deref(), &correlation_id))
                    .await;
                return;
            }
        };

        let family = kind.family();
        let Some(executor) = self.groups.get(&family).and_then(|g| g.get(kind)).cloned() else {
            warn!(
                "Session {} sent {} which the {} group does not accept",
                session.id(),
                kind,
                family
            );
            session
                .send(rejection(
                    format!("message type {kind} is not accepted from clients"),
                    operation_id.as_deref(),
                    &correlation_id,
                ))
                .await;
            return;
        };

        let operation_id = operation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        debug!(
            "Session {} -> {} [{}] op {}",
            session.id(),
            kind,
            family,
            operation_id
        );

        match executor.mode {
            ExecMode::Inline => {
                let ctx = OperationContext::new(
                    self.services.clone(),
                    session.clone(),
                    kind,
                    operation_id,
                    correlation_id,
                    inbound.payload,
                    CancelHandle::new(),
                );
                run_guarded(executor, ctx, None).await;
            }
            ExecMode::Spawned => {
                let lease = match session.track_operation(&operation_id) {
                    Ok(lease) => lease,
                    Err(e) => {
                        session
                            .send(rejection(e.to_string(), Some(&operation_id), &correlation_id))
                            .await;
                        return;
                    }
                };
                let ctx = OperationContext::new(
                    self.services.clone(),
                    session.clone(),
                    kind,
                    operation_id,
                    correlation_id,
                    inbound.payload,
                    lease.handle(),
                );
                tokio::spawn(run_guarded(executor, ctx, Some(lease)));
            }
        }
    }
}

fn rejection(message: String, operation_id: Option<&str>, correlation_id: &Option<String>) -> Envelope {
    Envelope::error(message, operation_id).with_correlation(correlation_id.clone())
}
