use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is closed.
    ///
    /// Used after a transaction has committed, where the write must not be
    /// reported as failed because nobody is listening.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("{}", e);
        }
    }
}

/// Domain events emitted by the order engine after each committed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        user_id: Uuid,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    InventoryAdjusted {
        product_id: Uuid,
        delta: i32,
        order_id: Uuid,
    },
    OwnershipGranted {
        user_id: Uuid,
        product_ids: Vec<Uuid>,
    },
    OwnershipRevoked {
        user_id: Uuid,
        product_ids: Vec<Uuid>,
    },
}

/// Drains the event channel, logging each event until all senders are dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated { order_id, user_id } => {
                info!(%order_id, %user_id, "order created");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(%order_id, %old_status, %new_status, "order status changed");
            }
            Event::InventoryAdjusted {
                product_id,
                delta,
                order_id,
            } => {
                debug!(%product_id, delta, %order_id, "inventory adjusted");
            }
            Event::OwnershipGranted {
                user_id,
                product_ids,
            } => {
                info!(%user_id, count = product_ids.len(), "ownership granted");
            }
            Event::OwnershipRevoked {
                user_id,
                product_ids,
            } => {
                info!(%user_id, count = product_ids.len(), "ownership revoked");
            }
        }
    }

    info!("Event processing loop stopped");
}
