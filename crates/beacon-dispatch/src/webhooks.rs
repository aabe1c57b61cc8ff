use std::sync::Arc;

use async_trait::async_trait;
use beacon_db::Database;
use beacon_types::events::WebhookEvent;
use beacon_types::models::{EventType, Webhook};
use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::queue::{Deliver, DeliveryJob, DeliveryOutcome, DispatchQueue, QueueSizing};

/// Where webhook destinations are registered.
pub trait WebhookRegistry: Send + Sync + 'static {
    fn webhooks_for_event(&self, event: EventType) -> anyhow::Result<Vec<Webhook>>;
    fn mark_used(&self, webhook_id: i64) -> anyhow::Result<()>;
}

impl WebhookRegistry for Database {
    fn webhooks_for_event(&self, event: EventType) -> anyhow::Result<Vec<Webhook>> {
        self.get_webhooks_for_event(event)
    }

    fn mark_used(&self, webhook_id: i64) -> anyhow::Result<()> {
        self.set_webhook_used(webhook_id)
    }
}

/// One event addressed to one registered destination.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub webhook_id: i64,
    pub event: Arc<WebhookEvent>,
}

/// POSTs the event as JSON and stamps `last_used` on success.
pub struct WebhookDeliverer {
    client: reqwest::Client,
    registry: Arc<dyn WebhookRegistry>,
}

impl WebhookDeliverer {
    pub fn new(client: reqwest::Client, registry: Arc<dyn WebhookRegistry>) -> Self {
        Self { client, registry }
    }
}

#[async_trait]
impl Deliver<WebhookDelivery> for WebhookDeliverer {
    async fn deliver(&self, url: &str, delivery: WebhookDelivery) -> Result<(), DispatchError> {
        debug!("Event {} sent to webhook {}", delivery.event.event_type, url);

        let response = self.client.post(url).json(&*delivery.event).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Status(status));
        }

        let registry = self.registry.clone();
        let id = delivery.webhook_id;
        match tokio::task::spawn_blocking(move || registry.mark_used(id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to mark webhook {} as used: {}", id, e),
            Err(e) => warn!("Webhook bookkeeping task failed: {}", e),
        }

        Ok(())
    }
}

/// Fans one logical event out to every subscribed destination.
#[derive(Clone)]
pub struct WebhookNotifier {
    queue: DispatchQueue<WebhookDelivery>,
    registry: Arc<dyn WebhookRegistry>,
}

impl WebhookNotifier {
    pub fn start(
        client: reqwest::Client,
        registry: Arc<dyn WebhookRegistry>,
        sizing: QueueSizing,
    ) -> Self {
        let deliverer = Arc::new(WebhookDeliverer::new(client, registry.clone()));
        Self::with_deliverer(registry, sizing, deliverer)
    }

    pub fn with_deliverer(
        registry: Arc<dyn WebhookRegistry>,
        sizing: QueueSizing,
        deliverer: Arc<dyn Deliver<WebhookDelivery>>,
    ) -> Self {
        Self {
            queue: DispatchQueue::start("Webhook", sizing, deliverer),
            registry,
        }
    }

    /// Queue `event` for every destination subscribed to its type. Returns
    /// the number of jobs queued.
    pub async fn notify(&self, event: WebhookEvent) -> Result<usize, DispatchError> {
        let (hooks, event) = self.resolve(event).await?;
        let count = hooks.len();

        for hook in hooks {
            let delivery = WebhookDelivery {
                webhook_id: hook.id,
                event: event.clone(),
            };
            self.queue.enqueue(DeliveryJob::new(hook.url, delivery)).await?;
        }

        Ok(count)
    }

    /// Like [`notify`](Self::notify) but waits for every attempt to finish.
    pub async fn notify_and_wait(
        &self,
        event: WebhookEvent,
    ) -> Result<Vec<DeliveryOutcome>, DispatchError> {
        let (hooks, event) = self.resolve(event).await?;

        let mut pending = Vec::with_capacity(hooks.len());
        for hook in hooks {
            let delivery = WebhookDelivery {
                webhook_id: hook.id,
                event: event.clone(),
            };
            let (job, done) = DeliveryJob::with_completion(hook.url, delivery);
            self.queue.enqueue(job).await?;
            pending.push(done);
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        for done in pending {
            // A dropped sender means the worker went away mid-job
            outcomes.push(
                done.await
                    .unwrap_or_else(|_| DeliveryOutcome::Failed("worker stopped".into())),
            );
        }
        Ok(outcomes)
    }

    async fn resolve(
        &self,
        event: WebhookEvent,
    ) -> Result<(Vec<Webhook>, Arc<WebhookEvent>), DispatchError> {
        let registry = self.registry.clone();
        let event_type = event.event_type;
        let hooks = tokio::task::spawn_blocking(move || registry.webhooks_for_event(event_type))
            .await
            .map_err(|e| DispatchError::Registry(e.into()))??;
        Ok((hooks, Arc::new(event)))
    }
}
