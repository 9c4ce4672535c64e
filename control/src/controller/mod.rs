//! Service to Ingress controller
//!
//! Informers feed the [`events::EventRouter`], which fills the
//! [`queue::WorkQueue`]; a fixed pool of workers drains it through the
//! [`reconciler::Reconciler`].

pub mod client;
pub mod events;
pub mod informer;
pub mod queue;
pub mod rate_limiter;
pub mod reconciler;

use crate::apis::metrics::{record_queue_drop, record_reconciliation};
use crate::config::ControllerConfig;
use crate::controller::client::ClusterClient;
use crate::controller::events::EventRouter;
use crate::controller::queue::WorkQueue;
use crate::controller::rate_limiter::RateLimiter;
use crate::controller::reconciler::Reconciler;
use crate::error::ControllerError;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Work queue plus reconciler, driven by a worker pool
pub struct Controller<C: ClusterClient> {
    queue: Arc<WorkQueue>,
    reconciler: Reconciler<C>,
    max_retries: u32,
}

impl<C: ClusterClient> Controller<C> {
    pub fn new(client: Arc<C>, config: &ControllerConfig) -> Self {
        let rate_limiter = RateLimiter::new(
            config.queue.base_delay(),
            config.queue.max_delay(),
            config.queue.qps,
            config.queue.burst,
        );

        Self {
            queue: Arc::new(WorkQueue::new(rate_limiter)),
            reconciler: Reconciler::new(
                client,
                config.marker_annotation.clone(),
                config.ingress.clone(),
            ),
            max_retries: config.queue.max_retries,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Router that feeds this controller's queue
    pub fn event_router(&self) -> EventRouter {
        EventRouter::new(self.queue.clone())
    }

    /// Take one key off the queue and reconcile it
    ///
    /// Returns `false` once the queue is shut down and drained.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let start = Instant::now();
        // A panicking reconcile must still release the key
        let result = AssertUnwindSafe(self.reconciler.reconcile(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(ControllerError::ReconcilePanicked(panic_message(&*payload)))
            });
        let elapsed = start.elapsed().as_secs_f64();

        match result {
            Ok(action) => {
                debug!("Reconciled {}: {}", key, action);
                record_reconciliation(elapsed, action.as_str());
                self.queue.forget(&key);
            }
            Err(e) => {
                record_reconciliation(elapsed, "error");
                self.handle_error(&key, e);
            }
        }

        self.queue.done(&key);
        true
    }

    fn handle_error(&self, key: &str, err: ControllerError) {
        let requeues = self.queue.num_requeues(key);

        if err.is_retryable() && requeues < self.max_retries {
            warn!(
                "Error reconciling {} (retry {}/{}): {}",
                key,
                requeues + 1,
                self.max_retries,
                err
            );
            self.queue.add_rate_limited(key);
            return;
        }

        if err.is_retryable() {
            error!(
                "Dropping {} after {} retries: {}",
                key, self.max_retries, err
            );
        } else {
            error!("Dropping {}: {}", key, err);
        }
        self.queue.forget(key);
        record_queue_drop();
    }

    /// Run `workers` workers until `shutdown` fires
    ///
    /// Shutdown stops handing out keys; reconciles already in flight finish.
    pub async fn run(self: Arc<Self>, workers: usize, shutdown: CancellationToken) {
        info!("Starting controller with {} workers", workers);

        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let controller = self.clone();
                tokio::spawn(async move {
                    debug!("Worker {} started", id);
                    while controller.process_next_item().await {}
                    debug!("Worker {} stopped", id);
                })
            })
            .collect();

        shutdown.cancelled().await;
        info!("Shutting down controller");
        self.queue.shut_down();

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }

        info!("Controller stopped");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::controller::client::ClientError;
    use async_trait::async_trait;
    use common::ObjectKey;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::api::networking::v1::Ingress;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Every call fails with a server error
    #[derive(Default)]
    struct FailingClient {
        service_reads: AtomicUsize,
    }

    #[async_trait]
    impl ClusterClient for FailingClient {
        async fn get_service(&self, _namespace: &str, _name: &str) -> Result<Service, ClientError> {
            self.service_reads.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::Api(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "unavailable".to_string(),
                reason: "ServiceUnavailable".to_string(),
                code: 503,
            })))
        }

        async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress, ClientError> {
            Err(ClientError::NotFound {
                kind: "Ingress",
                key: ObjectKey::new(namespace, name),
            })
        }

        async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress, ClientError> {
            Ok(ingress.clone())
        }

        async fn delete_ingress(&self, _namespace: &str, _name: &str) -> Result<(), ClientError> {
            Ok(())
        }
    }

    /// First Service read panics, later ones report the Service gone
    #[derive(Default)]
    struct PanicOnceClient {
        service_reads: AtomicUsize,
    }

    #[async_trait]
    impl ClusterClient for PanicOnceClient {
        async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClientError> {
            if self.service_reads.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("injected failure reading {}/{}", namespace, name);
            }
            Err(ClientError::NotFound {
                kind: "Service",
                key: ObjectKey::new(namespace, name),
            })
        }

        async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress, ClientError> {
            Err(ClientError::NotFound {
                kind: "Ingress",
                key: ObjectKey::new(namespace, name),
            })
        }

        async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress, ClientError> {
            Ok(ingress.clone())
        }

        async fn delete_ingress(&self, _namespace: &str, _name: &str) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn fast_config(max_retries: u32) -> ControllerConfig {
        let mut config = ControllerConfig::default();
        config.queue.max_retries = max_retries;
        config.queue.base_delay_ms = 1;
        config.queue.max_delay_secs = 1;
        config.queue.qps = 1000.0;
        config.queue.burst = 1000;
        config
    }

    #[tokio::test]
    async fn test_transient_error_is_requeued() {
        let client = Arc::new(FailingClient::default());
        let controller = Controller::new(client.clone(), &fast_config(3));

        controller.queue().add("default/foo");
        assert!(controller.process_next_item().await);

        assert_eq!(controller.queue().num_requeues("default/foo"), 1);
        assert_eq!(controller.queue().in_flight(), 0, "done must always be called");
    }

    #[tokio::test]
    async fn test_panicking_reconcile_releases_key_and_retries() {
        let client = Arc::new(PanicOnceClient::default());
        let controller = Controller::new(client.clone(), &fast_config(3));

        controller.queue().add("default/foo");
        assert!(controller.process_next_item().await);

        assert_eq!(controller.queue().in_flight(), 0, "Key must be released");
        assert_eq!(controller.queue().num_requeues("default/foo"), 1);

        // Rate-limited redelivery succeeds and forgets the key
        let redelivered =
            tokio::time::timeout(Duration::from_secs(1), controller.process_next_item())
                .await
                .expect("Key should be redelivered");
        assert!(redelivered);
        assert_eq!(client.service_reads.load(Ordering::SeqCst), 2);
        assert_eq!(controller.queue().num_requeues("default/foo"), 0);
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&"owned".to_string()), "owned");
        assert_eq!(panic_message(&42u8), "unknown panic");
    }

    #[tokio::test]
    async fn test_malformed_key_is_dropped_immediately() {
        let client = Arc::new(FailingClient::default());
        let controller = Controller::new(client.clone(), &fast_config(3));

        controller.queue().add("a/b/c");
        assert!(controller.process_next_item().await);

        assert_eq!(controller.queue().num_requeues("a/b/c"), 0);
        assert_eq!(client.service_reads.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(controller.queue().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let client = Arc::new(FailingClient::default());
        let controller = Arc::new(Controller::new(client, &fast_config(0)));
        let shutdown = CancellationToken::new();

        let run = tokio::spawn(controller.clone().run(2, shutdown.clone()));
        controller.queue().add("default/foo");
        tokio::time::sleep(Duration::from_millis(20)).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("run should return after cancel")
            .unwrap();

        assert!(controller.queue().is_shutting_down());
    }
}
