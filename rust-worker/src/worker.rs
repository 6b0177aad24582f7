//! Worker loop: drives each dequeued event to completion, a requeue, or the
//! dead-letter store.
//!
//! One worker handles one event at a time. The only suspension point that
//! waits for work is the queue's timed dequeue; the shutdown token is checked
//! once per iteration, so an event already in flight always finishes its
//! transition before the worker stops.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::deliver::{Delivery, EmailMessage};
use crate::error::DeliveryError;
use crate::event::Event;
use crate::limiter::{today, RateDecision, RateLimiter};
use crate::metrics::Metrics;
use crate::queue::{DeadLetterEntry, DeadLetterStore, EventQueue, QueueError, QueueResult};
use crate::retry::{classify, RetryDecision, RetryPolicy};

const LIMIT_ALERT_SUBJECT: &str = "[EventFlow] Daily Email Limit Reached";

/// Terminal transition of one processing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Delivered; the event is discarded.
    Completed { retry_count: u32 },
    /// Put back on the queue with the new `retry_count`.
    Requeued { retry_count: u32 },
    /// Moved to the dead-letter store.
    DeadLettered { retry_count: u32, reason: String },
}

/// Collaborators shared by every worker in the process.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<dyn EventQueue>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub delivery: Arc<dyn Delivery>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<Config>,
}

pub struct Worker {
    id: usize,
    ctx: WorkerContext,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(id: usize, ctx: WorkerContext) -> Self {
        let policy = RetryPolicy::new(ctx.config.max_retries);
        Self {
            id,
            ctx,
            policy,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop this worker when `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run(&self) {
        let shutdown = &self.shutdown;

        self.ctx.metrics.worker_started();
        info!(
            worker_id = self.id,
            max_retries = self.policy.max_retries,
            dequeue_timeout_ms = self.ctx.config.dequeue_timeout.as_millis() as u64,
            "worker_started"
        );

        while !shutdown.is_cancelled() {
            let event = match self.ctx.queue.dequeue(self.ctx.config.dequeue_timeout).await {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                // Undecodable message; it is already off the queue.
                Err(QueueError::Codec { .. }) => continue,
                Err(e) => {
                    self.transport_failure(&e).await;
                    continue;
                }
            };

            match self.process(event).await {
                Ok(outcome) => debug!(worker_id = self.id, outcome = ?outcome, "event_transition"),
                Err(e) => self.transport_failure(&e).await,
            }
        }

        self.ctx.metrics.worker_stopped();
        info!(worker_id = self.id, "worker_stopped");
    }

    async fn transport_failure(&self, err: &QueueError) {
        self.ctx.metrics.record_transport_error();
        error!(
            worker_id = self.id,
            error = %err,
            pause_ms = self.ctx.config.error_pause.as_millis() as u64,
            "queue_transport_error"
        );

        tokio::select! {
            _ = tokio::time::sleep(self.ctx.config.error_pause) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Take one dequeued event through the state machine.
    ///
    /// Delivery failures never escape; only queue or dead-letter transport
    /// failures are returned, in which case the event is lost.
    pub async fn process(&self, event: Event) -> QueueResult<Outcome> {
        info!(
            worker_id = self.id,
            event_id = %event.id,
            user_id = %event.user_id,
            event_type = %event.event_type,
            retry_count = event.retry_count,
            "event_dequeued"
        );

        let day = today();
        let result = match self.ctx.limiter.try_consume(day).await {
            RateDecision::Allowed { .. } => {
                let result = self.ctx.delivery.deliver(&event).await;
                match result {
                    Ok(()) => self.ctx.metrics.record_email_sent(),
                    Err(_) => self.ctx.metrics.record_email_failed(),
                }
                result
            }
            RateDecision::Denied { count } => {
                self.ctx.metrics.record_rate_limit_denied();
                warn!(
                    event_id = %event.id,
                    day = %day,
                    count = count,
                    limit = self.ctx.limiter.daily_limit(),
                    "daily_email_limit_reached"
                );
                self.send_limit_alert(day, count).await;
                Err(DeliveryError::RateLimitDenied {
                    day,
                    limit: self.ctx.limiter.daily_limit(),
                })
            }
        };

        match result {
            Ok(()) => {
                self.ctx.metrics.record_completed();
                info!(
                    worker_id = self.id,
                    event_id = %event.id,
                    user_id = %event.user_id,
                    event_type = %event.event_type,
                    retry_count = event.retry_count,
                    "event_processed"
                );
                Ok(Outcome::Completed {
                    retry_count: event.retry_count,
                })
            }
            Err(err) => self.handle_failure(event, err).await,
        }
    }

    async fn handle_failure(&self, mut event: Event, err: DeliveryError) -> QueueResult<Outcome> {
        let class = classify(&err);

        match self.policy.decide(event.retry_count, &err) {
            RetryDecision::Retry { next_retry_count } => {
                event.retry_count = next_retry_count;

                // Cut short on shutdown; the event is still requeued.
                let delay = self.ctx.config.retry_delay;
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => {}
                    }
                }

                if let Err(e) = self.ctx.queue.enqueue(&event).await {
                    error!(event_id = %event.id, error = %e, "requeue_failed");
                    return Err(e);
                }

                self.ctx.metrics.record_retry();
                info!(
                    worker_id = self.id,
                    event_id = %event.id,
                    user_id = %event.user_id,
                    event_type = %event.event_type,
                    retry_count = event.retry_count,
                    max_retries = self.policy.max_retries,
                    classification = %class,
                    error_kind = err.kind(),
                    error = %err,
                    "retry_scheduled"
                );
                Ok(Outcome::Requeued {
                    retry_count: event.retry_count,
                })
            }
            RetryDecision::DeadLetter { reason } => {
                let retry_count = event.retry_count;
                let event_id = event.id;
                let user_id = event.user_id.clone();
                let event_type = event.event_type;

                if let Err(e) = self
                    .ctx
                    .dead_letters
                    .append(DeadLetterEntry::new(event, reason.clone()))
                    .await
                {
                    error!(event_id = %event_id, error = %e, "dead_letter_append_failed");
                    return Err(e);
                }

                self.ctx.metrics.record_dead_lettered();
                warn!(
                    worker_id = self.id,
                    event_id = %event_id,
                    user_id = %user_id,
                    event_type = %event_type,
                    retry_count = retry_count,
                    classification = %class,
                    error_kind = err.kind(),
                    reason = %reason,
                    "event_dead_lettered"
                );
                Ok(Outcome::DeadLettered {
                    retry_count,
                    reason,
                })
            }
        }
    }

    async fn send_limit_alert(&self, day: chrono::NaiveDate, count: u32) {
        let Some(alert_email) = self.ctx.config.alert_email.as_deref() else {
            return;
        };
        if !self.ctx.limiter.claim_alert(day).await {
            return;
        }

        let limit = self.ctx.limiter.daily_limit();
        let message = EmailMessage {
            to: alert_email.to_string(),
            subject: LIMIT_ALERT_SUBJECT.to_string(),
            text: format!(
                "Daily email limit of {} has been reached.\n\n\
                 Emails sent today: {}\n\
                 New email requests will be queued but not sent until tomorrow.",
                limit, count
            ),
            html: None,
        };

        match self.ctx.delivery.send_alert(&message).await {
            Ok(()) => warn!(
                limit = limit,
                count = count,
                alert_email = %alert_email,
                "email_limit_alert_sent"
            ),
            Err(e) => error!(error = %e, "email_limit_alert_failed"),
        }
    }
}

/// Spawn `count` workers sharing `ctx`, all stopped by `shutdown`.
pub fn spawn_workers(
    ctx: &WorkerContext,
    count: usize,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|id| {
            let worker = Worker::new(id, ctx.clone()).with_shutdown(shutdown.clone());
            tokio::spawn(async move { worker.run().await })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    use super::*;
    use crate::event::{EventType, Payload};
    use crate::queue::{MemoryDeadLetters, MemoryQueue};

    /// Delivery that replays scripted results, then a fixed fallback.
    struct ScriptedDelivery {
        script: Mutex<VecDeque<Result<(), DeliveryError>>>,
        fallback: Result<(), DeliveryError>,
        calls: AtomicUsize,
        alerts: Mutex<Vec<EmailMessage>>,
    }

    impl ScriptedDelivery {
        fn always(result: Result<(), DeliveryError>) -> Arc<Self> {
            Self::scripted(Vec::new(), result)
        }

        fn scripted(
            script: Vec<Result<(), DeliveryError>>,
            fallback: Result<(), DeliveryError>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicUsize::new(0),
                alerts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Delivery for ScriptedDelivery {
        async fn deliver(&self, _event: &Event) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().await.pop_front() {
                Some(result) => result,
                None => self.fallback.clone(),
            }
        }

        async fn send_alert(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
            self.alerts.lock().await.push(message.clone());
            Ok(())
        }
    }

    /// Queue whose backing store is always unreachable.
    struct UnreachableQueue;

    #[async_trait]
    impl EventQueue for UnreachableQueue {
        async fn enqueue(&self, _event: &Event) -> QueueResult<()> {
            Err(QueueError::transport("connection refused"))
        }

        async fn dequeue(&self, _timeout: Duration) -> QueueResult<Option<Event>> {
            Err(QueueError::transport("connection refused"))
        }

        async fn len(&self) -> QueueResult<u64> {
            Err(QueueError::transport("connection refused"))
        }

        async fn health_check(&self) -> bool {
            false
        }
    }

    struct Harness {
        queue: Arc<MemoryQueue>,
        dead_letters: Arc<MemoryDeadLetters>,
        delivery: Arc<ScriptedDelivery>,
        metrics: Arc<Metrics>,
        worker: Worker,
    }

    fn harness(delivery: Arc<ScriptedDelivery>, config: Config) -> Harness {
        let queue = Arc::new(MemoryQueue::new());
        let dead_letters = Arc::new(MemoryDeadLetters::new());
        let metrics = Arc::new(Metrics::new());
        let ctx = WorkerContext {
            queue: queue.clone(),
            dead_letters: dead_letters.clone(),
            delivery: delivery.clone(),
            limiter: Arc::new(RateLimiter::new(config.daily_email_limit)),
            metrics: metrics.clone(),
            config: Arc::new(config),
        };
        Harness {
            queue,
            dead_letters,
            delivery,
            metrics,
            worker: Worker::new(0, ctx),
        }
    }

    fn notification() -> Event {
        let payload: Payload =
            serde_json::from_value(json!({"to": "a@b.com", "message": "hi"})).unwrap();
        Event::new("u1", EventType::UserNotification, payload)
    }

    async fn next(h: &Harness) -> Event {
        h.queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .expect("event should be queued")
    }

    #[tokio::test]
    async fn test_successful_delivery_completes() {
        let h = harness(ScriptedDelivery::always(Ok(())), Config::default());
        h.queue.enqueue(&notification()).await.unwrap();

        let event = next(&h).await;
        let outcome = h.worker.process(event).await.unwrap();

        assert_eq!(outcome, Outcome::Completed { retry_count: 0 });
        assert_eq!(h.dead_letters.len().await.unwrap(), 0);
        assert_eq!(h.queue.len().await.unwrap(), 0);
        assert_eq!(h.metrics.snapshot().events_completed, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_hits_retry_ceiling() {
        let h = harness(
            ScriptedDelivery::always(Err(DeliveryError::Timeout { timeout_ms: 100 })),
            Config::default(),
        );
        let original = notification();
        h.queue.enqueue(&original).await.unwrap();

        let first = h.worker.process(next(&h).await).await.unwrap();
        assert_eq!(first, Outcome::Requeued { retry_count: 1 });

        let second = h.worker.process(next(&h).await).await.unwrap();
        assert_eq!(second, Outcome::Requeued { retry_count: 2 });

        match h.worker.process(next(&h).await).await.unwrap() {
            Outcome::DeadLettered {
                retry_count,
                reason,
            } => {
                assert_eq!(retry_count, 2);
                assert!(reason.contains("max retries (3) exceeded"));
            }
            other => panic!("expected dead letter, got {:?}", other),
        }

        assert_eq!(h.delivery.calls(), 3);
        assert_eq!(h.queue.len().await.unwrap(), 0);

        let entries = h.dead_letters.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event.id, original.id);
        assert_eq!(entries[0].event.retry_count, 2);

        let s = h.metrics.snapshot();
        assert_eq!(s.events_retried, 2);
        assert_eq!(s.events_dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let h = harness(
            ScriptedDelivery::scripted(vec![Err(DeliveryError::connection("refused"))], Ok(())),
            Config::default(),
        );
        h.queue.enqueue(&notification()).await.unwrap();

        assert_eq!(
            h.worker.process(next(&h).await).await.unwrap(),
            Outcome::Requeued { retry_count: 1 }
        );
        assert_eq!(
            h.worker.process(next(&h).await).await.unwrap(),
            Outcome::Completed { retry_count: 1 }
        );
        assert_eq!(h.dead_letters.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_short_circuits() {
        let h = harness(
            ScriptedDelivery::always(Err(DeliveryError::from_status(400, "bad request"))),
            Config::default(),
        );
        h.queue.enqueue(&notification()).await.unwrap();

        match h.worker.process(next(&h).await).await.unwrap() {
            Outcome::DeadLettered {
                retry_count,
                reason,
            } => {
                assert_eq!(retry_count, 0);
                assert!(reason.starts_with("permanent failure"));
            }
            other => panic!("expected dead letter, got {:?}", other),
        }

        assert_eq!(h.delivery.calls(), 1);
        assert_eq!(h.queue.len().await.unwrap(), 0);
        assert_eq!(h.dead_letters.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_daily_limit_denies_without_delivery() {
        let config = Config {
            daily_email_limit: 20,
            alert_email: Some("ops@example.com".to_string()),
            ..Config::default()
        };
        let h = harness(ScriptedDelivery::always(Ok(())), config);

        for _ in 0..20 {
            let outcome = h.worker.process(notification()).await.unwrap();
            assert!(matches!(outcome, Outcome::Completed { .. }));
        }
        assert_eq!(h.delivery.calls(), 20);

        let outcome = h.worker.process(notification()).await.unwrap();
        assert_eq!(outcome, Outcome::Requeued { retry_count: 1 });
        assert_eq!(h.delivery.calls(), 20);
        assert_eq!(h.metrics.snapshot().rate_limit_denied, 1);

        // Still denied on the later attempts; the alert goes out once.
        assert_eq!(
            h.worker.process(next(&h).await).await.unwrap(),
            Outcome::Requeued { retry_count: 2 }
        );
        assert_eq!(
            h.worker.process(next(&h).await).await.unwrap(),
            Outcome::DeadLettered {
                retry_count: 2,
                reason: "rate limit exhausted".to_string()
            }
        );
        assert_eq!(h.delivery.calls(), 20);

        let alerts = h.delivery.alerts.lock().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].to, "ops@example.com");
        assert_eq!(alerts[0].subject, LIMIT_ALERT_SUBJECT);
    }

    #[tokio::test]
    async fn test_no_alert_without_recipient() {
        let config = Config {
            daily_email_limit: 0,
            ..Config::default()
        };
        let h = harness(ScriptedDelivery::always(Ok(())), config);

        h.worker.process(notification()).await.unwrap();
        assert!(h.delivery.alerts.lock().await.is_empty());
        assert_eq!(h.delivery.calls(), 0);
    }

    #[tokio::test]
    async fn test_requeue_transport_failure_loses_event() {
        let dead_letters = Arc::new(MemoryDeadLetters::new());
        let ctx = WorkerContext {
            queue: Arc::new(UnreachableQueue),
            dead_letters: dead_letters.clone(),
            delivery: ScriptedDelivery::always(Err(DeliveryError::Timeout { timeout_ms: 1 })),
            limiter: Arc::new(RateLimiter::new(20)),
            metrics: Arc::new(Metrics::new()),
            config: Arc::new(Config::default()),
        };
        let worker = Worker::new(0, ctx);

        let err = worker.process(notification()).await.unwrap_err();
        assert!(matches!(err, QueueError::Transport { .. }));
        assert_eq!(dead_letters.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_event_dropped_after_dequeue_is_gone() {
        let h = harness(ScriptedDelivery::always(Ok(())), Config::default());
        h.queue.enqueue(&notification()).await.unwrap();

        // A worker that dies here never hands the event back.
        drop(next(&h).await);

        assert_eq!(h.queue.len().await.unwrap(), 0);
        assert_eq!(h.dead_letters.len().await.unwrap(), 0);
        assert!(h
            .queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
        assert_eq!(h.delivery.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stays_live_on_empty_queue_and_stops_on_cancel() {
        let h = harness(ScriptedDelivery::always(Ok(())), Config::default());
        let token = CancellationToken::new();
        let worker = h.worker.with_shutdown(token.clone());

        let handle = tokio::spawn(async move { worker.run().await });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!handle.is_finished());
        assert_eq!(h.metrics.snapshot().workers_running, 1);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should stop after cancel")
            .unwrap();
        assert_eq!(h.metrics.snapshot().workers_running, 0);
    }

    #[tokio::test]
    async fn test_loop_processes_queued_events() {
        let config = Config {
            dequeue_timeout: Duration::from_millis(20),
            ..Config::default()
        };
        let h = harness(ScriptedDelivery::always(Ok(())), config);
        for _ in 0..3 {
            h.queue.enqueue(&notification()).await.unwrap();
        }

        let token = CancellationToken::new();
        let worker = h.worker.with_shutdown(token.clone());
        let handle = tokio::spawn(async move { worker.run().await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.metrics.snapshot().events_completed < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("events should complete");

        token.cancel();
        handle.await.unwrap();
        assert_eq!(h.delivery.calls(), 3);
        assert_eq!(h.queue.len().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_pauses_on_transport_error() {
        let metrics = Arc::new(Metrics::new());
        let ctx = WorkerContext {
            queue: Arc::new(UnreachableQueue),
            dead_letters: Arc::new(MemoryDeadLetters::new()),
            delivery: ScriptedDelivery::always(Ok(())),
            limiter: Arc::new(RateLimiter::new(20)),
            metrics: metrics.clone(),
            config: Arc::new(Config {
                error_pause: Duration::from_secs(1),
                ..Config::default()
            }),
        };
        let token = CancellationToken::new();
        let worker = Worker::new(0, ctx).with_shutdown(token.clone());
        let handle = tokio::spawn(async move { worker.run().await });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let errors = metrics.snapshot().transport_errors;
        assert!((3..=5).contains(&errors), "got {} transport errors", errors);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_workers_share_queue() {
        let queue = Arc::new(MemoryQueue::new());
        let delivery = ScriptedDelivery::always(Ok(()));
        let metrics = Arc::new(Metrics::new());
        let ctx = WorkerContext {
            queue: queue.clone(),
            dead_letters: Arc::new(MemoryDeadLetters::new()),
            delivery: delivery.clone(),
            limiter: Arc::new(RateLimiter::new(100)),
            metrics: metrics.clone(),
            config: Arc::new(Config {
                dequeue_timeout: Duration::from_millis(20),
                ..Config::default()
            }),
        };
        for _ in 0..10 {
            queue.enqueue(&notification()).await.unwrap();
        }

        let token = CancellationToken::new();
        let handles = spawn_workers(&ctx, 3, &token);
        assert_eq!(handles.len(), 3);

        tokio::time::timeout(Duration::from_secs(5), async {
            while metrics.snapshot().events_completed < 10 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("events should complete");

        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(delivery.calls(), 10);
    }

    #[tokio::test]
    async fn test_retry_delay_is_cut_short_by_shutdown() {
        let config = Config {
            retry_delay: Duration::from_secs(60),
            dequeue_timeout: Duration::from_millis(20),
            ..Config::default()
        };
        let h = harness(
            ScriptedDelivery::always(Err(DeliveryError::Timeout { timeout_ms: 1 })),
            config,
        );
        let original = notification();
        h.queue.enqueue(&original).await.unwrap();

        let token = CancellationToken::new();
        let worker = h.worker.with_shutdown(token.clone());
        let handle = tokio::spawn(async move { worker.run().await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.delivery.calls() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first attempt should run");

        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker should not wait out the retry delay")
            .unwrap();

        // The pending retry still lands back on the queue.
        let requeued = h
            .queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .expect("event should be queued");
        assert_eq!(requeued.id, original.id);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(h.dead_letters.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_workers_in_one_process_share_the_daily_limit() {
        let queue = Arc::new(MemoryQueue::new());
        let delivery = ScriptedDelivery::always(Ok(()));
        let metrics = Arc::new(Metrics::new());
        let ctx = WorkerContext {
            queue: queue.clone(),
            dead_letters: Arc::new(MemoryDeadLetters::new()),
            delivery: delivery.clone(),
            limiter: Arc::new(RateLimiter::new(5)),
            metrics: metrics.clone(),
            config: Arc::new(Config {
                dequeue_timeout: Duration::from_millis(20),
                ..Config::default()
            }),
        };
        for _ in 0..10 {
            queue.enqueue(&notification()).await.unwrap();
        }

        let token = CancellationToken::new();
        let handles = spawn_workers(&ctx, 4, &token);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let s = metrics.snapshot();
                if s.events_completed + s.events_dead_lettered >= 10 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("every event should reach a terminal state");

        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        let s = metrics.snapshot();
        assert_eq!(delivery.calls(), 5);
        assert_eq!(s.events_completed, 5);
        assert_eq!(s.events_dead_lettered, 5);
    }
}
