//! Ingestion pipeline: event transport deliveries in, ack/nack out.
//!
//! ```text
//! transport ── Delivery{seq, payload, reply} ──► IngestPipeline
//!                                                   │ decode
//!                                                   │   └─ malformed → Ack (dropped)
//!                                                   │ ProjectionApplier::apply
//!                                                   │   ├─ committed → Ack
//!                                                   │   └─ failed    → Nack (redeliver)
//! ```
//!
//! Deliveries are acknowledged only after the store commit returns, so a
//! crash between the two leads to redelivery rather than a lost mutation.
//! Redelivered projections are re-applied; field merges are overwrites, so
//! replaying the same sequence leaves the same record behind.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::applier::{ApplyError, ProjectionApplier};
use crate::projection::Projection;

/// What the transport should do with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done with it, never redeliver
    Ack,
    /// Not applied, redeliver later
    Nack,
}

/// Result of processing one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Payload did not decode; nothing was touched
    Discarded,
}

/// One message handed over by the event transport.
#[derive(Debug)]
pub struct Delivery {
    pub sequence: u64,
    pub payload: Vec<u8>,
    reply: Option<oneshot::Sender<Disposition>>,
}

impl Delivery {
    /// A delivery whose disposition is reported on the returned receiver.
    pub fn new(sequence: u64, payload: Vec<u8>) -> (Self, oneshot::Receiver<Disposition>) {
        let (tx, rx) = oneshot::channel();
        let delivery = Self {
            sequence,
            payload,
            reply: Some(tx),
        };
        (delivery, rx)
    }

    /// A delivery nobody waits on.
    pub fn unacknowledged(sequence: u64, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            payload,
            reply: None,
        }
    }

    fn settle(self, disposition: Disposition) {
        if let Some(reply) = self.reply {
            // Transport may have given up waiting.
            let _ = reply.send(disposition);
        }
    }
}

/// Ingestion failures that must not be acknowledged.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Failed to apply projection at sequence {sequence}: {source}")]
    Apply {
        sequence: u64,
        #[source]
        source: ApplyError,
    },
}

/// Pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub applied: u64,
    pub discarded: u64,
    pub failed: u64,
}

struct AtomicIngestStats {
    applied: AtomicU64,
    discarded: AtomicU64,
    failed: AtomicU64,
}

impl AtomicIngestStats {
    fn new() -> Self {
        Self {
            applied: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }
}

/// Decodes deliveries and applies them in arrival order.
pub struct IngestPipeline {
    applier: ProjectionApplier,
    stats: AtomicIngestStats,
}

impl IngestPipeline {
    pub fn new(applier: ProjectionApplier) -> Self {
        Self {
            applier,
            stats: AtomicIngestStats::new(),
        }
    }

    /// Decode and apply one payload.
    pub fn process(&self, sequence: u64, payload: &[u8]) -> Result<Outcome, IngestError> {
        let projection = match Projection::decode(payload) {
            Ok(projection) => projection,
            Err(e) => {
                log::warn!("Discarding malformed projection at sequence {sequence}: {e}");
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                return Ok(Outcome::Discarded);
            }
        };

        if let Err(source) = self.applier.apply(sequence, &projection) {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            return Err(IngestError::Apply { sequence, source });
        }

        self.stats.applied.fetch_add(1, Ordering::Relaxed);
        Ok(Outcome::Applied)
    }

    /// Process a delivery and report its disposition back to the transport.
    pub fn handle(&self, delivery: Delivery) -> Disposition {
        let disposition = match self.process(delivery.sequence, &delivery.payload) {
            Ok(_) => Disposition::Ack,
            Err(e) => {
                log::error!("{e}");
                Disposition::Nack
            }
        };
        delivery.settle(disposition);
        disposition
    }

    /// Consume deliveries one at a time until the channel closes.
    pub async fn run(self: Arc<Self>, deliveries: mpsc::Receiver<Delivery>) -> IngestStats {
        self.run_until(deliveries, std::future::pending::<()>()).await
    }

    /// Consume deliveries one at a time until the channel closes or `stop`
    /// resolves.
    ///
    /// Storage work runs on the blocking pool; the next delivery is not
    /// taken until the previous one settled. `stop` is only observed between
    /// deliveries, so once this returns no apply is still running. Deliveries
    /// left in the channel are dropped unacknowledged.
    pub async fn run_until<F>(
        self: Arc<Self>,
        mut deliveries: mpsc::Receiver<Delivery>,
        stop: F,
    ) -> IngestStats
    where
        F: Future<Output = ()>,
    {
        log::info!("Ingestion pipeline started");
        tokio::pin!(stop);

        loop {
            let delivery = tokio::select! {
                biased;
                _ = &mut stop => {
                    log::info!("Ingestion stop requested, {} deliveries left queued", deliveries.len());
                    break;
                }
                next = deliveries.recv() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let sequence = delivery.sequence;
            let pipeline = self.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || pipeline.handle(delivery)).await {
                // Reply sender was dropped with the task; the transport sees no ack.
                log::error!("Ingestion task for sequence {sequence} failed: {e}");
            }
        }

        let stats = self.stats();
        log::info!(
            "Ingestion pipeline stopped: {} applied, {} discarded, {} failed",
            stats.applied,
            stats.discarded,
            stats.failed
        );
        stats
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            applied: self.stats.applied.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    pub fn applier(&self) -> &ProjectionApplier {
        &self.applier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CollectionRegistry, RegistryConfig};
    use tempfile::tempdir;

    fn pipeline(dir: &std::path::Path) -> IngestPipeline {
        let registry = Arc::new(CollectionRegistry::new(RegistryConfig::for_testing(dir)));
        IngestPipeline::new(ProjectionApplier::new(registry))
    }

    fn payload(projection: &Projection) -> Vec<u8> {
        projection.encode().unwrap()
    }

    #[test]
    fn test_process_applies_projection() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(dir.path());

        let outcome = pipeline
            .process(3, &payload(&Projection::upsert("users").with_primary("id", 1)))
            .unwrap();
        assert_eq!(outcome, Outcome::Applied);

        let store = pipeline.applier().registry().lookup("users").unwrap().unwrap();
        assert_eq!(store.current_sequence().unwrap(), 3);
        assert_eq!(pipeline.stats().applied, 1);
    }

    #[test]
    fn test_malformed_payload_is_discarded_and_acked() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(dir.path());

        let (delivery, mut rx) = Delivery::new(1, b"{{{".to_vec());
        assert_eq!(pipeline.handle(delivery), Disposition::Ack);
        assert_eq!(rx.try_recv().unwrap(), Disposition::Ack);

        assert_eq!(pipeline.stats().discarded, 1);
        assert!(pipeline.applier().registry().collection_names().unwrap().is_empty());
    }

    #[test]
    fn test_apply_failure_is_nacked() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(dir.path());

        let bad = payload(&Projection::upsert("a/b").with_field("x", 1));
        let (delivery, mut rx) = Delivery::new(1, bad);
        assert_eq!(pipeline.handle(delivery), Disposition::Nack);
        assert_eq!(rx.try_recv().unwrap(), Disposition::Nack);
        assert_eq!(pipeline.stats().failed, 1);
    }

    #[test]
    fn test_unacknowledged_delivery() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(dir.path());

        let delivery = Delivery::unacknowledged(
            1,
            payload(&Projection::upsert("users").with_primary("id", 1)),
        );
        assert_eq!(pipeline.handle(delivery), Disposition::Ack);
    }

    #[tokio::test]
    async fn test_run_processes_in_order() {
        let dir = tempdir().unwrap();
        let pipeline = Arc::new(pipeline(dir.path()));
        let (tx, rx) = mpsc::channel(16);
        let runner = tokio::spawn(pipeline.clone().run(rx));

        let mut replies = Vec::new();
        for seq in 1..=10u64 {
            let projection = Projection::upsert("counters")
                .with_primary("id", "c")
                .with_field("value", seq);
            let (delivery, reply) = Delivery::new(seq, payload(&projection));
            tx.send(delivery).await.unwrap();
            replies.push(reply);
        }
        drop(tx);

        for reply in replies {
            assert_eq!(reply.await.unwrap(), Disposition::Ack);
        }
        let stats = runner.await.unwrap();
        assert_eq!(stats.applied, 10);

        let store = pipeline.applier().registry().lookup("counters").unwrap().unwrap();
        assert_eq!(store.current_sequence().unwrap(), 10);
        let record = store.get(b"key-\"c\"").unwrap().unwrap();
        assert_eq!(record["value"], 10);
    }

    #[tokio::test]
    async fn test_run_until_stop_settles_in_flight_delivery() {
        let dir = tempdir().unwrap();
        let pipeline = Arc::new(pipeline(dir.path()));
        let (tx, rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let runner = tokio::spawn(pipeline.clone().run_until(rx, async move {
            let _ = stop_rx.await;
        }));

        let (first, first_reply) = Delivery::new(
            1,
            payload(&Projection::upsert("events").with_primary("id", 1)),
        );
        tx.send(first).await.unwrap();
        assert_eq!(first_reply.await.unwrap(), Disposition::Ack);

        let mut replies = Vec::new();
        for seq in 2..=40u64 {
            let projection = Projection::upsert("events").with_primary("id", seq);
            let (delivery, reply) = Delivery::new(seq, payload(&projection));
            tx.send(delivery).await.unwrap();
            replies.push((seq, reply));
        }
        stop_tx.send(()).unwrap();

        let stats = runner.await.unwrap();
        // Receiver is gone once the runner returns.
        let (late, _late_reply) = Delivery::new(99, b"{}".to_vec());
        assert!(tx.send(late).await.is_err());

        let mut last_acked = 1;
        for (seq, reply) in replies {
            if let Ok(disposition) = reply.await {
                assert_eq!(disposition, Disposition::Ack);
                assert_eq!(seq, last_acked + 1, "acks must form a prefix");
                last_acked = seq;
            }
        }

        // Every commit was acknowledged before the runner returned.
        assert_eq!(stats.applied, last_acked);
        let store = pipeline.applier().registry().lookup("events").unwrap().unwrap();
        assert_eq!(store.current_sequence().unwrap(), last_acked);
        assert_eq!(store.record_count().unwrap(), last_acked as usize);
    }
}
