//! A single named, bounded MPMC queue.
//!
//! Producers publish with exponential backoff when the queue is full
//! (10ms doubling to 1s). What happens when backoff runs out depends on the
//! channel's policy: persistent channels keep retrying at the cap, sheddable
//! channels drop the payload and count it.

use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use kobzar_core::metrics;

use crate::error::BusError;

/// First backoff delay when the queue is full.
const BACKOFF_BASE_MS: u64 = 10;
/// Backoff ceiling.
const BACKOFF_CAP_MS: u64 = 1_000;

/// Load-shedding behavior of a channel when backoff is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishPolicy {
    /// Never drop — keep retrying at the capped delay. Used for `ingestion`.
    Persistent,
    /// Give up after this many full-queue attempts and shed the payload.
    Sheddable { max_attempts: u32 },
}

/// One bounded FIFO channel of the stream bus.
///
/// Cloning the receiver gives every worker in a pool a handle onto the same
/// queue — `async_channel` is MPMC, so no mutexed receiver is needed.
pub struct Queue<T> {
    name: &'static str,
    policy: PublishPolicy,
    /// Counter bumped when this channel sheds.
    shed_counter: &'static str,
    tx: async_channel::Sender<T>,
    rx: async_channel::Receiver<T>,
}

impl<T> Queue<T> {
    pub fn bounded(
        name: &'static str,
        capacity: usize,
        policy: PublishPolicy,
        shed_counter: &'static str,
    ) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Self {
            name,
            policy,
            shed_counter,
            tx,
            rx,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// A receiver handle for one consumer worker.
    pub fn receiver(&self) -> async_channel::Receiver<T> {
        self.rx.clone()
    }

    /// Number of payloads currently queued.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Close the channel; consumers drain what is left, then their `recv`
    /// returns Err and the worker loops exit.
    pub fn close(&self) {
        self.tx.close();
    }

    /// Publish with backoff. Non-blocking in the happy path (`try_send`);
    /// on a full queue, backs off 10ms → 1s and retries per the policy.
    pub async fn publish(&self, payload: T) -> Result<(), BusError> {
        let mut payload = payload;
        let mut delay_ms = BACKOFF_BASE_MS;
        let mut attempt: u32 = 0;

        loop {
            match self.tx.try_send(payload) {
                Ok(()) => return Ok(()),
                Err(async_channel::TrySendError::Closed(_)) => {
                    return Err(BusError::Closed(self.name));
                }
                Err(async_channel::TrySendError::Full(p)) => {
                    payload = p;
                    attempt += 1;

                    if let PublishPolicy::Sheddable { max_attempts } = self.policy {
                        if attempt >= max_attempts {
                            warn!(
                                channel = self.name,
                                attempts = attempt,
                                "queue full, shedding payload"
                            );
                            metrics::incr(self.shed_counter);
                            return Err(BusError::Shed(self.name));
                        }
                    }

                    sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms * 2).min(BACKOFF_CAP_MS);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive() {
        let q: Queue<u32> = Queue::bounded(
            "test",
            4,
            PublishPolicy::Sheddable { max_attempts: 3 },
            metrics::names::QUEUE_SHED_TOTAL,
        );
        q.publish(7).await.unwrap();
        assert_eq!(q.receiver().recv().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn sheddable_queue_drops_when_full() {
        let q: Queue<u32> = Queue::bounded(
            "test-shed",
            1,
            PublishPolicy::Sheddable { max_attempts: 2 },
            metrics::names::QUEUE_SHED_TOTAL,
        );
        q.publish(1).await.unwrap();

        let before = metrics::get(metrics::names::QUEUE_SHED_TOTAL);
        let err = q.publish(2).await.unwrap_err();
        assert_eq!(err, BusError::Shed("test-shed"));
        assert_eq!(metrics::get(metrics::names::QUEUE_SHED_TOTAL), before + 1);

        // The original payload is still there.
        assert_eq!(q.receiver().recv().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn persistent_queue_waits_for_consumer() {
        let q: Queue<u32> = Queue::bounded(
            "test-persist",
            1,
            PublishPolicy::Persistent,
            metrics::names::QUEUE_SHED_TOTAL,
        );
        q.publish(1).await.unwrap();

        let rx = q.receiver();
        let drainer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            rx.recv().await.unwrap()
        });

        // Blocks until the drainer makes room, then succeeds.
        q.publish(2).await.unwrap();
        assert_eq!(drainer.await.unwrap(), 1);
        assert_eq!(q.receiver().recv().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn closed_queue_reports_closed() {
        let q: Queue<u32> = Queue::bounded(
            "test-closed",
            1,
            PublishPolicy::Persistent,
            metrics::names::QUEUE_SHED_TOTAL,
        );
        q.close();
        assert_eq!(q.publish(1).await.unwrap_err(), BusError::Closed("test-closed"));
    }

    #[tokio::test]
    async fn receivers_share_the_queue() {
        let q: Queue<u32> = Queue::bounded(
            "test-mpmc",
            8,
            PublishPolicy::Persistent,
            metrics::names::QUEUE_SHED_TOTAL,
        );
        for i in 0..4 {
            q.publish(i).await.unwrap();
        }
        let a = q.receiver();
        let b = q.receiver();
        let mut got = vec![
            a.recv().await.unwrap(),
            b.recv().await.unwrap(),
            a.recv().await.unwrap(),
            b.recv().await.unwrap(),
        ];
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3]);
    }
}
