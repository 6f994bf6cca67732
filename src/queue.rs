//! Bounded queues shared by a pool of workers.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A bounded multi-producer, multi-consumer queue.
///
/// Consumers take turns on the receiver; whoever holds it gets the next item.
#[derive(Debug)]
pub struct Queue<T> {
    tx: mpsc::Sender<T>,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T: Send> Queue<T> {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Waits for space and enqueues `item`.
    ///
    /// Gives up and returns false once `token` is cancelled.
    pub async fn send(&self, item: T, token: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            () = token.cancelled() => false,
            res = self.tx.send(item) => res.is_ok(),
        }
    }

    /// Waits for the next item. Cancel safe.
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

/// The periodic wake of idle workers. Purely a liveness signal, cancellation
/// goes through the tokens.
pub fn heartbeat(period: Duration) -> Interval {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn items_reach_one_consumer_each() {
        let queue = Queue::new(4);
        let token = CancellationToken::new();
        for i in 0..4 {
            assert!(queue.send(i, &token).await);
        }

        let other = queue.clone();
        let mut seen = vec![
            queue.recv().await.unwrap(),
            other.recv().await.unwrap(),
            queue.recv().await.unwrap(),
            other.recv().await.unwrap(),
        ];
        seen.sort_unstable();
        assert_eq!(seen, [0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn blocked_send_gives_up_on_cancel() {
        let queue = Queue::new(1);
        let token = CancellationToken::new();
        assert!(queue.send(1, &token).await);

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        assert!(!queue.send(2, &token).await);
    }
}
