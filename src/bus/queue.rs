//! In-process queue bus
//!
//! Bounded work queue with an acknowledged-id set. Same at-most-once
//! contract as the filesystem variant for single-process deployments; a
//! full queue backpressures the producer with `BusUnavailable`.

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::SignalBus;
use crate::errors::EngineError;
use crate::types::Signal;

pub struct QueueBus {
    tx: mpsc::Sender<Signal>,
    rx: Mutex<mpsc::Receiver<Signal>>,
    taken: DashSet<Uuid>,
}

impl QueueBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            taken: DashSet::new(),
        }
    }
}

#[async_trait]
impl SignalBus for QueueBus {
    async fn emit(&self, signal: &Signal) -> Result<(), EngineError> {
        self.tx
            .try_send(signal.clone())
            .map_err(|e| EngineError::BusUnavailable(format!("queue: {e}")))
    }

    async fn consume(&self) -> Result<Option<Signal>, EngineError> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.try_recv() {
                Ok(signal) => {
                    // Marking taken and returning is the atomic take; a
                    // duplicate id (replayed producer) is dropped here.
                    if self.taken.insert(signal.id) {
                        return Ok(Some(signal));
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return Ok(None),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(EngineError::BusUnavailable("queue closed".into()))
                }
            }
        }
    }

    async fn probe(&self) -> Result<(), EngineError> {
        if self.tx.is_closed() {
            return Err(EngineError::BusUnavailable("queue closed".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fixtures;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn fifo_and_exactly_once() {
        let bus = QueueBus::new(16);
        let first = fixtures::signal(dec!(10), dec!(2), Utc::now());
        let second = fixtures::signal(dec!(12), dec!(2), Utc::now());
        bus.emit(&first).await.unwrap();
        bus.emit(&second).await.unwrap();

        assert_eq!(bus.consume().await.unwrap().unwrap().id, first.id);
        assert_eq!(bus.consume().await.unwrap().unwrap().id, second.id);
        assert!(bus.consume().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_emission_consumed_once() {
        let bus = QueueBus::new(16);
        let signal = fixtures::signal(dec!(10), dec!(2), Utc::now());
        bus.emit(&signal).await.unwrap();
        bus.emit(&signal).await.unwrap();

        assert!(bus.consume().await.unwrap().is_some());
        assert!(bus.consume().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn full_queue_backpressures() {
        let bus = QueueBus::new(1);
        bus.emit(&fixtures::signal(dec!(10), dec!(2), Utc::now())).await.unwrap();
        let err = bus
            .emit(&fixtures::signal(dec!(11), dec!(2), Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BusUnavailable(_)));
    }
}
