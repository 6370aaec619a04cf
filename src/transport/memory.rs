//! In-memory datagram link
//!
//! Two connected endpoints exchanging datagrams over unbounded channels. Each
//! direction can drop, duplicate and delay datagrams at random, which makes it
//! the workhorse of the muxer tests.

use super::{MsgConn, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::trace;

/// Impairments applied to every datagram written on a link
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkConditions {
    /// Probability that a datagram is dropped
    pub loss: f64,
    /// Probability that a datagram is delivered twice
    pub duplicate: f64,
    /// Probability that a datagram is held back by a random delay
    pub reorder: f64,
    /// Upper bound for that delay
    pub max_delay: Duration,
}

impl LinkConditions {
    /// A perfect link
    pub fn clean() -> Self {
        Self {
            loss: 0.0,
            duplicate: 0.0,
            reorder: 0.0,
            max_delay: Duration::ZERO,
        }
    }
}

impl Default for LinkConditions {
    fn default() -> Self {
        Self::clean()
    }
}

/// One end of an in-memory link
pub struct MemoryConn {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    conditions: LinkConditions,
    closed: watch::Sender<bool>,
}

/// Create two connected endpoints with the same conditions in both directions
pub fn pair(conditions: LinkConditions) -> (MemoryConn, MemoryConn) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryConn::new(a_tx, b_rx, conditions),
        MemoryConn::new(b_tx, a_rx, conditions),
    )
}

impl MemoryConn {
    fn new(
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
        conditions: LinkConditions,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            tx,
            rx: Mutex::new(rx),
            conditions,
            closed,
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Delays for each copy of a datagram; empty when it is lost
fn plan_delivery(conditions: &LinkConditions) -> Vec<Duration> {
    let mut rng = rand::thread_rng();
    if conditions.loss > 0.0 && rng.gen_bool(conditions.loss.min(1.0)) {
        return Vec::new();
    }

    let copies = if conditions.duplicate > 0.0 && rng.gen_bool(conditions.duplicate.min(1.0)) {
        2
    } else {
        1
    };

    (0..copies)
        .map(|_| {
            if conditions.reorder > 0.0 && rng.gen_bool(conditions.reorder.min(1.0)) {
                let max = conditions.max_delay.as_micros().max(1) as u64;
                Duration::from_micros(rng.gen_range(0..=max))
            } else {
                Duration::ZERO
            }
        })
        .collect()
}

#[async_trait]
impl MsgConn for MemoryConn {
    async fn read_msg(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::Closed);
        }

        let mut rx = self.rx.lock().await;
        let datagram = tokio::select! {
            datagram = rx.recv() => datagram.ok_or(TransportError::Closed)?,
            _ = closed.changed() => return Err(TransportError::Closed),
        };

        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(n)
    }

    async fn write_msg(&self, buf: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let datagram = Bytes::copy_from_slice(buf);
        let delays = plan_delivery(&self.conditions);
        if delays.is_empty() {
            trace!("link dropped {} byte datagram", buf.len());
        }

        for delay in delays {
            if delay.is_zero() {
                // The peer going away is just more loss
                let _ = self.tx.send(datagram.clone());
            } else {
                let tx = self.tx.clone();
                let datagram = datagram.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(datagram);
                });
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.send_replace(true);
        Ok(())
    }
}
