//! Receive window: reordering, reassembly and flow-control state for one
//! reliable tube.
//!
//! The receiver is plain data. The owning tube serializes access through its
//! lock and takes care of blocking readers.

use super::seq;
use super::TubeError;
use crate::protocol::ProtocolError;
use bytes::Bytes;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use tracing::trace;

/// An in-window frame waiting for the gap before it to fill
#[derive(Debug)]
struct Fragment {
    frame_no: u64,
    data: Bytes,
    fin: bool,
}

impl PartialEq for Fragment {
    fn eq(&self, other: &Self) -> bool {
        self.frame_no == other.frame_no
    }
}

impl Eq for Fragment {}

impl PartialOrd for Fragment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Fragment {
    fn cmp(&self, other: &Self) -> Ordering {
        self.frame_no.cmp(&other.frame_no)
    }
}

/// What a call to [`Receiver::receive`] changed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Frames moved into the read buffer
    pub frames: u64,
    /// An in-order FIN was consumed by this call
    pub fin: bool,
}

/// Per-tube receive window
#[derive(Debug)]
pub struct Receiver {
    /// Next frame number expected; everything below has been delivered
    ack_no: u64,
    /// Frames accepted ahead of `ack_no`
    window_size: u16,
    fragments: BinaryHeap<Reverse<Fragment>>,
    buffer: VecDeque<Bytes>,
    buffered: usize,
    closed: bool,
}

impl Receiver {
    /// Create a receiver expecting frame 1
    pub fn new(window_size: u16) -> Self {
        Self {
            ack_no: 1,
            window_size,
            fragments: BinaryHeap::new(),
            buffer: VecDeque::new(),
            buffered: 0,
            closed: false,
        }
    }

    /// Current ack number truncated for the wire
    pub fn ack(&self) -> u32 {
        self.ack_no as u32
    }

    /// Unwrapped ack number
    pub fn ack_no(&self) -> u64 {
        self.ack_no
    }

    /// Lowest frame number the window accepts
    pub fn window_start(&self) -> u64 {
        self.ack_no
    }

    pub fn window_size(&self) -> u16 {
        self.window_size
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes delivered but not yet read
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Accept one frame from the peer.
    pub fn receive(&mut self, frame_no: u32, data: Bytes, fin: bool) -> Result<Delivery, TubeError> {
        if self.closed {
            return Err(TubeError::EndOfStream);
        }

        // Pure acks and keep-alives carry nothing to sequence
        if data.is_empty() && !fin {
            return Ok(Delivery::default());
        }

        let frame_no = seq::unwrap(self.ack_no, frame_no);
        let window_start = self.window_start();
        let window_end = window_start + self.window_size as u64;
        if frame_no < window_start || frame_no >= window_end {
            trace!(
                "out of bounds frame {} (window [{}, {}))",
                frame_no,
                window_start,
                window_end
            );
            return Err(ProtocolError::OutOfBounds {
                frame_no,
                window_start,
                window_end,
            }
            .into());
        }

        self.fragments.push(Reverse(Fragment { frame_no, data, fin }));
        Ok(self.process_into_buffer())
    }

    /// Drain the heap while its head is the next expected frame.
    fn process_into_buffer(&mut self) -> Delivery {
        let mut delivery = Delivery::default();

        while let Some(Reverse(head)) = self.fragments.peek() {
            match head.frame_no.cmp(&self.ack_no) {
                // Duplicate of something already delivered
                Ordering::Less => {
                    self.fragments.pop();
                }
                Ordering::Equal => {
                    let Some(Reverse(frag)) = self.fragments.pop() else {
                        break;
                    };
                    trace!("delivering frame {} ({} bytes)", frag.frame_no, frag.data.len());
                    if !frag.data.is_empty() {
                        self.buffered += frag.data.len();
                        self.buffer.push_back(frag.data);
                    }
                    self.ack_no += 1;
                    delivery.frames += 1;
                    if frag.fin {
                        self.closed = true;
                        delivery.fin = true;
                        self.fragments.clear();
                        break;
                    }
                }
                Ordering::Greater => break,
            }
        }

        delivery
    }

    /// Copy buffered bytes into `buf`.
    ///
    /// Returns `Ok(Some(n))` when bytes were copied, `Ok(None)` when the
    /// caller has to wait, and `Ok(Some(0))` once the peer has finished and
    /// everything was read.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TubeError> {
        if self.buffer.is_empty() {
            return Ok(if self.closed { Some(0) } else { None });
        }

        let mut total = 0;
        while total < buf.len() {
            let Some(data) = self.buffer.front_mut() else {
                break;
            };
            let to_copy = std::cmp::min(data.len(), buf.len() - total);
            buf[total..total + to_copy].copy_from_slice(&data[..to_copy]);
            total += to_copy;

            if to_copy == data.len() {
                self.buffer.pop_front();
            } else {
                *data = data.slice(to_copy..);
            }
        }

        self.buffered -= total;
        Ok(Some(total))
    }

    /// Drop bytes waiting to be read. Frames keep being accepted and
    /// acknowledged.
    pub fn discard(&mut self) {
        self.buffer.clear();
        self.buffered = 0;
    }

    /// Stop accepting frames; buffered bytes stay readable.
    pub fn close(&mut self) {
        self.closed = true;
        self.fragments.clear();
    }
}
