//! Broadcast ring linking the ingest driver to the demodulators.
//!
//! One producer (the UDP reader) publishes blocks of complex baseband
//! samples; any number of consumers (channel workers) observe them.
//! Each datagram becomes one block, published atomically: a consumer
//! sees either none or all of its samples. The producer never blocks;
//! consumers that fall behind skip forward to the oldest live block.

use std::{
    collections::VecDeque,
    ops::Deref,
    sync::Arc,
    time::Duration,
};

use num_complex::Complex;
use parking_lot::{
    Condvar,
    Mutex,
};

/// One published block of complex samples.
///
/// Cheaply cloneable; the sample storage is shared. `filled` bounds the
/// valid prefix, everything past it is stale.
#[derive(Clone, PartialEq, derive_more::Debug)]
pub struct Block {
    #[debug(skip)]
    data: Arc<[Complex<f32>]>,
    filled: usize,
}

impl Block {
    fn new(capacity: usize) -> Self {
        let data = std::iter::repeat_n(Complex::new(0.0, 0.0), capacity).collect();
        Self { data, filled: 0 }
    }

    /// Get the sample storage for writing, reclaiming the allocation
    /// when no consumer still holds it, allocating fresh otherwise.
    pub fn reclaim_or_allocate(&mut self, capacity: usize) -> &mut [Complex<f32>] {
        if Arc::get_mut(&mut self.data).is_none() || self.data.len() < capacity {
            *self = Self::new(capacity);
        }
        self.filled = 0;
        Arc::get_mut(&mut self.data).expect("Arc::get_mut failed")
    }

    /// Publish the first `n` samples of the storage.
    pub fn set_filled(&mut self, n: usize) {
        assert!(n <= self.data.len());
        self.filled = n;
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }
}

impl Deref for Block {
    type Target = [Complex<f32>];

    fn deref(&self) -> &Self::Target {
        &self.data[..self.filled]
    }
}

impl AsRef<[Complex<f32>]> for Block {
    fn as_ref(&self) -> &[Complex<f32>] {
        &self.data[..self.filled]
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SharedState>,

    /// notified on every publish, and when the producer drops, so
    /// blocking consumers wake up.
    block_published: Condvar,
}

/// The blocks in `slots` are numbered head_pos..tail_pos. Consumers
/// carry a read_pos in that numbering, so they can tell when they are
/// lagging behind.
#[derive(Debug)]
struct SharedState {
    num_producers: usize,
    slots: VecDeque<Block>,
    tail_pos: usize,
    head_pos: usize,
    capacity: usize,
}

impl SharedState {
    fn pop_block(&mut self) -> Option<Block> {
        if self.slots.len() == self.capacity {
            let block = self
                .slots
                .pop_front()
                .expect("empty queue, but is at capacity");
            self.head_pos += 1;
            Some(block)
        }
        else {
            None
        }
    }

    fn push_block(&mut self, block: Block) {
        assert!(
            self.slots.len() < self.capacity,
            "expecting ring to be below capacity when pushing"
        );
        self.slots.push_back(block);
        self.tail_pos += 1;
    }
}

/// Producer end. There is exactly one per ring.
#[derive(derive_more::Debug)]
pub struct Producer {
    #[debug(skip)]
    shared: Arc<Shared>,
}

impl Drop for Producer {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.num_producers -= 1;
        drop(state);
        self.shared.block_published.notify_all();
    }
}

impl Producer {
    /// Publish a freshly filled block (if any) and get storage for the
    /// next one. Never blocks: when the ring is at capacity, the
    /// oldest block is recycled and lagging consumers skip it.
    pub fn swap_blocks(&mut self, push_block: Option<Block>, capacity: usize) -> Block {
        let mut state = self.shared.state.lock();

        let published = push_block.is_some();
        if let Some(block) = push_block {
            state.push_block(block);
        }

        let block = state
            .pop_block()
            .unwrap_or_else(|| Block::new(capacity));

        drop(state);
        if published {
            self.shared.block_published.notify_all();
        }

        block
    }

    /// Position the next published block will take; this is the ring
    /// write pointer as consumers observe it.
    pub fn write_pos(&self) -> usize {
        self.shared.state.lock().tail_pos
    }
}

/// Handle from which consumers are created. Holding a subscriber keeps
/// the ring alive without consuming from it.
#[derive(Clone, Debug)]
pub struct Subscriber {
    shared: Arc<Shared>,
}

impl Subscriber {
    /// A new consumer starts at the current write position; it only
    /// observes blocks published after this call.
    pub fn consumer(&self) -> Consumer {
        let state = self.shared.state.lock();
        Consumer {
            shared: self.shared.clone(),
            read_pos: state.tail_pos,
        }
    }
}

/// Consumer end; each channel worker owns one.
#[derive(Debug)]
pub struct Consumer {
    shared: Arc<Shared>,
    read_pos: usize,
}

/// Why a blocking receive returned without a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvError {
    /// No block was published within the deadline.
    TimedOut,
    /// The producer is gone and everything published was consumed.
    Closed,
}

impl Consumer {
    fn try_recv_locked(read_pos: &mut usize, state: &mut SharedState) -> Option<Block> {
        let queue_index = if *read_pos < state.head_pos {
            tracing::debug!(
                read_pos = *read_pos,
                head_pos = state.head_pos,
                "lagging behind by {} blocks",
                state.head_pos - *read_pos
            );
            *read_pos = state.head_pos;
            0
        }
        else {
            *read_pos - state.head_pos
        };

        if *read_pos < state.tail_pos {
            let block = state.slots[queue_index].clone();
            *read_pos += 1;
            Some(block)
        }
        else {
            None
        }
    }

    pub fn try_recv(&mut self) -> Option<Block> {
        let mut state = self.shared.state.lock();
        Self::try_recv_locked(&mut self.read_pos, &mut state)
    }

    /// Wait up to `timeout` for the next block.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Block, RecvError> {
        let mut state = self.shared.state.lock();

        loop {
            if let Some(block) = Self::try_recv_locked(&mut self.read_pos, &mut state) {
                return Ok(block);
            }
            if state.num_producers == 0 {
                return Err(RecvError::Closed);
            }
            if self
                .shared
                .block_published
                .wait_for(&mut state, timeout)
                .timed_out()
            {
                return Err(RecvError::TimedOut);
            }
        }
    }
}

/// Create a ring holding up to `depth` in-flight blocks.
pub fn ring(depth: usize) -> (Producer, Subscriber) {
    assert!(depth > 0);

    let shared = Arc::new(Shared {
        state: Mutex::new(SharedState {
            num_producers: 1,
            slots: VecDeque::with_capacity(depth),
            tail_pos: 0,
            head_pos: 0,
            capacity: depth,
        }),
        block_published: Condvar::new(),
    });

    (
        Producer {
            shared: shared.clone(),
        },
        Subscriber { shared },
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use num_complex::Complex;

    use super::{
        RecvError,
        ring,
    };

    fn publish(producer: &mut super::Producer, samples: &[Complex<f32>]) {
        let mut block = producer.swap_blocks(None, samples.len());
        let storage = block.reclaim_or_allocate(samples.len());
        storage[..samples.len()].copy_from_slice(samples);
        block.set_filled(samples.len());
        let _ = producer.swap_blocks(Some(block), samples.len());
    }

    #[test]
    fn blocks_arrive_atomically() {
        let (mut producer, subscriber) = ring(4);
        let mut consumer = subscriber.consumer();

        assert!(consumer.try_recv().is_none());

        let samples: Vec<_> = (0..256).map(|i| Complex::new(i as f32, -(i as f32))).collect();
        publish(&mut producer, &samples);

        let block = consumer.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(block.len(), 256);
        assert_eq!(block[255], Complex::new(255.0, -255.0));
        assert!(consumer.try_recv().is_none());
    }

    #[test]
    fn write_pos_advances_per_publish() {
        let (mut producer, _subscriber) = ring(4);
        assert_eq!(producer.write_pos(), 0);
        publish(&mut producer, &[Complex::new(1.0, 0.0)]);
        publish(&mut producer, &[Complex::new(2.0, 0.0)]);
        assert_eq!(producer.write_pos(), 2);
    }

    #[test]
    fn lagging_consumer_skips_to_oldest() {
        let (mut producer, subscriber) = ring(3);
        let mut consumer = subscriber.consumer();

        for i in 0..5 {
            publish(&mut producer, &[Complex::new(i as f32, 0.0)]);
        }

        // ring depth is 3, so the oldest blocks were recycled
        let block = consumer.try_recv().unwrap();
        assert_eq!(block[0].re, 3.0);
        let block = consumer.try_recv().unwrap();
        assert_eq!(block[0].re, 4.0);
        assert!(consumer.try_recv().is_none());
    }

    #[test]
    fn closed_after_producer_drop() {
        let (producer, subscriber) = ring(2);
        let mut consumer = subscriber.consumer();
        drop(producer);
        assert_eq!(
            consumer.recv_timeout(Duration::from_millis(10)),
            Err(RecvError::Closed)
        );
    }

    #[test]
    fn recv_times_out_when_idle() {
        let (_producer, subscriber) = ring(2);
        let mut consumer = subscriber.consumer();
        assert_eq!(
            consumer.recv_timeout(Duration::from_millis(10)),
            Err(RecvError::TimedOut)
        );
    }
}
