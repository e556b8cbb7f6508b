//! Pooled byte buffers sized in power-of-ten classes
//!
//! Every insert serializes its key and value into scratch buffers. Allocating
//! those per operation is wasteful at high write rates, so buffers are drawn
//! from per-class free lists and handed back when the [`PooledBuffer`] drops.
//!
//! A class has a fixed maximum number of buffers. Once all of them are on
//! loan, `acquire` blocks until one is returned (or the pool shuts down).

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tallystore_common::config::{DEFAULT_MAX_BUFFERS_PER_CLASS, PoolConfig};
use tallystore_common::{Error, Result};
use tracing::{debug, info, warn};

struct ClassState {
    free: Vec<BytesMut>,
    created: usize,
}

struct BufferClass {
    capacity: usize,
    max: usize,
    state: Mutex<ClassState>,
    returned: Condvar,
}

impl BufferClass {
    fn new(capacity: usize, max: usize) -> Self {
        Self {
            capacity,
            max,
            state: Mutex::new(ClassState {
                free: Vec::new(),
                created: 0,
            }),
            returned: Condvar::new(),
        }
    }
}

/// Snapshot of one class
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassStats {
    pub capacity: usize,
    pub max: usize,
    pub created: usize,
    pub available: usize,
    pub on_loan: usize,
}

/// Pool of reusable byte buffers, shared by every store in the process
pub struct BufferPool {
    classes: Vec<BufferClass>,
    shutdown: AtomicBool,
}

impl BufferPool {
    /// Build a pool from a capacity to count table.
    ///
    /// Capacities that are not powers of ten are ignored. Classes between 1
    /// and the largest configured capacity that have no entry get
    /// [`DEFAULT_MAX_BUFFERS_PER_CLASS`] buffers.
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        let mut counts = config.buffer_counts();
        counts.retain(|&capacity, _| {
            let keep = is_power_of_ten(capacity);
            if !keep {
                warn!("Ignoring buffer class {}: not a power of ten", capacity);
            }
            keep
        });

        let mut classes = Vec::new();
        if let Some(&largest) = counts.keys().next_back() {
            let mut capacity = 1usize;
            loop {
                let max = counts
                    .get(&capacity)
                    .copied()
                    .unwrap_or(DEFAULT_MAX_BUFFERS_PER_CLASS);
                classes.push(BufferClass::new(capacity, max));
                if capacity >= largest {
                    break;
                }
                capacity *= 10;
            }
        }

        let table: Vec<String> = classes
            .iter()
            .map(|c| format!("{}x{}", c.capacity, c.max))
            .collect();
        info!("Buffer pool initialised: {}", table.join(", "));

        Self {
            classes,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Acquire a cleared buffer of at least `min_capacity` bytes, blocking
    /// while the class is exhausted.
    pub fn acquire(&self, min_capacity: usize) -> Result<PooledBuffer<'_>> {
        self.acquire_inner(min_capacity, None)
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout` with
    /// [`Error::ResourceExhausted`]
    pub fn acquire_timeout(
        &self,
        min_capacity: usize,
        timeout: Duration,
    ) -> Result<PooledBuffer<'_>> {
        self.acquire_inner(min_capacity, Some(Instant::now() + timeout))
    }

    fn acquire_inner(
        &self,
        min_capacity: usize,
        deadline: Option<Instant>,
    ) -> Result<PooledBuffer<'_>> {
        if self.is_shut_down() {
            return Err(Error::Cancelled);
        }

        let Some((index, capacity)) = class_for(min_capacity) else {
            return Ok(PooledBuffer::unpooled(self, min_capacity, min_capacity));
        };
        let Some(class) = self.classes.get(index).filter(|c| c.max > 0) else {
            return Ok(PooledBuffer::unpooled(self, capacity, min_capacity));
        };

        let mut state = class.state.lock();
        loop {
            if self.is_shut_down() {
                return Err(Error::Cancelled);
            }
            if let Some(mut buf) = state.free.pop() {
                buf.clear();
                return Ok(PooledBuffer::pooled(self, index, capacity, buf));
            }
            if state.created < class.max {
                state.created += 1;
                let buf = BytesMut::with_capacity(capacity);
                return Ok(PooledBuffer::pooled(self, index, capacity, buf));
            }
            match deadline {
                None => class.returned.wait(&mut state),
                Some(deadline) => {
                    if class.returned.wait_until(&mut state, deadline).timed_out()
                        && state.free.is_empty()
                    {
                        return Err(Error::exhausted(format!(
                            "no {capacity} byte buffer returned in time"
                        )));
                    }
                }
            }
        }
    }

    fn release(&self, index: usize, buf: BytesMut) {
        if let Some(class) = self.classes.get(index) {
            class.state.lock().free.push(buf);
            class.returned.notify_one();
        }
    }

    /// Wake every blocked `acquire` with [`Error::Cancelled`]. Buffers on
    /// loan may still be returned.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for class in &self.classes {
            let _state = class.state.lock();
            class.returned.notify_all();
        }
        debug!("Buffer pool shut down");
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Drop every idle buffer. Classes may allocate again afterwards.
    pub fn clear(&self) {
        for class in &self.classes {
            let mut state = class.state.lock();
            let drained = state.free.len();
            state.free.clear();
            state.created -= drained;
        }
    }

    /// Idle buffers across all classes
    #[must_use]
    pub fn available(&self) -> usize {
        self.classes.iter().map(|c| c.state.lock().free.len()).sum()
    }

    #[must_use]
    pub fn stats(&self) -> Vec<ClassStats> {
        self.classes
            .iter()
            .map(|c| {
                let state = c.state.lock();
                ClassStats {
                    capacity: c.capacity,
                    max: c.max,
                    created: state.created,
                    available: state.free.len(),
                    on_loan: state.created - state.free.len(),
                }
            })
            .collect()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(&PoolConfig::default())
    }
}

fn is_power_of_ten(mut n: usize) -> bool {
    if n == 0 {
        return false;
    }
    while n % 10 == 0 {
        n /= 10;
    }
    n == 1
}

/// Class index and capacity serving `min_capacity`, or `None` when the
/// next power of ten overflows
fn class_for(min_capacity: usize) -> Option<(usize, usize)> {
    let mut capacity = 1usize;
    let mut index = 0;
    while capacity < min_capacity {
        capacity = capacity.checked_mul(10)?;
        index += 1;
    }
    Some((index, capacity))
}

/// A buffer on loan from a [`BufferPool`]. Returned to its class on drop.
pub struct PooledBuffer<'p> {
    pool: &'p BufferPool,
    class: Option<usize>,
    capacity: usize,
    buf: BytesMut,
}

impl<'p> PooledBuffer<'p> {
    fn pooled(pool: &'p BufferPool, class: usize, capacity: usize, buf: BytesMut) -> Self {
        Self {
            pool,
            class: Some(class),
            capacity,
            buf,
        }
    }

    fn unpooled(pool: &'p BufferPool, capacity: usize, alloc: usize) -> Self {
        Self {
            pool,
            class: None,
            capacity,
            buf: BytesMut::with_capacity(alloc),
        }
    }

    /// Class capacity this buffer was issued for
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn is_pooled(&self) -> bool {
        self.class.is_some()
    }
}

impl Deref for PooledBuffer<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(class) = self.class {
            self.pool.release(class, std::mem::take(&mut self.buf));
        }
    }
}
