//! # Simulated message bus
//!
//! An in-process stand-in for a CAN-style broadcast bus. Frames carry an
//! identifier and at most eight payload bytes.
//!
//! ```text
//!   publish() ──► [outbound queue, 1024] ──► bus-tx thread ──► "wire" (counted)
//!
//!   inject()  ──► [inbound queue, 256]  ──┐
//!   sensor synthesis (randomized timer) ──┴─► bus-rx thread ──► dispatch(frame)
//!                                                                   │
//!                                     subscribers[frame.id] ◄───────┘
//! ```
//!
//! ## Rules
//! - **Non-blocking publish**: a full outbound queue rejects the frame and
//!   bumps the drop counter; nothing waits for space.
//! - **One subscriber per id**: subscribing again replaces the callback.
//! - **Reentrant dispatch**: the callback is cloned out of the registry and
//!   the registry lock is released before it runs, so a callback may
//!   publish, subscribe or unsubscribe on the same bus, its own id included.
//! - **Drain without blocking producers**: the tx thread drops the queue lock
//!   for the simulated per-frame transmit delay.
//! - **Lock-free counters**: rx/tx/drop counts are atomics, readable any time.

use crate::config::BusConfig;
use crate::error::BusError;
use heapless::Deque;
use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const MAX_PAYLOAD_LEN: usize = 8;
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;
pub const INBOUND_QUEUE_CAPACITY: usize = 256;

// Synthesized sensor readings: 65.0 - 69.9 °C in 0.1 °C counts
const SIM_TEMP_BASE: u16 = 650;
const SIM_TEMP_SPAN: u64 = 50;

pub type Payload = heapless::Vec<u8, MAX_PAYLOAD_LEN>;

/// Callback registered for one identifier.
pub type Subscriber = Arc<dyn Fn(&Frame) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub payload: Payload,
    /// Monotonic capture time.
    pub timestamp: Instant,
}

impl Frame {
    /// Build a frame stamped now. Payloads longer than eight bytes are
    /// rejected, never truncated.
    pub fn new(id: u32, data: &[u8]) -> Result<Self, BusError> {
        let payload =
            Payload::from_slice(data).map_err(|()| BusError::PayloadTooLong { len: data.len() })?;
        Ok(Self {
            id,
            payload,
            timestamp: Instant::now(),
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> u8 {
        self.payload.len() as u8
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Frames dispatched to a subscriber.
    pub rx_count: u64,
    /// Frames drained from the outbound queue and transmitted.
    pub tx_count: u64,
    /// Publishes rejected because the outbound queue was full.
    pub dropped: u64,
    /// Injections rejected because the inbound queue was full.
    pub rx_dropped: u64,
}

struct BusShared {
    config: BusConfig,
    running: AtomicBool,

    subscribers: Mutex<HashMap<u32, Subscriber>>,

    outbound: Mutex<Deque<Frame, OUTBOUND_QUEUE_CAPACITY>>,
    outbound_cv: Condvar,

    inbound: Mutex<Deque<Frame, INBOUND_QUEUE_CAPACITY>>,
    inbound_cv: Condvar,

    // Most recent transmitted frame per id
    transmitted: Mutex<HashMap<u32, Frame>>,

    rx_count: AtomicU64,
    tx_count: AtomicU64,
    dropped: AtomicU64,
    rx_dropped: AtomicU64,
}

/// Cloneable handle onto a bus. Safe to capture in subscriber callbacks.
#[derive(Clone)]
pub struct BusHandle {
    shared: Arc<BusShared>,
}

assert_impl_all!(BusHandle: Send, Sync, Clone);
assert_impl_all!(Frame: Send, Sync);

impl BusHandle {
    pub fn node_id(&self) -> u32 {
        self.shared.config.node_id
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Queue a frame for transmission. Never blocks.
    pub fn publish(&self, id: u32, data: &[u8]) -> Result<(), BusError> {
        let shared = &self.shared;
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(BusError::PayloadTooLong { len: data.len() });
        }
        if !self.is_running() {
            return Err(BusError::NotRunning);
        }

        let frame = Frame::new(id, data)?;
        let pushed = lock(&shared.outbound).push_back(frame);
        if pushed.is_err() {
            shared.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(id, "outbound queue full, frame dropped");
            return Err(BusError::QueueFull {
                capacity: OUTBOUND_QUEUE_CAPACITY,
            });
        }

        shared.outbound_cv.notify_one();
        Ok(())
    }

    /// Hand a frame to the rx thread as if it had arrived from the wire.
    pub fn inject(&self, id: u32, data: &[u8]) -> Result<(), BusError> {
        let shared = &self.shared;
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(BusError::PayloadTooLong { len: data.len() });
        }
        if !self.is_running() {
            return Err(BusError::NotRunning);
        }

        let frame = Frame::new(id, data)?;
        let pushed = lock(&shared.inbound).push_back(frame);
        if pushed.is_err() {
            shared.rx_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(id, "inbound queue full, frame dropped");
            return Err(BusError::InboundQueueFull {
                capacity: INBOUND_QUEUE_CAPACITY,
            });
        }

        shared.inbound_cv.notify_one();
        Ok(())
    }

    /// Register `callback` for `id`. Returns `true` if it replaced one.
    pub fn subscribe(&self, id: u32, callback: impl Fn(&Frame) + Send + Sync + 'static) -> bool {
        lock(&self.shared.subscribers)
            .insert(id, Arc::new(callback))
            .is_some()
    }

    pub fn unsubscribe(&self, id: u32) -> bool {
        lock(&self.shared.subscribers).remove(&id).is_some()
    }

    pub fn is_subscribed(&self, id: u32) -> bool {
        lock(&self.shared.subscribers).contains_key(&id)
    }

    /// Deliver `frame` to its subscriber on the calling thread.
    /// Returns `false` if nothing is subscribed to the frame's id.
    pub fn dispatch(&self, frame: &Frame) -> bool {
        let subscriber = {
            let registry = lock(&self.shared.subscribers);
            registry.get(&frame.id).cloned()
        };

        match subscriber {
            Some(callback) => {
                callback(frame);
                self.shared.rx_count.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                debug!(id = frame.id, "no subscriber for frame");
                false
            }
        }
    }

    pub fn stats(&self) -> BusStats {
        let shared = &self.shared;
        BusStats {
            rx_count: shared.rx_count.load(Ordering::Relaxed),
            tx_count: shared.tx_count.load(Ordering::Relaxed),
            dropped: shared.dropped.load(Ordering::Relaxed),
            rx_dropped: shared.rx_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn outbound_len(&self) -> usize {
        lock(&self.shared.outbound).len()
    }

    /// Most recent frame transmitted on `id`.
    pub fn last_transmitted(&self, id: u32) -> Option<Frame> {
        lock(&self.shared.transmitted).get(&id).cloned()
    }
}

/// Owner of the bus worker threads.
///
/// Dropping the bus stops and joins both workers.
pub struct MessageBus {
    handle: BusHandle,
    workers: Option<Workers>,
}

struct Workers {
    rx: JoinHandle<()>,
    tx: JoinHandle<()>,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        let shared = BusShared {
            config,
            running: AtomicBool::new(false),
            subscribers: Mutex::new(HashMap::new()),
            outbound: Mutex::new(Deque::new()),
            outbound_cv: Condvar::new(),
            inbound: Mutex::new(Deque::new()),
            inbound_cv: Condvar::new(),
            transmitted: Mutex::new(HashMap::new()),
            rx_count: AtomicU64::new(0),
            tx_count: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
        };

        Self {
            handle: BusHandle {
                shared: Arc::new(shared),
            },
            workers: None,
        }
    }

    /// Spawn the rx and tx threads. Starting a running bus is a no-op.
    pub fn start(&mut self) -> std::io::Result<()> {
        if self.workers.is_some() {
            return Ok(());
        }

        let shared = &self.handle.shared;
        shared.running.store(true, Ordering::Release);

        let rx_handle = self.handle.clone();
        let rx = thread::Builder::new()
            .name("bus-rx".into())
            .spawn(move || rx_loop(&rx_handle));
        let rx = match rx {
            Ok(rx) => rx,
            Err(e) => {
                shared.running.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let tx_shared = Arc::clone(shared);
        let tx = thread::Builder::new()
            .name("bus-tx".into())
            .spawn(move || tx_loop(&tx_shared));
        let tx = match tx {
            Ok(tx) => tx,
            Err(e) => {
                self.signal_stop();
                let _ = rx.join();
                return Err(e);
            }
        };

        self.workers = Some(Workers { rx, tx });
        info!(node = self.handle.node_id(), "message bus started");
        Ok(())
    }

    /// Stop both workers and wait for them. Frames still queued are discarded.
    pub fn stop(&mut self) {
        let Some(workers) = self.workers.take() else {
            return;
        };

        self.signal_stop();
        let _ = workers.rx.join();
        let _ = workers.tx.join();

        let shared = &self.handle.shared;
        let discarded = {
            let mut outbound = lock(&shared.outbound);
            let mut inbound = lock(&shared.inbound);
            let n = outbound.len() + inbound.len();
            outbound.clear();
            inbound.clear();
            n
        };
        if discarded > 0 {
            debug!(discarded, "queued frames discarded on stop");
        }

        info!(node = self.handle.node_id(), stats = ?self.handle.stats(), "message bus stopped");
    }

    fn signal_stop(&self) {
        let shared = &self.handle.shared;
        shared.running.store(false, Ordering::Release);

        // Take each queue lock before notifying so a worker that has just
        // checked `running` cannot miss the wakeup.
        drop(lock(&shared.outbound));
        shared.outbound_cv.notify_all();
        drop(lock(&shared.inbound));
        shared.inbound_cv.notify_all();
    }

    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn publish(&self, id: u32, data: &[u8]) -> Result<(), BusError> {
        self.handle.publish(id, data)
    }

    pub fn inject(&self, id: u32, data: &[u8]) -> Result<(), BusError> {
        self.handle.inject(id, data)
    }

    pub fn subscribe(&self, id: u32, callback: impl Fn(&Frame) + Send + Sync + 'static) -> bool {
        self.handle.subscribe(id, callback)
    }

    pub fn unsubscribe(&self, id: u32) -> bool {
        self.handle.unsubscribe(id)
    }

    pub fn stats(&self) -> BusStats {
        self.handle.stats()
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Inbound {
    Frame(Frame),
    Synthesize,
    Stop,
}

fn rx_loop(handle: &BusHandle) {
    let shared = &handle.shared;
    let config = shared.config;
    let mut rng = SimRng::new(config.rng_seed);
    let mut next_synth = config
        .simulate_sensors
        .then(|| Instant::now() + rng.interval(&config));

    loop {
        match next_inbound(shared, next_synth) {
            Inbound::Frame(frame) => {
                handle.dispatch(&frame);
            }
            Inbound::Synthesize => {
                let counts = SIM_TEMP_BASE + rng.below(SIM_TEMP_SPAN) as u16;
                match Frame::new(config.synthetic_sensor_id, &counts.to_be_bytes()) {
                    Ok(frame) => {
                        handle.dispatch(&frame);
                    }
                    Err(e) => warn!(error = %e, "failed to synthesize sensor frame"),
                }
                next_synth = Some(Instant::now() + rng.interval(&config));
            }
            Inbound::Stop => break,
        }
    }

    debug!("bus rx thread exiting");
}

fn next_inbound(shared: &BusShared, next_synth: Option<Instant>) -> Inbound {
    let mut queue = lock(&shared.inbound);
    loop {
        if !shared.running.load(Ordering::Acquire) {
            return Inbound::Stop;
        }
        if let Some(frame) = queue.pop_front() {
            return Inbound::Frame(frame);
        }

        match next_synth {
            Some(at) => {
                let now = Instant::now();
                if now >= at {
                    return Inbound::Synthesize;
                }
                queue = shared
                    .inbound_cv
                    .wait_timeout(queue, at - now)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|poisoned| poisoned.into_inner().0);
            }
            None => {
                queue = shared
                    .inbound_cv
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

fn tx_loop(shared: &BusShared) {
    let tx_delay = shared.config.tx_delay();
    let mut queue = lock(&shared.outbound);

    loop {
        queue = shared
            .outbound_cv
            .wait_while(queue, |q| q.is_empty() && shared.running.load(Ordering::Acquire))
            .unwrap_or_else(PoisonError::into_inner);

        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        let Some(frame) = queue.pop_front() else {
            continue;
        };

        // Producers keep publishing while the frame is "on the wire".
        drop(queue);
        if !tx_delay.is_zero() {
            thread::sleep(tx_delay);
        }
        shared.tx_count.fetch_add(1, Ordering::Relaxed);
        lock(&shared.transmitted).insert(frame.id, frame);

        queue = lock(&shared.outbound);
    }

    debug!("bus tx thread exiting");
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// Linear congruential generator; reproducible across runs for a given seed.
struct SimRng {
    state: u64,
}

impl SimRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.state >> 33
    }

    fn below(&mut self, bound: u64) -> u64 {
        if bound == 0 {
            0
        } else {
            self.next() % bound
        }
    }

    fn interval(&mut self, config: &BusConfig) -> Duration {
        let span = config
            .max_inbound_interval_ms
            .saturating_sub(config.min_inbound_interval_ms);
        Duration::from_millis(config.min_inbound_interval_ms + self.below(span + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rejects_long_payload() {
        let err = Frame::new(0x10, &[0; 9]).unwrap_err();
        assert_eq!(err, BusError::PayloadTooLong { len: 9 });

        let frame = Frame::new(0x10, &[1, 2, 3]).unwrap();
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.data(), &[1, 2, 3]);
    }

    #[test]
    fn test_sim_rng_interval_in_range() {
        let config = BusConfig::default();
        let mut rng = SimRng::new(config.rng_seed);
        for _ in 0..1000 {
            let interval = rng.interval(&config);
            assert!(interval >= Duration::from_millis(config.min_inbound_interval_ms));
            assert!(interval <= Duration::from_millis(config.max_inbound_interval_ms));
        }
    }

    #[test]
    fn test_dispatch_without_running_threads() {
        let bus = MessageBus::new(BusConfig::quiet());
        let handle = bus.handle();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = Arc::clone(&seen);
        handle.subscribe(0x42, move |frame| {
            seen_cb.store(u64::from(frame.payload[0]), Ordering::SeqCst);
        });

        let frame = Frame::new(0x42, &[7]).unwrap();
        assert!(handle.dispatch(&frame));
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert!(!handle.dispatch(&Frame::new(0x43, &[]).unwrap()));
        assert_eq!(handle.stats().rx_count, 1);
    }
}
