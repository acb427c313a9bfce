//! Ingress buffer & channel manager (spec.md §4.D).
//!
//! The channel reference is held behind `arc_swap::ArcSwap` rather than a
//! `tokio::sync::RwLock`, since the access pattern ("read far more often
//! than swapped") is exactly what `ArcSwap` is built for — the teacher
//! repo already depends on `arc-swap` for this shape of reference. A
//! separate `tokio::sync::Mutex` serializes expansion attempts; an
//! `AtomicBool` double-checks so only one expansion runs concurrently,
//! per spec.md §4.D / §5.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::value::Record;

const MIGRATION_BUDGET: Duration = Duration::from_secs(5);

pub struct ChannelPair {
    pub sender: mpsc::Sender<Record>,
    pub receiver: Mutex<mpsc::Receiver<Record>>,
}

impl ChannelPair {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn len(&self) -> usize {
        self.capacity().saturating_sub(self.sender.capacity())
    }

    pub fn usage(&self) -> f64 {
        let cap = self.capacity();
        if cap == 0 {
            return 0.0;
        }
        self.len() as f64 / cap as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExpandOutcome {
    Expanded { new_capacity: usize, lost: u64 },
    AlreadyExpanding,
    BelowThreshold,
}

pub struct IngressChannel {
    current: ArcSwap<ChannelPair>,
    expanding: AtomicBool,
    expand_guard: Mutex<()>,
    growth_factor: f64,
    expand_recheck_threshold: f64,
}

impl IngressChannel {
    pub fn new(capacity: usize, growth_factor: f64, expand_recheck_threshold: f64) -> Self {
        Self {
            current: ArcSwap::from_pointee(ChannelPair::new(capacity)),
            expanding: AtomicBool::new(false),
            expand_guard: Mutex::new(()),
            growth_factor,
            expand_recheck_threshold,
        }
    }

    /// `safeGet`: returns the current channel reference under a read of
    /// the swap point. Cheap — `ArcSwap::load_full` is an atomic pointer
    /// load plus a refcount bump.
    pub fn current(&self) -> arc_swap::Guard<std::sync::Arc<ChannelPair>> {
        self.current.load()
    }

    /// `safeSend`: a non-blocking try-send against whichever channel is
    /// current at the moment of the call.
    pub fn try_send(&self, record: Record) -> Result<(), Record> {
        let pair = self.current.load();
        pair.sender.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(r) => r,
            mpsc::error::TrySendError::Closed(r) => r,
        })
    }

    pub fn usage(&self) -> f64 {
        self.current.load().usage()
    }

    pub fn capacity(&self) -> usize {
        self.current.load().capacity()
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_expanding(&self) -> bool {
        self.expanding.load(Ordering::Relaxed)
    }

    /// Attempts to double the (well, 1.5x) the channel capacity.
    /// Double-checked: only one expansion runs at a time, and the usage
    /// threshold is rechecked after acquiring the exclusive guard in case
    /// another task already expanded or load subsided.
    pub async fn try_expand(&self) -> ExpandOutcome {
        if self
            .expanding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return ExpandOutcome::AlreadyExpanding;
        }

        let outcome = self.expand_inner().await;
        self.expanding.store(false, Ordering::Release);
        outcome
    }

    async fn expand_inner(&self) -> ExpandOutcome {
        let _guard = self.expand_guard.lock().await;

        let old_pair = self.current.load_full();
        if old_pair.usage() < self.expand_recheck_threshold {
            return ExpandOutcome::BelowThreshold;
        }

        let old_cap = old_pair.capacity() as f64;
        let new_cap = ((old_cap * self.growth_factor).ceil() as usize)
            .max(old_pair.capacity() + 1000);

        let new_pair = std::sync::Arc::new(ChannelPair::new(new_cap));

        let deadline = Instant::now() + MIGRATION_BUDGET;
        let mut migrated = 0u64;
        let mut lost = 0u64;
        {
            let mut old_receiver = old_pair.receiver.lock().await;
            loop {
                if Instant::now() >= deadline {
                    break;
                }
                match old_receiver.try_recv() {
                    Ok(record) => {
                        if new_pair.sender.try_send(record).is_ok() {
                            migrated += 1;
                        } else {
                            lost += 1;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => break,
                }
            }
            // Anything still sitting in the old channel past the budget is
            // reported as lost (spec.md §9's explicit decision: expansion
            // migration loss is counted as a drop, not silently dropped).
            while let Ok(_leftover) = old_receiver.try_recv() {
                lost += 1;
            }
        }

        self.current.store(new_pair);

        if lost > 0 {
            warn!(migrated, lost, "ingress channel expansion dropped records past the migration budget");
        }

        ExpandOutcome::Expanded {
            new_capacity: new_cap,
            lost,
        }
    }
}
