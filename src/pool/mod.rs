use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::engine::{DiscoveryEngine, DiscoveryFactory};
use crate::protocol::candidate::Candidate;

/// Shares one discovery engine across the sessions of a connection burst.
/// Generations are replaced once their engine has shut down; a live
/// generation is torn down only after its registration count reaches zero
/// AND the grace window since the last gathered candidate has elapsed, so
/// late-arriving peers reuse the same gathering pass.
pub(crate) struct PoolManager {
    factory: Arc<dyn DiscoveryFactory>,
    grace: Duration,
    current: tokio::sync::Mutex<Option<PoolRef>>,
    next_generation: AtomicU64,
}

struct PoolRef {
    generation: u64,
    engine: Arc<dyn DiscoveryEngine>,
    gather: Arc<Mutex<Gather>>,
    events: flume::Sender<PoolEvent>,
}

struct Gather {
    candidates: Vec<Candidate>,
    /// `None` once gathering completed; new subscribers then only get the
    /// snapshot.
    subscribers: Option<Vec<flume::Sender<Candidate>>>,
}

enum PoolEvent {
    Register,
    Release,
}

impl PoolManager {
    pub(crate) fn new(factory: Arc<dyn DiscoveryFactory>, grace: Duration) -> Self {
        Self {
            factory,
            grace,
            current: tokio::sync::Mutex::new(None),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Returns a handle on the live generation, building a new one first if
    /// the previous generation's engine has shut down. Replacement is
    /// serialized by the manager's own lock; callers never observe a
    /// half-built generation.
    pub(crate) async fn acquire(&self) -> io::Result<PoolHandle> {
        let mut current = self.current.lock().await;
        if let Some(pool) = current.as_ref() {
            if !pool.engine.is_shutdown() {
                if let Some(handle) = pool.try_handle() {
                    return Ok(handle);
                }
            }
        }
        let engine = self.factory.create().await?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        log::debug!("starting candidate pool generation {generation}");
        let gather = Arc::new(Mutex::new(Gather {
            candidates: Vec::new(),
            subscribers: Some(Vec::new()),
        }));
        let (events_tx, events_rx) = flume::unbounded();
        tokio::spawn(pool_task(
            engine.clone(),
            events_rx,
            gather.clone(),
            self.grace,
            generation,
        ));
        let pool = PoolRef {
            generation,
            engine,
            gather,
            events: events_tx,
        };
        let handle = pool.try_handle().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "candidate pool task exited early")
        })?;
        *current = Some(pool);
        Ok(handle)
    }
}

impl PoolRef {
    fn try_handle(&self) -> Option<PoolHandle> {
        self.events.send(PoolEvent::Register).ok()?;
        Some(PoolHandle {
            generation: self.generation,
            engine: self.engine.clone(),
            gather: self.gather.clone(),
            events: self.events.clone(),
        })
    }
}

async fn pool_task(
    engine: Arc<dyn DiscoveryEngine>,
    events: flume::Receiver<PoolEvent>,
    gather: Arc<Mutex<Gather>>,
    grace: Duration,
    generation: u64,
) {
    let candidates = engine.local_candidates();
    let mut users = 0usize;
    let mut gathering_done = false;
    let mut events_open = true;
    let mut last_candidate = tokio::time::Instant::now();
    loop {
        tokio::select! {
            ev = events.recv_async(), if events_open => match ev {
                Ok(PoolEvent::Register) => users += 1,
                Ok(PoolEvent::Release) => users = users.saturating_sub(1),
                Err(_) => {
                    // Owner and every handle gone; only the grace window is
                    // left to run out.
                    events_open = false;
                    users = 0;
                }
            },
            rs = candidates.recv_async(), if !gathering_done => match rs {
                Ok(candidate) => {
                    last_candidate = tokio::time::Instant::now();
                    let mut gather = gather.lock();
                    gather.candidates.push(candidate);
                    if let Some(subscribers) = gather.subscribers.as_mut() {
                        subscribers.retain(|tx| tx.send(candidate).is_ok());
                    }
                }
                Err(_) => {
                    gathering_done = true;
                    // Dropping the senders ends every subscriber stream.
                    gather.lock().subscribers.take();
                }
            },
            _ = tokio::time::sleep_until(last_candidate + grace), if users == 0 => break,
        }
    }
    log::debug!("candidate pool generation {generation} shutting down");
    gather.lock().subscribers.take();
    engine.shutdown().await;
}

/// One session's registration against a pool generation. Dropping the handle
/// releases the registration; the release is processed by the pool's own
/// task, so callers never contend on pool state.
pub(crate) struct PoolHandle {
    generation: u64,
    engine: Arc<dyn DiscoveryEngine>,
    gather: Arc<Mutex<Gather>>,
    events: flume::Sender<PoolEvent>,
}

impl PoolHandle {
    pub(crate) fn engine(&self) -> &Arc<dyn DiscoveryEngine> {
        &self.engine
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Local candidates as a snapshot of everything gathered so far followed
    /// by live additions. The stream ends when gathering completes.
    pub(crate) fn candidates(&self) -> flume::Receiver<Candidate> {
        let (tx, rx) = flume::unbounded();
        let mut gather = self.gather.lock();
        for candidate in &gather.candidates {
            _ = tx.send(*candidate);
        }
        if let Some(subscribers) = gather.subscribers.as_mut() {
            subscribers.push(tx);
        }
        rx
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        _ = self.events.send(PoolEvent::Release);
        log::trace!("released pool generation {}", self.generation);
    }
}
