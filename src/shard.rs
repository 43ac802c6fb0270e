//! Instrument sharding across LOB engine threads.
//!
//! Instruments map to shards with a jump consistent hash, so every update
//! of an instrument goes through the same SPSC queue and keeps its order.

use crate::event::InstrumentId;

/// Jump consistent hash (Lamping & Veach). `buckets` must be non-zero.
pub fn jump_hash(mut key: u64, buckets: u32) -> u32 {
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < i64::from(buckets) {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b.max(0) as u32
}

/// Instrument -> shard routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShardRouter {
    shards: u32,
}

impl ShardRouter {
    /// At least one shard.
    pub fn new(shards: u32) -> Self {
        Self { shards: shards.max(1) }
    }

    #[inline]
    pub fn shards(&self) -> u32 {
        self.shards
    }

    #[inline]
    pub fn shard_for(&self, instrument: InstrumentId) -> usize {
        jump_hash(u64::from(instrument), self.shards) as usize
    }
}

#[cfg(feature = "runtime")]
pub use runtime::ShardSet;

#[cfg(feature = "runtime")]
mod runtime {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread::JoinHandle;

    use tracing::{info, warn};

    use super::ShardRouter;
    use crate::event::{LobStatsEvent, MarketEvent};
    use crate::lob::{LobConfig, LobEngine};

    /// One pinned LOB engine thread per shard, fed by rtrb queues.
    pub struct ShardSet {
        router: ShardRouter,
        inputs: Vec<rtrb::Producer<MarketEvent>>,
        outputs: Vec<rtrb::Consumer<LobStatsEvent>>,
        handles: Vec<JoinHandle<LobEngine>>,
        stop: Arc<AtomicBool>,
        dropped_stats: Arc<AtomicU64>,
    }

    impl ShardSet {
        /// Spawn `shards` engine threads.
        pub fn spawn(shards: u32, config: LobConfig, queue_capacity: usize, pin_to_core: bool) -> std::io::Result<Self> {
            let router = ShardRouter::new(shards);
            let stop = Arc::new(AtomicBool::new(false));
            let dropped_stats = Arc::new(AtomicU64::new(0));
            let core_ids = if pin_to_core {
                core_affinity::get_core_ids().unwrap_or_default()
            } else {
                Vec::new()
            };

            let mut inputs = Vec::with_capacity(router.shards() as usize);
            let mut outputs = Vec::with_capacity(router.shards() as usize);
            let mut handles = Vec::with_capacity(router.shards() as usize);
            for shard in 0..router.shards() as usize {
                let (in_tx, in_rx) = rtrb::RingBuffer::<MarketEvent>::new(queue_capacity);
                let (out_tx, out_rx) = rtrb::RingBuffer::<LobStatsEvent>::new(queue_capacity);
                // Last cores first; they are usually the isolated ones
                let core = (!core_ids.is_empty()).then(|| core_ids[core_ids.len() - 1 - shard % core_ids.len()]);
                let stop = Arc::clone(&stop);
                let dropped = Arc::clone(&dropped_stats);
                let handle = std::thread::Builder::new()
                    .name(format!("lob-shard-{shard}"))
                    .spawn(move || {
                        if let Some(core) = core {
                            if !core_affinity::set_for_current(core) {
                                warn!(shard, "failed to pin shard thread");
                            }
                        }
                        run_shard(LobEngine::new(config), in_rx, out_tx, &stop, &dropped)
                    })?;
                inputs.push(in_tx);
                outputs.push(out_rx);
                handles.push(handle);
            }
            info!(shards = router.shards(), queue_capacity, pin_to_core, "lob shards started");
            Ok(Self {
                router,
                inputs,
                outputs,
                handles,
                stop,
                dropped_stats,
            })
        }

        #[inline]
        pub fn router(&self) -> &ShardRouter {
            &self.router
        }

        /// Route one event. Returns it back if the shard queue is full.
        ///
        /// A gap without an instrument goes to every shard, or to none if
        /// any queue is full.
        pub fn dispatch(&mut self, event: MarketEvent) -> Result<(), MarketEvent> {
            match event.instrument() {
                Some(id) => {
                    let shard = self.router.shard_for(id);
                    self.inputs[shard].push(event).map_err(|rtrb::PushError::Full(ev)| ev)
                }
                None => {
                    if self.inputs.iter().any(|p| p.slots() == 0) {
                        return Err(event);
                    }
                    for input in &mut self.inputs {
                        // Checked above; this thread is the only producer
                        let _ = input.push(event);
                    }
                    Ok(())
                }
            }
        }

        /// Hand every pending stats event to `f`.
        pub fn poll_stats(&mut self, mut f: impl FnMut(LobStatsEvent)) -> usize {
            let mut n = 0;
            for output in &mut self.outputs {
                while let Ok(stats) = output.pop() {
                    f(stats);
                    n += 1;
                }
            }
            n
        }

        /// Stats dropped because an output queue was full.
        pub fn dropped_stats(&self) -> u64 {
            self.dropped_stats.load(Ordering::Relaxed)
        }

        /// Drain the queues, stop the threads and return the engines in shard order.
        pub fn shutdown(self) -> Vec<LobEngine> {
            self.stop.store(true, Ordering::Release);
            let mut engines = Vec::with_capacity(self.handles.len());
            for handle in self.handles {
                match handle.join() {
                    Ok(engine) => engines.push(engine),
                    Err(_) => warn!("lob shard thread panicked"),
                }
            }
            engines
        }
    }

    fn run_shard(
        mut engine: LobEngine,
        mut input: rtrb::Consumer<MarketEvent>,
        mut output: rtrb::Producer<LobStatsEvent>,
        stop: &AtomicBool,
        dropped: &AtomicU64,
    ) -> LobEngine {
        loop {
            let mut idle = true;
            while let Ok(event) = input.pop() {
                idle = false;
                if let Some(stats) = engine.apply(&event) {
                    // Best effort - drop if full
                    if output.push(stats).is_err() {
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            if idle {
                if stop.load(Ordering::Acquire) && input.is_empty() {
                    return engine;
                }
                std::hint::spin_loop();
            }
        }
    }
}
