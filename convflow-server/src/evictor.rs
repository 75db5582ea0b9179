//! Idle conversation eviction.

use crate::config::EvictionConfig;
use convflow_core::ConversationRuntime;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;

/// Periodically drops conversations that have been idle too long.
pub struct IdleEvictor {
    runtime: Arc<ConversationRuntime>,
    config: EvictionConfig,
    evicted_total: AtomicU64,
    last_run: parking_lot::Mutex<Instant>,
    shutdown: AtomicBool,
    notify: Notify,
}

impl IdleEvictor {
    pub fn new(runtime: Arc<ConversationRuntime>, config: EvictionConfig) -> Self {
        Self {
            runtime,
            config,
            evicted_total: AtomicU64::new(0),
            last_run: parking_lot::Mutex::new(Instant::now()),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Runs one eviction pass.
    pub fn run_once(&self) -> usize {
        let evicted = self.runtime.evict_idle(self.config.max_idle());
        self.evicted_total
            .fetch_add(evicted as u64, Ordering::Relaxed);
        *self.last_run.lock() = Instant::now();
        evicted
    }

    /// Runs the eviction loop (call from a background task).
    pub async fn run(&self) {
        if !self.config.enabled {
            tracing::info!("Idle eviction is disabled");
            return;
        }

        tracing::info!(
            "Idle evictor started (max_idle={}s, interval={}s)",
            self.config.max_idle_secs,
            self.config.check_interval_secs
        );

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.check_interval()) => {}
            }

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let evicted = self.run_once();
            if evicted > 0 {
                tracing::info!("Evicted {} idle conversation(s)", evicted);
            }
        }

        tracing::info!("Idle evictor stopped");
    }

    /// Signals the evictor to shut down.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Returns eviction statistics.
    pub fn stats(&self) -> EvictionStats {
        EvictionStats {
            evicted_total: self.evicted_total.load(Ordering::Relaxed),
            since_last_run: self.last_run.lock().elapsed(),
            live_conversations: self.runtime.instance_count(),
        }
    }
}

/// Eviction statistics.
#[derive(Debug)]
pub struct EvictionStats {
    pub evicted_total: u64,
    pub since_last_run: std::time::Duration,
    pub live_conversations: usize,
}
