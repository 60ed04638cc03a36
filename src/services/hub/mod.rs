//! Real-time broadcast fan-out.
//!
//! Handlers never await the hub: `publish` enqueues onto a bounded queue and
//! a small worker pool drains it off the critical path. On overflow the
//! oldest event is dropped and counted; a stale chart update is worth less
//! than a fresh one.

pub mod auth;
pub mod rest;

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use rest::HubClient;

pub const HUB_NAME: &str = "spyoptions";

const DEFAULT_WORKERS: usize = 2;
const DEFAULT_CAPACITY: usize = 256;

struct Inner {
    client: Option<HubClient>,
    queue: Mutex<VecDeque<(String, Value)>>,
    notify: Notify,
    capacity: usize,
}

#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    pub fn start(client: Option<HubClient>) -> Self {
        Self::with_options(client, DEFAULT_WORKERS, DEFAULT_CAPACITY)
    }

    pub fn with_options(client: Option<HubClient>, workers: usize, capacity: usize) -> Self {
        let inner = Arc::new(Inner {
            client,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        });

        if inner.client.is_some() {
            for worker in 0..workers {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    drain_loop(worker, inner).await;
                });
            }
        }

        Self { inner }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.client.is_some()
    }

    pub async fn pending(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    /// Fire-and-forget: enqueue and return. Never blocks on the hub.
    pub async fn publish(&self, event: &str, payload: Value) {
        if self.inner.client.is_none() {
            log::debug!("hub disabled; dropping '{event}'");
            return;
        }
        {
            let mut queue = self.inner.queue.lock().await;
            queue.push_back((event.to_string(), payload));
            while queue.len() > self.inner.capacity {
                queue.pop_front();
                metrics::increment_counter!("broadcast_dropped_total");
                log::warn!("broadcast queue full; dropped oldest event");
            }
        }
        self.inner.notify.notify_one();
    }
}

async fn drain_loop(worker: usize, inner: Arc<Inner>) {
    let client = match &inner.client {
        Some(c) => c.clone(),
        None => return,
    };
    loop {
        inner.notify.notified().await;
        loop {
            let job = inner.queue.lock().await.pop_front();
            let (event, payload) = match job {
                Some(j) => j,
                None => break,
            };
            match client.broadcast(&event, &payload).await {
                Ok(()) => {
                    metrics::increment_counter!("broadcast_sent_total");
                }
                Err(e) => {
                    metrics::increment_counter!("broadcast_errors_total");
                    log::warn!("broadcast worker {worker}: '{event}' failed: {e}");
                }
            }
        }
    }
}
