//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use publish_gate::clock::ManualClock;
use publish_gate::queue::{PlatformClient, PlatformClients, PublishError, PublishReceipt, QueueItem};
use publish_gate::store::MemoryStore;
use publish_gate::{GateSettings, PublishGate};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Client that replays scripted results, then succeeds
#[derive(Debug, Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Result<PublishReceipt, PublishError>>>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_script(results: Vec<Result<PublishReceipt, PublishError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into()),
            calls: AtomicUsize::new(0),
        })
    }

    /// Client whose every call fails with a retryable error
    pub fn always_retryable(times: usize) -> Arc<Self> {
        Self::with_script(
            (0..times)
                .map(|_| Err(PublishError::Retryable("HTTP 503".to_string())))
                .collect(),
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformClient for ScriptedClient {
    async fn publish(&self, item: &QueueItem) -> Result<PublishReceipt, PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Ok(PublishReceipt {
                remote_id: Some(format!("remote-{}", item.id)),
            })
        })
    }
}

/// Gate over an in-memory store and a manual clock
pub struct Harness {
    pub gate: Arc<PublishGate>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
}

pub async fn harness(settings: GateSettings, clients: PlatformClients) -> Harness {
    harness_with_store(settings, clients, Arc::new(MemoryStore::new())).await
}

pub async fn harness_with_store(
    settings: GateSettings,
    clients: PlatformClients,
    store: Arc<MemoryStore>,
) -> Harness {
    let clock = Arc::new(ManualClock::starting_now());
    let gate = PublishGate::open(settings, store.clone(), clock.clone(), clients)
        .await
        .unwrap();
    Harness { gate, clock, store }
}
