//! Scripted monitors and in-memory backends shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use mesura::monitor::Monitor;
use mesura::storage::Backend;
use mesura::{AppResult, MesuraError, Record};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Fetch attempts and teardown of a [`ScriptedMonitor`], readable after it moved into a controller.
#[derive(Clone, Default)]
pub struct Observations {
    fetches: Arc<Mutex<Vec<Instant>>>,
    torn_down: Arc<AtomicBool>,
}

impl Observations {
    /// Start instants of every fetch attempt.
    pub fn fetch_times(&self) -> Vec<Instant> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    pub fn torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

/// Monitor whose behaviour is fixed up front.
pub struct ScriptedMonitor {
    name: String,
    payload: Value,
    fetch_delay: Duration,
    failures_left: usize,
    hang: bool,
    panic: bool,
    seen: Observations,
}

impl ScriptedMonitor {
    pub fn new(name: &str, payload: Value) -> (Self, Observations) {
        let seen = Observations::default();
        let monitor = Self {
            name: name.to_string(),
            payload,
            fetch_delay: Duration::ZERO,
            failures_left: 0,
            hang: false,
            panic: false,
            seen: seen.clone(),
        };
        (monitor, seen)
    }

    /// Every fetch takes `delay` before answering.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    /// The first `n` fetches fail.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.failures_left = n;
        self
    }

    /// Fetches never complete.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Fetches panic.
    pub fn panicking(mut self) -> Self {
        self.panic = true;
        self
    }
}

#[async_trait]
impl Monitor for ScriptedMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&mut self) -> AppResult<Value> {
        self.seen.fetches.lock().unwrap().push(Instant::now());
        if self.panic {
            panic!("scripted monitor '{}' panicked", self.name);
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(MesuraError::fetch(&self.name, "scripted failure"));
        }
        Ok(self.payload.clone())
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        self.seen.torn_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Keeps every written record in memory.
#[derive(Default)]
pub struct RecordingBackend {
    writes: Mutex<Vec<(String, Record)>>,
}

impl RecordingBackend {
    pub fn writes(&self) -> Vec<(String, Record)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    async fn write(&self, record: &Record, source_name: &str) -> AppResult<()> {
        self.writes
            .lock()
            .unwrap()
            .push((source_name.to_string(), record.clone()));
        Ok(())
    }
}

/// Fails every write.
#[derive(Default)]
pub struct FailingBackend {
    calls: AtomicUsize,
}

impl FailingBackend {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for FailingBackend {
    fn name(&self) -> &str {
        "failing"
    }

    async fn write(&self, _record: &Record, _source_name: &str) -> AppResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(MesuraError::Storage("disk full".to_string()))
    }
}
