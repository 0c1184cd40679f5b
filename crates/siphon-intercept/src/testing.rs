//! In-process fakes for the channel and validator.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use siphon_core::{Body, Headers};
use siphon_storage::CacheRecord;
use tokio::sync::Notify;

use crate::channel::InstrumentationChannel;
use crate::error::{InterceptError, Result};
use crate::revalidator::{ValidationResult, Validator};

/// Command received by [`RecordingChannel`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Continue(String),
    Fail(String, String),
    Fulfill {
        id: String,
        status: u16,
        headers: Headers,
        body: Body,
    },
}

/// Channel that records every command.
#[derive(Default)]
pub struct RecordingChannel {
    commands: Mutex<Vec<Command>>,
    bodies: Mutex<HashMap<String, Body>>,
    body_fetches: AtomicUsize,
    detaches: AtomicUsize,
    refuse_fulfill: AtomicBool,
    notify: Notify,
}

impl RecordingChannel {
    pub fn set_body(&self, id: &str, body: Body) {
        self.bodies.lock().insert(id.to_string(), body);
    }

    pub fn refuse_fulfill(&self) {
        self.refuse_fulfill.store(true, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    pub fn body_fetches(&self) -> usize {
        self.body_fetches.load(Ordering::SeqCst)
    }

    pub fn detach_count(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }

    /// Waits until at least `n` commands were recorded.
    pub async fn wait_for(&self, n: usize, limit: Duration) {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.commands.lock().len() >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, wait)
            .await
            .expect("timed out waiting for commands");
    }

    fn record(&self, command: Command) {
        self.commands.lock().push(command);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl InstrumentationChannel for RecordingChannel {
    async fn continue_exchange(&self, exchange_id: &str) -> Result<()> {
        self.record(Command::Continue(exchange_id.to_string()));
        Ok(())
    }

    async fn fail(&self, exchange_id: &str, reason: &str) -> Result<()> {
        self.record(Command::Fail(exchange_id.to_string(), reason.to_string()));
        Ok(())
    }

    async fn fulfill(
        &self,
        exchange_id: &str,
        status_code: u16,
        headers: &Headers,
        body: &Body,
    ) -> Result<()> {
        if self.refuse_fulfill.load(Ordering::SeqCst) {
            return Err(InterceptError::Protocol("fulfill refused".into()));
        }
        self.record(Command::Fulfill {
            id: exchange_id.to_string(),
            status: status_code,
            headers: headers.clone(),
            body: body.clone(),
        });
        Ok(())
    }

    async fn fetch_body(&self, exchange_id: &str) -> Result<Body> {
        self.body_fetches.fetch_add(1, Ordering::SeqCst);
        self.bodies
            .lock()
            .get(exchange_id)
            .cloned()
            .ok_or_else(|| InterceptError::Protocol(format!("no body for {}", exchange_id)))
    }

    async fn detach(&self) {
        self.detaches.fetch_add(1, Ordering::SeqCst);
    }
}

/// Validator answering from a queue of canned results.
#[derive(Default)]
pub struct ScriptedValidator {
    results: Mutex<VecDeque<ValidationResult>>,
    calls: AtomicUsize,
    panic_next: AtomicBool,
}

impl ScriptedValidator {
    pub fn push(&self, result: ValidationResult) {
        self.results.lock().push_back(result);
    }

    pub fn panic_next(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn revalidate(
        &self,
        _method: &str,
        _record: &CacheRecord,
        _request_headers: &Headers,
    ) -> ValidationResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("scripted validator panic");
        }
        self.results
            .lock()
            .pop_front()
            .unwrap_or_else(ValidationResult::rejected)
    }
}
