//! Mock collaborators for testing
//!
//! Spy and failing steps, exception stores and handlers that record what they
//! were given, item handlers, batch sources, poll targets and connection
//! plumbing, so every component can be exercised without real I/O.

use crate::agent::exception_handler::{AgentExceptionHandler, FaultPhase};
use crate::error::{ReceiverError, StepFault, StoreError};
use crate::persistence::{ExceptionRecord, ExceptionStore};
use crate::pipeline::{ProcessingContext, ResultDescriptor, Step, StepOutcome, StepResult};
use crate::receivers::batch::BatchSource;
use crate::receivers::http::{ConnectionAcceptor, ConnectionHandler, HandlerResponse, RequestContext, RequestHandler};
use crate::receivers::{ItemHandler, PollTarget, ReceivedItem};
use async_trait::async_trait;
use hyper::StatusCode;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Property a proceeding `SpyStep` appends its name to
pub const VISITED_PROPERTY: &str = "visited";

#[derive(Debug, Clone)]
enum SpyBehavior {
    Proceed,
    Stop,
    Unsuccessful,
    Reject,
    Replace(Value),
}

/// Step that records every call and behaves as configured
#[derive(Debug, Clone)]
pub struct SpyStep {
    name: String,
    behavior: SpyBehavior,
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Value>>>,
}

impl SpyStep {
    fn with_behavior(name: &str, behavior: SpyBehavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Appends its name to the `visited` property and proceeds
    pub fn proceeding(name: &str) -> Self {
        Self::with_behavior(name, SpyBehavior::Proceed)
    }

    /// Succeeds but stops the pipeline
    pub fn stopping(name: &str) -> Self {
        Self::with_behavior(name, SpyBehavior::Stop)
    }

    /// Reports failure without a fault or a result descriptor
    pub fn unsuccessful(name: &str) -> Self {
        Self::with_behavior(name, SpyBehavior::Unsuccessful)
    }

    /// Rejects with result code `rejected`
    pub fn rejecting(name: &str) -> Self {
        Self::with_behavior(name, SpyBehavior::Reject)
    }

    /// Proceeds with a replacement context carrying `payload`
    pub fn replacing(name: &str, payload: Value) -> Self {
        Self::with_behavior(name, SpyBehavior::Replace(payload))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_payloads(&self) -> Vec<Value> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Step for SpyStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, mut context: ProcessingContext) -> StepResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(context.payload.clone());

        Ok(match &self.behavior {
            SpyBehavior::Proceed => {
                let visited = match context.property(VISITED_PROPERTY) {
                    Some(previous) => format!("{previous},{}", self.name),
                    None => self.name.clone(),
                };
                context.set_property(VISITED_PROPERTY, visited);
                StepOutcome::proceed(context)
            }
            SpyBehavior::Stop => StepOutcome::stop(context),
            SpyBehavior::Unsuccessful => StepOutcome {
                context,
                succeeded: false,
                can_proceed: false,
                fault: None,
            },
            SpyBehavior::Reject => StepOutcome::reject(
                context,
                ResultDescriptor::new("rejected", format!("rejected by {}", self.name))
                    .with_step(self.name.clone()),
            ),
            SpyBehavior::Replace(payload) => {
                let mut replacement = ProcessingContext::new(context.pipeline.clone(), payload.clone());
                replacement.received_message_id = context.received_message_id.clone();
                replacement.sending_message_id = context.sending_message_id.clone();
                StepOutcome::proceed(replacement)
            }
        })
    }
}

/// Step that always raises a fault
#[derive(Debug, Clone)]
pub struct FailingStep {
    name: String,
    calls: Arc<AtomicUsize>,
}

impl FailingStep {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Step for FailingStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _context: ProcessingContext) -> StepResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StepFault::step_failed(self.name.clone(), "simulated failure"))
    }
}

/// Exception store that refuses every write
#[derive(Debug, Default, Clone)]
pub struct RejectingExceptionStore;

#[async_trait]
impl ExceptionStore for RejectingExceptionStore {
    async fn record_exception(&self, _record: ExceptionRecord) -> Result<(), StoreError> {
        Err(StoreError::Rejected("store is read-only".to_string()))
    }

    async fn mark_for_retry(&self, _correlation_id: &str) -> Result<(), StoreError> {
        Err(StoreError::Rejected("store is read-only".to_string()))
    }
}

/// One fault seen by `RecordingExceptionHandler`
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFault {
    pub agent: String,
    pub phase: FaultPhase,
    pub kind: &'static str,
    pub correlation_id: Option<String>,
}

/// Agent exception handler that keeps every delegated fault
#[derive(Debug, Default)]
pub struct RecordingExceptionHandler {
    calls: Mutex<Vec<RecordedFault>>,
}

impl RecordingExceptionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RecordedFault> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentExceptionHandler for RecordingExceptionHandler {
    async fn handle_fault(
        &self,
        agent: &str,
        phase: FaultPhase,
        fault: &StepFault,
        context: Option<&ProcessingContext>,
    ) {
        self.calls.lock().unwrap().push(RecordedFault {
            agent: agent.to_string(),
            phase,
            kind: fault.kind(),
            correlation_id: context.and_then(|c| c.correlation_id()).map(str::to_string),
        });
    }
}

/// Item handler that keeps every item it is given
#[derive(Debug, Default)]
pub struct RecordingItemHandler {
    items: Mutex<Vec<ReceivedItem>>,
    fail: bool,
}

impl RecordingItemHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the item, then reports a fault
    pub fn failing() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn items(&self) -> Vec<ReceivedItem> {
        self.items.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

#[async_trait]
impl ItemHandler<ReceivedItem> for RecordingItemHandler {
    async fn handle_item(&self, item: ReceivedItem) -> Result<(), StepFault> {
        self.items.lock().unwrap().push(item);
        if self.fail {
            Err(StepFault::step_failed("recording_handler", "configured to fail"))
        } else {
            Ok(())
        }
    }
}

/// Batch source over numbered items, logging every event in order
#[derive(Debug, Default)]
pub struct MockBatchSource {
    batches: Mutex<VecDeque<Vec<u32>>>,
    failing: HashSet<u32>,
    panicking: HashSet<u32>,
    item_delay: Duration,
    failing_polls: usize,
    events: Mutex<Vec<String>>,
    faulted: Mutex<Vec<String>>,
    completed: Mutex<Vec<String>>,
    releases: AtomicUsize,
    polls: AtomicUsize,
}

impl MockBatchSource {
    /// Each poll returns the next batch, then nothing
    pub fn new(batches: Vec<Vec<u32>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            ..Default::default()
        }
    }

    pub fn failing_on(mut self, item: u32) -> Self {
        self.failing.insert(item);
        self
    }

    pub fn panicking_on(mut self, item: u32) -> Self {
        self.panicking.insert(item);
        self
    }

    /// The first `count` polls return an error
    pub fn with_failing_polls(mut self, count: usize) -> Self {
        self.failing_polls = count;
        self
    }

    /// Item `n` takes `n × delay` to handle
    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn faulted_items(&self) -> Vec<String> {
        self.faulted.lock().unwrap().clone()
    }

    pub fn completed_items(&self) -> Vec<String> {
        let mut completed = self.completed.lock().unwrap().clone();
        completed.sort();
        completed
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    fn log(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl BatchSource for MockBatchSource {
    type Item = u32;

    fn name(&self) -> &str {
        "mock-batch"
    }

    async fn poll_due(&self) -> Result<Vec<u32>, ReceiverError> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst);
        if poll < self.failing_polls {
            self.log("poll:error".to_string());
            return Err(ReceiverError::poll_failed("batch source unavailable"));
        }
        let batch = self.batches.lock().unwrap().pop_front().unwrap_or_default();
        self.log(format!("poll:{}", batch.len()));
        Ok(batch)
    }

    fn item_key(&self, item: &u32) -> String {
        format!("item-{item}")
    }

    async fn handle(&self, item: u32) -> Result<(), StepFault> {
        self.log(format!("start:{item}"));
        tokio::time::sleep(self.item_delay * item).await;

        if self.panicking.contains(&item) {
            panic!("item {item} panicked");
        }
        if self.failing.contains(&item) {
            self.log(format!("fault:{item}"));
            return Err(StepFault::step_failed("mock", format!("item {item} failed")));
        }

        self.completed.lock().unwrap().push(format!("item-{item}"));
        self.log(format!("done:{item}"));
        Ok(())
    }

    async fn on_item_fault(&self, item_key: &str, _fault: StepFault) {
        self.faulted.lock().unwrap().push(item_key.to_string());
    }

    fn release_pending(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.log("release".to_string());
    }
}

/// Poll target returning scripted batches, then nothing
#[derive(Debug, Default)]
pub struct StaticPollTarget {
    key: String,
    batches: Mutex<VecDeque<Vec<ReceivedItem>>>,
    polls: AtomicUsize,
    fail: bool,
}

impl StaticPollTarget {
    pub fn new(key: &str, batches: Vec<Vec<ReceivedItem>>) -> Self {
        Self {
            key: key.to_string(),
            batches: Mutex::new(batches.into()),
            ..Default::default()
        }
    }

    /// Every poll returns an error
    pub fn failing(key: &str) -> Self {
        Self {
            key: key.to_string(),
            fail: true,
            ..Default::default()
        }
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PollTarget for StaticPollTarget {
    fn key(&self) -> &str {
        &self.key
    }

    async fn poll(&self) -> Result<Vec<ReceivedItem>, ReceiverError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ReceiverError::poll_failed(format!("{} unreachable", self.key)));
        }
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }
}

/// Acceptor fed through a channel; connections are plain numbers
pub struct ChannelAcceptor {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<u32>>,
}

impl ChannelAcceptor {
    pub fn new() -> (Self, mpsc::UnboundedSender<u32>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                incoming: tokio::sync::Mutex::new(receiver),
            },
            sender,
        )
    }
}

#[async_trait]
impl ConnectionAcceptor for ChannelAcceptor {
    type Connection = u32;

    async fn accept(&self) -> std::io::Result<(u32, String)> {
        match self.incoming.lock().await.recv().await {
            Some(connection) => Ok((connection, format!("mock-{connection}"))),
            // a closed channel behaves like a listener with no more clients
            None => std::future::pending().await,
        }
    }
}

/// Acceptor whose every accept fails with the same error kind
#[derive(Debug)]
pub struct FailingAcceptor {
    kind: std::io::ErrorKind,
    attempts: AtomicUsize,
}

impl FailingAcceptor {
    pub fn new(kind: std::io::ErrorKind) -> Self {
        Self {
            kind,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionAcceptor for FailingAcceptor {
    type Connection = u32;

    async fn accept(&self) -> std::io::Result<(u32, String)> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Err(std::io::Error::new(self.kind, "simulated accept failure"))
    }
}

/// Connection handler that holds each connection for a fixed time
#[derive(Debug)]
pub struct CountingConnectionHandler {
    hold: Duration,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl CountingConnectionHandler {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionHandler<u32> for CountingConnectionHandler {
    async fn handle_connection(&self, _connection: u32, _peer: String) {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

/// Request handler matching one path and answering with a fixed status
#[derive(Debug)]
pub struct FixedRequestHandler {
    name: String,
    path: String,
    status: Option<StatusCode>,
    calls: AtomicUsize,
}

impl FixedRequestHandler {
    pub fn new(name: &str, path: &str, status: StatusCode) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            status: Some(status),
            calls: AtomicUsize::new(0),
        }
    }

    /// Matches `path` and always returns an error
    pub fn failing(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            status: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestHandler for FixedRequestHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, request: &RequestContext) -> bool {
        request.path == self.path
    }

    async fn handle(&self, _request: &RequestContext) -> Result<HandlerResponse, StepFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.status {
            Some(status) => Ok(HandlerResponse::text(status, self.name.clone())),
            None => Err(StepFault::step_failed(self.name.clone(), "handler failed")),
        }
    }
}
