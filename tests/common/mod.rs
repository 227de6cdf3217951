//! Handlers and helpers shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use blockrunner::handlers::HandlerResult;
use blockrunner::{
    Block, BlockContext, BlockHandler, BlockOutcome, CancelHandle, Engine, HandlerRegistry,
};

/// Shared counters the test handlers report into.
#[derive(Default)]
pub struct Tracker {
    runs: Mutex<HashMap<String, usize>>,
    finished: Mutex<Vec<String>>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Tracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(&self, ctx: &BlockContext) {
        *self
            .runs
            .lock()
            .unwrap()
            .entry(ctx.block_id.clone())
            .or_insert(0) += 1;
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self, label: String) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.finished.lock().unwrap().push(label);
    }

    /// How many times a block id ran, across all iterations.
    pub fn runs(&self, block_id: &str) -> usize {
        self.runs.lock().unwrap().get(block_id).copied().unwrap_or(0)
    }

    /// Highest number of tracked handlers running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Labels in the order handlers finished.
    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }
}

fn label(ctx: &BlockContext) -> String {
    if ctx.iteration.is_empty() {
        ctx.block_id.clone()
    } else {
        format!("{}{:?}", ctx.block_id, ctx.iteration)
    }
}

/// `double`: outputs twice its numeric `value` input.
pub struct DoubleHandler(pub Arc<Tracker>);

#[async_trait]
impl BlockHandler for DoubleHandler {
    fn block_type(&self) -> &str {
        "double"
    }

    async fn execute(&self, _block: &Block, inputs: &Value, ctx: &BlockContext) -> HandlerResult {
        self.0.enter(ctx);
        let value = inputs
            .get("value")
            .and_then(Value::as_i64)
            .ok_or("double needs a numeric 'value'")?;
        self.0.leave(label(ctx));
        Ok(BlockOutcome::output(json!(value * 2)))
    }
}

/// `sleep`: waits `ms` milliseconds, then outputs its `value` input.
pub struct SleepHandler(pub Arc<Tracker>);

#[async_trait]
impl BlockHandler for SleepHandler {
    fn block_type(&self) -> &str {
        "sleep"
    }

    async fn execute(&self, _block: &Block, inputs: &Value, ctx: &BlockContext) -> HandlerResult {
        self.0.enter(ctx);
        let ms = inputs.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        self.0.leave(label(ctx));
        Ok(BlockOutcome::output(
            inputs.get("value").cloned().unwrap_or(Value::Null),
        ))
    }
}

/// `count`: records the run and echoes its inputs.
pub struct CountHandler(pub Arc<Tracker>);

#[async_trait]
impl BlockHandler for CountHandler {
    fn block_type(&self) -> &str {
        "count"
    }

    async fn execute(&self, _block: &Block, inputs: &Value, ctx: &BlockContext) -> HandlerResult {
        self.0.enter(ctx);
        self.0.leave(label(ctx));
        Ok(BlockOutcome::output(inputs.clone()))
    }
}

/// `fail`: always errors with its `message` input.
pub struct FailHandler;

#[async_trait]
impl BlockHandler for FailHandler {
    fn block_type(&self) -> &str {
        "fail"
    }

    async fn execute(&self, _block: &Block, inputs: &Value, _ctx: &BlockContext) -> HandlerResult {
        let message = inputs
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("boom");
        Err(message.into())
    }
}

/// `panic`: panics inside the handler.
pub struct PanicHandler;

#[async_trait]
impl BlockHandler for PanicHandler {
    fn block_type(&self) -> &str {
        "panic"
    }

    async fn execute(&self, _block: &Block, _inputs: &Value, _ctx: &BlockContext) -> HandlerResult {
        panic!("handler blew up");
    }
}

/// `trip`: cancels the run from inside a block.
pub struct TripHandler(pub CancelHandle);

#[async_trait]
impl BlockHandler for TripHandler {
    fn block_type(&self) -> &str {
        "trip"
    }

    async fn execute(&self, _block: &Block, _inputs: &Value, _ctx: &BlockContext) -> HandlerResult {
        self.0.cancel();
        Ok(BlockOutcome::output(json!({"tripped": true})))
    }
}

/// Built-in handlers plus every tracked test handler.
pub fn registry(tracker: &Arc<Tracker>) -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::with_builtins();
    registry.register(Arc::new(DoubleHandler(Arc::clone(tracker))));
    registry.register(Arc::new(SleepHandler(Arc::clone(tracker))));
    registry.register(Arc::new(CountHandler(Arc::clone(tracker))));
    registry.register(Arc::new(FailHandler));
    registry.register(Arc::new(PanicHandler));
    Arc::new(registry)
}

/// Engine with the test registry and room for real concurrency.
pub fn engine(tracker: &Arc<Tracker>) -> Engine {
    let mut engine = Engine::new().with_registry(registry(tracker));
    engine.set_max_concurrency(8);
    engine
}
