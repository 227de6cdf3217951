//! Workflow Execution Engine
//!
//! A single coordinator owns the [`ExecutionContext`] and walks the graph
//! scope by scope:
//! - Ready blocks are dispatched onto tokio tasks, bounded by `max_concurrency`
//! - Finished blocks report back over a channel; only the coordinator writes state
//! - Loop and parallel groups open one frame per iteration
//! - A wait block suspends the run into a checkpoint that [`Engine::resume`] picks up
//!
//! Resuming replays the graph: every instance that already has a result is
//! completed from the restored context instead of being dispatched again.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use super::context::{BlockState, ExecutionContext, GroupRun, StateKey};
use super::result::{BlockLogEntry, ExecutionMetadata, ExecutionResult, RunStatus, WaitBlockInfo};
use super::step::{execute_step, StepReport};
use crate::checkpoint::record::validate_execution_id;
use crate::checkpoint::{Checkpoint, CheckpointMetadata, CheckpointStore, PauseResumeService, ResumedRun};
use crate::config::EngineConfig;
use crate::error::{BlockExecutionError, EngineError, Result};
use crate::handlers::{default_registry, BlockOutcome, HandlerRegistry};
use crate::references::ReferenceResolver;
use crate::workflow::planner::ERROR_HANDLE;
use crate::workflow::{
    load_workflow, Block, ExecutionPlanner, GroupInfo, GroupKind, Iteration, NodeStatus, Workflow,
    WorkflowDefinition,
};

/// Cooperative cancellation flag, checked before every dispatch.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Parameters of a fresh run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub execution_id: String,
    pub input: Value,
    pub environment: HashMap<String, String>,
    pub variables: HashMap<String, Value>,
    pub is_deployed_context: bool,
    pub workspace_id: Option<String>,
    pub cancel: CancelHandle,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRequest {
    /// A request with a random execution id and an empty input object.
    pub fn new() -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            input: json!({}),
            environment: HashMap::new(),
            variables: HashMap::new(),
            is_deployed_context: false,
            workspace_id: None,
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_execution_id(mut self, id: impl Into<String>) -> Self {
        self.execution_id = id.into();
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn deployed(mut self, deployed: bool) -> Self {
        self.is_deployed_context = deployed;
        self
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Parameters of a resume.
#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub execution_id: String,
    /// Data delivered to the wait block the run is suspended on
    pub resume_input: Value,
    pub cancel: CancelHandle,
}

impl ResumeRequest {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            resume_input: Value::Null,
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.resume_input = input;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Workflow execution engine.
///
/// Holds the handler catalog, the checkpoint service and the limits; one
/// engine can drive any number of runs.
///
/// # Example
///
/// ```rust,no_run
/// use blockrunner::execution::{Engine, RunRequest};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut engine = Engine::new();
///     engine.set_max_concurrency(4);
///
///     let workflow = engine.load_file("flow.yaml")?;
///     let result = engine
///         .execute(workflow, RunRequest::new().with_input(json!({"name": "Ada"})))
///         .await?;
///     println!("{}", result.output);
///     Ok(())
/// }
/// ```
pub struct Engine {
    registry: Arc<HandlerRegistry>,
    checkpoints: Arc<PauseResumeService>,
    config: EngineConfig,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Creates an engine with the built-in handlers, an in-memory checkpoint
    /// store and the environment-derived configuration.
    pub fn new() -> Self {
        Self {
            registry: default_registry(),
            checkpoints: Arc::new(PauseResumeService::default()),
            config: EngineConfig::from_env(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Arc::new(PauseResumeService::new(store));
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the maximum number of blocks in flight.
    pub fn set_max_concurrency(&mut self, max: usize) {
        self.config.max_concurrency = max.max(1);
    }

    /// Sets the cap on a single group's iteration count.
    pub fn set_max_iterations(&mut self, max: usize) {
        self.config.max_iterations = max;
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn checkpoints(&self) -> &Arc<PauseResumeService> {
        &self.checkpoints
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates and compiles a definition against this engine's handlers.
    pub fn load(&self, definition: WorkflowDefinition) -> Result<Arc<Workflow>> {
        Ok(Arc::new(Workflow::compile(definition, &self.registry)?))
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Arc<Workflow>> {
        self.load(load_workflow(path)?)
    }

    /// Runs a workflow until it completes, fails, is cancelled or pauses.
    ///
    /// Block failures and cancellation are reported inside the result;
    /// `Err` means the run could not be started or its checkpoint not saved.
    pub async fn execute(
        &self,
        workflow: Arc<Workflow>,
        request: RunRequest,
    ) -> Result<ExecutionResult> {
        validate_execution_id(&request.execution_id)?;
        info!(
            "Starting execution '{}' of workflow '{}' ({} blocks)",
            request.execution_id,
            workflow.id(),
            workflow.len()
        );

        let mut ctx = ExecutionContext::new(
            Arc::clone(&workflow),
            request.execution_id,
            request.input,
            request.environment,
        );
        ctx.workflow_variables = request.variables;
        ctx.is_deployed_context = request.is_deployed_context;
        ctx.workspace_id = request.workspace_id;

        let meta = RunMeta {
            started_at: Utc::now(),
            logs: Vec::new(),
            pause_count: 0,
        };
        self.run(workflow, ctx, meta, request.cancel).await
    }

    /// Continues a paused run, delivering `resume_input` to its wait block.
    ///
    /// Each pause can be resumed once; an unknown or already resumed id is
    /// `CheckpointNotFound`.
    pub async fn resume(&self, request: ResumeRequest) -> Result<ExecutionResult> {
        let checkpoint = self
            .checkpoints
            .resume_execution(&request.execution_id)
            .await?
            .ok_or_else(|| EngineError::CheckpointNotFound {
                execution_id: request.execution_id.clone(),
            })?;

        let backup = checkpoint.clone();
        let resumed = match PauseResumeService::create_from_paused_state(
            checkpoint,
            request.resume_input,
            &self.registry,
        ) {
            Ok(resumed) => resumed,
            Err(err) => {
                // Put the pause back so the caller can retry with a fixed registry
                self.checkpoints.pause_execution(&backup).await?;
                return Err(err);
            }
        };

        let ResumedRun {
            workflow,
            context,
            metadata,
        } = resumed;
        let meta = RunMeta {
            started_at: metadata.started_at,
            logs: metadata.logs,
            pause_count: metadata.pause_count,
        };
        self.run(workflow, context, meta, request.cancel).await
    }

    async fn run(
        &self,
        workflow: Arc<Workflow>,
        ctx: ExecutionContext,
        meta: RunMeta,
        cancel: CancelHandle,
    ) -> Result<ExecutionResult> {
        let mut coordinator = Coordinator::new(Arc::clone(&workflow), ctx, meta.logs, &self.config, cancel);
        coordinator.drive().await;

        let ended_at = Utc::now();
        let mut pause_count = meta.pause_count;

        if let Some(Halt::Paused(wait)) = &coordinator.halt {
            pause_count += 1;
            let checkpoint = Checkpoint::capture(
                &coordinator.ctx,
                CheckpointMetadata {
                    started_at: meta.started_at,
                    paused_at: ended_at,
                    wait_block: wait.clone(),
                    ready_blocks: coordinator.ready_instances(),
                    pause_count,
                    logs: coordinator.logs.clone(),
                },
            );
            self.checkpoints.pause_execution(&checkpoint).await?;
        }

        let result = coordinator.into_result(meta.started_at, ended_at, pause_count);
        log_summary(&result);
        Ok(result)
    }
}

fn log_summary(result: &ExecutionResult) {
    match result.status {
        RunStatus::Completed => info!(
            "Execution '{}' completed: {} blocks in {} ms",
            result.execution_id, result.metadata.executed_block_count, result.metadata.duration_ms
        ),
        RunStatus::Paused => info!(
            "Execution '{}' paused after {} blocks",
            result.execution_id, result.metadata.executed_block_count
        ),
        _ => error!(
            "Execution '{}' {}: {}",
            result.execution_id,
            result.status,
            result.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

/// Bookkeeping carried across pauses.
struct RunMeta {
    started_at: DateTime<Utc>,
    logs: Vec<BlockLogEntry>,
    pause_count: u32,
}

/// One scope instance: the root, or one iteration of a group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct FrameKey {
    group: Option<String>,
    path: Vec<usize>,
}

impl FrameKey {
    fn root() -> Self {
        Self {
            group: None,
            path: Vec::new(),
        }
    }

    fn iteration(group: &StateKey, index: usize) -> Self {
        let mut path = group.iteration.clone();
        path.push(index);
        Self {
            group: Some(group.block_id.clone()),
            path,
        }
    }
}

/// A group instance that is iterating.
#[derive(Debug)]
struct ActiveGroup {
    total: usize,
    next: usize,
    open: usize,
    completed: usize,
    /// Iterations allowed in flight at once
    limit: usize,
}

/// Message from a dispatched block back to the coordinator.
struct Finished {
    frame: FrameKey,
    key: StateKey,
    block_type: String,
    report: StepReport,
}

/// Why a run stopped dispatching.
enum Halt {
    Paused(WaitBlockInfo),
    Cancelled(Option<String>),
    Failed(EngineError),
}

impl Halt {
    fn rank(&self) -> u8 {
        match self {
            Halt::Paused(_) => 0,
            Halt::Cancelled(_) => 1,
            Halt::Failed(_) => 2,
        }
    }
}

type Timing = (DateTime<Utc>, DateTime<Utc>, u64);

type Step<T> = std::result::Result<T, Halt>;

struct Coordinator {
    workflow: Arc<Workflow>,
    ctx: ExecutionContext,
    frames: BTreeMap<FrameKey, ExecutionPlanner>,
    groups: BTreeMap<StateKey, ActiveGroup>,
    in_flight: usize,
    max_concurrency: usize,
    max_iterations: usize,
    cancel: CancelHandle,
    logs: Vec<BlockLogEntry>,
    halt: Option<Halt>,
    tx: UnboundedSender<Finished>,
    rx: UnboundedReceiver<Finished>,
}

impl Coordinator {
    fn new(
        workflow: Arc<Workflow>,
        ctx: ExecutionContext,
        logs: Vec<BlockLogEntry>,
        config: &EngineConfig,
        cancel: CancelHandle,
    ) -> Self {
        let (tx, rx) = unbounded_channel();
        let mut frames = BTreeMap::new();
        frames.insert(
            FrameKey::root(),
            ExecutionPlanner::new(Arc::clone(workflow.root_scope())),
        );

        Self {
            workflow,
            ctx,
            frames,
            groups: BTreeMap::new(),
            in_flight: 0,
            max_concurrency: config.max_concurrency.max(1),
            max_iterations: config.max_iterations,
            cancel,
            logs,
            halt: None,
            tx,
            rx,
        }
    }

    /// Main loop: schedule, then wait for one block to finish.
    async fn drive(&mut self) {
        loop {
            if self.halt.is_none() {
                if let Err(halt) = self.advance() {
                    self.set_halt(halt);
                }
            }

            if self.in_flight == 0 {
                break;
            }

            // In-flight blocks always drain, even after a halt
            match self.rx.recv().await {
                Some(done) => self.on_finished(done),
                None => break,
            }
        }

        if self.halt.is_none() {
            self.check_stalled();
        }
    }

    fn set_halt(&mut self, halt: Halt) {
        let replace = match &self.halt {
            None => true,
            Some(current) => halt.rank() > current.rank(),
        };
        if replace {
            self.halt = Some(halt);
        } else if let Halt::Paused(wait) = &halt {
            debug!(
                "Wait block '{}' will run again on resume",
                wait.key()
            );
        }
    }

    /// Schedules until nothing more can happen without a block finishing.
    fn advance(&mut self) -> Step<()> {
        loop {
            let mut progressed = false;

            let frames: Vec<FrameKey> = self.frames.keys().cloned().collect();
            for frame in &frames {
                progressed |= self.advance_frame(frame)?;
            }
            progressed |= self.open_iterations();
            progressed |= self.close_frames();

            if !progressed {
                return Ok(());
            }
        }
    }

    fn advance_frame(&mut self, frame: &FrameKey) -> Step<bool> {
        let Some(planner) = self.frames.get_mut(frame) else {
            return Ok(false);
        };
        let skipped = planner.settle_skips();
        let ready = planner.ready_nodes();

        let mut progressed = !skipped.is_empty();
        for id in &skipped {
            self.ctx.mark_skipped(id);
        }

        for node in ready {
            let key = StateKey::new(node.clone(), frame.path.clone());

            if self.workflow.is_group(&node) {
                self.open_group(frame, key)?;
                progressed = true;
                continue;
            }

            let Some(block) = self.workflow.block(&node).cloned() else {
                continue;
            };

            if !block.enabled {
                debug!("Block '{}' is disabled, passing through", key);
                if let Some(planner) = self.frames.get_mut(frame) {
                    planner.mark_bypassed(&node);
                }
                progressed = true;
                continue;
            }

            if let Some(state) = self.ctx.state(&key) {
                debug!("Block '{}' already has a result, not running it again", key);
                let handle = state.selected_handle.clone();
                if let Some(planner) = self.frames.get_mut(frame) {
                    planner.mark_completed(&node, handle);
                }
                progressed = true;
                continue;
            }

            if self.in_flight >= self.max_concurrency {
                continue;
            }
            if self.cancel.is_cancelled() {
                info!("Cancellation requested, not starting '{}'", key);
                return Err(Halt::Cancelled(Some(node)));
            }

            self.dispatch(frame, key, block)?;
            progressed = true;
        }

        Ok(progressed)
    }

    fn dispatch(&mut self, frame: &FrameKey, key: StateKey, block: Block) -> Step<()> {
        let Some(handler) = self.workflow.handler(&block.id) else {
            let err = BlockExecutionError::new(&block.id, "no handler bound to block");
            return self.fail_block(frame, &key, err.into(), None);
        };

        let resolver =
            ReferenceResolver::new(&self.workflow, &self.ctx, &key.block_id, &key.iteration);
        let inputs = match handler.resolve_inputs(&block, &resolver) {
            Ok(inputs) => inputs,
            Err(err) => {
                let now = Utc::now();
                let mut entry = self.log_entry(&key, &block.block_type, (now, now, 0));
                entry.success = false;
                entry.error = Some(err.to_string());
                self.logs.push(entry);
                return self.fail_block(frame, &key, err.into(), None);
            }
        };

        let block_ctx = self.ctx.block_context(&key);
        if let Some(planner) = self.frames.get_mut(frame) {
            planner.mark_running(&block.id);
        }
        self.in_flight += 1;
        info!("Starting block: {}", key);

        let tx = self.tx.clone();
        let frame = frame.clone();
        let block_type = block.block_type.clone();
        tokio::spawn(async move {
            let report = execute_step(handler, block, inputs, block_ctx).await;
            let done = Finished {
                frame,
                key,
                block_type,
                report,
            };
            if tx.send(done).is_err() {
                debug!("Coordinator gone, dropping block result");
            }
        });
        Ok(())
    }

    fn log_entry(&self, key: &StateKey, block_type: &str, timing: Timing) -> BlockLogEntry {
        let (started_at, ended_at, duration_ms) = timing;
        BlockLogEntry {
            block_id: key.block_id.clone(),
            block_name: self.workflow.reference_name(&key.block_id).to_string(),
            block_type: block_type.to_string(),
            iteration: key.iteration.clone(),
            started_at,
            ended_at,
            duration_ms,
            success: true,
            output: None,
            error: None,
        }
    }

    fn on_finished(&mut self, done: Finished) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let Finished {
            frame,
            key,
            block_type,
            report,
        } = done;
        let timing = (report.started_at, report.ended_at, report.duration_ms);
        let mut entry = self.log_entry(&key, &block_type, timing);

        match report.outcome {
            Ok(BlockOutcome::Completed(out)) => {
                info!("Block '{}' completed in {} ms", key, report.duration_ms);
                for (name, value) in out.variable_updates {
                    self.ctx.set_variable(name, value);
                }
                entry.output = Some(out.output.clone());
                self.logs.push(entry);

                let state = BlockState::new(out.output)
                    .with_timing(timing.0, timing.1, timing.2)
                    .with_handle(out.selected_handle.clone());
                self.ctx.store(key.clone(), state);
                if let Some(planner) = self.frames.get_mut(&frame) {
                    planner.mark_completed(&key.block_id, out.selected_handle);
                }
            }
            Ok(BlockOutcome::Wait(request)) => {
                info!("Block '{}' is waiting: {}", key, request.reason);
                entry.output = Some(json!({"waiting": true, "reason": request.reason}));
                let wait = WaitBlockInfo {
                    block_id: key.block_id.clone(),
                    block_name: entry.block_name.clone(),
                    iteration: key.iteration.clone(),
                    reason: request.reason,
                    payload: request.payload,
                };
                self.logs.push(entry);
                self.set_halt(Halt::Paused(wait));
            }
            Err(message) => {
                entry.success = false;
                entry.error = Some(message.clone());
                self.logs.push(entry);

                let err = BlockExecutionError::new(&key.block_id, message);
                if let Err(halt) = self.fail_block(&frame, &key, err.into(), Some(timing)) {
                    self.set_halt(halt);
                }
            }
        }
    }

    /// Routes a failure to the node's `error` edge, or halts the run.
    fn fail_block(
        &mut self,
        frame: &FrameKey,
        key: &StateKey,
        error: EngineError,
        timing: Option<Timing>,
    ) -> Step<()> {
        let message = match &error {
            EngineError::BlockExecution(e) => e.message.clone(),
            other => other.to_string(),
        };
        let routed = self
            .frames
            .get(frame)
            .map(|p| p.scope().has_error_route(&key.block_id))
            .unwrap_or(false);

        if routed {
            warn!("Block '{}' failed, taking its error path: {}", key, message);
            let mut state = BlockState::new(json!({ "error": message }))
                .with_handle(Some(ERROR_HANDLE.to_string()));
            if let Some((started, ended, ms)) = timing {
                state = state.with_timing(started, ended, ms);
            }
            self.ctx.store(key.clone(), state);
            if let Some(planner) = self.frames.get_mut(frame) {
                planner.mark_completed(&key.block_id, Some(ERROR_HANDLE.to_string()));
            }
            Ok(())
        } else {
            error!("Block '{}' failed: {}", key, message);
            if let Some(planner) = self.frames.get_mut(frame) {
                planner.mark_failed(&key.block_id, message);
            }
            Err(Halt::Failed(error))
        }
    }

    /// Starts iterating a group instance whose dependencies are met.
    fn open_group(&mut self, frame: &FrameKey, key: StateKey) -> Step<()> {
        if let Some(state) = self.ctx.state(&key) {
            debug!("Group '{}' already completed, not running it again", key);
            let handle = state.selected_handle.clone();
            if let Some(planner) = self.frames.get_mut(frame) {
                planner.mark_completed(&key.block_id, handle);
            }
            return Ok(());
        }

        let workflow = Arc::clone(&self.workflow);
        let Some(info) = workflow.group(&key.block_id) else {
            return Ok(());
        };

        let run = match self.ctx.group_runs.get(&key) {
            Some(run) => run.clone(),
            None => {
                let run = match self.resolve_iteration(info, &key) {
                    Ok(run) => run,
                    Err(err) => return self.fail_block(frame, &key, err, None),
                };
                if run.total > self.max_iterations {
                    let err = BlockExecutionError::new(
                        &key.block_id,
                        format!(
                            "{} iterations exceed the limit of {}",
                            run.total, self.max_iterations
                        ),
                    );
                    return self.fail_block(frame, &key, err.into(), None);
                }
                self.ctx.group_runs.insert(key.clone(), run.clone());
                run
            }
        };

        let limit = match info.kind {
            GroupKind::Loop => 1,
            GroupKind::Parallel => info.max_concurrency.unwrap_or(run.total).max(1),
        };
        info!(
            "Opening {} '{}' with {} iteration(s)",
            info.kind.system_prefix(),
            key,
            run.total
        );

        if let Some(planner) = self.frames.get_mut(frame) {
            planner.mark_running(&key.block_id);
        }
        self.groups.insert(
            key,
            ActiveGroup {
                total: run.total,
                next: 0,
                open: 0,
                completed: 0,
                limit,
            },
        );
        Ok(())
    }

    fn resolve_iteration(&self, info: &GroupInfo, key: &StateKey) -> Result<GroupRun> {
        match &info.iteration {
            Iteration::Count { count } => Ok(GroupRun {
                total: *count,
                items: None,
            }),
            Iteration::Collection { items } => {
                let resolved =
                    ReferenceResolver::new(&self.workflow, &self.ctx, &info.id, &key.iteration)
                        .resolve_value(items)?;
                let items = collection_items(&info.id, resolved)?;
                Ok(GroupRun {
                    total: items.len(),
                    items: Some(items),
                })
            }
        }
    }

    /// Opens iteration frames up to each group's in-flight limit.
    fn open_iterations(&mut self) -> bool {
        let mut progressed = false;
        for (key, group) in self.groups.iter_mut() {
            let Some(scope) = self.workflow.group(&key.block_id).map(|g| Arc::clone(&g.scope)) else {
                continue;
            };
            while group.open < group.limit && group.next < group.total {
                let frame = FrameKey::iteration(key, group.next);
                debug!("Starting iteration {} of '{}'", group.next, key);
                self.frames.insert(frame, ExecutionPlanner::new(Arc::clone(&scope)));
                group.next += 1;
                group.open += 1;
                progressed = true;
            }
        }
        progressed
    }

    /// Retires settled iteration frames and completes finished groups.
    fn close_frames(&mut self) -> bool {
        let settled: Vec<FrameKey> = self
            .frames
            .iter()
            .filter(|(frame, planner)| frame.group.is_some() && !planner.has_work_remaining())
            .map(|(frame, _)| frame.clone())
            .collect();

        let mut progressed = false;
        for frame in settled {
            self.frames.remove(&frame);
            let (Some(group_id), Some((index, parent_path))) = (frame.group, frame.path.split_last()) else {
                continue;
            };
            let group_key = StateKey::new(group_id, parent_path.to_vec());
            debug!("Iteration {} of '{}' finished", index, group_key);
            if let Some(group) = self.groups.get_mut(&group_key) {
                group.open = group.open.saturating_sub(1);
                group.completed += 1;
            }
            progressed = true;
        }

        let done: Vec<StateKey> = self
            .groups
            .iter()
            .filter(|(_, group)| group.completed >= group.total)
            .map(|(key, _)| key.clone())
            .collect();
        for key in done {
            self.groups.remove(&key);
            self.complete_group(&key);
            progressed = true;
        }

        progressed
    }

    /// Records a group's aggregate once every iteration has settled.
    fn complete_group(&mut self, key: &StateKey) {
        let workflow = Arc::clone(&self.workflow);
        let Some(info) = workflow.group(&key.block_id) else {
            return;
        };
        let run = self.ctx.group_runs.get(key).cloned().unwrap_or(GroupRun {
            total: 0,
            items: None,
        });

        let results: Vec<Value> = (0..run.total)
            .map(|index| {
                let mut path = key.iteration.clone();
                path.push(index);
                self.iteration_result(info, &path)
            })
            .collect();

        let mut aggregate = json!({
            "results": results,
            "iterations": run.total,
        });
        if let Some(items) = run.items {
            aggregate["items"] = Value::Array(items);
        }

        info!("Group '{}' completed {} iteration(s)", key, run.total);
        self.ctx.store(key.clone(), BlockState::new(aggregate));

        let parent = FrameKey {
            group: workflow.parent(&key.block_id).map(String::from),
            path: key.iteration.clone(),
        };
        if let Some(planner) = self.frames.get_mut(&parent) {
            planner.mark_completed(&key.block_id, None);
        }
    }

    /// Output of one iteration: its single sink's output, or an object keyed
    /// by sink reference name.
    fn iteration_result(&self, info: &GroupInfo, path: &[usize]) -> Value {
        let sinks = info.scope.sinks();
        let output_of = |id: &str| {
            self.ctx
                .state(&StateKey::new(id, path.to_vec()))
                .map(|s| s.output.clone())
                .unwrap_or(Value::Null)
        };

        match sinks {
            [only] => output_of(only.as_str()),
            _ => Value::Object(
                sinks
                    .iter()
                    .map(|id| (self.workflow.reference_name(id).to_string(), output_of(id.as_str())))
                    .collect(),
            ),
        }
    }

    fn check_stalled(&mut self) {
        let Some(root) = self.frames.get(&FrameKey::root()) else {
            return;
        };
        if !root.has_work_remaining() {
            return;
        }
        let pending = root
            .scope()
            .order
            .iter()
            .find(|id| !root.status(id).map(NodeStatus::is_settled).unwrap_or(true))
            .cloned()
            .unwrap_or_default();

        error!("Execution stalled with '{}' still pending", pending);
        let err = BlockExecutionError::new(pending, "block never became ready");
        self.halt = Some(Halt::Failed(err.into()));
    }

    /// Instances ready to dispatch when the run stopped.
    fn ready_instances(&self) -> Vec<StateKey> {
        self.frames
            .iter()
            .flat_map(|(frame, planner)| {
                planner
                    .ready_nodes()
                    .into_iter()
                    .map(move |node| StateKey::new(node, frame.path.clone()))
            })
            .collect()
    }

    /// Output of the last root-scope sink, in topological order, that ran.
    fn final_output(&self) -> Value {
        self.workflow
            .root_scope()
            .sinks()
            .iter()
            .rev()
            .find_map(|id| self.ctx.state(&StateKey::root(id.as_str())))
            .map(|state| state.output.clone())
            .unwrap_or(Value::Null)
    }

    fn into_result(
        self,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        pause_count: u32,
    ) -> ExecutionResult {
        let output = self.final_output();
        let executed_block_count = self
            .ctx
            .execution_order
            .iter()
            .filter(|key| !self.workflow.is_group(&key.block_id))
            .count();

        let mut result = ExecutionResult {
            execution_id: self.ctx.execution_id.clone(),
            workflow_id: self.ctx.workflow_id.clone(),
            success: true,
            output,
            error: None,
            error_code: None,
            logs: self.logs,
            is_paused: false,
            status: RunStatus::Completed,
            executed_blocks: self.ctx.executed_blocks.iter().cloned().collect(),
            skipped_blocks: self.ctx.skipped_blocks.iter().cloned().collect(),
            metadata: ExecutionMetadata {
                duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
                executed_block_count,
                start_time: started_at,
                end_time: ended_at,
                wait_block_info: None,
                failed_block_id: None,
                unresolved_token: None,
                pause_count,
            },
        };

        match self.halt {
            None => {}
            Some(Halt::Paused(wait)) => {
                result.is_paused = true;
                result.status = RunStatus::Paused;
                result.metadata.wait_block_info = Some(wait);
            }
            Some(Halt::Cancelled(block_id)) => {
                let err = EngineError::Cancelled { block_id };
                result.success = false;
                result.status = RunStatus::Cancelled;
                result.error = Some(err.to_string());
                result.error_code = Some(err.code().to_string());
                result.metadata.failed_block_id = err.block_id().map(String::from);
            }
            Some(Halt::Failed(err)) => {
                result.success = false;
                result.status = RunStatus::Failed;
                result.error = Some(err.to_string());
                result.error_code = Some(err.code().to_string());
                result.metadata.failed_block_id = err.block_id().map(String::from);
                result.metadata.unresolved_token = err.token().map(String::from);
            }
        }

        result
    }
}

/// Interprets a resolved collection expression as a list of items.
///
/// Arrays are used as-is, objects become `{key, value}` entries, strings
/// must hold a JSON array, and an unresolved (null) reference yields no
/// iterations.
fn collection_items(group_id: &str, value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect()),
        Value::Null => {
            warn!("Collection of '{}' resolved to nothing; running no iterations", group_id);
            Ok(Vec::new())
        }
        Value::String(text) if text.trim().is_empty() => Ok(Vec::new()),
        Value::String(text) => match serde_json::from_str::<Value>(text.trim()) {
            Ok(Value::Array(items)) => Ok(items),
            _ => Err(BlockExecutionError::new(
                group_id,
                format!("collection '{}' is not a JSON array", text),
            )
            .into()),
        },
        other => Err(BlockExecutionError::new(
            group_id,
            format!("collection must be an array, got {}", other),
        )
        .into()),
    }
}
