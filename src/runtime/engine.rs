use dashmap::DashMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::activities::ActivityRegistry;
use crate::behaviors::{BehaviorRegistry, Completion, EnterResult, ErrorOutcome, EvalStatus, Model};
use crate::compiler::Compiler;
use crate::config::EngineConfig;
use crate::data::resolver::{ExprResolver, Resolver};
use crate::data::scope::Scope;
use crate::dsl::DefinitionRep;
use crate::error::{DefinitionError, FlowError, TaskError};
use crate::runtime::context::{ERROR_ATTR, ExecEnv, InstanceEvent, TaskContext};
use crate::runtime::definition::{Definition, Task};
use crate::runtime::handler::{DoneGuard, FlowResult, ReplySink, ResultHandler};
use crate::runtime::instance::Instance;
use crate::runtime::recorder::{StateRecorder, StepRecord};
use crate::runtime::state::{EnterCode, FlowStatus, LinkState, TaskEntry, TaskState};

/// Compiles and stores definitions, and starts one worker per instance.
pub struct Engine {
    definitions: DashMap<String, Arc<Definition>>,
    activities: ActivityRegistry,
    behaviors: BehaviorRegistry,
    resolver: Arc<dyn Resolver>,
    recorder: Option<Arc<dyn StateRecorder>>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(activities: ActivityRegistry, behaviors: BehaviorRegistry, config: EngineConfig) -> Self {
        Self {
            definitions: DashMap::new(),
            activities,
            behaviors,
            resolver: Arc::new(ExprResolver::new()),
            recorder: None,
            config,
        }
    }

    /// Engine with the builtin activities and the "simple" model.
    pub fn with_defaults(config: EngineConfig) -> Self {
        Self::new(ActivityRegistry::with_builtins(), BehaviorRegistry::with_defaults(), config)
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn StateRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn compile(&self, rep: &DefinitionRep) -> Result<Definition, DefinitionError> {
        Compiler::new(&self.activities, &self.behaviors)
            .with_default_model(&self.config.default_model)
            .compile(rep)
    }

    /// Compiles `rep` and makes it startable under `flow_uri`, replacing any
    /// earlier definition with that uri.
    pub fn register_definition(&self, flow_uri: &str, rep: &DefinitionRep) -> Result<Arc<Definition>, DefinitionError> {
        let definition = Arc::new(self.compile(rep)?);
        self.definitions.insert(flow_uri.to_string(), definition.clone());
        info!(flow_uri = %flow_uri, tasks = definition.tasks.len(), "Registered definition");
        Ok(definition)
    }

    pub fn definition(&self, flow_uri: &str) -> Option<Arc<Definition>> {
        self.definitions.get(flow_uri).map(|d| d.value().clone())
    }

    /// Starts a new instance. Returns once the instance is queued; the
    /// outcome arrives through `handler`.
    ///
    /// The instance worker is spawned with `tokio::spawn`, so this must be
    /// called from within a Tokio runtime.
    pub fn start(
        &self,
        flow_uri: &str,
        inputs: HashMap<String, Value>,
        handler: Arc<dyn ResultHandler>,
    ) -> Result<Uuid, FlowError> {
        let (definition, model) = self.lookup(flow_uri)?;

        let mut instance = Instance::new(Uuid::new_v4(), flow_uri);
        seed_attributes(&definition, &mut instance);
        apply_inputs(&mut instance, inputs)?;
        instance.enqueue(model.flow_behavior().start(&definition));

        Ok(self.spawn(definition, model, instance, handler))
    }

    /// Continues a previously suspended instance from its recorded state.
    /// Like `start`, requires a running Tokio runtime.
    pub fn resume(
        &self,
        mut instance: Instance,
        inputs: HashMap<String, Value>,
        handler: Arc<dyn ResultHandler>,
    ) -> Result<Uuid, FlowError> {
        if instance.status.is_terminal() {
            return Err(FlowError::NotResumable(
                instance.id.to_string(),
                format!("instance is {:?}", instance.status),
            ));
        }
        let (definition, model) = self.lookup(&instance.flow_uri)?;
        apply_inputs(&mut instance, inputs)?;

        for entry in model.flow_behavior().resume(&definition, &instance) {
            if entry.enter_code == EnterCode::Repeat {
                instance.set_task_state(&entry.task_id, TaskState::Ready);
            }
            instance.pending.push_back(entry);
        }
        if instance.pending.is_empty() {
            return Err(FlowError::NotResumable(instance.id.to_string(), "nothing left to run".to_string()));
        }

        Ok(self.spawn(definition, model, instance, handler))
    }

    /// Starts a fresh instance of the same flow, seeded with the attributes
    /// of `previous` and then `inputs`. Requires a running Tokio runtime.
    pub fn restart(
        &self,
        previous: &Instance,
        inputs: HashMap<String, Value>,
        handler: Arc<dyn ResultHandler>,
    ) -> Result<Uuid, FlowError> {
        let (definition, model) = self.lookup(&previous.flow_uri)?;

        let mut instance = Instance::new(Uuid::new_v4(), previous.flow_uri.clone());
        seed_attributes(&definition, &mut instance);
        let carried = previous
            .attrs
            .iter()
            .filter(|(name, _)| name.as_str() != ERROR_ATTR)
            .map(|(name, attr)| (name.clone(), attr.value.clone()));
        apply_inputs(&mut instance, carried.collect())?;
        apply_inputs(&mut instance, inputs)?;
        instance.enqueue(model.flow_behavior().start(&definition));

        info!(instance_id = %instance.id, previous = %previous.id, "Restarting instance");
        Ok(self.spawn(definition, model, instance, handler))
    }

    fn lookup(&self, flow_uri: &str) -> Result<(Arc<Definition>, Arc<Model>), FlowError> {
        let definition = self
            .definition(flow_uri)
            .ok_or_else(|| FlowError::FlowNotFound(flow_uri.to_string()))?;
        let model = self
            .behaviors
            .get(&definition.model_id)
            .ok_or_else(|| FlowError::ModelNotFound(definition.model_id.clone()))?;
        Ok((definition, model))
    }

    fn spawn(
        &self,
        definition: Arc<Definition>,
        model: Arc<Model>,
        instance: Instance,
        handler: Arc<dyn ResultHandler>,
    ) -> Uuid {
        let instance_id = instance.id;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let runner = Runner {
            definition,
            model,
            instance,
            env: ExecEnv {
                resolver: self.resolver.clone(),
                reply: ReplySink::new(handler.clone()),
                events: events_tx,
                task_timeout: self.config.task_timeout(),
            },
            events: events_rx,
            recorder: self.recorder.clone(),
            max_steps: self.config.max_step_count,
            record_steps: self.config.record_steps,
            record_snapshots: self.config.record_snapshots,
        };

        tokio::spawn(async move {
            let _done = DoneGuard(handler);
            runner.run().await;
        });
        instance_id
    }
}

/// Declared attributes first, then declared inputs with their defaults.
fn seed_attributes(definition: &Definition, instance: &mut Instance) {
    for attr in definition.attributes.values() {
        instance.attrs.insert(attr.name.clone(), attr.clone());
    }
    for attr in &definition.metadata.input {
        instance.attrs.insert(attr.name.clone(), attr.clone());
    }
}

fn apply_inputs(instance: &mut Instance, inputs: HashMap<String, Value>) -> Result<(), FlowError> {
    for (name, value) in inputs {
        instance
            .set_attr_value(&name, value)
            .map_err(|e| FlowError::InvalidInput {
                name: name.clone(),
                message: e.to_string(),
            })?;
    }
    Ok(())
}

/// Declared outputs, or every flow attribute when none are declared.
fn return_attributes(definition: &Definition, instance: &Instance) -> HashMap<String, Value> {
    if definition.metadata.output.is_empty() {
        return instance
            .attrs
            .iter()
            .map(|(name, attr)| (name.clone(), attr.value.clone()))
            .collect();
    }
    definition
        .metadata
        .output
        .iter()
        .map(|attr| {
            let value = instance.attr_value(&attr.name).cloned().unwrap_or_else(|| attr.value.clone());
            let value = attr.attr_type.coerce(value.clone()).unwrap_or(value);
            (attr.name.clone(), value)
        })
        .collect()
}

/// Steps one instance. Owns the instance exclusively; async completions
/// reach it through `events`.
struct Runner {
    definition: Arc<Definition>,
    model: Arc<Model>,
    instance: Instance,
    env: ExecEnv,
    events: mpsc::UnboundedReceiver<InstanceEvent>,
    recorder: Option<Arc<dyn StateRecorder>>,
    max_steps: u64,
    record_steps: bool,
    record_snapshots: bool,
}

impl Runner {
    async fn run(mut self) {
        let instance_id = self.instance.id;
        info!(instance_id = %instance_id, flow_uri = %self.instance.flow_uri, "Instance started");
        self.instance.status = FlowStatus::Active;
        self.instance.take_changes();
        let limit = self.instance.step_count.saturating_add(self.max_steps);

        while !self.instance.status.is_terminal() {
            let has_work = !self.instance.pending.is_empty() || self.instance.has_waiting();
            if has_work && self.instance.step_count >= limit {
                warn!(instance_id = %instance_id, steps = self.max_steps, "Step limit reached, instance left incomplete");
                self.deliver(Err(FlowError::StepLimitExceeded { steps: self.max_steps }));
                break;
            }

            if let Some(entry) = self.instance.pending.pop_front() {
                self.instance.step_count += 1;
                let (task_id, enter_code) = (entry.task_id.clone(), entry.enter_code);
                self.step(entry).await;
                self.record(task_id, enter_code).await;
                continue;
            }

            if self.settle_scopes() {
                continue;
            }

            if self.instance.has_waiting() {
                match timeout(self.env.task_timeout, self.events.recv()).await {
                    Ok(Some(event)) => {
                        self.instance.step_count += 1;
                        let InstanceEvent::Completed { task_id, result } = event;
                        self.on_completed(&task_id, result).await;
                        self.record(task_id, EnterCode::PostEval).await;
                    }
                    Ok(None) => {
                        error!(instance_id = %instance_id, "Event channel closed while tasks were waiting");
                        break;
                    }
                    Err(_) => self.timeout_waiting(),
                }
                continue;
            }

            self.complete_drained();
        }

        if self.record_snapshots {
            self.snapshot().await;
        }
        info!(
            instance_id = %instance_id,
            status = ?self.instance.status,
            steps = self.instance.step_count,
            "Instance finished"
        );
    }

    fn ctx<'s>(&'s mut self, task: &'s Arc<Task>) -> TaskContext<'s> {
        TaskContext::new(task, &self.definition, &mut self.instance, &self.env)
    }

    async fn step(&mut self, entry: TaskEntry) {
        let Some(task) = self.definition.task(&entry.task_id).cloned() else {
            warn!(instance_id = %self.instance.id, task = %entry.task_id, "Entry for unknown task dropped");
            return;
        };
        debug!(
            instance_id = %self.instance.id,
            step = self.instance.step_count,
            task = %task.id,
            enter_code = ?entry.enter_code,
            "Step"
        );

        let state = self.instance.task_state(&task.id);
        match entry.enter_code {
            EnterCode::Repeat => match state {
                Some(TaskState::Ready) | Some(TaskState::Waiting) => {
                    self.instance.set_task_state(&task.id, TaskState::Ready);
                    self.eval(&task).await;
                }
                other => debug!(task = %task.id, state = ?other, "Repeat dropped"),
            },
            EnterCode::PostEval => match state {
                Some(TaskState::Waiting) => self.post_eval(&task, Value::Null).await,
                other => debug!(task = %task.id, state = ?other, "Post-eval dropped"),
            },
            _ => self.enter(&task, &entry).await,
        }
    }

    async fn enter(&mut self, task: &Arc<Task>, entry: &TaskEntry) {
        match self.instance.task_state(&task.id) {
            None | Some(TaskState::Entered) => {}
            Some(state) if state.is_terminal() && self.is_loop_back(entry) => {
                if let Some(link) = &entry.via_link {
                    self.rearm(task, link);
                }
            }
            Some(state) => {
                debug!(task = %task.id, state = ?state, "Entry dropped, task already past enter");
                return;
            }
        }

        let result = {
            let mut ctx = self.ctx(task);
            task.behavior().enter(&mut ctx)
        };
        match result {
            EnterResult::NotReady => {
                debug!(instance_id = %self.instance.id, task = %task.id, "Task not ready");
            }
            EnterResult::Eval => self.eval(task).await,
            EnterResult::Skip => {
                let completion = {
                    let mut ctx = self.ctx(task);
                    task.behavior().skip(&mut ctx)
                };
                self.complete(task, completion);
            }
        }
    }

    fn is_loop_back(&self, entry: &TaskEntry) -> bool {
        entry.enter_code == EnterCode::True
            && entry
                .via_link
                .as_deref()
                .and_then(|id| self.definition.link(id))
                .is_some_and(|link| link.loop_back && self.instance.link_state(&link.id) == LinkState::True)
    }

    /// Clears the state of `start` and everything downstream of it so a loop
    /// can run its body again.
    fn rearm(&mut self, start: &Task, via_link: &str) {
        let mut queue = VecDeque::from([start.id.clone()]);
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            self.instance.reset_task(&id);
            let Some(task) = self.definition.task(&id) else {
                continue;
            };
            queue.extend(task.children.iter().cloned());
            for link in self.definition.to_links(task) {
                self.instance.reset_link(&link.id);
                queue.push_back(link.to.clone());
            }
        }
        self.instance.set_link_state(via_link, LinkState::True);
        debug!(instance_id = %self.instance.id, task = %start.id, reset = seen.len(), "Loop re-armed");
    }

    async fn eval(&mut self, task: &Arc<Task>) {
        let result = {
            let mut ctx = self.ctx(task);
            task.behavior().eval(&mut ctx).await
        };
        self.after_eval(task, result);
    }

    async fn post_eval(&mut self, task: &Arc<Task>, data: Value) {
        let result = {
            let mut ctx = self.ctx(task);
            task.behavior().post_eval(&mut ctx, data).await
        };
        self.after_eval(task, result);
    }

    fn after_eval(&mut self, task: &Arc<Task>, result: Result<EvalStatus, TaskError>) {
        match result {
            Ok(EvalStatus::Done) => {
                let completion = {
                    let mut ctx = self.ctx(task);
                    task.behavior().done(&mut ctx)
                };
                self.complete(task, completion);
            }
            Ok(EvalStatus::Repeat) => {
                self.instance.set_task_state(&task.id, TaskState::Ready);
                self.instance.enqueue([TaskEntry::new(task.id.clone(), EnterCode::Repeat)]);
            }
            Ok(EvalStatus::Wait) => {
                if self.instance.task_state(&task.id) != Some(TaskState::Waiting) {
                    self.instance.set_task_state(&task.id, TaskState::Waiting);
                }
            }
            Err(err) => self.fail_task(task, err),
        }
    }

    async fn on_completed(&mut self, task_id: &str, result: Result<Value, String>) {
        let Some(task) = self.definition.task(task_id).cloned() else {
            warn!(instance_id = %self.instance.id, task = %task_id, "Completion for unknown task dropped");
            return;
        };
        if self.instance.task_state(task_id) != Some(TaskState::Waiting) {
            debug!(instance_id = %self.instance.id, task = %task_id, "Completion for task that is not waiting dropped");
            return;
        }
        match result {
            Ok(data) => self.post_eval(&task, data).await,
            Err(message) => self.fail_task(
                &task,
                TaskError::Activity {
                    task: task_id.to_string(),
                    message,
                },
            ),
        }
    }

    fn complete(&mut self, task: &Task, completion: Completion) {
        self.instance.enqueue(completion.entries);
        if completion.notify_parent {
            self.notify_parent(task);
        }
    }

    fn notify_parent(&mut self, task: &Task) {
        let Some(scope) = task.parent.as_deref().and_then(|p| self.definition.task(p)).cloned() else {
            return;
        };
        if !self
            .model
            .flow_behavior()
            .tasks_done(&self.definition, &self.instance, &scope)
        {
            return;
        }

        if self.definition.is_top_level_scope(&scope.id) {
            self.finish_flow();
        } else if self.instance.task_state(&scope.id) == Some(TaskState::Waiting) {
            self.instance.enqueue([TaskEntry::new(scope.id.clone(), EnterCode::PostEval)]);
        }
    }

    /// With the queue drained, post-evaluates nested scopes whose children
    /// can make no further progress.
    fn settle_scopes(&mut self) -> bool {
        let mut settled = false;
        for id in self.instance.waiting_tasks() {
            let Some(scope) = self.definition.task(&id).cloned() else {
                continue;
            };
            if !scope.is_scope() {
                continue;
            }
            let busy = scope
                .children
                .iter()
                .any(|c| self.instance.task_state(c) == Some(TaskState::Waiting));
            if busy {
                continue;
            }
            let stuck: Vec<&String> = scope
                .children
                .iter()
                .filter(|c| self.instance.task_state(c).is_some_and(|s| !s.is_terminal()))
                .collect();
            if !stuck.is_empty() {
                warn!(instance_id = %self.instance.id, scope = %scope.id, stuck = ?stuck, "Scope finished with tasks that never became ready");
            }
            self.instance.enqueue([TaskEntry::new(id, EnterCode::PostEval)]);
            settled = true;
        }
        settled
    }

    fn fail_task(&mut self, task: &Arc<Task>, err: TaskError) {
        warn!(instance_id = %self.instance.id, task = %task.id, error = %err, "Task failed");
        {
            let mut ctx = self.ctx(task);
            ctx.set_state(TaskState::Failed);
            ctx.record_error(&err);
        }
        self.handle_error(task, err);
    }

    fn handle_error(&mut self, task: &Arc<Task>, err: TaskError) {
        let outcome = {
            let mut ctx = self.ctx(task);
            task.behavior().error(&mut ctx, &err)
        };
        match outcome {
            ErrorOutcome::Handled(entries) => self.instance.enqueue(entries),
            ErrorOutcome::Unhandled => self.escalate(task, err),
        }
    }

    /// An unhandled error fails the enclosing nested scope, or reaches the
    /// flow level once it leaves the top-level scope.
    fn escalate(&mut self, task: &Task, err: TaskError) {
        let scope = task.parent.as_deref().and_then(|p| self.definition.task(p)).cloned();
        match scope {
            Some(scope) if !self.definition.is_top_level_scope(&scope.id) => {
                let definition = self.definition.clone();
                self.instance
                    .pending
                    .retain(|e| !is_within(&definition, &e.task_id, &scope.id));
                // Late async completions for these are dropped by on_completed.
                for id in self.instance.waiting_tasks() {
                    if is_within(&definition, &id, &scope.id) {
                        self.instance.set_task_state(&id, TaskState::Failed);
                    }
                }
                self.instance.set_task_state(&scope.id, TaskState::Failed);
                self.handle_error(&scope, err);
            }
            _ => self.unhandled(err),
        }
    }

    fn unhandled(&mut self, err: TaskError) {
        let handler_entries = if self.instance.handling_error {
            Vec::new()
        } else {
            self.model.flow_behavior().start_error_handler(&self.definition)
        };

        if !handler_entries.is_empty() {
            info!(instance_id = %self.instance.id, error = %err, "Running error handler");
            self.instance.handling_error = true;
            self.instance.pending.clear();
            for id in self.instance.waiting_tasks() {
                self.instance.set_task_state(&id, TaskState::Failed);
            }
            self.instance.enqueue(handler_entries);
            return;
        }

        error!(instance_id = %self.instance.id, error = %err, "Unhandled task error, instance failed");
        self.instance.status = FlowStatus::Failed;
        self.deliver(Err(FlowError::Unhandled(err)));
    }

    fn timeout_waiting(&mut self) {
        let waiting = self.instance.waiting_tasks();
        let leaves: Vec<String> = waiting
            .iter()
            .filter(|id| self.definition.task(id).is_some_and(|t| !t.is_scope()))
            .cloned()
            .collect();
        let expired = if leaves.is_empty() { waiting } else { leaves };

        for id in expired {
            if self.instance.status.is_terminal() {
                break;
            }
            if self.instance.task_state(&id) != Some(TaskState::Waiting) {
                continue;
            }
            let Some(task) = self.definition.task(&id).cloned() else {
                continue;
            };
            let err = TaskError::Timeout {
                task: id,
                after: self.env.task_timeout,
            };
            self.fail_task(&task, err);
        }
    }

    fn complete_drained(&mut self) {
        let stuck: Vec<String> = self
            .instance
            .task_insts
            .values()
            .filter(|t| matches!(t.state, TaskState::Entered | TaskState::Ready))
            .map(|t| t.task_id.clone())
            .collect();
        if !stuck.is_empty() {
            warn!(instance_id = %self.instance.id, stuck = ?stuck, "Completing with tasks that never became ready");
        }
        self.finish_flow();
    }

    fn finish_flow(&mut self) {
        self.instance.status = FlowStatus::Completed;
        let attrs = return_attributes(&self.definition, &self.instance);
        info!(instance_id = %self.instance.id, handled_error = self.instance.handling_error, "Flow completed");
        self.deliver(Ok(attrs));
    }

    fn deliver(&self, result: FlowResult) {
        let failure = result.as_ref().err().map(|e| e.to_string());
        if !self.env.reply.deliver(result) {
            match failure {
                Some(e) => warn!(instance_id = %self.instance.id, error = %e, "Flow failed after it already replied"),
                None => debug!(instance_id = %self.instance.id, "Flow already replied, final result not delivered"),
            }
        }
    }

    async fn record(&mut self, task_id: String, enter_code: EnterCode) {
        let changes = self.instance.take_changes();
        let Some(recorder) = &self.recorder else {
            return;
        };
        if self.record_steps {
            let step = StepRecord {
                instance_id: self.instance.id,
                flow_uri: self.instance.flow_uri.clone(),
                step: self.instance.step_count,
                task_id,
                enter_code,
                status: self.instance.status,
                changes,
            };
            if let Err(e) = recorder.record_step(&step).await {
                warn!(instance_id = %self.instance.id, error = %e, "Failed to record step");
            }
        }
        if self.record_snapshots {
            self.snapshot().await;
        }
    }

    async fn snapshot(&self) {
        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.record_snapshot(&self.instance).await {
                warn!(instance_id = %self.instance.id, error = %e, "Failed to record snapshot");
            }
        }
    }
}

fn is_within(definition: &Definition, task_id: &str, scope_id: &str) -> bool {
    let mut current = definition.task(task_id).and_then(|t| t.parent.clone());
    while let Some(parent) = current {
        if parent == scope_id {
            return true;
        }
        current = definition.task(&parent).and_then(|t| t.parent.clone());
    }
    false
}

