use anyhow::{Result, anyhow};
use async_trait::async_trait;
use flowgate::activities::{Activity, ActivityContext, ActivityOutcome, ActivityRegistry};
use flowgate::behaviors::BehaviorRegistry;
use flowgate::config::EngineConfig;
use flowgate::data::AttrType;
use flowgate::dsl::builder::DefinitionBuilder;
use flowgate::dsl::{DefinitionRep, LinkRep, MappingsRep, RepId, TaskRep};
use flowgate::error::{FlowError, TaskError};
use flowgate::runtime::Engine;
use flowgate::runtime::handler::result_channel;
use flowgate::runtime::recorder::InMemoryStateRecorder;
use flowgate::runtime::state::{EnterCode, FlowStatus, LinkState, TaskState};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fails until it has been called `fail_times` times.
#[derive(Debug, Default)]
struct FlakyActivity {
    fail_times: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl Activity for FlakyActivity {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn eval(&self, ctx: &mut ActivityContext<'_>) -> Result<ActivityOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_times {
            return Err(anyhow!("attempt {} failed", call));
        }
        ctx.set_output("attempts", json!(call));
        Ok(ActivityOutcome::Done)
    }
}

fn engine_with(config: EngineConfig, recorder: &Arc<InMemoryStateRecorder>) -> Engine {
    Engine::with_defaults(config).with_recorder(recorder.clone())
}

fn recording_config() -> EngineConfig {
    EngineConfig {
        record_snapshots: true,
        record_steps: true,
        ..EngineConfig::default()
    }
}

fn inputs(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn object(pairs: &[(&str, Value)]) -> Option<MappingsRep> {
    let map: Map<String, Value> = pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
    Some(MappingsRep::Object(map))
}

#[tokio::test]
async fn test_linear_flow_completes_once() {
    let recorder = Arc::new(InMemoryStateRecorder::new());
    let engine = engine_with(recording_config(), &recorder);

    let rep = DefinitionBuilder::new("linear")
        .task("A", "assign")
            .input("x", 1)
            .build()
        .task("B", "assign")
            .input("y", "=$x + 1")
            .build()
        .connect("A", "B")
        .build();
    engine.register_definition("flow://linear", &rep).unwrap();

    let (handler, results) = result_channel();
    let instance_id = engine.start("flow://linear", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    assert_eq!(finished.done_calls, 1);
    assert_eq!(finished.results.len(), 1);
    let attrs = finished.results[0].as_ref().unwrap();
    assert_eq!(attrs.get("x"), Some(&json!(1)));
    assert_eq!(attrs.get("y"), Some(&json!(2)));

    let snapshot = recorder.snapshot(instance_id).unwrap();
    assert_eq!(snapshot.status, FlowStatus::Completed);
    assert_eq!(snapshot.task_state("A"), Some(TaskState::Done));
    assert_eq!(snapshot.task_state("B"), Some(TaskState::Done));
    assert_eq!(snapshot.link_state("root:0"), LinkState::True);
}

#[tokio::test]
async fn test_expression_branch_skips_false_side() {
    let recorder = Arc::new(InMemoryStateRecorder::new());
    let engine = engine_with(recording_config(), &recorder);

    let rep = DefinitionBuilder::new("branch")
        .input("x", AttrType::Integer)
        .output("branch", AttrType::String)
        .noop("A")
            .build()
        .task("B", "assign")
            .input("branch", "big")
            .build()
        .task("C", "assign")
            .input("branch", "small")
            .build()
        .connect_if("A", "B", "$x > 5")
        .connect_if("A", "C", "$x <= 5")
        .build();
    engine.register_definition("flow://branch", &rep).unwrap();

    let (handler, results) = result_channel();
    let instance_id = engine
        .start("flow://branch", inputs(&[("x", json!(10))]), handler)
        .unwrap();
    let finished = results.finish().await;

    let attrs = finished.results[0].as_ref().unwrap();
    assert_eq!(attrs.len(), 1);
    assert_eq!(attrs.get("branch"), Some(&json!("big")));

    let snapshot = recorder.snapshot(instance_id).unwrap();
    assert_eq!(snapshot.task_state("B"), Some(TaskState::Done));
    assert_eq!(snapshot.task_state("C"), Some(TaskState::Skipped));
    assert_eq!(snapshot.link_state("root:0"), LinkState::True);
    assert_eq!(snapshot.link_state("root:1"), LinkState::False);
}

#[tokio::test]
async fn test_skip_cascades_downstream() {
    let recorder = Arc::new(InMemoryStateRecorder::new());
    let engine = engine_with(recording_config(), &recorder);

    let rep = DefinitionBuilder::new("cascade")
        .noop("A")
            .build()
        .noop("B")
            .build()
        .task("C", "assign")
            .input("reached", true)
            .build()
        .connect_if("A", "B", "false")
        .connect("B", "C")
        .build();
    engine.register_definition("flow://cascade", &rep).unwrap();

    let (handler, results) = result_channel();
    let instance_id = engine.start("flow://cascade", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    let attrs = finished.results[0].as_ref().unwrap();
    assert!(attrs.get("reached").is_none());

    let snapshot = recorder.snapshot(instance_id).unwrap();
    assert_eq!(snapshot.status, FlowStatus::Completed);
    assert_eq!(snapshot.task_state("B"), Some(TaskState::Skipped));
    assert_eq!(snapshot.task_state("C"), Some(TaskState::Skipped));
    assert_eq!(snapshot.link_state("root:1"), LinkState::Skipped);
}

#[tokio::test]
async fn test_and_join_waits_for_every_branch() {
    let engine = Engine::with_defaults(EngineConfig::default());

    let rep = DefinitionBuilder::new("join")
        .task("A", "assign")
            .input("left", 1)
            .build()
        .task("B", "assign")
            .input("right", 2)
            .build()
        .task("J", "assign")
            .input("sum", "=$left + $right")
            .build()
        .connect("A", "J")
        .connect("B", "J")
        .build();
    engine.register_definition("flow://join", &rep).unwrap();

    let (handler, results) = result_channel();
    engine.start("flow://join", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    let attrs = finished.results[0].as_ref().unwrap();
    assert_eq!(attrs.get("sum"), Some(&json!(3)));
}

#[tokio::test]
async fn test_error_link_handles_failure() {
    let recorder = Arc::new(InMemoryStateRecorder::new());
    let engine = engine_with(recording_config(), &recorder);

    let rep = DefinitionBuilder::new("error-link")
        .task("D", "error")
            .input("message", "boom")
            .build()
        .task("E", "assign")
            .input("handled", "=$_E.message")
            .build()
        .task("F", "assign")
            .input("unreachable", true)
            .build()
        .connect_error("D", "E")
        .connect("D", "F")
        .build();
    engine.register_definition("flow://error-link", &rep).unwrap();

    let (handler, results) = result_channel();
    let instance_id = engine.start("flow://error-link", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    let attrs = finished.results[0].as_ref().unwrap();
    let handled = attrs.get("handled").and_then(|v| v.as_str()).unwrap();
    assert!(handled.contains("boom"));
    assert_eq!(attrs.get("_E").unwrap()["task"], json!("D"));

    let snapshot = recorder.snapshot(instance_id).unwrap();
    assert_eq!(snapshot.status, FlowStatus::Completed);
    assert_eq!(snapshot.task_state("D"), Some(TaskState::Failed));
    assert_eq!(snapshot.task_state("E"), Some(TaskState::Done));
    assert_eq!(snapshot.task_state("F"), None);
    assert_eq!(snapshot.link_state("root:0"), LinkState::True);
    assert_eq!(snapshot.link_state("root:1"), LinkState::False);
}

#[tokio::test]
async fn test_unhandled_error_fails_instance() {
    let recorder = Arc::new(InMemoryStateRecorder::new());
    let engine = engine_with(recording_config(), &recorder);

    let rep = DefinitionBuilder::new("unhandled")
        .task("D", "error")
            .input("message", "boom")
            .build()
        .build();
    engine.register_definition("flow://unhandled", &rep).unwrap();

    let (handler, results) = result_channel();
    let instance_id = engine.start("flow://unhandled", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    assert_eq!(finished.done_calls, 1);
    assert_eq!(finished.results.len(), 1);
    match &finished.results[0] {
        Err(FlowError::Unhandled(TaskError::Activity { task, message })) => {
            assert_eq!(task, "D");
            assert_eq!(message, "boom");
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(recorder.snapshot(instance_id).unwrap().status, FlowStatus::Failed);
}

#[tokio::test]
async fn test_error_handler_runs_on_unhandled_error() {
    let recorder = Arc::new(InMemoryStateRecorder::new());
    let engine = engine_with(recording_config(), &recorder);

    let rep = DefinitionBuilder::new("handler")
        .task("D", "error")
            .input("message", "boom")
            .build()
        .task("N", "assign")
            .input("next", true)
            .build()
        .connect("D", "N")
        .on_error()
        .task("H", "assign")
            .input("recovered", "=$_E.task")
            .build()
        .build();
    engine.register_definition("flow://handler", &rep).unwrap();

    let (handler, results) = result_channel();
    let instance_id = engine.start("flow://handler", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    let attrs = finished.results[0].as_ref().unwrap();
    assert_eq!(attrs.get("recovered"), Some(&json!("D")));
    assert!(attrs.get("next").is_none());

    let snapshot = recorder.snapshot(instance_id).unwrap();
    assert_eq!(snapshot.status, FlowStatus::Completed);
    assert!(snapshot.handling_error);
    assert_eq!(snapshot.task_state("N"), None);
}

#[tokio::test]
async fn test_failure_inside_error_handler_fails_instance() {
    let engine = Engine::with_defaults(EngineConfig::default());

    let rep = DefinitionBuilder::new("handler-fails")
        .task("D", "error")
            .input("message", "first")
            .build()
        .on_error()
        .task("H", "error")
            .input("message", "second")
            .build()
        .build();
    engine.register_definition("flow://handler-fails", &rep).unwrap();

    let (handler, results) = result_channel();
    engine.start("flow://handler-fails", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    match &finished.results[0] {
        Err(FlowError::Unhandled(err)) => assert_eq!(err.task_id(), "H"),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_cycle_stops_at_step_limit() {
    let recorder = Arc::new(InMemoryStateRecorder::new());
    let config = EngineConfig {
        max_step_count: 50,
        ..recording_config()
    };
    let engine = engine_with(config, &recorder);

    let rep = DefinitionBuilder::new("cycle")
        .noop("S")
            .build()
        .noop("A")
            .build()
        .noop("B")
            .build()
        .connect("S", "A")
        .connect("A", "B")
        .connect("B", "A")
        .build();
    let definition = engine.register_definition("flow://cycle", &rep).unwrap();
    assert!(definition.link("root:2").unwrap().loop_back);

    let (handler, results) = result_channel();
    let instance_id = engine.start("flow://cycle", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    assert_eq!(finished.done_calls, 1);
    assert!(matches!(
        finished.results[0],
        Err(FlowError::StepLimitExceeded { steps: 50 })
    ));

    let snapshot = recorder.snapshot(instance_id).unwrap();
    assert_eq!(snapshot.step_count, 50);
    assert_eq!(snapshot.status, FlowStatus::Active);
    assert!(!snapshot.pending.is_empty());
}

#[tokio::test]
async fn test_conditional_loop_exits() {
    let engine = Engine::with_defaults(EngineConfig::default());

    let rep = DefinitionBuilder::new("counter")
        .task("S", "assign")
            .input("n", 0)
            .build()
        .task("A", "assign")
            .input("n", "=$n + 1")
            .build()
        .task("E", "assign")
            .input("finished", "=$n")
            .build()
        .connect("S", "A")
        .connect_if("A", "A", "$n < 3")
        .connect_if("A", "E", "$n >= 3")
        .build();
    engine.register_definition("flow://counter", &rep).unwrap();

    let (handler, results) = result_channel();
    engine.start("flow://counter", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    let attrs = finished.results[0].as_ref().unwrap();
    assert_eq!(attrs.get("n"), Some(&json!(3)));
    assert_eq!(attrs.get("finished"), Some(&json!(3)));
}

#[tokio::test]
async fn test_explicit_reply_is_delivered_once() {
    let engine = Engine::with_defaults(EngineConfig::default());

    let rep = DefinitionBuilder::new("reply")
        .task("A", "reply")
            .input("early", "yes")
            .build()
        .task("B", "assign")
            .input("late", 1)
            .build()
        .connect("A", "B")
        .build();
    let definition = engine.register_definition("flow://reply", &rep).unwrap();
    assert!(definition.explicit_reply);

    let (handler, results) = result_channel();
    engine.start("flow://reply", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    assert_eq!(finished.done_calls, 1);
    assert_eq!(finished.results.len(), 1);
    let attrs = finished.results[0].as_ref().unwrap();
    assert_eq!(attrs.get("early"), Some(&json!("yes")));
    assert!(attrs.get("late").is_none());
}

#[tokio::test]
async fn test_async_activity_resumes_flow() {
    let engine = Engine::with_defaults(EngineConfig::default());

    let rep = DefinitionBuilder::new("async")
        .task("W", "delay")
            .setting("millis", 10)
            .input("value", "v")
            .build()
        .task("N", "assign")
            .input("after", "=$value")
            .build()
        .connect("W", "N")
        .build();
    engine.register_definition("flow://async", &rep).unwrap();

    let (handler, results) = result_channel();
    engine.start("flow://async", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    let attrs = finished.results[0].as_ref().unwrap();
    assert_eq!(attrs.get("after"), Some(&json!("v")));
    assert_eq!(attrs.get("delayed_ms"), Some(&json!(10)));
}

#[tokio::test]
async fn test_async_activity_times_out() {
    let config = EngineConfig {
        task_timeout_ms: 20,
        ..EngineConfig::default()
    };
    let engine = Engine::with_defaults(config);

    let rep = DefinitionBuilder::new("slow")
        .task("W", "delay")
            .setting("millis", 2_000)
            .build()
        .build();
    engine.register_definition("flow://slow", &rep).unwrap();

    let (handler, results) = result_channel();
    engine.start("flow://slow", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    assert!(matches!(
        &finished.results[0],
        Err(FlowError::Unhandled(TaskError::Timeout { task, .. })) if task == "W"
    ));
}

#[tokio::test]
async fn test_retry_on_error_recovers() {
    let mut activities = ActivityRegistry::with_builtins();
    let flaky = Arc::new(FlakyActivity {
        fail_times: 2,
        ..FlakyActivity::default()
    });
    activities.register(flaky.clone()).unwrap();
    let engine = Engine::new(activities, BehaviorRegistry::with_defaults(), EngineConfig::default());

    let rep = DefinitionBuilder::new("retry")
        .task("F", "flaky")
            .setting("retryOnError", json!({"count": 2, "interval": 1}))
            .build()
        .build();
    engine.register_definition("flow://retry", &rep).unwrap();

    let (handler, results) = result_channel();
    engine.start("flow://retry", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    let attrs = finished.results[0].as_ref().unwrap();
    assert_eq!(attrs.get("attempts"), Some(&json!(3)));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_exhausted_takes_error_path() {
    let mut activities = ActivityRegistry::with_builtins();
    activities
        .register(Arc::new(FlakyActivity {
            fail_times: 5,
            ..FlakyActivity::default()
        }))
        .unwrap();
    let engine = Engine::new(activities, BehaviorRegistry::with_defaults(), EngineConfig::default());

    let rep = DefinitionBuilder::new("retry-exhausted")
        .task("F", "flaky")
            .setting("retryOnError", json!({"count": 1}))
            .build()
        .build();
    engine.register_definition("flow://retry-exhausted", &rep).unwrap();

    let (handler, results) = result_channel();
    engine.start("flow://retry-exhausted", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    match &finished.results[0] {
        Err(FlowError::Unhandled(TaskError::Activity { message, .. })) => {
            assert_eq!(message, "attempt 2 failed");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

fn nested_definition(child_activity: &str) -> DefinitionRep {
    let x = TaskRep {
        id: Some(RepId::from("X")),
        activity_ref: Some(child_activity.to_string()),
        input: object(&[("inner", json!(1)), ("message", json!("inner failure"))]),
        ..TaskRep::default()
    };
    let y = TaskRep {
        id: Some(RepId::from("Y")),
        activity_ref: Some("assign".to_string()),
        input: object(&[("inner_done", json!("=$inner + 1"))]),
        ..TaskRep::default()
    };
    let link = LinkRep {
        id: None,
        link_type: None,
        from: RepId::from("X"),
        to: RepId::from("Y"),
        value: None,
        name: None,
    };

    DefinitionBuilder::new("nested")
        .noop("G")
            .children(vec![x, y], vec![link])
            .build()
        .task("T", "assign")
            .input("outer", "=$inner_done")
            .build()
        .task("R", "assign")
            .input("rescued", true)
            .build()
        .connect("G", "T")
        .connect_error("G", "R")
        .build()
}

#[tokio::test]
async fn test_nested_scope_runs_children_before_successors() {
    let recorder = Arc::new(InMemoryStateRecorder::new());
    let engine = engine_with(recording_config(), &recorder);
    engine.register_definition("flow://nested", &nested_definition("assign")).unwrap();

    let (handler, results) = result_channel();
    let instance_id = engine.start("flow://nested", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    let attrs = finished.results[0].as_ref().unwrap();
    assert_eq!(attrs.get("outer"), Some(&json!(2)));
    assert!(attrs.get("rescued").is_none());

    let snapshot = recorder.snapshot(instance_id).unwrap();
    assert_eq!(snapshot.task_state("G"), Some(TaskState::Done));
    assert_eq!(snapshot.task_state("X"), Some(TaskState::Done));
    assert_eq!(snapshot.task_state("Y"), Some(TaskState::Done));
}

#[tokio::test]
async fn test_nested_scope_escalates_child_error() {
    let recorder = Arc::new(InMemoryStateRecorder::new());
    let engine = engine_with(recording_config(), &recorder);
    engine.register_definition("flow://nested-error", &nested_definition("error")).unwrap();

    let (handler, results) = result_channel();
    let instance_id = engine.start("flow://nested-error", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    let attrs = finished.results[0].as_ref().unwrap();
    assert_eq!(attrs.get("rescued"), Some(&json!(true)));
    assert_eq!(attrs.get("_E").unwrap()["task"], json!("X"));

    let snapshot = recorder.snapshot(instance_id).unwrap();
    assert_eq!(snapshot.task_state("G"), Some(TaskState::Failed));
    assert_eq!(snapshot.task_state("X"), Some(TaskState::Failed));
    assert_eq!(snapshot.task_state("T"), None);
}

#[tokio::test]
async fn test_failed_scope_stops_waiting_children() {
    let recorder = Arc::new(InMemoryStateRecorder::new());
    let engine = engine_with(recording_config(), &recorder);

    let w = TaskRep {
        id: Some(RepId::from("W")),
        activity_ref: Some("delay".to_string()),
        settings: HashMap::from([("millis".to_string(), json!(50))]),
        ..TaskRep::default()
    };
    let z = TaskRep {
        id: Some(RepId::from("Z")),
        activity_ref: Some("assign".to_string()),
        input: object(&[("leaked", json!(true))]),
        ..TaskRep::default()
    };
    let f = TaskRep {
        id: Some(RepId::from("F")),
        activity_ref: Some("error".to_string()),
        input: object(&[("message", json!("boom"))]),
        ..TaskRep::default()
    };
    let link = LinkRep {
        id: None,
        link_type: None,
        from: RepId::from("W"),
        to: RepId::from("Z"),
        value: None,
        name: None,
    };

    // R outlives W's delay so a late completion would still be seen.
    let rep = DefinitionBuilder::new("scope-failure")
        .noop("G")
            .children(vec![w, z, f], vec![link])
            .build()
        .task("R", "delay")
            .setting("millis", 100)
            .input("rescued", true)
            .build()
        .connect_error("G", "R")
        .build();
    engine.register_definition("flow://scope-failure", &rep).unwrap();

    let (handler, results) = result_channel();
    let instance_id = engine.start("flow://scope-failure", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    assert_eq!(finished.done_calls, 1);
    let attrs = finished.results[0].as_ref().unwrap();
    assert_eq!(attrs.get("rescued"), Some(&json!(true)));
    assert!(attrs.get("leaked").is_none());

    let snapshot = recorder.snapshot(instance_id).unwrap();
    assert_eq!(snapshot.status, FlowStatus::Completed);
    assert_eq!(snapshot.task_state("G"), Some(TaskState::Failed));
    assert_eq!(snapshot.task_state("F"), Some(TaskState::Failed));
    assert_eq!(snapshot.task_state("W"), Some(TaskState::Failed));
    assert_eq!(snapshot.task_state("Z"), None);
}

#[tokio::test]
async fn test_join_reached_by_two_links_runs_once() {
    let recorder = Arc::new(InMemoryStateRecorder::new());
    let mut activities = ActivityRegistry::with_builtins();
    let join = Arc::new(FlakyActivity::default());
    activities.register(join.clone()).unwrap();
    let engine = Engine::new(activities, BehaviorRegistry::with_defaults(), recording_config())
        .with_recorder(recorder.clone());

    let rep = DefinitionBuilder::new("diamond")
        .noop("S")
            .build()
        .noop("A")
            .build()
        .noop("B")
            .build()
        .task("J", "flaky")
            .build()
        .connect("S", "A")
        .connect("S", "B")
        .connect("A", "J")
        .connect("B", "J")
        .build();
    engine.register_definition("flow://diamond", &rep).unwrap();

    let (handler, results) = result_channel();
    let instance_id = engine.start("flow://diamond", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;

    assert_eq!(finished.done_calls, 1);
    let attrs = finished.results[0].as_ref().unwrap();
    assert_eq!(attrs.get("attempts"), Some(&json!(1)));
    assert_eq!(join.calls.load(Ordering::SeqCst), 1);

    let snapshot = recorder.snapshot(instance_id).unwrap();
    assert_eq!(snapshot.status, FlowStatus::Completed);
    assert_eq!(snapshot.task_state("J"), Some(TaskState::Done));
}

#[tokio::test]
async fn test_steps_are_recorded_in_order() {
    let recorder = Arc::new(InMemoryStateRecorder::new());
    let engine = engine_with(recording_config(), &recorder);

    let rep = DefinitionBuilder::new("steps")
        .noop("A")
            .build()
        .noop("B")
            .build()
        .connect("A", "B")
        .build();
    engine.register_definition("flow://steps", &rep).unwrap();

    let (handler, results) = result_channel();
    let instance_id = engine.start("flow://steps", HashMap::new(), handler).unwrap();
    results.finish().await;

    let steps = recorder.steps(instance_id);
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].step, 1);
    assert_eq!(steps[0].task_id, "A");
    assert_eq!(steps[0].enter_code, EnterCode::Start);
    assert_eq!(steps[1].task_id, "B");
    assert_eq!(steps[1].enter_code, EnterCode::True);
    assert!(steps[1].changes.tasks.contains(&("B".to_string(), TaskState::Done)));
    assert_eq!(steps[1].status, FlowStatus::Completed);
}

#[tokio::test]
async fn test_resume_continues_after_step_limit() {
    let recorder = Arc::new(InMemoryStateRecorder::new());
    let rep = DefinitionBuilder::new("resume")
        .task("A", "assign")
            .input("a", 1)
            .build()
        .task("B", "assign")
            .input("b", "=$a + $extra")
            .build()
        .connect("A", "B")
        .build();

    let limited = engine_with(
        EngineConfig {
            max_step_count: 1,
            ..recording_config()
        },
        &recorder,
    );
    limited.register_definition("flow://resume", &rep).unwrap();
    let (handler, results) = result_channel();
    let instance_id = limited.start("flow://resume", HashMap::new(), handler).unwrap();
    let finished = results.finish().await;
    assert!(matches!(finished.results[0], Err(FlowError::StepLimitExceeded { steps: 1 })));

    let suspended = recorder.snapshot(instance_id).unwrap();
    assert_eq!(suspended.task_state("A"), Some(TaskState::Done));

    let engine = engine_with(recording_config(), &recorder);
    engine.register_definition("flow://resume", &rep).unwrap();
    let (handler, results) = result_channel();
    let resumed_id = engine
        .resume(suspended, inputs(&[("extra", json!(10))]), handler)
        .unwrap();
    assert_eq!(resumed_id, instance_id);
    let finished = results.finish().await;

    let attrs = finished.results[0].as_ref().unwrap();
    assert_eq!(attrs.get("b"), Some(&json!(11)));
    let snapshot = recorder.snapshot(instance_id).unwrap();
    assert_eq!(snapshot.status, FlowStatus::Completed);
    assert_eq!(snapshot.step_count, 2);
}

#[tokio::test]
async fn test_restart_seeds_new_instance() {
    let recorder = Arc::new(InMemoryStateRecorder::new());
    let engine = engine_with(recording_config(), &recorder);

    let rep = DefinitionBuilder::new("restart")
        .input("name", AttrType::String)
        .task("A", "assign")
            .input("greeting", "=\"hello \" + $name")
            .build()
        .build();
    engine.register_definition("flow://restart", &rep).unwrap();

    let (handler, results) = result_channel();
    let first_id = engine
        .start("flow://restart", inputs(&[("name", json!("ada"))]), handler)
        .unwrap();
    results.finish().await;
    let first = recorder.snapshot(first_id).unwrap();

    let (handler, results) = result_channel();
    assert!(matches!(
        engine.resume(first.clone(), HashMap::new(), handler),
        Err(FlowError::NotResumable(..))
    ));
    results.finish().await;

    let (handler, results) = result_channel();
    let second_id = engine
        .restart(&first, inputs(&[("name", json!("grace"))]), handler)
        .unwrap();
    assert_ne!(first_id, second_id);
    let finished = results.finish().await;

    let attrs = finished.results[0].as_ref().unwrap();
    assert_eq!(attrs.get("greeting"), Some(&json!("hello grace")));
}

#[tokio::test]
async fn test_start_rejects_bad_input_and_unknown_flow() {
    let engine = Engine::with_defaults(EngineConfig::default());
    let rep = DefinitionBuilder::new("typed")
        .input("count", AttrType::Integer)
        .noop("A")
            .build()
        .build();
    engine.register_definition("flow://typed", &rep).unwrap();

    let (handler, _results) = result_channel();
    let err = engine
        .start("flow://typed", inputs(&[("count", json!("many"))]), handler.clone())
        .unwrap_err();
    assert!(matches!(err, FlowError::InvalidInput { ref name, .. } if name == "count"));

    let err = engine.start("flow://missing", HashMap::new(), handler).unwrap_err();
    assert!(matches!(err, FlowError::FlowNotFound(_)));
}

#[tokio::test]
async fn test_input_defaults_and_coercion() {
    let engine = Engine::with_defaults(EngineConfig::default());
    let rep = DefinitionBuilder::new("defaults")
        .input("count", AttrType::Integer)
        .input_default("label", AttrType::String, "none")
        .output("count", AttrType::Integer)
        .output("label", AttrType::String)
        .noop("A")
            .build()
        .build();
    engine.register_definition("flow://defaults", &rep).unwrap();

    let (handler, results) = result_channel();
    engine
        .start("flow://defaults", inputs(&[("count", json!("7"))]), handler)
        .unwrap();
    let finished = results.finish().await;

    let attrs = finished.results[0].as_ref().unwrap();
    assert_eq!(attrs.get("count"), Some(&json!(7)));
    assert_eq!(attrs.get("label"), Some(&json!("none")));
}
