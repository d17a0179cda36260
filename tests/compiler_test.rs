use flowgate::activities::ActivityRegistry;
use flowgate::behaviors::{BehaviorRegistry, Model};
use flowgate::compiler::Compiler;
use flowgate::compiler::parse_definition;
use flowgate::dsl::builder::DefinitionBuilder;
use flowgate::dsl::{DefinitionRep, LinkRep, RepId, TaskRep};
use flowgate::error::{DefinitionError, RegistryError};
use flowgate::runtime::definition::{Definition, LinkType};

fn compile(rep: &DefinitionRep) -> Result<Definition, DefinitionError> {
    let activities = ActivityRegistry::with_builtins();
    let behaviors = BehaviorRegistry::with_defaults();
    Compiler::new(&activities, &behaviors).compile(rep)
}

#[test]
fn test_compile_wires_tasks_and_links() {
    let rep = DefinitionBuilder::new("wired")
        .task("A", "log")
            .setting("message", "hi")
            .build()
        .noop("B")
            .build()
        .task("C", "assign")
            .input("x", 1)
            .build()
        .connect("A", "B")
        .connect_if("B", "C", "$x > 0")
        .build();

    let definition = compile(&rep).unwrap();
    assert_eq!(definition.name, "wired");
    assert_eq!(definition.model_id, "simple");
    assert_eq!(definition.root_task.children, vec!["A", "B", "C"]);

    let a = definition.task("A").unwrap();
    assert_eq!(a.parent.as_deref(), Some("root"));
    assert_eq!(a.to_links, vec!["root:0"]);
    assert!(a.from_links.is_empty());

    let link = definition.link("root:1").unwrap();
    assert_eq!(link.link_type, LinkType::Expression);
    assert_eq!(link.value, "$x > 0");
    assert_eq!((link.from.as_str(), link.to.as_str()), ("B", "C"));

    let leading: Vec<&str> = definition
        .leading_tasks(&definition.root_task)
        .map(|t| t.id.as_str())
        .collect();
    assert_eq!(leading, vec!["A"]);
}

#[test]
fn test_compile_is_repeatable() {
    let rep = DefinitionBuilder::new("repeat")
        .noop("A")
            .build()
        .noop("B")
            .build()
        .noop("C")
            .build()
        .connect("A", "B")
        .connect("A", "C")
        .connect("B", "C")
        .build();

    let first = compile(&rep).unwrap();
    let second = compile(&rep).unwrap();

    assert_eq!(
        first.tasks.keys().collect::<Vec<_>>(),
        second.tasks.keys().collect::<Vec<_>>()
    );
    assert_eq!(
        first.links.keys().collect::<Vec<_>>(),
        second.links.keys().collect::<Vec<_>>()
    );
    for (id, task) in &first.tasks {
        let other = second.task(id).unwrap();
        assert_eq!(task.to_links, other.to_links);
        assert_eq!(task.from_links, other.from_links);
    }
    for (id, link) in &first.links {
        assert_eq!(link.as_ref(), second.link(id).unwrap().as_ref());
    }
}

#[test]
fn test_duplicate_task_id_rejected() {
    let rep = DefinitionBuilder::new("dup")
        .noop("A")
            .build()
        .noop("A")
            .build()
        .build();

    assert!(matches!(compile(&rep), Err(DefinitionError::DuplicateTask(id)) if id == "A"));
}

#[test]
fn test_unknown_activity_rejected() {
    let rep = DefinitionBuilder::new("unknown")
        .task("A", "teleport")
            .build()
        .build();

    match compile(&rep) {
        Err(DefinitionError::UnknownActivity { task, activity }) => {
            assert_eq!(task, "A");
            assert_eq!(activity, "teleport");
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn test_invalid_activity_settings_rejected() {
    let rep = DefinitionBuilder::new("bad-settings")
        .task("W", "delay")
            .setting("millis", "soon")
            .build()
        .build();

    assert!(matches!(compile(&rep), Err(DefinitionError::InvalidSettings { .. })));
}

#[test]
fn test_link_to_unknown_task_rejected() {
    let rep = DefinitionBuilder::new("dangling")
        .noop("A")
            .build()
        .connect("A", "Z")
        .build();

    assert!(matches!(
        compile(&rep),
        Err(DefinitionError::UnknownTask { task, .. }) if task == "Z"
    ));
}

#[test]
fn test_cross_scope_link_rejected() {
    let child = TaskRep {
        id: Some(RepId::from("X")),
        ..TaskRep::default()
    };
    let rep = DefinitionBuilder::new("cross")
        .noop("G")
            .children(vec![child], Vec::new())
            .build()
        .noop("B")
            .build()
        .connect("B", "X")
        .build();

    assert!(matches!(compile(&rep), Err(DefinitionError::CrossScopeLink { .. })));
}

#[test]
fn test_multiple_error_links_rejected() {
    let rep = DefinitionBuilder::new("two-errors")
        .noop("A")
            .build()
        .noop("B")
            .build()
        .noop("C")
            .build()
        .connect_error("A", "B")
        .connect_error("A", "C")
        .build();

    assert!(matches!(
        compile(&rep),
        Err(DefinitionError::MultipleErrorLinks { task }) if task == "A"
    ));
}

#[test]
fn test_expression_link_requires_expression() {
    let rep = DefinitionBuilder::new("empty-expr")
        .noop("A")
            .build()
        .noop("B")
            .build()
        .connect_if("A", "B", "  ")
        .build();

    assert!(matches!(compile(&rep), Err(DefinitionError::EmptyExpression { .. })));
}

#[test]
fn test_scope_without_entry_point_rejected() {
    let rep = DefinitionBuilder::new("closed")
        .noop("A")
            .build()
        .noop("B")
            .build()
        .connect("A", "B")
        .connect("B", "A")
        .build();

    assert!(matches!(compile(&rep), Err(DefinitionError::NoEntryPoints(scope)) if scope == "root"));
}

#[test]
fn test_unknown_model_and_task_type_rejected() {
    let rep = DefinitionBuilder::new("modelled")
        .model("fancy")
        .noop("A")
            .build()
        .build();
    assert!(matches!(compile(&rep), Err(DefinitionError::UnknownModel(m)) if m == "fancy"));

    let rep = DefinitionBuilder::new("typed")
        .noop("A")
            .type_tag("parallel")
            .build()
        .build();
    assert!(matches!(
        compile(&rep),
        Err(DefinitionError::UnknownTaskType { type_tag, .. }) if type_tag == "parallel"
    ));
}

#[test]
fn test_back_edges_marked_as_loop_back() {
    let rep = DefinitionBuilder::new("loop")
        .noop("S")
            .build()
        .noop("A")
            .build()
        .noop("B")
            .build()
        .noop("E")
            .build()
        .connect("S", "A")
        .connect("A", "B")
        .connect_if("B", "A", "true")
        .connect("B", "E")
        .build();

    let definition = compile(&rep).unwrap();
    let loop_backs: Vec<&str> = definition
        .links
        .values()
        .filter(|l| l.loop_back)
        .map(|l| l.id.as_str())
        .collect();
    assert_eq!(loop_backs, vec!["root:2"]);
}

#[test]
fn test_reply_activity_turns_on_explicit_reply() {
    let plain = DefinitionBuilder::new("plain")
        .task("A", "assign")
            .build()
        .build();
    assert!(!compile(&plain).unwrap().explicit_reply);

    let replying = DefinitionBuilder::new("replying")
        .task("A", "reply")
            .build()
        .build();
    assert!(compile(&replying).unwrap().explicit_reply);
}

#[test]
fn test_numeric_ids_and_legacy_link_codes() {
    let rep = parse_definition(
        r#"{
            "name": "legacy",
            "rootTask": {
                "id": 1,
                "tasks": [
                    { "id": 2, "activityType": "assign",
                      "inputMappings": [ { "type": 2, "value": 5, "mapTo": "five" } ] },
                    { "id": 3 },
                    { "id": 4 }
                ],
                "links": [
                    { "id": 10, "type": 0, "from": 2, "to": 3 },
                    { "type": 1, "from": 2, "to": 4, "value": "$five > 1" }
                ]
            }
        }"#,
    )
    .unwrap();

    let definition = compile(&rep).unwrap();
    assert_eq!(definition.root_task.id, "1");
    assert!(definition.task("2").is_some());
    assert_eq!(definition.link("10").unwrap().link_type, LinkType::Dependency);
    assert_eq!(definition.link("1:1").unwrap().link_type, LinkType::Expression);
}

#[test]
fn test_duplicate_link_id_rejected() {
    let mut rep = DefinitionBuilder::new("dup-links")
        .noop("A")
            .build()
        .noop("B")
            .build()
        .build();
    for _ in 0..2 {
        rep.root_task.links.push(LinkRep {
            id: Some(RepId::from("L")),
            link_type: None,
            from: RepId::from("A"),
            to: RepId::from("B"),
            value: None,
            name: None,
        });
    }

    assert!(matches!(compile(&rep), Err(DefinitionError::DuplicateLink(id)) if id == "L"));
}

#[test]
fn test_registries_reject_duplicates() {
    let mut behaviors = BehaviorRegistry::with_defaults();
    assert!(matches!(
        behaviors.register(Model::simple()),
        Err(RegistryError::DuplicateModel(name)) if name == "simple"
    ));

    let mut activities = ActivityRegistry::with_builtins();
    let log = activities.get("log").unwrap();
    assert!(matches!(
        activities.register(log),
        Err(RegistryError::DuplicateActivity(name)) if name == "log"
    ));
}
