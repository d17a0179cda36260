use crate::behaviors::FlowBehavior;
use crate::runtime::definition::{Definition, Task};
use crate::runtime::instance::Instance;
use crate::runtime::state::{EnterCode, TaskEntry};

/// Flow behavior of the "simple" model.
#[derive(Debug, Default)]
pub struct SimpleFlowBehavior;

fn leading_entries(definition: &Definition, scope: &Task) -> Vec<TaskEntry> {
    definition
        .leading_tasks(scope)
        .map(|task| TaskEntry::new(task.id.clone(), EnterCode::Start))
        .collect()
}

impl FlowBehavior for SimpleFlowBehavior {
    fn start(&self, definition: &Definition) -> Vec<TaskEntry> {
        leading_entries(definition, &definition.root_task)
    }

    fn resume(&self, definition: &Definition, instance: &Instance) -> Vec<TaskEntry> {
        if instance.task_insts.is_empty() && instance.pending.is_empty() {
            return self.start(definition);
        }
        // Work in flight when the instance was suspended is evaluated again.
        instance
            .waiting_tasks()
            .into_iter()
            .filter(|id| definition.task(id).is_some_and(|t| !t.is_scope()))
            .map(|id| TaskEntry::new(id, EnterCode::Repeat))
            .collect()
    }

    fn start_error_handler(&self, definition: &Definition) -> Vec<TaskEntry> {
        match &definition.error_handler_task {
            Some(handler) => leading_entries(definition, handler),
            None => Vec::new(),
        }
    }

    fn tasks_done(&self, _definition: &Definition, instance: &Instance, scope: &Task) -> bool {
        let reached_finished = scope
            .children
            .iter()
            .all(|id| instance.task_state(id).is_none_or(|s| s.is_terminal()));
        let queued = instance.pending.iter().any(|e| scope.children.contains(&e.task_id));
        reached_finished && !queued
    }
}
