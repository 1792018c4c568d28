//! Composable workflow steps.

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;

use crate::event::Event;

/// What a step does when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Gate: run children only when the predicate holds.
    Condition,
    /// Leaf work item; children (if any) run after a successful action.
    Action,
    /// Children run concurrently and all run to completion.
    Parallel,
    /// Children run in order, stopping at the first failure.
    Sequential,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Condition => "condition",
            StepKind::Action => "action",
            StepKind::Parallel => "parallel",
            StepKind::Sequential => "sequential",
        }
    }
}

/// Step lifecycle: `Pending → Running → (Completed | Failed | Skipped)`,
/// with `reset` returning the whole subtree to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    fn from_u8(v: u8) -> StepStatus {
        match v {
            1 => StepStatus::Running,
            2 => StepStatus::Completed,
            3 => StepStatus::Failed,
            4 => StepStatus::Skipped,
            _ => StepStatus::Pending,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

type StepFn = Box<dyn Fn(&Event) -> bool + Send + Sync>;

/// One node of a workflow tree.
///
/// Built mutably (`add_child`, `with_condition`, `with_action`), then
/// wrapped in `Arc` and registered. Execution only touches the atomic
/// status, so a shared tree can run and be inspected concurrently.
pub struct WorkflowStep {
    name: String,
    kind: StepKind,
    status: AtomicU8,
    condition: Option<StepFn>,
    action: Option<StepFn>,
    children: Vec<Arc<WorkflowStep>>,
}

impl WorkflowStep {
    pub fn new(name: impl Into<String>, kind: StepKind) -> WorkflowStep {
        WorkflowStep {
            name: name.into(),
            kind,
            status: AtomicU8::new(StepStatus::Pending as u8),
            condition: None,
            action: None,
            children: Vec::new(),
        }
    }

    pub fn with_condition(mut self, f: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Box::new(f));
        self
    }

    pub fn with_action(mut self, f: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.action = Some(Box::new(f));
        self
    }

    pub fn add_child(&mut self, child: Arc<WorkflowStep>) -> &mut Self {
        self.children.push(child);
        self
    }

    pub fn with_child(mut self, child: Arc<WorkflowStep>) -> Self {
        self.children.push(child);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn status(&self) -> StepStatus {
        StepStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: StepStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn children(&self) -> &[Arc<WorkflowStep>] {
        &self.children
    }

    /// Execute this step against `event`. Returns `true` unless the step
    /// (or a child it depends on) failed; a skipped condition counts as
    /// success.
    pub fn execute(&self, event: &Event) -> bool {
        self.set_status(StepStatus::Running);

        let ok = match self.kind {
            StepKind::Condition => {
                let accepted = self.condition.as_ref().map(|c| c(event)).unwrap_or(true);
                if !accepted {
                    self.set_status(StepStatus::Skipped);
                    return true;
                }
                self.execute_children_sequential(event)
            }
            StepKind::Action => {
                let acted = self.action.as_ref().map(|a| a(event)).unwrap_or(true);
                if acted {
                    self.execute_children_sequential(event)
                } else {
                    false
                }
            }
            StepKind::Sequential => self.execute_children_sequential(event),
            StepKind::Parallel => self.execute_children_parallel(event),
        };

        self.set_status(if ok {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        });
        ok
    }

    fn execute_children_sequential(&self, event: &Event) -> bool {
        for child in &self.children {
            if !child.execute(event) {
                return false;
            }
        }
        true
    }

    /// All children run to completion on short-lived threads; a failing
    /// child does not stop its siblings.
    fn execute_children_parallel(&self, event: &Event) -> bool {
        if self.children.is_empty() {
            return true;
        }
        let results = thread::scope(|scope| {
            let handles: Vec<_> = self
                .children
                .iter()
                .map(|child| scope.spawn(move || child.execute(event)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or(false))
                .collect::<Vec<_>>()
        });
        results.into_iter().all(|ok| ok)
    }

    /// Post-order walk resetting the subtree to `Pending`.
    pub fn reset(&self) {
        for child in &self.children {
            child.reset();
        }
        self.set_status(StepStatus::Pending);
    }

    /// Multi-line tree rendering for logs.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let _ = writeln!(
            out,
            "{:indent$}{} [{}] {}",
            "",
            self.name,
            self.kind.as_str(),
            self.status().as_str(),
            indent = depth * 2
        );
        for child in &self.children {
            child.render_into(out, depth + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::sync::atomic::AtomicUsize;

    fn ev() -> Event {
        Event::new(EventKind::Custom, "test", "")
    }

    #[test]
    fn test_action_success_and_failure() {
        let ok = WorkflowStep::new("ok", StepKind::Action).with_action(|_| true);
        assert!(ok.execute(&ev()));
        assert_eq!(ok.status(), StepStatus::Completed);

        let bad = WorkflowStep::new("bad", StepKind::Action).with_action(|_| false);
        assert!(!bad.execute(&ev()));
        assert_eq!(bad.status(), StepStatus::Failed);
    }

    #[test]
    fn test_condition_false_skips_children() {
        let child_ran = Arc::new(AtomicUsize::new(0));
        let flag = child_ran.clone();
        let child = Arc::new(WorkflowStep::new("child", StepKind::Action).with_action(
            move |_| {
                flag.fetch_add(1, Ordering::SeqCst);
                true
            },
        ));
        let gate = WorkflowStep::new("gate", StepKind::Condition)
            .with_condition(|_| false)
            .with_child(child.clone());

        assert!(gate.execute(&ev()));
        assert_eq!(gate.status(), StepStatus::Skipped);
        assert_eq!(child.status(), StepStatus::Pending);
        assert_eq!(child_ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sequential_stops_at_first_failure() {
        let third_ran = Arc::new(AtomicUsize::new(0));
        let flag = third_ran.clone();
        let seq = WorkflowStep::new("seq", StepKind::Sequential)
            .with_child(Arc::new(
                WorkflowStep::new("a", StepKind::Action).with_action(|_| true),
            ))
            .with_child(Arc::new(
                WorkflowStep::new("b", StepKind::Action).with_action(|_| false),
            ))
            .with_child(Arc::new(WorkflowStep::new("c", StepKind::Action).with_action(
                move |_| {
                    flag.fetch_add(1, Ordering::SeqCst);
                    true
                },
            )));

        assert!(!seq.execute(&ev()));
        assert_eq!(seq.status(), StepStatus::Failed);
        assert_eq!(third_ran.load(Ordering::SeqCst), 0);
        assert_eq!(seq.children()[2].status(), StepStatus::Pending);
    }

    #[test]
    fn test_parallel_runs_all_children() {
        let b = Arc::new(WorkflowStep::new("b", StepKind::Action).with_action(|_| true));
        let c = Arc::new(WorkflowStep::new("c", StepKind::Action).with_action(|_| false));
        let par = WorkflowStep::new("par", StepKind::Parallel)
            .with_child(b.clone())
            .with_child(c.clone());

        assert!(!par.execute(&ev()));
        assert_eq!(par.status(), StepStatus::Failed);
        // The failing sibling did not prevent b from completing.
        assert_eq!(b.status(), StepStatus::Completed);
        assert_eq!(c.status(), StepStatus::Failed);
    }

    #[test]
    fn test_mixed_composition() {
        // Sequential(Condition(true, Action A=true),
        //            Parallel(Action B=true, Action C=false))
        let a = Arc::new(WorkflowStep::new("A", StepKind::Action).with_action(|_| true));
        let b = Arc::new(WorkflowStep::new("B", StepKind::Action).with_action(|_| true));
        let c = Arc::new(WorkflowStep::new("C", StepKind::Action).with_action(|_| false));

        let gate = Arc::new(
            WorkflowStep::new("gate", StepKind::Condition)
                .with_condition(|_| true)
                .with_child(a.clone()),
        );
        let par = Arc::new(
            WorkflowStep::new("par", StepKind::Parallel)
                .with_child(b.clone())
                .with_child(c.clone()),
        );
        let root = WorkflowStep::new("root", StepKind::Sequential)
            .with_child(gate)
            .with_child(par);

        assert!(!root.execute(&ev()));
        assert_eq!(root.status(), StepStatus::Failed);
        assert_eq!(a.status(), StepStatus::Completed);
        assert_eq!(b.status(), StepStatus::Completed);
        assert_eq!(c.status(), StepStatus::Failed);
    }

    #[test]
    fn test_reset_restores_pending_recursively() {
        let a = Arc::new(WorkflowStep::new("a", StepKind::Action).with_action(|_| true));
        let root = WorkflowStep::new("root", StepKind::Sequential).with_child(a.clone());

        assert!(root.execute(&ev()));
        assert_eq!(root.status(), StepStatus::Completed);
        assert_eq!(a.status(), StepStatus::Completed);

        root.reset();
        assert_eq!(root.status(), StepStatus::Pending);
        assert_eq!(a.status(), StepStatus::Pending);

        // Re-running after reset matches a fresh run.
        assert!(root.execute(&ev()));
        assert_eq!(root.status(), StepStatus::Completed);
    }

    #[test]
    fn test_render_tree_shows_status() {
        let root = WorkflowStep::new("root", StepKind::Sequential).with_child(Arc::new(
            WorkflowStep::new("leaf", StepKind::Action).with_action(|_| true),
        ));
        root.execute(&ev());
        let rendered = root.render_tree();
        assert!(rendered.contains("root [sequential] completed"));
        assert!(rendered.contains("  leaf [action] completed"));
    }
}
