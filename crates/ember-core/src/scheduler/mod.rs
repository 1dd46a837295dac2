//! Cooperative, single-threaded task scheduler backing `async-call`/`await`.
//!
//! Unlike the corpus's `raya-core` scheduler — a multi-threaded work-stealing
//! pool of OS-thread workers pulling from per-worker `crossbeam-deque`
//! queues — this scheduler runs everything on the one mutator thread that
//! already owns the VM. Guest concurrency is cooperative: an async call
//! enqueues a task record, and nothing about it actually runs until the
//! queue is drained, which only happens when an `await` needs its result (or
//! the embedder explicitly pumps it). There is exactly one worker: the
//! caller of [`Scheduler::pop_next`].

use crate::value::Value;
use std::collections::VecDeque;

/// Identifies one enqueued task, in enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// One pending unit of async work: a callee (function or native function
/// `Value`), its already-evaluated arguments, and the `Future` heap object
/// it must resolve (or reject) when it finishes.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub callee: Value,
    pub args: Vec<Value>,
    pub future: Value,
}

/// A FIFO queue of tasks awaiting execution on the mutator thread.
///
/// `Scheduler` itself only tracks *what* is queued; it has no notion of how
/// to call a function, so running a task's body is `Vm`'s job (see
/// `vm::interpreter::Vm::run_one_task`). This separation mirrors
/// `crate::gc::RootProvider`'s split between bookkeeping and mechanism.
#[derive(Debug, Default)]
pub struct Scheduler {
    next_id: u64,
    queue: VecDeque<Task>,
    max_tasks: Option<usize>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_limit(max_tasks: Option<usize>) -> Self {
        Self {
            max_tasks,
            ..Self::default()
        }
    }

    /// Enqueue a task. Returns `None` if the scheduler's task cap is
    /// already at capacity (including tasks still queued or mid-flight via
    /// a previous `pop_next` whose completion hasn't been recorded).
    pub fn enqueue(&mut self, callee: Value, args: Vec<Value>, future: Value) -> Option<TaskId> {
        if let Some(max) = self.max_tasks {
            if self.queue.len() >= max {
                return None;
            }
        }
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.queue.push_back(Task {
            id,
            callee,
            args,
            future,
        });
        Some(id)
    }

    /// Dequeue the oldest pending task, FIFO.
    pub fn pop_next(&mut self) -> Option<Task> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Visit every `Value` held by a queued task — its callee, each
    /// argument, and its future — so the collector can treat pending task
    /// queue entries as roots (spec.md §4.2 Roots (f)).
    pub fn for_each_value(&self, mut visit: impl FnMut(Value)) {
        for task in &self.queue {
            visit(task.callee);
            for &arg in &task.args {
                visit(arg);
            }
            visit(task.future);
        }
    }

    /// Like [`Scheduler::for_each_value`], but rewrites each held `Value`
    /// in place — used by the collector's minor-collection forwarding pass.
    pub fn for_each_value_mut(&mut self, mut visit: impl FnMut(&mut Value)) {
        for task in &mut self.queue {
            visit(&mut task.callee);
            for arg in &mut task.args {
                visit(arg);
            }
            visit(&mut task.future);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_dequeue_in_fifo_order() {
        let mut sched = Scheduler::new();
        let a = sched.enqueue(Value::int(1), vec![], Value::nil()).unwrap();
        let b = sched.enqueue(Value::int(2), vec![], Value::nil()).unwrap();
        assert_eq!(sched.pop_next().unwrap().id, a);
        assert_eq!(sched.pop_next().unwrap().id, b);
        assert!(sched.pop_next().is_none());
    }

    #[test]
    fn task_limit_rejects_additional_enqueues() {
        let mut sched = Scheduler::with_task_limit(Some(1));
        assert!(sched.enqueue(Value::int(1), vec![], Value::nil()).is_some());
        assert!(sched.enqueue(Value::int(2), vec![], Value::nil()).is_none());
    }
}
