//! Single-threaded deterministic executor
//!
//! Tasks are polled in the order they became ready. Wakers are `Rc`-backed, so
//! neither the executor nor its wakers may leave the thread.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TaskState {
    /// Waiting for a wake.
    Idle,
    /// In the ready queue.
    Queued,
    /// Returned `Ready`; never polled again.
    Done,
}

type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;

struct Task {
    id: u64,
    fut: RefCell<Option<LocalFuture>>,
    state: Cell<TaskState>,
    exec: Weak<RefCell<Queue>>,
}

impl Task {
    /// Queue the task unless it is already queued or finished.
    fn schedule(self: &Rc<Self>) {
        if self.state.get() != TaskState::Idle {
            return;
        }
        if let Some(queue) = self.exec.upgrade() {
            self.state.set(TaskState::Queued);
            queue.borrow_mut().ready.push_back(self.clone());
        }
    }
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Rc<Task>>,
    live: usize,
    next_id: u64,
}

/// Handle to a spawned task.
#[derive(Clone)]
pub struct TaskHandle {
    task: Rc<Task>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.task.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.state.get() == TaskState::Done
    }
}

/// Deterministic FIFO executor.
pub struct Executor {
    queue: Rc<RefCell<Queue>>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            queue: Rc::new(RefCell::new(Queue::default())),
        }
    }

    /// Spawn a task. It first runs on the next `run_until_stalled`.
    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) -> TaskHandle {
        let id = {
            let mut queue = self.queue.borrow_mut();
            queue.live += 1;
            queue.next_id += 1;
            queue.next_id
        };
        let task = Rc::new(Task {
            id,
            fut: RefCell::new(Some(Box::pin(fut))),
            state: Cell::new(TaskState::Idle),
            exec: Rc::downgrade(&self.queue),
        });
        task.schedule();
        TaskHandle { task }
    }

    /// Poll ready tasks until none are left. Returns the number of polls.
    pub fn run_until_stalled(&self) -> usize {
        let mut polls = 0;
        loop {
            let Some(task) = self.queue.borrow_mut().ready.pop_front() else {
                break;
            };
            if task.state.get() != TaskState::Queued {
                continue;
            }
            task.state.set(TaskState::Idle);
            polls += 1;

            let waker = task_waker(&task);
            let mut cx = Context::from_waker(&waker);

            // Taken out of the cell so a wake during the poll can requeue it.
            let Some(mut fut) = task.fut.borrow_mut().take() else {
                continue;
            };
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {
                    task.state.set(TaskState::Done);
                    self.queue.borrow_mut().live -= 1;
                }
                Poll::Pending => {
                    *task.fut.borrow_mut() = Some(fut);
                }
            }
        }
        polls
    }

    pub fn has_ready_tasks(&self) -> bool {
        !self.queue.borrow().ready.is_empty()
    }

    /// Tasks spawned and not yet finished.
    pub fn pending_tasks(&self) -> usize {
        self.queue.borrow().live
    }
}

// --- Waker implementation ---

fn task_waker(task: &Rc<Task>) -> Waker {
    unsafe fn clone_fn(data: *const ()) -> RawWaker {
        Rc::increment_strong_count(data as *const Task);
        RawWaker::new(data, &VTABLE)
    }

    unsafe fn wake_fn(data: *const ()) {
        let task = Rc::from_raw(data as *const Task);
        task.schedule();
    }

    unsafe fn wake_by_ref_fn(data: *const ()) {
        let task = &*(data as *const Task);
        if task.state.get() != TaskState::Idle {
            return;
        }
        Rc::increment_strong_count(data as *const Task);
        let task = Rc::from_raw(data as *const Task);
        task.schedule();
    }

    unsafe fn drop_fn(data: *const ()) {
        Rc::decrement_strong_count(data as *const Task);
    }

    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_fn, wake_fn, wake_by_ref_fn, drop_fn);

    let raw = RawWaker::new(Rc::into_raw(task.clone()) as *const (), &VTABLE);
    // SAFETY: the vtable keeps the Rc count balanced and the waker never
    // leaves the executor's thread.
    unsafe { Waker::from_raw(raw) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_basic_spawn() {
        let exec = Executor::new();
        let counter = Rc::new(Cell::new(0));

        let c = counter.clone();
        let handle = exec.spawn(async move {
            c.set(c.get() + 1);
        });
        assert_eq!(exec.pending_tasks(), 1);

        assert_eq!(exec.run_until_stalled(), 1);
        assert_eq!(counter.get(), 1);
        assert!(handle.is_finished());
        assert_eq!(exec.pending_tasks(), 0);
    }

    #[test]
    fn test_ordering() {
        let exec = Executor::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 1..=3 {
            let o = order.clone();
            exec.spawn(async move {
                o.borrow_mut().push(i);
            });
        }

        exec.run_until_stalled();
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_pending_then_wake() {
        let exec = Executor::new();
        let counter = Rc::new(Cell::new(0));
        let waker_holder: Rc<RefCell<Option<Waker>>> = Rc::new(RefCell::new(None));

        let c = counter.clone();
        let wh = waker_holder.clone();

        let handle = exec.spawn(async move {
            std::future::poll_fn(|cx| {
                if c.get() == 0 {
                    *wh.borrow_mut() = Some(cx.waker().clone());
                    c.set(1);
                    Poll::Pending
                } else {
                    c.set(c.get() + 1);
                    Poll::Ready(())
                }
            })
            .await;
        });

        exec.run_until_stalled();
        assert_eq!(counter.get(), 1);
        assert!(!handle.is_finished());
        assert_eq!(exec.run_until_stalled(), 0);

        let waker = waker_holder.borrow_mut().take().unwrap();
        waker.wake_by_ref();
        waker.wake_by_ref();
        assert_eq!(exec.run_until_stalled(), 1);
        assert_eq!(counter.get(), 2);
        assert!(handle.is_finished());

        // Waking a finished task is a no-op
        waker.wake();
        assert!(!exec.has_ready_tasks());
    }

    #[test]
    fn test_self_wake_requeues_behind_others() {
        let exec = Executor::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        exec.spawn(async move {
            let mut yielded = false;
            std::future::poll_fn(|cx| {
                o.borrow_mut().push("a");
                if yielded {
                    Poll::Ready(())
                } else {
                    yielded = true;
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            })
            .await;
        });
        let o = order.clone();
        exec.spawn(async move {
            o.borrow_mut().push("b");
        });

        assert_eq!(exec.run_until_stalled(), 3);
        assert_eq!(*order.borrow(), vec!["a", "b", "a"]);
    }
}
