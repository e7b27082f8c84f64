use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use id_generator::IdGenerator;
use memory_pool::memory::Memory;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::io::IoKey;
use crate::scheduler::{self, Scheduler};

/// Opaque identity of a fiber, unique within the process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(usize);

impl FiberId {
    pub(crate) fn next() -> Self {
        FiberId(IdGenerator::next_id("fiber"))
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    ///栈已分配，上下文已准备好
    Created,
    ///在就绪队列中
    Ready,
    ///运行中
    Running,
    ///等待定时器、I/O或唤醒
    Suspended,
    ///用户函数已返回或panic
    Terminated,
}

/// What ended a wait.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Wake {
    /// The descriptor became ready.
    Io,
    /// The deadline passed.
    Timer,
    /// Someone called `wake` on the fiber (or the awaited fiber finished).
    Notify,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum WaitKind {
    Sleep,
    Io,
    Park,
    Join,
}

/// Registrations a suspended fiber holds; whichever fires first removes the rest.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Wait {
    pub(crate) kind: WaitKind,
    pub(crate) timer: Option<u64>,
    pub(crate) io: Option<IoKey>,
}

impl Wait {
    pub(crate) fn new(kind: WaitKind) -> Self {
        Wait {
            kind,
            timer: None,
            io: None,
        }
    }

    /// Only sleeps, descriptor waits and parks may be ended by `wake`.
    pub(crate) fn is_cancellable(&self) -> bool {
        self.kind != WaitKind::Join
    }
}

pub(crate) enum Outcome {
    Returned(Box<dyn Any>),
    Panicked(String),
}

pub(crate) type Entry = Box<dyn FnOnce() -> Box<dyn Any>>;

pub(crate) struct Fiber {
    id: FiberId,
    name: Option<String>,
    stack_size: usize,
    status: Cell<Status>,
    stack: RefCell<Option<Memory>>,
    //只在未运行时有效
    context: Cell<Option<Context>>,
    entry: Cell<Option<Entry>>,
    outcome: RefCell<Option<Outcome>>,
    pub(crate) wait: Cell<Option<Wait>>,
    pub(crate) wake: Cell<Option<Wake>>,
    pub(crate) joiner: Cell<Option<FiberId>>,
    //远程唤醒到达时协程没有在等待，留给下一次park
    pub(crate) permit: Cell<bool>,
}

impl Fiber {
    pub(crate) fn new(
        name: Option<String>,
        stack_size: usize,
        stack: Memory,
        context: Context,
        entry: Entry,
    ) -> Self {
        Fiber {
            id: FiberId::next(),
            name,
            stack_size,
            status: Cell::new(Status::Created),
            stack: RefCell::new(Some(stack)),
            context: Cell::new(Some(context)),
            entry: Cell::new(Some(entry)),
            outcome: RefCell::new(None),
            wait: Cell::new(None),
            wake: Cell::new(None),
            joiner: Cell::new(None),
            permit: Cell::new(false),
        }
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub(crate) fn status(&self) -> Status {
        self.status.get()
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.status.set(status);
    }

    pub(crate) fn take_context(&self) -> Option<Context> {
        self.context.take()
    }

    pub(crate) fn set_context(&self, context: Context) {
        self.context.set(Some(context));
    }

    pub(crate) fn take_entry(&self) -> Option<Entry> {
        self.entry.take()
    }

    pub(crate) fn take_stack(&self) -> Option<Memory> {
        self.stack.borrow_mut().take()
    }

    /// Free bytes left below `sp` on this fiber's stack, 0 if `sp` is not on it.
    pub(crate) fn stack_remaining(&self, sp: usize) -> usize {
        self.stack
            .borrow()
            .as_ref()
            .map_or(0, |stack| stack.remaining(sp))
    }

    pub(crate) fn set_outcome(&self, outcome: Outcome) {
        *self.outcome.borrow_mut() = Some(outcome);
    }

    pub(crate) fn panic_message(&self) -> Option<String> {
        match &*self.outcome.borrow() {
            Some(Outcome::Panicked(message)) => Some(message.clone()),
            _ => None,
        }
    }

    fn result<T: Clone + 'static>(&self) -> Result<T> {
        match &*self.outcome.borrow() {
            Some(Outcome::Returned(value)) => value
                .downcast_ref::<T>()
                .cloned()
                .ok_or(Error::InvalidState("join handle does not match the fiber's result type")),
            Some(Outcome::Panicked(message)) => Err(Error::Panicked {
                fiber: self.id,
                message: message.clone(),
            }),
            None => Err(Error::InvalidState("fiber has not terminated")),
        }
    }

    pub(crate) fn take_result<T: 'static>(&self) -> Result<T> {
        match self.outcome.borrow_mut().take() {
            Some(Outcome::Returned(value)) => value
                .downcast::<T>()
                .map(|value| *value)
                .map_err(|_| Error::InvalidState("join handle does not match the fiber's result type")),
            Some(Outcome::Panicked(message)) => Err(Error::Panicked {
                fiber: self.id,
                message,
            }),
            None => Err(Error::InvalidState("fiber has not terminated")),
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status.get())
            .finish()
    }
}

/// Owned permission to wait for a fiber and read what it returned.
///
/// Handles are cheap to clone; every clone sees the same outcome.
pub struct JoinHandle<T> {
    fiber: Rc<Fiber>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(fiber: Rc<Fiber>) -> Self {
        JoinHandle {
            fiber,
            _marker: PhantomData,
        }
    }

    pub(crate) fn fiber(&self) -> &Rc<Fiber> {
        &self.fiber
    }

    pub fn id(&self) -> FiberId {
        self.fiber.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.fiber.name()
    }

    pub fn status(&self) -> Status {
        self.fiber.status()
    }

    pub fn is_finished(&self) -> bool {
        self.fiber.status() == Status::Terminated
    }
}

impl<T: Clone + 'static> JoinHandle<T> {
    /// Waits for the fiber to terminate and returns a copy of its result.
    ///
    /// A finished fiber's result comes back immediately, from any context and
    /// as often as asked. Waiting for an unfinished one suspends the calling
    /// fiber; only one fiber may wait at a time, and waiting from outside any
    /// fiber is an `InvalidState` error. A panic inside the fiber is reported
    /// as [`Error::Panicked`].
    pub fn join(&self) -> Result<T> {
        if !self.is_finished() {
            scheduler::with_current(|scheduler| scheduler.join_wait(&self.fiber))??;
        }
        self.fiber.result()
    }
}

impl<T> Clone for JoinHandle<T> {
    fn clone(&self) -> Self {
        JoinHandle::new(self.fiber.clone())
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JoinHandle").field(&self.fiber).finish()
    }
}

/// Fiber factory, for when the defaults are not enough.
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    pub fn new() -> Self {
        Builder::default()
    }

    /// Name used in logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Spawns on the scheduler driving the current thread.
    pub fn spawn<F, T>(self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        scheduler::with_current(|scheduler| self.spawn_on(scheduler, f))?
    }

    pub fn spawn_on<F, T>(self, scheduler: &Scheduler, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let entry: Entry = Box::new(move || Box::new(f()) as Box<dyn Any>);
        let fiber = scheduler.spawn_entry(self.name, self.stack_size, entry)?;
        Ok(JoinHandle::new(fiber))
    }
}

/// Best effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_ordered() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(format!("#{}", a.as_usize()), a.to_string());
    }

    #[test]
    fn panic_messages() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!("boom", panic_message(&*payload));
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!("bang", panic_message(&*payload));
        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!("Box<dyn Any>", panic_message(&*payload));
    }

    #[test]
    fn only_joins_are_uncancellable() {
        assert!(Wait::new(WaitKind::Sleep).is_cancellable());
        assert!(Wait::new(WaitKind::Io).is_cancellable());
        assert!(Wait::new(WaitKind::Park).is_cancellable());
        assert!(!Wait::new(WaitKind::Join).is_cancellable());
    }
}
