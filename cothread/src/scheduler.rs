use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use id_generator::IdGenerator;
use memory_pool::MemoryPools;
use timer::TimerList;

use crate::config::{Config, TieBreak};
use crate::context::{Context, Transfer};
use crate::error::{Error, Result};
use crate::fiber::{self, Builder, Entry, Fiber, FiberId, JoinHandle, Outcome, Status, Wait, WaitKind, Wake};
use crate::io::{IoKey, IoWaiters};
use crate::queue::ReadyQueue;
use crate::remote::{Remote, Shared};

thread_local! {
    // the scheduler driving this thread, set only inside `Scheduler::drive`
    static CURRENT: Cell<Option<NonNull<Scheduler>>> = Cell::new(None);
}

/// Runs `f` against the scheduler driving this thread.
pub(crate) fn with_current<R>(f: impl FnOnce(&Scheduler) -> R) -> Result<R> {
    match CURRENT.with(Cell::get) {
        // the pointer is only installed while `drive` borrows the scheduler
        Some(scheduler) => Ok(f(unsafe { scheduler.as_ref() })),
        None => Err(Error::InvalidState("no scheduler is running on this thread")),
    }
}

struct Installed;

impl Installed {
    fn install(scheduler: &Scheduler) -> Result<Installed> {
        CURRENT.with(|current| {
            if current.get().is_some() {
                return Err(Error::InvalidState("a scheduler is already running on this thread"));
            }
            current.set(Some(NonNull::from(scheduler)));
            Ok(Installed)
        })
    }
}

impl Drop for Installed {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(None));
    }
}

/// Data word a fiber hands to the loop when it switches out.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(usize)]
enum Signal {
    Yield = 1,
    Suspend = 2,
    Terminate = 3,
}

impl Signal {
    fn from_data(data: *mut c_void) -> Option<Signal> {
        match data as usize {
            1 => Some(Signal::Yield),
            2 => Some(Signal::Suspend),
            3 => Some(Signal::Terminate),
            _ => None,
        }
    }

    fn into_data(self) -> *mut c_void {
        self as usize as *mut c_void
    }
}

/// Counters describing a scheduler at one instant.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// Fibers spawned and not yet terminated.
    pub live: usize,
    pub ready: usize,
    pub running: usize,
    pub suspended: usize,
    /// Timer entries, including deadlines of descriptor waits.
    pub timers: usize,
    pub io_waiters: usize,
    /// Switches from the loop into a fiber so far.
    pub switches: u64,
    /// Stacks lent out to live fibers.
    pub stacks_in_use: usize,
    /// Stacks cached for the next spawn.
    pub stacks_cached: usize,
}

#[derive(Debug)]
struct State {
    ready: ReadyQueue,
    timers: TimerList<FiberId>,
    waiters: IoWaiters,
    fibers: HashMap<FiberId, Rc<Fiber>>,
}

impl State {
    fn fiber(&self, id: FiberId) -> Option<Rc<Fiber>> {
        self.fibers.get(&id).cloned()
    }

    /// Suspended → Ready, dropping whatever else the fiber was waiting on.
    fn make_ready(&mut self, fiber: &Fiber, wake: Wake) -> Result<()> {
        if let Some(wait) = fiber.wait.take() {
            if let Some(time) = wait.timer {
                self.timers.cancel(time, &fiber.id());
            }
            if let Some(key) = wait.io {
                self.waiters.remove(key);
            }
        }
        fiber.wake.set(Some(wake));
        fiber.set_status(Status::Ready);
        self.ready.push(fiber.id())
    }

    fn wake_io(&mut self, ready: &[IoKey]) -> Result<()> {
        for key in ready {
            // gone if the same pass already woke the fiber through its timer
            let Some(id) = self.waiters.remove(*key) else {
                continue;
            };
            if let Some(fiber) = self.fiber(id).filter(|fiber| fiber.status() == Status::Suspended) {
                tracing::trace!(fiber = %id, fd = key.fd, direction = ?key.direction, "descriptor ready");
                self.make_ready(&fiber, Wake::Io)?;
            }
        }
        Ok(())
    }

    fn wake_timers(&mut self, now: u64) -> Result<()> {
        for id in self.timers.pop_expired(now) {
            let Some(fiber) = self.fiber(id).filter(|fiber| fiber.status() == Status::Suspended) else {
                continue;
            };
            if let Some(mut wait) = fiber.wait.get() {
                // already popped
                wait.timer = None;
                fiber.wait.set(Some(wait));
            }
            tracing::trace!(fiber = %id, "deadline passed");
            self.make_ready(&fiber, Wake::Timer)?;
        }
        Ok(())
    }
}

/// A single-threaded cooperative scheduler of fibers.
///
/// Fibers are spawned onto a scheduler at any time, but only run while the
/// scheduler is being driven by [`run`](Scheduler::run),
/// [`run_until`](Scheduler::run_until) or [`block_on`](Scheduler::block_on).
/// During that time it is the thread's *current* scheduler, which is what the
/// free functions of this crate (`spawn`, `sleep_for`, `wait_readable`, ...)
/// talk to. A thread drives at most one scheduler at a time.
///
/// Dropping a scheduler while fibers are still suspended releases their
/// stacks without unwinding them: whatever their frames own is leaked.
pub struct Scheduler {
    id: usize,
    config: Config,
    state: RefCell<State>,
    stacks: RefCell<MemoryPools>,
    running: RefCell<Option<Rc<Fiber>>>,
    //只在有协程运行时有效，协程通过它回到调度循环
    loop_context: Cell<Option<Context>>,
    switching: Cell<bool>,
    switches: Cell<u64>,
    remote: RefCell<Option<Arc<Shared>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Scheduler {
            id: IdGenerator::next_id("scheduler"),
            stacks: RefCell::new(MemoryPools::new(config.max_cached_stacks)),
            config,
            state: RefCell::new(State {
                ready: ReadyQueue::new(),
                timers: TimerList::new(),
                waiters: IoWaiters::new(),
                fibers: HashMap::new(),
            }),
            running: RefCell::new(None),
            loop_context: Cell::new(None),
            switching: Cell::new(false),
            switches: Cell::new(0),
            remote: RefCell::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Queues `f` to run as a new fiber and returns without switching.
    pub fn spawn<F, T>(&self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        Builder::new().spawn_on(self, f)
    }

    pub(crate) fn spawn_entry(
        &self,
        name: Option<String>,
        stack_size: Option<usize>,
        entry: Entry,
    ) -> Result<Rc<Fiber>> {
        let stack_size = stack_size.unwrap_or(self.config.stack_size);
        let stack = self.stacks.borrow_mut().allocate(stack_size)?;
        // the stack moves into the fiber below; its mapping stays put
        let context = unsafe { Context::new(&stack, Scheduler::bootstrap) };
        let fiber = Rc::new(Fiber::new(name, stack_size, stack, context, entry));
        tracing::debug!(scheduler = self.id, fiber = %fiber.id(), name = ?fiber.name(), "spawned");

        let mut state = self.state.borrow_mut();
        state.ready.push(fiber.id())?;
        fiber.set_status(Status::Ready);
        state.fibers.insert(fiber.id(), fiber.clone());
        Ok(fiber)
    }

    /// Drives the loop until every fiber has terminated.
    pub fn run(&self) -> Result<()> {
        self.drive(None)
    }

    /// Drives the loop until the fiber behind `handle` has terminated. Other
    /// fibers stay where they are and continue on the next drive.
    pub fn run_until<T>(&self, handle: &JoinHandle<T>) -> Result<()> {
        let fiber = handle.fiber();
        if fiber.status() != Status::Terminated && !self.state.borrow().fibers.contains_key(&fiber.id()) {
            return Err(Error::InvalidState("fiber belongs to another scheduler"));
        }
        self.drive(Some(fiber))
    }

    /// Spawns `f`, drives the loop until it has terminated and returns its result.
    pub fn block_on<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let handle = self.spawn(f)?;
        self.run_until(&handle)?;
        handle.fiber().take_result()
    }

    /// A handle other threads can use to wake fibers of this scheduler.
    pub fn remote(&self) -> Result<Remote> {
        let mut remote = self.remote.borrow_mut();
        let shared = match remote.as_ref() {
            Some(shared) => shared.clone(),
            None => {
                let waker = self.state.borrow_mut().waiters.waker()?;
                let shared = Arc::new(Shared::new(self.id, waker));
                *remote = Some(shared.clone());
                shared
            }
        };
        Ok(Remote::new(shared))
    }

    pub fn stats(&self) -> Stats {
        let state = self.state.borrow();
        let stacks = self.stacks.borrow();
        let mut stats = Stats {
            live: state.fibers.len(),
            ready: state.ready.len(),
            timers: state.timers.count(),
            io_waiters: state.waiters.len(),
            switches: self.switches.get(),
            stacks_in_use: stacks.using(),
            stacks_cached: stacks.available(),
            ..Stats::default()
        };
        for fiber in state.fibers.values() {
            match fiber.status() {
                Status::Running => stats.running += 1,
                Status::Suspended => stats.suspended += 1,
                _ => {}
            }
        }
        stats
    }

    /// Identity of the running fiber, `None` on the loop itself.
    pub fn current_fiber(&self) -> Option<FiberId> {
        self.running.borrow().as_ref().map(|fiber| fiber.id())
    }

    fn running_fiber(&self) -> Result<Rc<Fiber>> {
        self.running
            .borrow()
            .clone()
            .ok_or(Error::InvalidState("only a fiber can wait; this is the scheduler loop"))
    }

    fn drive(&self, until: Option<&Rc<Fiber>>) -> Result<()> {
        let _installed = Installed::install(self)?;
        let done = |state: &State| match until {
            Some(fiber) => fiber.status() == Status::Terminated,
            None => state.fibers.is_empty(),
        };
        loop {
            // one pass: whatever was ready when it started, fifo
            let batch = self.state.borrow().ready.len();
            for _ in 0..batch {
                let next = {
                    let mut state = self.state.borrow_mut();
                    state.ready.pop().and_then(|id| state.fiber(id))
                };
                match next {
                    Some(fiber) => self.resume(&fiber)?,
                    None => break,
                }
                if until.is_some() && done(&self.state.borrow()) {
                    return Ok(());
                }
            }
            if done(&self.state.borrow()) {
                return Ok(());
            }
            self.poll()?;
        }
    }

    /// Waits for descriptors and timers and moves every satisfied fiber to the
    /// readiness queue.
    fn poll(&self) -> Result<()> {
        let remote = self
            .remote
            .borrow()
            .as_ref()
            // a dropped handle may have queued requests before it went away
            .filter(|shared| Arc::strong_count(shared) > 1 || shared.has_pending())
            .cloned();
        let (timeout, has_waiters) = {
            let state = self.state.borrow();
            let timeout = if !state.ready.is_empty() {
                Some(Duration::ZERO)
            } else {
                state.timers.next_deadline().map(timer::until)
            };
            (timeout, !state.waiters.is_empty())
        };

        if !has_waiters && remote.is_none() && timeout.is_none() {
            let blocked = self.state.borrow().fibers.len();
            tracing::warn!(scheduler = self.id, blocked, "nothing left to wake the remaining fibers");
            return Err(Error::Stalled { blocked });
        }
        let polled = self.state.borrow_mut().waiters.poll(timeout)?;
        tracing::trace!(scheduler = self.id, ready = polled.ready.len(), remote = polled.remote, "polled");

        let now = timer::now();
        {
            let mut state = self.state.borrow_mut();
            match self.config.tie_break {
                TieBreak::IoFirst => {
                    state.wake_io(&polled.ready)?;
                    state.wake_timers(now)?;
                }
                TieBreak::TimerFirst => {
                    state.wake_timers(now)?;
                    state.wake_io(&polled.ready)?;
                }
            }
        }
        if let Some(shared) = remote {
            if polled.remote || shared.has_pending() {
                for id in shared.drain() {
                    self.remote_wake(id);
                }
            }
        }
        Ok(())
    }

    // 切换上下文，切换期间不允许再次切换
    fn switch(&self, to: Context, data: *mut c_void) -> Result<Transfer> {
        if self.switching.replace(true) {
            return Err(Error::InvalidState("context switch already in progress"));
        }
        let transfer = unsafe { to.resume(data) };
        self.switching.set(false);
        Ok(transfer)
    }

    /// Loop side: runs `fiber` until it switches back, then files it according
    /// to why it did.
    fn resume(&self, fiber: &Rc<Fiber>) -> Result<()> {
        if fiber.status() != Status::Ready {
            return Err(Error::InvalidState("only a ready fiber can be switched to"));
        }
        let context = fiber
            .take_context()
            .ok_or(Error::InvalidState("ready fiber has no saved context"))?;
        fiber.set_status(Status::Running);
        *self.running.borrow_mut() = Some(fiber.clone());
        self.switches.set(self.switches.get() + 1);

        let transfer = self.switch(context, self as *const Scheduler as *mut c_void);
        self.running.borrow_mut().take();
        let transfer = match transfer {
            Ok(transfer) => transfer,
            Err(e) => {
                fiber.set_context(context);
                fiber.set_status(Status::Ready);
                self.state.borrow_mut().ready.push(fiber.id())?;
                return Err(e);
            }
        };

        match Signal::from_data(transfer.data) {
            Some(Signal::Yield) => {
                self.check_stack(fiber, transfer.context);
                fiber.set_context(transfer.context);
                fiber.set_status(Status::Ready);
                self.state.borrow_mut().ready.push(fiber.id())?;
            }
            Some(Signal::Suspend) => {
                self.check_stack(fiber, transfer.context);
                fiber.set_context(transfer.context);
                fiber.set_status(Status::Suspended);
            }
            Some(Signal::Terminate) => self.reclaim(fiber),
            None => {
                tracing::error!(fiber = %fiber.id(), data = transfer.data as usize, "fiber switched out with garbage");
                std::process::abort();
            }
        }
        Ok(())
    }

    fn check_stack(&self, fiber: &Fiber, context: Context) {
        let remaining = fiber.stack_remaining(context.stack_pointer());
        if remaining < self.config.redzone {
            tracing::error!(
                fiber = %fiber.id(),
                remaining,
                redzone = self.config.redzone,
                "fiber stack overflow, aborting"
            );
            std::process::abort();
        }
    }

    /// Running → Terminated: the stack goes back to the pool and a waiting
    /// joiner becomes ready.
    fn reclaim(&self, fiber: &Rc<Fiber>) {
        fiber.set_status(Status::Terminated);
        if let Some(stack) = fiber.take_stack() {
            if let Err(e) = self.stacks.borrow_mut().revert(fiber.stack_size(), stack) {
                tracing::warn!(fiber = %fiber.id(), error = %e, "dropping stack instead of caching it");
            }
        }
        let mut state = self.state.borrow_mut();
        state.fibers.remove(&fiber.id());
        let joiner = fiber.joiner.take().and_then(|id| state.fiber(id));
        match joiner {
            Some(joiner) => {
                if let Err(e) = state.make_ready(&joiner, Wake::Notify) {
                    tracing::error!(fiber = %joiner.id(), error = %e, "could not wake joiner");
                }
            }
            None => {
                if let Some(message) = fiber.panic_message() {
                    tracing::warn!(fiber = %fiber.id(), name = ?fiber.name(), %message, "fiber panicked and nobody is joining it");
                }
            }
        }
        tracing::debug!(scheduler = self.id, fiber = %fiber.id(), "terminated");
    }

    /// First code a fresh fiber runs, on its own stack.
    extern "C" fn bootstrap(t: Transfer) -> ! {
        let scheduler = unsafe { &*(t.data as *const Scheduler) };
        scheduler.switching.set(false);
        scheduler.loop_context.set(Some(t.context));
        scheduler.start();
        // nothing with a destructor may live in this frame past here: the
        // stack is abandoned after the final switch
        let _ = scheduler.switch_out(Signal::Terminate);
        tracing::error!("terminated fiber was resumed");
        std::process::abort();
    }

    fn start(&self) {
        let Ok(fiber) = self.running_fiber() else {
            return;
        };
        let outcome = match fiber.take_entry() {
            Some(entry) => match panic::catch_unwind(AssertUnwindSafe(entry)) {
                Ok(value) => Outcome::Returned(value),
                Err(payload) => Outcome::Panicked(fiber::panic_message(&*payload)),
            },
            None => Outcome::Panicked("fiber started twice".to_string()),
        };
        fiber.set_outcome(outcome);
    }

    /// Fiber side: hands control back to the loop, returning once the loop
    /// switches to this fiber again.
    fn switch_out(&self, signal: Signal) -> Result<()> {
        let to = self
            .loop_context
            .take()
            .ok_or(Error::InvalidState("only a fiber can switch out"))?;
        match self.switch(to, signal.into_data()) {
            Ok(transfer) => {
                self.loop_context.set(Some(transfer.context));
                Ok(())
            }
            Err(e) => {
                self.loop_context.set(Some(to));
                Err(e)
            }
        }
    }

    /// Suspends the running fiber after it registered `wait`; returns what
    /// woke it.
    fn suspend(&self, fiber: &Fiber, wait: Wait) -> Result<Wake> {
        fiber.wait.set(Some(wait));
        let id = fiber.id();
        if let Err(e) = self.switch_out(Signal::Suspend) {
            let mut state = self.state.borrow_mut();
            if let Some(wait) = fiber.wait.take() {
                if let Some(time) = wait.timer {
                    state.timers.cancel(time, &id);
                }
                if let Some(key) = wait.io {
                    state.waiters.remove(key);
                }
            }
            return Err(e);
        }
        Ok(fiber.wake.take().unwrap_or(Wake::Notify))
    }

    pub(crate) fn yield_now(&self) -> Result<()> {
        self.running_fiber()?;
        self.switch_out(Signal::Yield)
    }

    /// Suspends until `deadline` (absolute, `timer` clock) or an explicit wake.
    pub(crate) fn sleep_until(&self, deadline: u64) -> Result<Wake> {
        let fiber = self.running_fiber()?;
        let mut wait = Wait::new(WaitKind::Sleep);
        wait.timer = Some(deadline);
        self.state.borrow_mut().timers.insert(deadline, fiber.id());
        self.suspend(&fiber, wait)
    }

    pub(crate) fn park(&self, deadline: Option<u64>) -> Result<Wake> {
        let fiber = self.running_fiber()?;
        if fiber.permit.replace(false) {
            return Ok(Wake::Notify);
        }
        let mut wait = Wait::new(WaitKind::Park);
        if let Some(deadline) = deadline {
            wait.timer = Some(deadline);
            self.state.borrow_mut().timers.insert(deadline, fiber.id());
        }
        self.suspend(&fiber, wait)
    }

    pub(crate) fn wait_io(&self, key: IoKey, deadline: Option<u64>) -> Result<Wake> {
        let fiber = self.running_fiber()?;
        let mut wait = Wait::new(WaitKind::Io);
        {
            let mut state = self.state.borrow_mut();
            state.waiters.insert(key, fiber.id())?;
            wait.io = Some(key);
            if let Some(deadline) = deadline {
                wait.timer = Some(deadline);
                state.timers.insert(deadline, fiber.id());
            }
        }
        self.suspend(&fiber, wait)
    }

    pub(crate) fn join_wait(&self, target: &Rc<Fiber>) -> Result<()> {
        if target.status() == Status::Terminated {
            return Ok(());
        }
        let fiber = self.running_fiber()?;
        if fiber.id() == target.id() {
            return Err(Error::InvalidState("a fiber cannot join itself"));
        }
        if !self.state.borrow().fibers.contains_key(&target.id()) {
            return Err(Error::InvalidState("fiber belongs to another scheduler"));
        }
        if target.joiner.get().is_some() {
            return Err(Error::InvalidState("fiber is already being joined"));
        }
        target.joiner.set(Some(fiber.id()));
        if let Err(e) = self.suspend(&fiber, Wait::new(WaitKind::Join)) {
            target.joiner.set(None);
            return Err(e);
        }
        Ok(())
    }

    // a remote wake that finds nothing to cancel is kept for the next park
    fn remote_wake(&self, id: FiberId) {
        match self.wake(id) {
            Ok(true) => {}
            Ok(false) => {
                if let Some(fiber) = self.state.borrow().fiber(id) {
                    tracing::trace!(fiber = %id, "remote wake kept for the next park");
                    fiber.permit.set(true);
                }
            }
            Err(_) => tracing::debug!(fiber = %id, "remote wake for unknown fiber"),
        }
    }

    /// Ends the sleep, descriptor wait or park of fiber `id` early, with
    /// [`Wake::Notify`]. Returns `false` if it is not in such a wait.
    pub fn wake(&self, id: FiberId) -> Result<bool> {
        let mut state = self.state.borrow_mut();
        let fiber = state
            .fiber(id)
            .ok_or(Error::InvalidState("no live fiber with that id"))?;
        if fiber.status() != Status::Suspended {
            return Ok(false);
        }
        match fiber.wait.get() {
            Some(wait) if wait.is_cancellable() => {
                state.make_ready(&fiber, Wake::Notify)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let fibers: Vec<_> = self.state.get_mut().fibers.drain().map(|(_, fiber)| fiber).collect();
        if !fibers.is_empty() {
            tracing::warn!(scheduler = self.id, live = fibers.len(), "dropping scheduler with live fibers");
        }
        for fiber in fibers {
            // suspended frames are abandoned, not unwound
            drop(fiber.take_stack());
            drop(fiber.take_entry());
        }
    }
}
