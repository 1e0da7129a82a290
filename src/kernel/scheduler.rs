//! Round-robin scheduling decisions.
//!
//! [`Scheduler`] is the thread table, ready queue and quantum counters of one runtime,
//! together with the state transitions every operation performs. It never touches a stack:
//! operations that give up the CPU report [`Suspend::Reschedule`], and [`Scheduler::schedule`]
//! returns the [`Switch`] the caller must carry out. All methods assume the caller holds the
//! preemption critical section.

use crate::arch::{fatal, Context};
use crate::error::{Error, Result};
use crate::kernel::queue::ReadyQueue;
use crate::kernel::sleep::{self, Wakeup};
use crate::kernel::stack::Stack;
use crate::kernel::thread::{ThreadControlBlock, ThreadEntry, ThreadState, Tid};

/// A scheduling decision: suspend `from`, resume `to`. Both may be the same thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Switch {
    pub from: Tid,
    pub to: Tid,
}

impl Switch {
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

/// Whether an operation took the running thread off the CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Suspend {
    Continue,
    Reschedule,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// Another thread was removed; the caller keeps running.
    Removed,
    /// The running thread removed itself; its stack is parked until the next switch.
    SelfTerminated,
    /// The main thread was terminated; the process must shut down.
    Process,
}

pub struct Scheduler<const MAX: usize> {
    /// Heap-allocated so a scheduler can be built on a small thread stack.
    threads: Box<[ThreadControlBlock]>,
    ready: ReadyQueue<MAX>,
    current: Tid,
    total_quanta: u64,
    /// Stack of a thread that terminated itself, released once another thread runs.
    released: Option<Stack>,
    shutdown: bool,
}

impl<const MAX: usize> Scheduler<MAX> {
    /// A fresh table where only the main thread exists and is running its first quantum.
    pub fn new() -> Self {
        assert!(MAX >= 1, "the thread table needs room for the main thread");
        let mut scheduler = Self {
            threads: (0..MAX).map(|raw| ThreadControlBlock::unused(Tid::new(raw))).collect(),
            ready: ReadyQueue::new(),
            current: Tid::MAIN,
            total_quanta: 1,
            released: None,
            shutdown: false,
        };
        scheduler.threads[0].mark_running();
        scheduler
    }

    pub fn current(&self) -> Tid {
        self.current
    }

    pub fn total_quanta(&self) -> u64 {
        self.total_quanta
    }

    pub fn ready_queue(&self) -> &ReadyQueue<MAX> {
        &self.ready
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown
    }

    fn slot(&self, tid: Tid) -> Result<&ThreadControlBlock> {
        match self.threads.get(tid.raw()) {
            Some(tcb) if tid.is_main() || !tcb.is_unused() => Ok(tcb),
            _ => Err(Error::InvalidTid(tid)),
        }
    }

    fn slot_mut(&mut self, tid: Tid) -> Result<&mut ThreadControlBlock> {
        match self.threads.get_mut(tid.raw()) {
            Some(tcb) if tid.is_main() || !tcb.is_unused() => Ok(tcb),
            _ => Err(Error::InvalidTid(tid)),
        }
    }

    pub fn thread(&self, tid: Tid) -> Result<&ThreadControlBlock> {
        self.slot(tid)
    }

    pub fn quanta_for(&self, tid: Tid) -> Result<u64> {
        self.slot(tid).map(|tcb| tcb.quanta)
    }

    pub fn state_of(&self, tid: Tid) -> Result<ThreadState> {
        self.slot(tid).map(|tcb| tcb.state)
    }

    pub fn entry_of(&self, tid: Tid) -> Option<ThreadEntry> {
        self.threads.get(tid.raw()).and_then(|tcb| tcb.entry)
    }

    fn enqueue(&mut self, tid: Tid) {
        if self.ready.push_back(tid).is_err() {
            fatal("ready queue overflow");
        }
    }

    /// Admit a new thread at the lowest free tid and queue it.
    ///
    /// `prime` builds the initial context once the stack exists.
    pub fn spawn<F>(&mut self, entry: Option<ThreadEntry>, stack_size: usize, prime: F) -> Result<Tid>
    where
        F: FnOnce(Tid, &Stack) -> Context,
    {
        let entry = entry.ok_or(Error::NoEntryPoint)?;
        let tid = self
            .threads
            .iter()
            .skip(1)
            .find(|tcb| tcb.is_unused())
            .map(|tcb| tcb.tid)
            .ok_or(Error::TableFull)?;
        let stack = Stack::new(stack_size).map_err(Error::StackAllocation)?;
        let context = prime(tid, &stack);

        let tcb = &mut self.threads[tid.raw()];
        tcb.entry = Some(entry);
        tcb.context = context;
        tcb.stack = Some(stack);
        tcb.quanta = 0;
        tcb.wake_at = 0;
        tcb.mark_ready();
        self.enqueue(tid);
        Ok(tid)
    }

    /// Decide which thread runs the next quantum.
    ///
    /// Wakes expired sleepers, advances the quantum counter, requeues the outgoing thread if
    /// it is still running (it was preempted), and promotes the head of the ready queue.
    pub fn schedule(&mut self) -> Switch {
        let now = self.total_quanta;
        let ready = &mut self.ready;
        sleep::expire(&mut self.threads, now, |wakeup| {
            if let Wakeup::Ready(tid) = wakeup {
                if ready.push_back(tid).is_err() {
                    fatal("ready queue overflow");
                }
            }
        });

        self.total_quanta += 1;

        let from = self.current;
        if self.threads[from.raw()].state == ThreadState::Running {
            self.threads[from.raw()].mark_ready();
            self.enqueue(from);
        }

        let Some(to) = self.ready.pop_front() else {
            fatal("scheduler invoked with an empty ready queue");
        };
        self.threads[to.raw()].mark_running();
        self.current = to;
        Switch { from, to }
    }

    pub fn block(&mut self, tid: Tid) -> Result<Suspend> {
        if tid.is_main() {
            return Err(Error::InvalidTid(tid));
        }
        let running = self.current;
        let tcb = self.slot_mut(tid)?;
        match tcb.state {
            ThreadState::Blocked => Ok(Suspend::Continue),
            ThreadState::Sleeping | ThreadState::SleepBlocked => {
                tcb.state = ThreadState::SleepBlocked;
                Ok(Suspend::Continue)
            }
            _ if tid == running => {
                tcb.state = ThreadState::Blocked;
                Ok(Suspend::Reschedule)
            }
            _ => {
                tcb.state = ThreadState::Blocked;
                self.ready.remove(tid);
                Ok(Suspend::Continue)
            }
        }
    }

    pub fn resume(&mut self, tid: Tid) -> Result<()> {
        let tcb = self.slot_mut(tid)?;
        match tcb.state {
            ThreadState::Blocked => {
                tcb.mark_ready();
                self.enqueue(tid);
            }
            ThreadState::SleepBlocked => tcb.state = ThreadState::Sleeping,
            _ => {}
        }
        Ok(())
    }

    /// Put the running thread to sleep for `quanta` scheduling decisions.
    pub fn sleep(&mut self, quanta: u64) -> Result<Suspend> {
        let tid = self.current;
        if tid.is_main() || quanta == 0 {
            return Err(Error::InvalidSleep);
        }
        let wake_at = self.total_quanta.saturating_add(quanta);
        self.threads[tid.raw()].put_to_sleep(wake_at);
        Ok(Suspend::Reschedule)
    }

    pub fn terminate(&mut self, tid: Tid) -> Result<Termination> {
        if tid.is_main() {
            self.shutdown = true;
            return Ok(Termination::Process);
        }
        let stack = self.slot_mut(tid)?.release();
        self.ready.remove(tid);
        if tid == self.current {
            self.released = stack;
            Ok(Termination::SelfTerminated)
        } else {
            drop(stack);
            Ok(Termination::Removed)
        }
    }

    /// Give the CPU straight to the main thread so it can tear the process down.
    pub fn hand_off_to_main(&mut self) -> Switch {
        let from = self.current;
        self.ready.remove(Tid::MAIN);
        self.threads[0].state = ThreadState::Running;
        self.current = Tid::MAIN;
        Switch {
            from,
            to: Tid::MAIN,
        }
    }

    /// Take the stack parked by a self-terminated thread. Only call once that thread's stack
    /// is no longer the one executing.
    pub fn take_released(&mut self) -> Option<Stack> {
        self.released.take()
    }

    /// Release every spawned thread's stack and empty the ready queue. Returns how many
    /// threads were torn down. The main thread's slot is left alone.
    pub fn release_all(&mut self) -> usize {
        self.ready.reset();
        self.released = None;
        self.threads
            .iter_mut()
            .skip(1)
            .filter_map(|tcb| tcb.release())
            .count()
    }

    /// Detach the running thread's stack so it survives a teardown that runs on it.
    pub fn detach_running_stack(&mut self) -> Option<Stack> {
        self.threads[self.current.raw()].stack.take()
    }

    /// Take the main thread's adopted stack. Only call while main is switched out.
    pub fn release_main_stack(&mut self) -> Option<Stack> {
        self.threads[0].stack.take()
    }

    /// Let the main thread own the stack it is executing on.
    pub fn adopt_main_stack(&mut self, stack: Stack) {
        self.threads[0].stack = Some(stack);
    }

    /// Raw pointer to a thread's saved context, stable for the scheduler's lifetime.
    pub fn context_ptr(&mut self, tid: Tid) -> *mut Context {
        &mut self.threads[tid.raw()].context
    }

    /// Check the table and queue against each other. Used by tests and debug assertions.
    pub fn invariants_hold(&self) -> bool {
        let running = self
            .threads
            .iter()
            .filter(|tcb| tcb.state == ThreadState::Running)
            .count();
        let current_running = self.threads[self.current.raw()].state == ThreadState::Running;
        let queue_consistent = self.threads.iter().all(|tcb| {
            let queued = self.ready.contains(tcb.tid);
            queued == (tcb.state == ThreadState::Ready)
        });
        let stacks_consistent = self
            .threads
            .iter()
            .skip(1)
            .all(|tcb| tcb.stack.is_some() == !tcb.is_unused());
        let main_awake = !self.threads[0].state.is_sleeping();

        running == 1 && current_running && queue_consistent && stacks_consistent && main_awake
    }
}

impl<const MAX: usize> Default for Scheduler<MAX> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const STACK: usize = 16 * 1024;

    fn noop() {}

    fn spawn<const MAX: usize>(scheduler: &mut Scheduler<MAX>) -> Result<Tid> {
        scheduler.spawn(Some(noop), STACK, |_, _| Context::empty())
    }

    fn queued<const MAX: usize>(scheduler: &Scheduler<MAX>) -> Vec<usize> {
        scheduler.ready_queue().iter().map(|tid| tid.raw()).collect()
    }

    #[test]
    fn starts_with_main_running() {
        let scheduler = Scheduler::<4>::new();
        assert_eq!(scheduler.current(), Tid::MAIN);
        assert_eq!(scheduler.total_quanta(), 1);
        assert_eq!(scheduler.quanta_for(Tid::MAIN).unwrap(), 1);
        assert_eq!(scheduler.state_of(Tid::MAIN).unwrap(), ThreadState::Running);
        assert!(scheduler.invariants_hold());
    }

    #[test]
    fn spawn_fills_table_then_fails() {
        let mut scheduler = Scheduler::<4>::new();
        assert!(matches!(
            scheduler.spawn(None, STACK, |_, _| Context::empty()),
            Err(Error::NoEntryPoint)
        ));
        let tids: Vec<_> = (0..3).map(|_| spawn(&mut scheduler).unwrap().raw()).collect();
        assert_eq!(tids, vec![1, 2, 3]);
        assert!(matches!(spawn(&mut scheduler), Err(Error::TableFull)));
        assert_eq!(queued(&scheduler), vec![1, 2, 3]);
        assert_eq!(scheduler.quanta_for(Tid::new(2)).unwrap(), 0);
        assert!(scheduler.invariants_hold());
    }

    #[test]
    fn freed_slot_is_reused() {
        let mut scheduler = Scheduler::<4>::new();
        for _ in 0..3 {
            spawn(&mut scheduler).unwrap();
        }
        assert_eq!(scheduler.terminate(Tid::new(2)).unwrap(), Termination::Removed);
        assert_eq!(spawn(&mut scheduler).unwrap(), Tid::new(2));
        assert_eq!(queued(&scheduler), vec![1, 3, 2]);
    }

    #[test]
    fn round_robin_in_fifo_order() {
        let mut scheduler = Scheduler::<5>::new();
        for _ in 0..3 {
            spawn(&mut scheduler).unwrap();
        }

        let order: Vec<_> = (0..8).map(|_| scheduler.schedule().to.raw()).collect();
        assert_eq!(order, vec![1, 2, 3, 0, 1, 2, 3, 0]);
        assert_eq!(scheduler.total_quanta(), 9);
        for raw in 1..=3 {
            assert_eq!(scheduler.quanta_for(Tid::new(raw)).unwrap(), 2);
        }
        assert_eq!(scheduler.quanta_for(Tid::MAIN).unwrap(), 3);
        assert!(scheduler.invariants_hold());
    }

    #[test]
    fn lone_main_reschedules_itself() {
        let mut scheduler = Scheduler::<2>::new();
        let switch = scheduler.schedule();
        assert!(switch.is_noop());
        assert_eq!(scheduler.quanta_for(Tid::MAIN).unwrap(), 2);
        assert_eq!(scheduler.total_quanta(), 2);
    }

    #[test]
    fn sleeper_wakes_at_deadline() {
        let mut scheduler = Scheduler::<3>::new();
        let sleeper = spawn(&mut scheduler).unwrap();
        assert_eq!(scheduler.schedule().to, sleeper);

        let started = scheduler.total_quanta();
        assert_eq!(scheduler.sleep(3).unwrap(), Suspend::Reschedule);
        assert_eq!(scheduler.thread(sleeper).unwrap().wake_at, started + 3);

        while scheduler.total_quanta() < started + 3 {
            assert_eq!(scheduler.schedule().to, Tid::MAIN);
            assert_eq!(scheduler.state_of(sleeper).unwrap(), ThreadState::Sleeping);
        }
        assert_eq!(scheduler.schedule().to, sleeper);
        assert_eq!(scheduler.total_quanta(), started + 4);
        assert_eq!(scheduler.thread(sleeper).unwrap().wake_at, 0);
        assert!(scheduler.invariants_hold());
    }

    #[test]
    fn woken_sleeper_queues_ahead_of_preempted_thread() {
        let mut scheduler = Scheduler::<4>::new();
        let a = spawn(&mut scheduler).unwrap();
        let b = spawn(&mut scheduler).unwrap();
        assert_eq!(scheduler.schedule().to, a);
        scheduler.sleep(1).unwrap();
        assert_eq!(scheduler.schedule().to, b);
        // `a` wakes before `b` is requeued.
        scheduler.schedule();
        assert_eq!(queued(&scheduler), vec![a.raw(), b.raw()]);
    }

    #[test]
    fn invalid_sleep_requests() {
        let mut scheduler = Scheduler::<3>::new();
        assert!(matches!(scheduler.sleep(2), Err(Error::InvalidSleep)));
        spawn(&mut scheduler).unwrap();
        scheduler.schedule();
        assert!(matches!(scheduler.sleep(0), Err(Error::InvalidSleep)));
        assert_eq!(scheduler.state_of(Tid::new(1)).unwrap(), ThreadState::Running);
    }

    #[test]
    fn block_is_idempotent_and_resume_requeues() {
        let mut scheduler = Scheduler::<4>::new();
        let a = spawn(&mut scheduler).unwrap();
        let b = spawn(&mut scheduler).unwrap();

        assert_eq!(scheduler.block(a).unwrap(), Suspend::Continue);
        assert_eq!(scheduler.block(a).unwrap(), Suspend::Continue);
        assert_eq!(scheduler.state_of(a).unwrap(), ThreadState::Blocked);
        assert_eq!(queued(&scheduler), vec![b.raw()]);

        scheduler.resume(a).unwrap();
        scheduler.resume(a).unwrap();
        scheduler.resume(b).unwrap();
        assert_eq!(queued(&scheduler), vec![b.raw(), a.raw()]);
        assert!(scheduler.invariants_hold());
    }

    #[test]
    fn blocking_self_requests_reschedule() {
        let mut scheduler = Scheduler::<3>::new();
        let a = spawn(&mut scheduler).unwrap();
        scheduler.schedule();
        assert_eq!(scheduler.block(a).unwrap(), Suspend::Reschedule);
        let switch = scheduler.schedule();
        assert_eq!(switch, Switch { from: a, to: Tid::MAIN });
        assert_eq!(scheduler.state_of(a).unwrap(), ThreadState::Blocked);
        assert!(!scheduler.ready_queue().contains(a));
    }

    #[test]
    fn invalid_tids_are_rejected() {
        let mut scheduler = Scheduler::<3>::new();
        assert!(matches!(scheduler.block(Tid::MAIN), Err(Error::InvalidTid(_))));
        assert!(matches!(scheduler.block(Tid::new(1)), Err(Error::InvalidTid(_))));
        assert!(matches!(scheduler.resume(Tid::new(2)), Err(Error::InvalidTid(_))));
        assert!(matches!(scheduler.terminate(Tid::new(1)), Err(Error::InvalidTid(_))));
        assert!(matches!(scheduler.quanta_for(Tid::new(1)), Err(Error::InvalidTid(_))));
        assert!(matches!(scheduler.quanta_for(Tid::new(99)), Err(Error::InvalidTid(_))));
        assert!(scheduler.resume(Tid::MAIN).is_ok());
    }

    #[test]
    fn resume_alone_does_not_wake_a_sleeper() {
        let mut scheduler = Scheduler::<3>::new();
        let a = spawn(&mut scheduler).unwrap();
        scheduler.schedule();
        let started = scheduler.total_quanta();
        scheduler.sleep(2).unwrap();
        scheduler.schedule();

        scheduler.block(a).unwrap();
        assert_eq!(scheduler.state_of(a).unwrap(), ThreadState::SleepBlocked);
        scheduler.resume(a).unwrap();
        assert_eq!(scheduler.state_of(a).unwrap(), ThreadState::Sleeping);
        assert!(!scheduler.ready_queue().contains(a));

        while scheduler.total_quanta() <= started + 2 {
            scheduler.schedule();
        }
        assert_ne!(scheduler.state_of(a).unwrap(), ThreadState::Sleeping);
        assert!(scheduler.quanta_for(a).unwrap() >= 2);
    }

    #[test]
    fn sleeping_blocked_thread_needs_resume_after_deadline() {
        let mut scheduler = Scheduler::<3>::new();
        let a = spawn(&mut scheduler).unwrap();
        scheduler.schedule();
        scheduler.sleep(1).unwrap();
        scheduler.schedule();
        scheduler.block(a).unwrap();

        for _ in 0..3 {
            assert_eq!(scheduler.schedule().to, Tid::MAIN);
        }
        assert_eq!(scheduler.state_of(a).unwrap(), ThreadState::Blocked);
        scheduler.resume(a).unwrap();
        assert_eq!(scheduler.schedule().to, a);
    }

    #[test]
    fn self_termination_parks_stack_and_runs_next_in_fifo() {
        let mut scheduler = Scheduler::<4>::new();
        let a = spawn(&mut scheduler).unwrap();
        let b = spawn(&mut scheduler).unwrap();
        assert_eq!(scheduler.schedule().to, a);

        assert_eq!(scheduler.terminate(a).unwrap(), Termination::SelfTerminated);
        assert!(matches!(scheduler.state_of(a), Err(Error::InvalidTid(_))));
        let switch = scheduler.schedule();
        assert_eq!(switch, Switch { from: a, to: b });
        assert!(scheduler.take_released().is_some());
        assert!(scheduler.take_released().is_none());
        assert!(scheduler.invariants_hold());
    }

    #[test]
    fn terminating_main_requests_shutdown() {
        let mut scheduler = Scheduler::<3>::new();
        let a = spawn(&mut scheduler).unwrap();
        scheduler.schedule();
        assert_eq!(scheduler.terminate(Tid::MAIN).unwrap(), Termination::Process);
        assert!(scheduler.shutdown_requested());

        let switch = scheduler.hand_off_to_main();
        assert_eq!(switch, Switch { from: a, to: Tid::MAIN });
        assert_eq!(scheduler.current(), Tid::MAIN);
        assert_eq!(scheduler.release_all(), 1);
        assert!(scheduler.ready_queue().is_empty());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Spawn,
        Tick,
        Block(usize),
        Resume(usize),
        Sleep(u64),
        Terminate(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Spawn),
            Just(Op::Tick),
            (1usize..6).prop_map(Op::Block),
            (0usize..6).prop_map(Op::Resume),
            (1u64..4).prop_map(Op::Sleep),
            (1usize..6).prop_map(Op::Terminate),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn invariants_survive_any_operation_sequence(ops in proptest::collection::vec(op(), 1..48)) {
            let mut scheduler = Scheduler::<6>::new();
            let mut last_total = scheduler.total_quanta();
            for op in ops {
                let suspend = match op {
                    Op::Spawn => { let _ = spawn(&mut scheduler); Suspend::Continue }
                    Op::Tick => Suspend::Reschedule,
                    Op::Block(raw) => scheduler.block(Tid::new(raw)).unwrap_or(Suspend::Continue),
                    Op::Resume(raw) => { let _ = scheduler.resume(Tid::new(raw)); Suspend::Continue }
                    Op::Sleep(quanta) => scheduler.sleep(quanta).unwrap_or(Suspend::Continue),
                    Op::Terminate(raw) => match scheduler.terminate(Tid::new(raw)) {
                        Ok(Termination::SelfTerminated) => Suspend::Reschedule,
                        _ => Suspend::Continue,
                    },
                };
                if suspend == Suspend::Reschedule {
                    scheduler.schedule();
                    drop(scheduler.take_released());
                }
                prop_assert!(scheduler.invariants_hold());
                prop_assert!(scheduler.total_quanta() >= last_total);
                last_total = scheduler.total_quanta();
            }
        }
    }
}
