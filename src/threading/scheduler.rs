use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::MAX_THREADS;

use super::thread::{Thread, ThreadId};

/// The process-wide binary mutex: unlocked, or locked by one live thread.
#[derive(Debug, Default)]
struct MutexState {
    holder: Option<ThreadId>,
}

/// Bookkeeping for every live logical thread and the queues that decide
/// which one runs next. Mutated only while the preemption signal cannot
/// fire: under the mask in a public operation, or inside the timer
/// handler.
#[derive(Debug)]
pub struct Scheduler {
    /// Map between thread id and thread record.
    threads: BTreeMap<ThreadId, Thread>,
    /// Threads waiting for the processor, in arrival order. The running
    /// thread is never in this queue. Capacity is reserved up front so
    /// handler-side pushes never allocate.
    ready: VecDeque<ThreadId>,
    /// Threads suspended by an explicit block.
    blocked: BTreeSet<ThreadId>,
    /// Threads that hit a held mutex, in first-attempt order.
    mutex_line: VecDeque<ThreadId>,
    /// Ids not assigned to any live thread, lowest first.
    free_ids: BTreeSet<ThreadId>,
    /// Thread currently holding the processor.
    current_id: ThreadId,
    mutex: MutexState,
    /// Record of a thread that terminated itself. Its stack is the one
    /// control is jumping off of, so the drop is deferred to the next
    /// switch, which runs on a live thread's stack.
    graveyard: Option<Thread>,
    /// Quantums accumulated by threads that no longer exist.
    retired_quantums: usize,
}

impl Scheduler {
    pub fn new() -> Self {
        let main = Thread::bootstrap();
        let mut threads = BTreeMap::new();
        threads.insert(main.id(), main);
        Self {
            threads,
            ready: VecDeque::with_capacity(MAX_THREADS),
            blocked: BTreeSet::new(),
            mutex_line: VecDeque::with_capacity(MAX_THREADS),
            free_ids: (1..MAX_THREADS).map(ThreadId::new).collect(),
            current_id: ThreadId::MAIN,
            mutex: MutexState::default(),
            graveyard: None,
            retired_quantums: 0,
        }
    }

    /// Draw the lowest free id and file a new thread at the ready tail.
    /// `None` when every id is taken.
    pub fn create_thread(&mut self, entry: fn(), trampoline: extern "C" fn()) -> Option<ThreadId> {
        let id = self.free_ids.pop_first()?;
        self.threads.insert(id, Thread::new(id, entry, trampoline));
        self.ready.push_back(id);
        Some(id)
    }

    /// Whether a thread with `id` exists.
    pub fn contains(&self, id: ThreadId) -> bool {
        self.threads.contains_key(&id)
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(&id)
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(&id)
    }

    /// Id of the running thread.
    pub fn current_id(&self) -> ThreadId {
        self.current_id
    }

    pub fn current_thread_mut(&mut self) -> &mut Thread {
        self.threads
            .get_mut(&self.current_id)
            .expect("running thread has no record")
    }

    /// File `id` at the ready tail unless it is running, already queued,
    /// waiting on the mutex, or blocked. Threads are sent back to ready
    /// from several paths and must not be queued twice.
    pub fn enqueue_ready(&mut self, id: ThreadId) {
        if id != self.current_id
            && !self.ready.contains(&id)
            && !self.mutex_line.contains(&id)
            && !self.blocked.contains(&id)
        {
            self.ready.push_back(id);
        }
    }

    /// The head of the ready queue becomes the running thread.
    pub fn pop_next_running(&mut self) -> Option<ThreadId> {
        let next = self.ready.pop_front()?;
        self.current_id = next;
        Some(next)
    }

    /// Whether any thread is waiting for the processor.
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Suspend `id` until an explicit resume. A mutex-line entry stays in
    /// place; `advance_mutex_line` skips blocked waiters.
    pub fn block(&mut self, id: ThreadId) {
        self.blocked.insert(id);
        self.ready.retain(|&t| t != id);
    }

    /// Lift an explicit block. Returns false for an unknown id. Resuming
    /// a running, ready, or mutex-waiting thread is a no-op success.
    pub fn resume(&mut self, id: ThreadId) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.blocked.remove(&id);
        self.enqueue_ready(id);
        true
    }

    /// Join the mutex line. The caller switches away afterwards; its slot
    /// in line survives re-attempts.
    pub fn wait_for_mutex(&mut self, id: ThreadId) {
        if !self.mutex_line.contains(&id) {
            self.mutex_line.push_back(id);
        }
    }

    /// Ready the first mutex waiter that is not blocked. When every
    /// waiter is blocked, the head waiter leaves the line without being
    /// readied; it re-attempts the lock when resumed.
    pub fn advance_mutex_line(&mut self) {
        if let Some(pos) = self
            .mutex_line
            .iter()
            .position(|id| !self.blocked.contains(id))
        {
            let id = self.mutex_line.remove(pos).expect("position out of range");
            self.ready.push_back(id);
        } else {
            self.mutex_line.pop_front();
        }
    }

    pub fn mutex_holder(&self) -> Option<ThreadId> {
        self.mutex.holder
    }

    /// Take the mutex. Precondition: it is unlocked.
    pub fn lock_mutex(&mut self, id: ThreadId) {
        debug_assert!(self.mutex.holder.is_none());
        self.mutex.holder = Some(id);
    }

    /// Release the mutex and let the line advance.
    pub fn unlock_mutex(&mut self) {
        self.mutex.holder = None;
        self.advance_mutex_line();
    }

    /// Remove `id` from every structure and recycle its id, releasing the
    /// mutex if `id` holds it. Returns the record so the caller decides
    /// whether it can be dropped here or must outlive the switch off its
    /// stack.
    pub fn terminate(&mut self, id: ThreadId) -> Option<Thread> {
        let record = self.threads.remove(&id)?;
        self.ready.retain(|&t| t != id);
        self.blocked.remove(&id);
        self.mutex_line.retain(|&t| t != id);
        self.free_ids.insert(id);
        self.retired_quantums += record.quantums();
        if self.mutex.holder == Some(id) {
            self.unlock_mutex();
        }
        Some(record)
    }

    /// Terminate the running thread's record but keep it alive until the
    /// next switch reaps it from another stack.
    pub fn retire(&mut self, id: ThreadId) {
        self.graveyard = self.terminate(id);
    }

    /// Drop a retired record. Only called while control is on a live
    /// thread's stack.
    pub fn reap(&mut self) {
        self.graveyard = None;
    }

    /// Quantums accumulated by threads that have terminated.
    pub fn retired_quantums(&self) -> usize {
        self.retired_quantums
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn trampoline_stub() {}

    fn entry_stub() {}

    fn spawn_one(s: &mut Scheduler) -> ThreadId {
        s.create_thread(entry_stub, trampoline_stub)
            .expect("out of ids")
    }

    fn check_invariants(s: &Scheduler) {
        let live: BTreeSet<_> = s.threads.keys().copied().collect();
        assert!(live.is_disjoint(&s.free_ids));
        assert_eq!(live.len() + s.free_ids.len(), MAX_THREADS);
        assert!(!s.ready.contains(&s.current_id));
        assert!(!s.blocked.contains(&s.current_id));
        assert!(!s.mutex_line.contains(&s.current_id));
        assert!(s.ready.iter().all(|id| !s.blocked.contains(id)));
        assert!(s.ready.iter().all(|id| !s.mutex_line.contains(id)));
        if let Some(holder) = s.mutex.holder {
            assert!(s.contains(holder));
        }
    }

    #[test]
    fn ids_allocate_lowest_first_and_recycle() {
        let mut s = Scheduler::new();
        let a = spawn_one(&mut s);
        let b = spawn_one(&mut s);
        let c = spawn_one(&mut s);
        assert_eq!(
            [a, b, c].map(ThreadId::as_usize),
            [1, 2, 3],
            "ids are granted lowest-first"
        );
        s.terminate(b);
        assert_eq!(spawn_one(&mut s), b);
        check_invariants(&s);
    }

    #[test]
    fn spawn_refused_at_capacity() {
        let mut s = Scheduler::new();
        for _ in 1..MAX_THREADS {
            spawn_one(&mut s);
        }
        assert!(s.create_thread(entry_stub, trampoline_stub).is_none());
        check_invariants(&s);
    }

    #[test]
    fn ready_queue_never_holds_duplicates() {
        let mut s = Scheduler::new();
        let a = spawn_one(&mut s);
        s.enqueue_ready(a);
        s.enqueue_ready(a);
        assert_eq!(s.ready.iter().filter(|&&id| id == a).count(), 1);
        // the running thread never joins the queue
        s.enqueue_ready(s.current_id());
        assert!(!s.ready.contains(&ThreadId::MAIN));
    }

    #[test]
    fn blocked_thread_stays_off_the_ready_queue() {
        let mut s = Scheduler::new();
        let a = spawn_one(&mut s);
        s.block(a);
        assert!(!s.ready.contains(&a));
        s.enqueue_ready(a);
        assert!(!s.ready.contains(&a));
        assert!(s.resume(a));
        assert!(s.ready.contains(&a));
        check_invariants(&s);
    }

    #[test]
    fn resume_is_a_no_op_on_ready_and_running_threads() {
        let mut s = Scheduler::new();
        let a = spawn_one(&mut s);
        assert!(s.resume(a));
        assert_eq!(s.ready.iter().filter(|&&id| id == a).count(), 1);
        assert!(s.resume(s.current_id()));
        assert!(!s.ready.contains(&ThreadId::MAIN));
        assert!(!s.resume(ThreadId::new(7)));
    }

    #[test]
    fn mutex_line_releases_in_arrival_order() {
        let mut s = Scheduler::new();
        let a = spawn_one(&mut s);
        let b = spawn_one(&mut s);
        s.lock_mutex(ThreadId::MAIN);
        // a runs and queues on the mutex, then b does the same
        s.pop_next_running();
        s.enqueue_ready(ThreadId::MAIN);
        s.wait_for_mutex(a);
        s.pop_next_running();
        s.wait_for_mutex(b);
        s.pop_next_running();
        assert_eq!(s.current_id(), ThreadId::MAIN);

        s.unlock_mutex();
        assert_eq!(s.ready.back(), Some(&a));
        assert_eq!(s.mutex_line.front(), Some(&b));
        check_invariants(&s);
    }

    #[test]
    fn blocked_waiters_are_skipped_on_release() {
        let mut s = Scheduler::new();
        let a = spawn_one(&mut s);
        let b = spawn_one(&mut s);
        s.lock_mutex(ThreadId::MAIN);
        s.pop_next_running();
        s.enqueue_ready(ThreadId::MAIN);
        s.wait_for_mutex(a);
        s.pop_next_running();
        s.wait_for_mutex(b);
        s.pop_next_running();

        s.block(a);
        s.unlock_mutex();
        assert_eq!(s.ready.back(), Some(&b), "the unblocked waiter goes next");
        assert_eq!(s.mutex_line.front(), Some(&a), "the blocked waiter keeps its slot");
    }

    #[test]
    fn all_blocked_waiters_drop_the_head_of_the_line() {
        let mut s = Scheduler::new();
        let a = spawn_one(&mut s);
        let b = spawn_one(&mut s);
        s.lock_mutex(ThreadId::MAIN);
        s.pop_next_running();
        s.enqueue_ready(ThreadId::MAIN);
        s.wait_for_mutex(a);
        s.pop_next_running();
        s.wait_for_mutex(b);
        s.pop_next_running();

        s.block(a);
        s.block(b);
        s.unlock_mutex();
        assert!(s.ready.is_empty(), "nothing gets readied");
        assert_eq!(
            s.mutex_line.iter().copied().collect::<Vec<_>>(),
            [b],
            "the head waiter leaves the line and will re-lock on resume"
        );
        assert_eq!(s.mutex_holder(), None);
    }

    #[test]
    fn waiting_twice_keeps_one_slot_in_line() {
        let mut s = Scheduler::new();
        let a = spawn_one(&mut s);
        s.pop_next_running();
        s.wait_for_mutex(a);
        s.wait_for_mutex(a);
        assert_eq!(s.mutex_line.iter().filter(|&&id| id == a).count(), 1);
    }

    #[test]
    fn terminating_the_holder_releases_the_mutex() {
        let mut s = Scheduler::new();
        let a = spawn_one(&mut s);
        let b = spawn_one(&mut s);
        // a runs and takes the mutex, then b runs and queues on it
        s.pop_next_running();
        s.enqueue_ready(ThreadId::MAIN);
        s.lock_mutex(a);
        s.pop_next_running();
        s.enqueue_ready(a);
        s.wait_for_mutex(b);
        s.pop_next_running();
        assert_eq!(s.current_id(), ThreadId::MAIN);

        s.terminate(a);
        assert_eq!(s.mutex_holder(), None);
        assert!(s.ready.contains(&b), "the waiter advances on release");
        check_invariants(&s);
    }

    #[test]
    fn terminate_clears_every_structure() {
        let mut s = Scheduler::new();
        let a = spawn_one(&mut s);
        let b = spawn_one(&mut s);
        s.block(b);
        assert!(s.terminate(a).is_some());
        assert!(s.terminate(b).is_some());
        assert!(s.terminate(b).is_none(), "terminating twice finds nothing");
        assert!(s.ready.is_empty());
        assert!(s.blocked.is_empty());
        check_invariants(&s);
    }

    #[test]
    fn round_robin_rotation_is_fair() {
        let mut s = Scheduler::new();
        spawn_one(&mut s);
        spawn_one(&mut s);
        for _ in 0..9 {
            let outgoing = s.current_id();
            s.pop_next_running().expect("ready queue empty");
            s.enqueue_ready(outgoing);
            s.current_thread_mut().start_quantum();
        }
        let counts: Vec<_> = s.threads.values().map(Thread::quantums).collect();
        let lowest = counts.iter().min().unwrap();
        let highest = counts.iter().max().unwrap();
        assert!(highest - lowest <= 1, "rotation drifted: {counts:?}");
    }

    #[test]
    fn quantum_bookkeeping_survives_termination() {
        let mut s = Scheduler::new();
        let a = spawn_one(&mut s);
        spawn_one(&mut s);
        let mut total = 1; // the init quantum
        for _ in 0..6 {
            let outgoing = s.current_id();
            s.pop_next_running().expect("ready queue empty");
            s.enqueue_ready(outgoing);
            s.current_thread_mut().start_quantum();
            total += 1;
        }
        s.terminate(a);
        let live: usize = s.threads.values().map(Thread::quantums).sum();
        assert_eq!(live + s.retired_quantums(), total);
    }
}
