use crate::config::Config;
use crate::error::AllocError;
use crate::memory::HPBRManager;
use rand::Rng;
use std::alloc::{self, Layout};
use std::cmp;
use std::fmt;
use std::hint;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

// Hazard pointer slots used by each thread.
const HEAD_HAZARD: usize = 0;
const NEXT_HAZARD: usize = 1;
const TAIL_HAZARD: usize = 0;
const NUM_HAZARDS: usize = 2;

/// A lock-free Michael-Scott queue.
///
/// This queue is an implementation of that described in [Simple, Fast, and Practical
/// Non-blocking and Blocking Concurrent Queue Algorithms](https://dl.acm.org/citation.cfm?id=248106).
/// It is implemented as a linked-list of nodes headed by a sentinel node. `head` always points
/// at the sentinel and `tail` at the last node, or at a node shortly before it: `tail` is allowed
/// to lag behind and is swung forward by whichever thread notices.
///
/// Nodes removed by a dequeue are retired to a hazard pointer manager, which only frees them
/// once no other thread can still be reading them.
pub struct Queue<T: Send> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
    manager: HPBRManager<Node<T>>,
    config: Config,
    _marker: PhantomData<T>,
}

// Values only ever move between threads whole, never shared, so T: Sync isn't needed.
unsafe impl<T: Send> Sync for Queue<T> {}

struct Node<T> {
    // Uninitialised in the sentinel, and in every node once its value was dequeued.
    value: MaybeUninit<T>,
    next: AtomicPtr<Node<T>>,
}

impl<T: Send> Queue<T> {
    /// Create a new Queue.
    /// # Examples
    /// ```
    /// # use lockfree_queue::structures::Queue;
    /// let queue: Queue<String> = Queue::new();
    /// ```
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Create a new Queue with the given tuning.
    /// # Examples
    /// ```
    /// # use lockfree_queue::{Config, Queue};
    /// let queue: Queue<String> = Queue::with_config(Config::new().set_max_retired(10));
    /// ```
    pub fn with_config(config: Config) -> Self {
        debug!("creating queue with {:?}", config);
        let dummy_node = Box::into_raw(Box::new(Node::new_dummy_node()));
        Queue {
            head: AtomicPtr::new(dummy_node),
            tail: AtomicPtr::new(dummy_node),
            manager: HPBRManager::new(config.get_max_retired(), NUM_HAZARDS),
            config,
            _marker: PhantomData,
        }
    }

    fn backoff(&self, backoff: u32) -> u32 {
        let max_backoff = self.config.get_max_backoff();
        if max_backoff == 0 {
            return 0;
        }
        let spins = rand::thread_rng().gen_range(0..backoff.max(1));
        for _ in 0..spins {
            hint::spin_loop();
        }
        cmp::min(backoff.saturating_mul(2), max_backoff)
    }

    /// Add a new element to the back of the queue.
    ///
    /// Aborts through [`handle_alloc_error`](std::alloc::handle_alloc_error) if the node can't
    /// be allocated, use [`try_enqueue`](Queue::try_enqueue) to get the value back instead.
    /// # Examples
    /// ```
    /// # use lockfree_queue::structures::Queue;
    /// let queue: Queue<String> = Queue::new();
    /// queue.enqueue("hello".to_owned());
    /// ```
    pub fn enqueue(&self, val: T) {
        if self.try_enqueue(val).is_err() {
            alloc::handle_alloc_error(Layout::new::<Node<T>>());
        }
    }

    /// Add a new element to the back of the queue, returning it inside an [`AllocError`] if no
    /// memory was available for its node.
    /// # Examples
    /// ```
    /// # use lockfree_queue::structures::Queue;
    /// let queue: Queue<u32> = Queue::new();
    /// assert!(queue.try_enqueue(5).is_ok());
    /// assert_eq!(queue.dequeue(), Some(5));
    /// ```
    pub fn try_enqueue(&self, val: T) -> Result<(), AllocError<T>> {
        let node = Node::allocate(val).map_err(|val| {
            warn!("queue node allocation failed");
            AllocError(val)
        })?;

        let mut backoff = 1;
        while !self.try_link(node) {
            backoff = self.backoff(backoff);
        }
        Ok(())
    }

    /// One attempt at linking `node` after the last node. Returns true once it is linked.
    fn try_link(&self, node: *mut Node<T>) -> bool {
        let tail = self.tail.load(Ordering::Acquire);
        self.manager.protect(tail, TAIL_HAZARD);
        // Is the tail still consistent? Required for the hazard pointer to work
        if !ptr::eq(tail, self.tail.load(Ordering::SeqCst)) {
            return false;
        }
        let next = unsafe { (*tail).next.load(Ordering::Acquire) };
        if !ptr::eq(tail, self.tail.load(Ordering::Acquire)) {
            return false;
        }

        // Is the tail actually the end of the queue?
        if !next.is_null() {
            // If it isn't, help whoever linked next and retry
            let _ = self
                .tail
                .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
            return false;
        }

        // Try to CAS our node onto the end of the queue
        let linked = unsafe {
            (*tail)
                .next
                .compare_exchange(ptr::null_mut(), node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
        };
        if linked {
            // Swing the tail, if this fails someone else already has
            let _ = self
                .tail
                .compare_exchange(tail, node, Ordering::Release, Ordering::Relaxed);
            self.manager.unprotect(TAIL_HAZARD);
        }
        linked
    }

    /// Take an element from the front of the queue, or return None if the queue is empty.
    /// # Examples
    /// ```
    /// # use lockfree_queue::structures::Queue;
    /// let queue: Queue<String> = Queue::new();
    /// queue.enqueue("hello".to_owned());
    /// assert_eq!(queue.dequeue(), Some("hello".to_owned()));
    /// assert_eq!(queue.dequeue(), None);
    /// ```
    pub fn dequeue(&self) -> Option<T> {
        let mut backoff = 1;
        loop {
            if let Ok(val) = self.try_dequeue() {
                return val;
            }
            backoff = self.backoff(backoff);
        }
    }

    fn try_dequeue(&self) -> Result<Option<T>, ()> {
        let head = self.head.load(Ordering::Acquire);
        self.manager.protect(head, HEAD_HAZARD);
        if !ptr::eq(head, self.head.load(Ordering::SeqCst)) {
            return Err(());
        }

        let tail = self.tail.load(Ordering::Acquire);
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        self.manager.protect(next, NEXT_HAZARD);
        // While head is still the head, next is its successor and can't have been retired
        if !ptr::eq(head, self.head.load(Ordering::SeqCst)) {
            return Err(());
        }

        if ptr::eq(head, tail) {
            if next.is_null() {
                self.manager.unprotect(NEXT_HAZARD);
                self.manager.unprotect(HEAD_HAZARD);
                return Ok(None);
            }
            // Tail is lagging behind, help it along before taking anything
            let _ = self
                .tail
                .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
            return Err(());
        }

        if next.is_null() {
            return Err(());
        }

        match self
            .head
            .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                // next is the new sentinel. Only the thread that won the CAS reads its value,
                // and NEXT_HAZARD keeps it alive until then.
                let data = unsafe { ptr::read((*next).value.as_ptr()) };
                self.manager.unprotect(NEXT_HAZARD);
                self.manager.retire(head, HEAD_HAZARD);
                Ok(Some(data))
            }
            Err(_) => Err(()),
        }
    }

    /// Whether the queue held no elements at the instant it was observed.
    ///
    /// Other threads may have changed that by the time this returns.
    pub fn is_empty(&self) -> bool {
        loop {
            let head = self.head.load(Ordering::Acquire);
            self.manager.protect(head, HEAD_HAZARD);
            if ptr::eq(head, self.head.load(Ordering::SeqCst)) {
                let empty = unsafe { (*head).next.load(Ordering::Acquire).is_null() };
                self.manager.unprotect(HEAD_HAZARD);
                return empty;
            }
        }
    }
}

impl<T: Send> Default for Queue<T> {
    fn default() -> Self {
        Queue::new()
    }
}

impl<T: Send> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Queue")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("config", &self.config)
            .finish()
    }
}

impl<T: Send> Drop for Queue<T> {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        // The first node is the sentinel and holds no value
        let mut is_sentinel = true;
        while !current.is_null() {
            unsafe {
                let mut node = Box::from_raw(current);
                if !is_sentinel {
                    ptr::drop_in_place(node.value.as_mut_ptr());
                }
                current = *node.next.get_mut();
            }
            is_sentinel = false;
        }
    }
}

impl<T> Node<T> {
    fn new(value: T) -> Self {
        Node {
            value: MaybeUninit::new(value),
            next: AtomicPtr::default(),
        }
    }

    fn new_dummy_node() -> Self {
        Node {
            value: MaybeUninit::uninit(),
            next: AtomicPtr::default(),
        }
    }

    /// Allocate a node holding `value` on the heap, handing the value back if the allocator
    /// fails. The node can later be released with `Box::from_raw`.
    fn allocate(value: T) -> Result<*mut Self, T> {
        let layout = Layout::new::<Self>();
        let node_ptr = unsafe { alloc::alloc(layout) } as *mut Self;
        if node_ptr.is_null() {
            return Err(value);
        }
        unsafe {
            node_ptr.write(Node::new(value));
        }
        Ok(node_ptr)
    }
}

#[cfg(test)]
mod tests {
    use im::Vector;
    use rand::{thread_rng, Rng};

    use super::Queue;
    use crate::config::Config;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use crate::testing::{LinearizabilityResult, LinearizabilityTester, ThreadLog};

    #[derive(Debug)]
    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_queue_single_threaded() {
        let queue: Queue<u8> = Queue::new();
        queue.enqueue(8);
        unsafe {
            let head = (*queue.head.load(Ordering::Relaxed)).next.load(Ordering::Relaxed);
            assert_eq!(*(*head).value.as_ptr(), 8);
        }
        queue.enqueue(7);
        assert_eq!(queue.dequeue(), Some(8));
        assert_eq!(queue.dequeue(), Some(7));
        assert_eq!(queue.dequeue(), None);

        for i in 0..100 {
            queue.enqueue(i);
        }
        for i in 0..100 {
            assert_eq!(queue.dequeue(), Some(i));
        }
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_sequential_fifo() {
        let queue: Queue<u32> = Queue::new();
        queue.enqueue(1);
        queue.enqueue(2);
        queue.enqueue(3);
        assert_eq!(queue.dequeue(), Some(1));
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), Some(3));
    }

    #[test]
    fn test_empty() {
        let queue: Queue<String> = Queue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), None);

        queue.enqueue("x".to_owned());
        assert!(!queue.is_empty());
        assert_eq!(queue.dequeue(), Some("x".to_owned()));
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_empty());
        assert!(ptr_eq_head_tail(&queue));
    }

    fn ptr_eq_head_tail<T: Send>(queue: &Queue<T>) -> bool {
        queue.head.load(Ordering::SeqCst) == queue.tail.load(Ordering::SeqCst)
    }

    #[test]
    fn test_try_enqueue() {
        let queue: Queue<Vec<u8>> = Queue::default();
        assert!(queue.try_enqueue(vec![1, 2, 3]).is_ok());
        assert_eq!(queue.dequeue(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_remaining_values_dropped_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let queue: Queue<DropCounter> = Queue::with_config(Config::new().set_max_retired(2));
        for _ in 0..10 {
            queue.enqueue(DropCounter(drops.clone()));
        }
        for _ in 0..4 {
            assert!(queue.dequeue().is_some());
        }
        assert_eq!(drops.load(Ordering::SeqCst), 4);

        drop(queue);
        assert_eq!(drops.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_queue_multithreaded() {
        let queue: Arc<Queue<u32>> = Arc::new(Queue::new());
        let mut waitvec: Vec<thread::JoinHandle<()>> = Vec::new();

        for _ in 0..20 {
            let queue_copy = queue.clone();
            waitvec.push(thread::spawn(move || {
                for i in 0..10000 {
                    queue_copy.enqueue(i);
                }
            }));
            let queue_copy = queue.clone();
            waitvec.push(thread::spawn(move || {
                for _ in 0..10000 {
                    loop {
                        if queue_copy.dequeue().is_some() {
                            break;
                        }
                    }
                }
            }));
        }

        for handle in waitvec {
            handle.join().unwrap();
        }
        assert_eq!(None, queue.dequeue());
    }

    #[test]
    fn test_no_loss_no_duplication() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 20000;

        let queue: Arc<Queue<(usize, usize)>> = Arc::new(Queue::new());
        let producers_running = Arc::new(AtomicUsize::new(PRODUCERS));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let queue = queue.clone();
                let running = producers_running.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.enqueue((producer, i));
                    }
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = queue.clone();
                let running = producers_running.clone();
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    let mut last_seen = vec![None; PRODUCERS];
                    loop {
                        // Read the flag before dequeuing so a None really means drained
                        let done = running.load(Ordering::SeqCst) == 0;
                        match queue.dequeue() {
                            Some((producer, i)) => {
                                // A single consumer sees every producer's values in order
                                assert!(last_seen[producer].map_or(true, |last| last < i));
                                last_seen[producer] = Some(i);
                                taken.push((producer, i));
                            }
                            None if done => break,
                            None => {}
                        }
                    }
                    taken
                })
            })
            .collect();

        for handle in producers {
            handle.join().unwrap();
        }
        let mut seen = HashSet::new();
        for handle in consumers {
            for value in handle.join().unwrap() {
                assert!(seen.insert(value), "{:?} dequeued twice", value);
            }
        }
        assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reclamation_under_load() {
        let drops = Arc::new(AtomicUsize::new(0));
        let queue: Arc<Queue<DropCounter>> =
            Arc::new(Queue::with_config(Config::new().set_max_retired(0)));

        let workers: Vec<_> = (0..8)
            .map(|id| {
                let queue = queue.clone();
                let drops = drops.clone();
                thread::spawn(move || {
                    let mut enqueued: usize = 0;
                    for round in 0..5000 {
                        if (round + id) % 2 == 0 {
                            queue.enqueue(DropCounter(drops.clone()));
                            enqueued += 1;
                        } else {
                            drop(queue.dequeue());
                        }
                    }
                    enqueued
                })
            })
            .collect();

        let total: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();

        let queue = Arc::try_unwrap(queue).unwrap();
        drop(queue);
        assert_eq!(drops.load(Ordering::SeqCst), total);
    }

    #[test]
    fn test_linearizable() {
        let queue: Queue<usize> = Queue::new();
        let sequential: Vector<usize> = Vector::new();

        let linearizer: LinearizabilityTester<Queue<usize>, Vector<usize>, usize> =
            LinearizabilityTester::new(4, 1000000, queue, sequential);

        fn sequential_dequeue(queue: &Vector<usize>, _val: Option<usize>) -> (Vector<usize>, Option<usize>) {
            let mut queue = queue.clone();
            let res = queue.pop_front();
            (queue, res)
        }

        fn sequential_enqueue(queue: &Vector<usize>, val: Option<usize>) -> (Vector<usize>, Option<usize>) {
            let mut queue = queue.clone();
            if let Some(val) = val {
                queue.push_back(val);
            }
            (queue, None)
        }

        fn worker(_id: usize, log: &mut ThreadLog<Queue<usize>, Vector<usize>, usize>) {
            for _ in 0..500 {
                let rand = thread_rng().gen_range(0..101);
                if rand < 50 {
                    let val = thread_rng().gen();
                    log.log_val(Queue::enqueue, val, format!("enqueue: {}", val), sequential_enqueue);
                } else {
                    log.log(Queue::dequeue, "dequeue".to_owned(), sequential_dequeue);
                }
            }
        }

        let result = linearizer.run(worker);

        println!("{:?}", result);

        assert_eq!(result, LinearizabilityResult::Success);
    }
}
