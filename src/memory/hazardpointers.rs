use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::mem;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, Ordering};
use thread_local::ThreadLocal;

/// A hazard pointer based record manager.
///
/// Every thread owns `num_hp_per_thread` hazard pointers. Before dereferencing a shared record
/// a thread publishes it in one of them with [`protect`](HPBRManager::protect), and then checks
/// that the record is still reachable. Removed records are handed to
/// [`retire`](HPBRManager::retire); once a thread has more than `max_retired` of them it scans
/// every hazard pointer and frees the records nobody is protecting.
///
/// A record is never freed while it is protected, so its address can't be reused under a thread
/// that still holds it. This is what rules out the ABA problem for the structures built on top.
pub struct HPBRManager<T: Send> {
    thread_info: ThreadLocal<RefCell<ThreadLocalInfo<T>>>,
    head: AtomicPtr<HazardPointer<T>>,
    max_retired: usize,
    num_hp_per_thread: usize,
}

impl<T: Send> fmt::Debug for HPBRManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let retired = self
            .thread_info
            .get()
            .and_then(|cell| cell.try_borrow().ok().map(|info| info.retired_list.len()));

        f.debug_struct("HPBRManager")
            .field("head", &self.head)
            .field("max_retired", &self.max_retired)
            .field("num_hp_per_thread", &self.num_hp_per_thread)
            .field("local_retired", &retired)
            .finish()
    }
}

impl<T: Send> HPBRManager<T> {
    pub fn new(max_retired: usize, num_hp_per_thread: usize) -> Self {
        HPBRManager {
            thread_info: ThreadLocal::new(),
            head: AtomicPtr::default(),
            max_retired,
            num_hp_per_thread,
        }
    }

    fn allocate_hp(&self) -> *mut HazardPointer<T> {
        let new_hp_ptr = Box::into_raw(Box::new(HazardPointer::new()));

        // CAS push the new hazard pointer onto the global list.
        // Hazard pointers are only freed when the manager is dropped.
        loop {
            let old_head = self.head.load(Ordering::Acquire);
            unsafe {
                (*new_hp_ptr).next.store(old_head, Ordering::Relaxed);
            }
            if self
                .head
                .compare_exchange_weak(old_head, new_hp_ptr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        new_hp_ptr
    }

    /// Publish `record` in this thread's hazard pointer number `hazard_num`.
    ///
    /// The caller must re-read the location it loaded `record` from afterwards: the record is
    /// only safe to dereference if it was still reachable after it was protected.
    pub fn protect(&self, record: *mut T, hazard_num: usize) {
        let hazard = self.local_hazard(hazard_num);
        unsafe {
            (*hazard).protect(record);
        }
    }

    /// Clear this thread's hazard pointer number `hazard_num`.
    pub fn unprotect(&self, hazard_num: usize) {
        let hazard = self.local_hazard(hazard_num);
        unsafe {
            (*hazard).unprotect();
        }
    }

    /// Hand over a record that has been unlinked from the shared structure.
    ///
    /// Hazard pointer `hazard_num` is cleared, as it is usually the one that protected the
    /// record. The record must not be reachable by any thread that has not already protected it,
    /// and must not be retired twice.
    pub fn retire(&self, record: *mut T, hazard_num: usize) {
        self.unprotect(hazard_num);
        let should_scan = {
            let mut thread_info = self.local_info().borrow_mut();
            thread_info.retired_list.push(record);
            thread_info.retired_list.len() > self.max_retired
        };

        if should_scan {
            self.scan();
        }
    }

    /// Free every record retired by this thread that no hazard pointer protects.
    fn scan(&self) {
        // Pairs with the SeqCst store in HazardPointer::protect.
        fence(Ordering::SeqCst);

        let mut hazard_set: HashSet<*mut T> = HashSet::new();
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            unsafe {
                let hazard_pointer = &*current;
                let protected = hazard_pointer.protected.load(Ordering::SeqCst);
                if !protected.is_null() {
                    hazard_set.insert(protected);
                }
                current = hazard_pointer.next.load(Ordering::Acquire);
            }
        }

        // Split off the garbage first, dropping a record may reenter the manager.
        let garbage: Vec<*mut T> = {
            let mut thread_info = self.local_info().borrow_mut();
            let retired = mem::take(&mut thread_info.retired_list);
            let (kept, garbage): (Vec<*mut T>, Vec<*mut T>) = retired
                .into_iter()
                .partition(|record| hazard_set.contains(record));
            thread_info.retired_list = kept;
            trace!(
                "hazard pointer scan: freeing {} records, {} still protected",
                garbage.len(),
                thread_info.retired_list.len()
            );
            garbage
        };

        for record in garbage {
            unsafe { Self::free(record) };
        }
    }

    unsafe fn free(garbage: *mut T) {
        drop(Box::from_raw(garbage));
    }

    fn local_hazard(&self, hazard_num: usize) -> *mut HazardPointer<T> {
        self.local_info().borrow().local_hazards[hazard_num]
    }

    /// Get the thread local info. On first access from a thread this allocates its hazard
    /// pointers and adds them to the global list.
    fn local_info(&self) -> &RefCell<ThreadLocalInfo<T>> {
        self.thread_info.get_or(|| {
            let starting_hp = (0..self.num_hp_per_thread)
                .map(|_| self.allocate_hp())
                .collect();
            RefCell::new(ThreadLocalInfo::new(starting_hp))
        })
    }
}

impl<T: Send> Drop for HPBRManager<T> {
    fn drop(&mut self) {
        let mut freed = 0;
        for cell in self.thread_info.iter_mut() {
            for record in cell.get_mut().retired_list.drain(..) {
                unsafe { Self::free(record) };
                freed += 1;
            }
        }

        let mut current = *self.head.get_mut();
        while !current.is_null() {
            unsafe {
                let hazard_pointer = Box::from_raw(current);
                current = hazard_pointer.next.load(Ordering::Relaxed);
            }
        }
        debug!("hazard pointer manager dropped, freed {} retired records", freed);
    }
}

struct HazardPointer<T> {
    protected: AtomicPtr<T>,
    next: AtomicPtr<HazardPointer<T>>,
}

impl<T> HazardPointer<T> {
    fn new() -> Self {
        HazardPointer {
            protected: AtomicPtr::default(),
            next: AtomicPtr::default(),
        }
    }

    fn protect(&self, record: *mut T) {
        self.protected.store(record, Ordering::SeqCst);
    }

    fn unprotect(&self) {
        self.protected.store(ptr::null_mut(), Ordering::Release);
    }
}

struct ThreadLocalInfo<T> {
    local_hazards: Vec<*mut HazardPointer<T>>,
    retired_list: Vec<*mut T>,
}

// The retired records are owned by the manager and only touched by the owning thread, or by the
// manager's Drop once no thread can use it any more.
unsafe impl<T: Send> Send for ThreadLocalInfo<T> {}

impl<T> ThreadLocalInfo<T> {
    fn new(starting_hazards: Vec<*mut HazardPointer<T>>) -> Self {
        ThreadLocalInfo {
            local_hazards: starting_hazards,
            retired_list: Vec::new(),
        }
    }
}
