//! Queue configuration
//!

// default configs
const DEFAULT_MAX_RETIRED: usize = 100;
const DEFAULT_MAX_BACKOFF: u32 = 2048;

/// Tuning knobs for a [`Queue`](crate::structures::Queue).
///
/// ```
/// use lockfree_queue::{Config, Queue};
///
/// let config = Config::new().set_max_retired(64).set_max_backoff(512);
/// let queue: Queue<u8> = Queue::with_config(config);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    max_retired: usize,
    max_backoff: u32,
}

impl Config {
    pub fn new() -> Self {
        Config {
            max_retired: DEFAULT_MAX_RETIRED,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }

    /// set how many nodes a thread may hold retired before it scans the hazard pointers
    ///
    /// 0 means every retire triggers a scan
    pub fn set_max_retired(mut self, max_retired: usize) -> Self {
        debug!("set max retired={:?}", max_retired);
        self.max_retired = max_retired;
        self
    }

    /// get the retired list threshold
    pub fn get_max_retired(&self) -> usize {
        self.max_retired
    }

    /// set the upper bound on spin iterations after a failed CAS
    ///
    /// 0 disables backoff entirely
    pub fn set_max_backoff(mut self, max_backoff: u32) -> Self {
        debug!("set max backoff={:?}", max_backoff);
        self.max_backoff = max_backoff;
        self
    }

    /// get the backoff cap
    pub fn get_max_backoff(&self) -> u32 {
        self.max_backoff
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
