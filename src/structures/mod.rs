pub use self::queue::Queue;

mod queue;
