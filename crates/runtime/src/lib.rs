pub mod local;
pub mod scheduler;
pub mod timer_queue;

pub use local::*;
pub use scheduler::*;
pub use timer_queue::*;
