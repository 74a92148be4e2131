//! Tasks — the unit of crowd-work and its assignment state machine.

pub mod allocator;
pub mod model;

pub use allocator::TaskAllocator;
pub use model::{Answer, Payload, Task, TaskView, WorkerRelation};
