pub mod loop_;
pub mod state;
pub mod tasks;

pub use loop_::{Scheduler, SchedulerConfig};
pub use state::StateStore;
pub use tasks::{due_tasks, TaskUniverse};
