pub mod error;
pub mod manager;
pub mod process;
pub mod types;

pub use error::TaskError;
pub use manager::TaskManager;
pub use types::{TaskId, TaskState};
