//! Account scheduling and active hours

pub mod queue;
pub mod window;

pub use queue::{AccountLease, AccountState, AccountStatus, ScheduleSettings, Scheduler};
pub use window::ActiveWindow;
