pub mod queue;
pub mod worker;

pub use queue::{ChannelJobQueue, DeriverTask, JobQueue};
pub use worker::{DeriverError, DeriverWorker};
