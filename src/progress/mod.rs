pub mod compensator;
pub mod manager;

pub use compensator::QuestProgressCompensator;
pub use manager::{ProcessResult, ProgressContext, ProgressEventType, ProgressManager};
