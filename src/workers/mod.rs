pub mod pipeline;
pub mod postprocess;
pub mod scheduler;
pub mod sweeper;
