pub(crate) mod grading;
pub(crate) mod monitor;
pub(crate) mod scheduler;
