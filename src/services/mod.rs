pub(crate) mod availability;
pub(crate) mod events;
pub(crate) mod grader_client;
pub(crate) mod notifier;
pub(crate) mod registry;
pub(crate) mod script_runner;
pub(crate) mod tokens;
pub(crate) mod uploads;
