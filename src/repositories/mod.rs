pub(crate) mod events;
pub(crate) mod health;
pub(crate) mod phases;
pub(crate) mod questions;
pub(crate) mod store;
