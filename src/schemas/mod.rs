use std::collections::HashMap;

use serde::Serialize;

pub(crate) mod grading;

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) service: String,
    pub(crate) status: String,
    pub(crate) ready: bool,
    pub(crate) fatal_error: bool,
    pub(crate) components: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RootResponse {
    pub(crate) message: String,
    pub(crate) challenge: String,
    pub(crate) version: String,
}
