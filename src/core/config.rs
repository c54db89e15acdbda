mod grading;
mod parsing;
mod settings;
mod types;

pub(crate) use types::{
    ChallengeSettings, CronAt, GradingPart, GradingParts, GradingSettings, PartKind, PathSettings,
    PhasePlan, ServiceCheck, ServiceDescriptor, Settings, StoreBackend, SubmissionSettings,
    TokenLocation,
};

#[cfg(test)]
pub(crate) use types::SubmissionMethod;
