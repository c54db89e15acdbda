use serde::{Deserialize, Serialize};

/// Kinds of rows written to the analytics event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum EventKind {
    #[serde(rename = "Challenge Started")]
    ChallengeStarted,
    #[serde(rename = "Grading Result")]
    GradingResult,
    #[serde(rename = "Question Solved")]
    QuestionSolved,
    #[serde(rename = "Phase Solved")]
    PhaseSolved,
    #[serde(rename = "Question Graded")]
    QuestionGraded,
    #[serde(rename = "Challenge Completed")]
    ChallengeCompleted,
    Request,
    Submission,
    #[serde(rename = "Submission Counter")]
    SubmissionCounter,
}

impl EventKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::ChallengeStarted => "Challenge Started",
            Self::GradingResult => "Grading Result",
            Self::QuestionSolved => "Question Solved",
            Self::PhaseSolved => "Phase Solved",
            Self::QuestionGraded => "Question Graded",
            Self::ChallengeCompleted => "Challenge Completed",
            Self::Request => "Request",
            Self::Submission => "Submission",
            Self::SubmissionCounter => "Submission Counter",
        }
    }
}
