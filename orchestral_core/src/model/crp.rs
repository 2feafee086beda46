//! Clarification Request Packages (agent-to-human questions).
//!
//! A CRP comes in two shapes: a single question with selectable options, or
//! a bundle of questions each of which may carry its own options. The shape
//! is carried in the document's `type` field and modeled as an internally
//! tagged variant. Once written, a CRP is immutable except for `status`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::CrpId;
use crate::model::agent::AgentName;

/// Lifecycle of a CRP. Resolved iff a VCR with the matching `crp_id` exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrpStatus {
    /// Awaiting a human reply
    Pending,
    /// A matching VCR has been saved
    Resolved,
}

/// A selectable answer to a question.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrpOption {
    /// Stable option identifier referenced by VCR decisions
    pub id: String,
    /// Human-readable label
    pub label: String,
    /// Optional longer explanation
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
}

/// One question inside a multi-question CRP.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrpQuestion {
    /// Stable question identifier referenced by VCR decisions
    pub id: String,
    /// The question text
    pub question: String,
    /// Selectable options, if the question is not free-form
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub options: Option<Vec<CrpOption>>,
    /// Whether an answer is mandatory
    #[serde(default)]
    pub required: bool,
}

/// Question payload, discriminated by the `type` field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrpBody {
    /// One question, one decision.
    Single {
        /// The question text
        question: String,
        /// Selectable answers
        options: Vec<CrpOption>,
        /// The agent's suggested option id, if any
        #[serde(skip_serializing_if = "Option::is_none", default)]
        recommendation: Option<String>,
    },
    /// Several questions answered in one reply.
    Multi {
        /// The question bundle
        questions: Vec<CrpQuestion>,
    },
}

/// Clarification Request Package as persisted under `crp/<id>.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Crp {
    /// Identifier, also used for the filename by convention
    pub crp_id: CrpId,
    /// Agent slot that raised the question
    pub created_by: AgentName,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Pending until a matching VCR is saved
    pub status: CrpStatus,
    /// Question payload
    #[serde(flatten)]
    pub body: CrpBody,
}

impl Crp {
    /// True once a matching VCR has been recorded.
    pub fn is_resolved(&self) -> bool {
        self.status == CrpStatus::Resolved
    }

    /// Looks up the label of an option in a single-question CRP.
    pub fn option_label(&self, option_id: &str) -> Option<&str> {
        match &self.body {
            CrpBody::Single { options, .. } => options
                .iter()
                .find(|o| o.id == option_id)
                .map(|o| o.label.as_str()),
            CrpBody::Multi { .. } => None,
        }
    }

    /// Looks up the label of an option within one question of a multi CRP.
    pub fn question_option_label(&self, question_id: &str, option_id: &str) -> Option<&str> {
        match &self.body {
            CrpBody::Multi { questions } => questions
                .iter()
                .find(|q| q.id == question_id)
                .and_then(|q| q.options.as_ref())
                .and_then(|opts| opts.iter().find(|o| o.id == option_id))
                .map(|o| o.label.as_str()),
            CrpBody::Single { .. } => None,
        }
    }
}
