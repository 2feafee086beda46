//! Verified Clarification Responses (human-to-agent replies).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CrpId, VcrId};

/// The human's decision.
///
/// Single-question CRPs get a bare option id; multi-question CRPs get a
/// `questionId -> optionId` mapping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Decision {
    /// Chosen option id for a single-question CRP
    Single(String),
    /// Per-question answers for a multi-question CRP
    Multi(BTreeMap<String, String>),
}

/// Human reply as persisted under `vcr/<id>.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vcr {
    /// Identifier, also used for the filename
    pub vcr_id: VcrId,
    /// The CRP this reply resolves
    pub crp_id: CrpId,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// The decision payload
    pub decision: Decision,
    /// Why the human chose this
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rationale: Option<String>,
    /// Free-form notes handed to the resumed agent
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub additional_notes: Option<String>,
    /// Whether the decision applies to similar future questions
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub applies_to_future: Option<bool>,
}

impl Vcr {
    /// Builds a reply with a generated identifier and the current timestamp.
    pub fn new(crp_id: CrpId, decision: Decision) -> Self {
        Self {
            vcr_id: VcrId::generate(),
            crp_id,
            created_at: Utc::now(),
            decision,
            rationale: None,
            additional_notes: None,
            applies_to_future: None,
        }
    }
}
