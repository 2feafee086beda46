//! Continuation prompt construction.
//!
//! When a run resumes after a human reply, the restarted agent gets a
//! markdown prompt that restates the question, the decision (by label where
//! options carry labels), and any notes the human added. The Phase-2
//! verifier prompt embeds the external runner's output the same way.

use orchestral_core::model::{Crp, CrpBody, Decision, TestOutput, Vcr};

/// Renders the continuation prompt handed to the agent that raised the CRP.
pub fn continuation_prompt(crp: &Crp, vcr: &Vcr) -> String {
    let mut out = String::new();
    out.push_str("# Clarification resolved\n\n");
    out.push_str(&format!(
        "Your clarification request `{}` has been answered. Continue your work applying the decision below.\n\n",
        crp.crp_id
    ));

    match (&crp.body, &vcr.decision) {
        (CrpBody::Single { question, .. }, Decision::Single(option_id)) => {
            let label = crp.option_label(option_id).unwrap_or(option_id.as_str());
            out.push_str(&format!("## Question\n\n{question}\n\n"));
            out.push_str(&format!("## Decision\n\n{label} (`{option_id}`)\n"));
        }
        (CrpBody::Multi { questions }, Decision::Multi(answers)) => {
            out.push_str("## Decisions\n\n");
            for question in questions {
                let answer = match answers.get(&question.id) {
                    Some(option_id) => {
                        let label = crp
                            .question_option_label(&question.id, option_id)
                            .unwrap_or(option_id.as_str());
                        format!("{label} (`{option_id}`)")
                    }
                    // Unanswered optional questions render as N/A; required
                    // ones were rejected at VCR intake.
                    None => "N/A".to_string(),
                };
                out.push_str(&format!("- {}: {answer}\n", question.question));
            }
        }
        // Shape mismatches are rejected at intake; render the raw decision
        // rather than losing it if one slips through.
        (_, decision) => {
            out.push_str(&format!("## Decision\n\n{decision:?}\n"));
        }
    }

    if let Some(rationale) = &vcr.rationale {
        out.push_str(&format!("\n## Rationale\n\n{rationale}\n"));
    }
    if let Some(notes) = &vcr.additional_notes {
        out.push_str(&format!("\n## Additional notes\n\n{notes}\n"));
    }
    if vcr.applies_to_future == Some(true) {
        out.push_str("\nThis decision also applies to similar questions later in the run.\n");
    }
    out
}

/// Renders the Phase-2 verifier prompt after the external test runner has
/// produced its output.
pub fn verifier_phase2_prompt(output: &TestOutput) -> String {
    let mut out = String::new();
    out.push_str("# Test execution finished\n\n");
    out.push_str(&format!(
        "The external runner finished with exit code {} in {} ms. Analyze the output below, write `results.json`, then drop `done.flag`.\n\n",
        output.exit_code, output.duration_ms
    ));
    out.push_str(&format!("## stdout\n\n```\n{}\n```\n\n", output.stdout));
    if !output.stderr.is_empty() {
        out.push_str(&format!("## stderr\n\n```\n{}\n```\n", output.stderr));
    }
    if let Some(results) = &output.test_results {
        out.push_str(&format!(
            "\n## Structured results\n\n```json\n{}\n```\n",
            serde_json::to_string_pretty(results).unwrap_or_default()
        ));
    }
    out
}
