//! On-disk representation of runs.
//!
//! The run store owns the per-run directory layout. External consumers
//! (workers, the test runner, dashboards) depend on the exact paths, so the
//! layout is centralized in [`RunPaths`] and never computed ad hoc.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::fs;
use tracing::{debug, warn};

use crate::errors::{OrchestralError, Result};
use crate::fsutil;
use crate::ids::{CrpId, RunId};
use crate::model::agent::AgentName;
use crate::model::crp::{Crp, CrpBody, CrpStatus};
use crate::model::mrp::MrpEvidence;
use crate::model::phase::Phase;
use crate::model::state::{ModelSelection, RunState};
use crate::model::testing::VerifierResults;
use crate::model::vcr::{Decision, Vcr};
use crate::model::verdict::GateVerdict;
use crate::state_store::StateStore;

/// Maximum accepted briefing size in bytes.
pub const MAX_BRIEFING_BYTES: usize = 100_000;

/// Maximum length of any computed path.
pub const MAX_PATH_BYTES: usize = 4096;

/// Subdirectories materialized for every run.
const RUN_SUBDIRS: [&str; 13] = [
    "briefing",
    "prompts",
    "refiner",
    "builder",
    "builder/output",
    "verifier",
    "verifier/tests",
    "gatekeeper",
    "crp",
    "vcr",
    "mrp",
    "mrp/code",
    "mrp/tests",
];

/// Computed paths for one run directory.
#[derive(Clone, Debug)]
pub struct RunPaths {
    root: PathBuf,
}

impl RunPaths {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The run directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `state.json`
    pub fn state_json(&self) -> PathBuf {
        self.root.join("state.json")
    }

    /// `events.log`
    pub fn events_log(&self) -> PathBuf {
        self.root.join("events.log")
    }

    /// `model-selection.json`
    pub fn model_selection(&self) -> PathBuf {
        self.root.join("model-selection.json")
    }

    /// `briefing/raw.md`
    pub fn briefing_raw(&self) -> PathBuf {
        self.root.join("briefing/raw.md")
    }

    /// `briefing/refined.md`
    pub fn briefing_refined(&self) -> PathBuf {
        self.root.join("briefing/refined.md")
    }

    /// `prompts/<agent>.md`
    pub fn prompt(&self, agent: AgentName) -> PathBuf {
        self.root.join(format!("prompts/{agent}.md"))
    }

    /// `prompts/<agent>-continuation.md`, used after a VCR.
    pub fn continuation_prompt(&self, agent: AgentName) -> PathBuf {
        self.root.join(format!("prompts/{agent}-continuation.md"))
    }

    /// `prompts/` directory.
    pub fn prompts_dir(&self) -> PathBuf {
        self.root.join("prompts")
    }

    /// `<agent>/` working directory.
    pub fn agent_dir(&self, agent: AgentName) -> PathBuf {
        self.root.join(agent.as_str())
    }

    /// `<agent>/output.json`
    pub fn agent_output(&self, agent: AgentName) -> PathBuf {
        self.agent_dir(agent).join("output.json")
    }

    /// `<agent>/done.flag`
    pub fn agent_done_flag(&self, agent: AgentName) -> PathBuf {
        self.agent_dir(agent).join("done.flag")
    }

    /// `<agent>/error.flag`
    pub fn agent_error_flag(&self, agent: AgentName) -> PathBuf {
        self.agent_dir(agent).join("error.flag")
    }

    /// `<agent>/log.md`
    pub fn agent_log(&self, agent: AgentName) -> PathBuf {
        self.agent_dir(agent).join("log.md")
    }

    /// `builder/output/` tree populated by the Builder.
    pub fn builder_output_dir(&self) -> PathBuf {
        self.root.join("builder/output")
    }

    /// `builder/output/manifest.json`
    pub fn builder_manifest(&self) -> PathBuf {
        self.builder_output_dir().join("manifest.json")
    }

    /// `verifier/tests-ready.flag`
    pub fn tests_ready_flag(&self) -> PathBuf {
        self.root.join("verifier/tests-ready.flag")
    }

    /// `verifier/test-config.json`
    pub fn test_config(&self) -> PathBuf {
        self.root.join("verifier/test-config.json")
    }

    /// `verifier/test-output.json`
    pub fn test_output(&self) -> PathBuf {
        self.root.join("verifier/test-output.json")
    }

    /// `verifier/results.json`
    pub fn verifier_results(&self) -> PathBuf {
        self.root.join("verifier/results.json")
    }

    /// `verifier/tests/` tree authored by the Verifier.
    pub fn verifier_tests_dir(&self) -> PathBuf {
        self.root.join("verifier/tests")
    }

    /// `gatekeeper/verdict.json`
    pub fn gatekeeper_verdict(&self) -> PathBuf {
        self.root.join("gatekeeper/verdict.json")
    }

    /// `gatekeeper/review.md`
    pub fn gatekeeper_review(&self) -> PathBuf {
        self.root.join("gatekeeper/review.md")
    }

    /// `crp/` directory.
    pub fn crp_dir(&self) -> PathBuf {
        self.root.join("crp")
    }

    /// `vcr/` directory.
    pub fn vcr_dir(&self) -> PathBuf {
        self.root.join("vcr")
    }

    /// `mrp/` directory.
    pub fn mrp_dir(&self) -> PathBuf {
        self.root.join("mrp")
    }

    /// `mrp/code/` tree.
    pub fn mrp_code_dir(&self) -> PathBuf {
        self.root.join("mrp/code")
    }

    /// `mrp/tests/` tree.
    pub fn mrp_tests_dir(&self) -> PathBuf {
        self.root.join("mrp/tests")
    }

    /// `mrp/evidence.json`
    pub fn mrp_evidence(&self) -> PathBuf {
        self.root.join("mrp/evidence.json")
    }

    /// `mrp/summary.md`
    pub fn mrp_summary(&self) -> PathBuf {
        self.root.join("mrp/summary.md")
    }
}

/// Lightweight view of a run for enumeration.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    /// Run identity
    pub run_id: RunId,
    /// Current phase
    pub phase: Phase,
    /// Current iteration
    pub iteration: u32,
    /// Creation timestamp
    pub started_at: DateTime<Utc>,
    /// Last state save
    pub updated_at: DateTime<Utc>,
}

/// Owner of the on-disk representation of runs.
#[derive(Clone, Debug)]
pub struct RunStore {
    workspace_root: PathBuf,
    runs_root: PathBuf,
}

impl RunStore {
    /// Store rooted at `<workspace>/.orchestral/runs`.
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        let runs_root = workspace_root.join(".orchestral/runs");
        Self {
            workspace_root,
            runs_root,
        }
    }

    /// Store with an explicit runs root.
    pub fn with_runs_root(workspace_root: impl Into<PathBuf>, runs_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            runs_root: runs_root.into(),
        }
    }

    /// The workspace this store serves.
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// The directory all runs live under.
    pub fn runs_root(&self) -> &Path {
        &self.runs_root
    }

    /// Current UTC timestamp formatted as a fresh run identifier.
    pub fn generate_run_id(&self) -> RunId {
        RunId::generate(Utc::now())
    }

    /// Validated paths for a run directory.
    pub fn paths(&self, run_id: &RunId) -> Result<RunPaths> {
        let root = checked_join(&self.runs_root, Path::new(run_id.as_str()))?;
        Ok(RunPaths::new(root))
    }

    /// A state store bound to this run's `state.json`.
    pub fn state_store(&self, run_id: &RunId, cache_ttl: std::time::Duration) -> Result<StateStore> {
        Ok(StateStore::new(self.paths(run_id)?.state_json(), cache_ttl))
    }

    /// Creates the full run directory tree, writes the raw briefing, and
    /// hands off to the state store for the initial document.
    ///
    /// # Errors
    ///
    /// Validation errors for a malformed id, an empty/oversize/NUL-bearing
    /// briefing, an out-of-range `max_iterations`, or an already existing
    /// run directory.
    pub async fn create_run(
        &self,
        run_id: &RunId,
        raw_briefing: &str,
        max_iterations: u32,
    ) -> Result<RunPaths> {
        validate_briefing(raw_briefing)?;
        if !(1..=100).contains(&max_iterations) {
            return Err(OrchestralError::Validation(format!(
                "max_iterations must be in 1..=100, got {max_iterations}"
            )));
        }

        let paths = self.paths(run_id)?;
        if fs::try_exists(paths.root()).await? {
            return Err(OrchestralError::Validation(format!(
                "run {run_id} already exists"
            )));
        }

        for sub in RUN_SUBDIRS {
            fs::create_dir_all(paths.root().join(sub)).await?;
        }
        fs::write(paths.briefing_raw(), raw_briefing).await?;

        let state = RunState::new(run_id.clone(), max_iterations, Utc::now());
        StateStore::new(paths.state_json(), std::time::Duration::from_millis(1000))
            .save(state)
            .await?;

        debug!(%run_id, "created run directory");
        Ok(paths)
    }

    /// All runs, newest first.
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut summaries = Vec::new();
        let mut entries = match fs::read_dir(&self.runs_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(summaries),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Ok(run_id) = RunId::new(name.to_string_lossy().into_owned()) else {
                continue;
            };
            let state_path = entry.path().join("state.json");
            match fsutil::read_json_opt::<RunState>(&state_path).await {
                Ok(Some(state)) => summaries.push(RunSummary {
                    run_id,
                    phase: state.phase,
                    iteration: state.iteration,
                    started_at: state.started_at,
                    updated_at: state.updated_at,
                }),
                Ok(None) => {}
                Err(e) => warn!(%run_id, error = %e, "skipping run with unreadable state"),
            }
        }
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(summaries)
    }

    /// The most recently started run, regardless of phase.
    pub async fn get_current_run(&self) -> Result<Option<RunSummary>> {
        Ok(self.list_runs().await?.into_iter().next())
    }

    /// The newest run that is not in a terminal phase.
    pub async fn get_active_run(&self) -> Result<Option<RunSummary>> {
        Ok(self
            .list_runs()
            .await?
            .into_iter()
            .find(|r| r.phase.is_active()))
    }

    /// `briefing/raw.md`
    pub async fn read_raw_briefing(&self, run_id: &RunId) -> Result<String> {
        Ok(fs::read_to_string(self.paths(run_id)?.briefing_raw()).await?)
    }

    /// `briefing/refined.md`
    pub async fn read_refined_briefing(&self, run_id: &RunId) -> Result<String> {
        Ok(fs::read_to_string(self.paths(run_id)?.briefing_refined()).await?)
    }

    /// `verifier/results.json`
    pub async fn read_verifier_results(&self, run_id: &RunId) -> Result<Option<VerifierResults>> {
        fsutil::read_json_opt(&self.paths(run_id)?.verifier_results()).await
    }

    /// `gatekeeper/verdict.json`
    pub async fn read_gatekeeper_verdict(&self, run_id: &RunId) -> Result<Option<GateVerdict>> {
        fsutil::read_json_opt(&self.paths(run_id)?.gatekeeper_verdict()).await
    }

    /// `mrp/evidence.json`
    pub async fn read_mrp_evidence(&self, run_id: &RunId) -> Result<Option<MrpEvidence>> {
        fsutil::read_json_opt(&self.paths(run_id)?.mrp_evidence()).await
    }

    /// `mrp/summary.md`
    pub async fn read_mrp_summary(&self, run_id: &RunId) -> Result<Option<String>> {
        match fs::read_to_string(self.paths(run_id)?.mrp_summary()).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All CRPs of a run, oldest first.
    pub async fn list_crps(&self, run_id: &RunId) -> Result<Vec<Crp>> {
        let mut crps: Vec<Crp> = self.read_dir_json(self.paths(run_id)?.crp_dir()).await?;
        crps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(crps)
    }

    /// Looks a CRP up by its `crp_id` field, not by filename.
    pub async fn get_crp(&self, run_id: &RunId, crp_id: &CrpId) -> Result<Option<Crp>> {
        Ok(self
            .list_crps(run_id)
            .await?
            .into_iter()
            .find(|c| &c.crp_id == crp_id))
    }

    /// All VCRs of a run, oldest first.
    pub async fn list_vcrs(&self, run_id: &RunId) -> Result<Vec<Vcr>> {
        let mut vcrs: Vec<Vcr> = self.read_dir_json(self.paths(run_id)?.vcr_dir()).await?;
        vcrs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(vcrs)
    }

    /// Atomically writes the VCR, then marks the referenced CRP resolved.
    ///
    /// Multi-question CRPs require an answer for every `required` question;
    /// a missing one is rejected here, at intake, rather than surfacing at
    /// resume time. Marking an already resolved CRP is a no-op on status.
    pub async fn save_vcr(&self, run_id: &RunId, vcr: &Vcr) -> Result<()> {
        let paths = self.paths(run_id)?;
        let crp = self
            .get_crp(run_id, &vcr.crp_id)
            .await?
            .ok_or_else(|| {
                OrchestralError::Validation(format!("no CRP with id {}", vcr.crp_id))
            })?;
        validate_decision(&crp, &vcr.decision)?;

        let vcr_path = paths.vcr_dir().join(format!("{}.json", vcr.vcr_id));
        fsutil::write_json_atomic(&vcr_path, vcr).await?;

        if crp.status != CrpStatus::Resolved {
            self.mark_crp_resolved(run_id, &vcr.crp_id).await?;
        }
        Ok(())
    }

    /// Rewrites the CRP file carrying the given id with `status=resolved`.
    async fn mark_crp_resolved(&self, run_id: &RunId, crp_id: &CrpId) -> Result<()> {
        let crp_dir = self.paths(run_id)?.crp_dir();
        let mut entries = fs::read_dir(&crp_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            if let Ok(Some(mut crp)) = fsutil::read_json_opt::<Crp>(&path).await {
                if &crp.crp_id == crp_id {
                    crp.status = CrpStatus::Resolved;
                    return fsutil::write_json_atomic(&path, &crp).await;
                }
            }
        }
        Err(OrchestralError::Validation(format!(
            "no CRP file with id {crp_id}"
        )))
    }

    /// Deletes a run. Refused unless the phase is terminal.
    pub async fn delete_run(&self, run_id: &RunId) -> Result<()> {
        let paths = self.paths(run_id)?;
        let state: RunState = fsutil::read_json_opt(&paths.state_json())
            .await?
            .ok_or_else(|| OrchestralError::RunNotFound(run_id.to_string()))?;
        if !state.phase.is_terminal() {
            return Err(OrchestralError::Validation(format!(
                "refusing to delete run {run_id} in phase {}",
                state.phase
            )));
        }
        fs::remove_dir_all(paths.root()).await?;
        Ok(())
    }

    /// Deletes all completed/failed runs started before the cutoff.
    /// Returns how many were removed.
    pub async fn clean_runs(&self, max_age_ms: u64) -> Result<usize> {
        let cutoff = Utc::now()
            - ChronoDuration::milliseconds(i64::try_from(max_age_ms).unwrap_or(i64::MAX));
        let mut removed = 0;
        for summary in self.list_runs().await? {
            if summary.phase.is_terminal() && summary.started_at < cutoff {
                self.delete_run(&summary.run_id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes the verifier's flag and output files so a fresh verifier
    /// attempt can be observed. Authored tests are kept.
    pub async fn reset_verifier_for_retry(&self, run_id: &RunId) -> Result<()> {
        let paths = self.paths(run_id)?;
        for path in [
            paths.agent_done_flag(AgentName::Verifier),
            paths.agent_output(AgentName::Verifier),
            paths.agent_error_flag(AgentName::Verifier),
            paths.tests_ready_flag(),
            paths.test_config(),
            paths.test_output(),
            paths.verifier_results(),
        ] {
            fsutil::remove_if_exists(&path).await?;
        }
        Ok(())
    }

    /// Removes one agent's flag and output files ahead of a relaunch.
    pub async fn reset_agent_for_rerun(&self, run_id: &RunId, agent: AgentName) -> Result<()> {
        let paths = self.paths(run_id)?;
        for path in [
            paths.agent_done_flag(agent),
            paths.agent_output(agent),
            paths.agent_error_flag(agent),
        ] {
            fsutil::remove_if_exists(&path).await?;
        }
        Ok(())
    }

    /// `model-selection.json`
    pub async fn save_model_selection(
        &self,
        run_id: &RunId,
        selection: &ModelSelection,
    ) -> Result<()> {
        fsutil::write_json_atomic(&self.paths(run_id)?.model_selection(), selection).await
    }

    /// `model-selection.json`
    pub async fn read_model_selection(&self, run_id: &RunId) -> Result<Option<ModelSelection>> {
        fsutil::read_json_opt(&self.paths(run_id)?.model_selection()).await
    }

    async fn read_dir_json<T: serde::de::DeserializeOwned>(&self, dir: PathBuf) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(items),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            match fsutil::read_json_opt::<T>(&path).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unparseable document"),
            }
        }
        Ok(items)
    }
}

/// Parses `"Nd"`, `"Nh"`, `"Nm"`, or `"Ns"` into milliseconds.
pub fn parse_duration(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    // Split on the last char, not the last byte: the unit may be any
    // (multi-byte) character and must come back as a validation error.
    let Some(unit) = raw.chars().next_back() else {
        return Err(OrchestralError::Validation("empty duration".to_string()));
    };
    let digits = &raw[..raw.len() - unit.len_utf8()];
    let value: u64 = digits
        .parse()
        .map_err(|_| OrchestralError::Validation(format!("invalid duration: {raw:?}")))?;
    let per_unit = match unit {
        'd' => 24 * 60 * 60 * 1000,
        'h' => 60 * 60 * 1000,
        'm' => 60 * 1000,
        's' => 1000,
        _ => {
            return Err(OrchestralError::Validation(format!(
                "invalid duration unit in {raw:?}"
            )))
        }
    };
    value
        .checked_mul(per_unit)
        .ok_or_else(|| OrchestralError::Validation(format!("duration overflows: {raw:?}")))
}

/// Joins a relative path onto a root, refusing NUL bytes, parent/root
/// components, and paths longer than [`MAX_PATH_BYTES`].
pub fn checked_join(root: &Path, rel: &Path) -> Result<PathBuf> {
    let rel_str = rel.to_string_lossy();
    if rel_str.contains('\u{0}') {
        return Err(OrchestralError::PathValidation(
            "NUL byte in path".to_string(),
        ));
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(OrchestralError::PathTraversal(rel.to_path_buf())),
        }
    }
    let joined = root.join(rel);
    if !joined.starts_with(root) {
        return Err(OrchestralError::PathTraversal(joined));
    }
    if joined.as_os_str().len() > MAX_PATH_BYTES {
        return Err(OrchestralError::PathValidation(format!(
            "path exceeds {MAX_PATH_BYTES} bytes"
        )));
    }
    Ok(joined)
}

fn validate_briefing(raw: &str) -> Result<()> {
    if raw.trim().is_empty() {
        return Err(OrchestralError::Validation("briefing is empty".to_string()));
    }
    if raw.len() > MAX_BRIEFING_BYTES {
        return Err(OrchestralError::Validation(format!(
            "briefing exceeds {MAX_BRIEFING_BYTES} bytes"
        )));
    }
    if raw.contains('\u{0}') {
        return Err(OrchestralError::Validation(
            "briefing contains a NUL byte".to_string(),
        ));
    }
    Ok(())
}

fn validate_decision(crp: &Crp, decision: &Decision) -> Result<()> {
    match (&crp.body, decision) {
        (CrpBody::Single { .. }, Decision::Single(_)) => Ok(()),
        (CrpBody::Multi { questions }, Decision::Multi(answers)) => {
            for question in questions {
                if question.required && !answers.contains_key(&question.id) {
                    return Err(OrchestralError::Validation(format!(
                        "required question {:?} is unanswered",
                        question.id
                    )));
                }
            }
            Ok(())
        }
        (CrpBody::Single { .. }, Decision::Multi(_)) => Err(OrchestralError::Validation(
            "single-question CRP answered with a mapping".to_string(),
        )),
        (CrpBody::Multi { .. }, Decision::Single(_)) => Err(OrchestralError::Validation(
            "multi-question CRP answered with a bare option".to_string(),
        )),
    }
}
