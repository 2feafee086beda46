//! Merge-Readiness Pack assembly.
//!
//! Deterministic: the same run directory always produces the same pack,
//! byte for byte apart from the completion timestamp. Rerunning overwrites
//! copied files and regenerates evidence and summary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use tokio::fs;
use tracing::{debug, warn};

use orchestral_core::errors::{OrchestralError, Result};
use orchestral_core::fsutil;
use orchestral_core::ids::RunId;
use orchestral_core::model::{
    AgentName, MrpEvidence, RunState, TestTotals, VerifierResults,
};
use orchestral_core::run_store::{RunPaths, RunStore};

/// `builder/output/manifest.json` as written by the Builder.
#[derive(Clone, Debug, Default, Deserialize)]
struct BuilderManifest {
    #[serde(default)]
    files_created: Vec<String>,
    #[serde(default)]
    files_modified: Vec<String>,
}

impl BuilderManifest {
    /// Union of created and modified files, preserving list order and
    /// dropping duplicates.
    fn changed_files(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.files_created
            .iter()
            .chain(self.files_modified.iter())
            .filter(|f| seen.insert(f.as_str()))
            .cloned()
            .collect()
    }
}

/// Builds the Merge-Readiness Pack under `mrp/`.
pub struct MrpAssembler {
    store: RunStore,
    run_id: RunId,
    paths: RunPaths,
}

impl MrpAssembler {
    /// Assembler for one run.
    pub fn new(store: RunStore, run_id: RunId) -> Result<Self> {
        let paths = store.paths(&run_id)?;
        Ok(Self {
            store,
            run_id,
            paths,
        })
    }

    /// Assembles the pack: copies changed code and tests, then writes
    /// `evidence.json` and `summary.md`.
    pub async fn generate(&self, state: &RunState) -> Result<MrpEvidence> {
        self.generate_inner(state)
            .await
            .map_err(|e| OrchestralError::Assembly(e.to_string()))
    }

    async fn generate_inner(&self, state: &RunState) -> Result<MrpEvidence> {
        fs::create_dir_all(self.paths.mrp_code_dir()).await?;
        fs::create_dir_all(self.paths.mrp_tests_dir()).await?;

        let changed_files = self.copy_code().await?;
        fsutil::copy_dir_recursive(&self.paths.verifier_tests_dir(), &self.paths.mrp_tests_dir())
            .await?;

        let results = self
            .store
            .read_verifier_results(&self.run_id)
            .await?
            .unwrap_or_default();
        let verdict = self.store.read_gatekeeper_verdict(&self.run_id).await?;
        let decisions = self
            .store
            .list_vcrs(&self.run_id)
            .await?
            .into_iter()
            .map(|v| v.vcr_id)
            .collect();
        let agent_logs: BTreeMap<AgentName, String> = AgentName::ALL
            .iter()
            .map(|a| (*a, format!("{a}/log.md")))
            .collect();

        let evidence = MrpEvidence {
            run_id: self.run_id.clone(),
            iteration: state.iteration,
            completed_at: Utc::now(),
            tests: totals(&results),
            changed_files,
            decisions,
            agent_logs,
            verdict,
            usage: Some(state.usage),
        };
        fsutil::write_json_atomic(&self.paths.mrp_evidence(), &evidence).await?;

        let summary = self.render_summary(&evidence).await?;
        fsutil::write_atomic(&self.paths.mrp_summary(), summary.as_bytes()).await?;

        debug!(run_id = %self.run_id, files = evidence.changed_files.len(), "MRP assembled");
        Ok(evidence)
    }

    /// Copies the changed source files under `mrp/code/`, preserving their
    /// workspace-relative sub-paths. Returns the copied list in manifest
    /// order.
    async fn copy_code(&self) -> Result<Vec<String>> {
        let manifest: Option<BuilderManifest> =
            fsutil::read_json_opt(&self.paths.builder_manifest()).await?;

        match manifest {
            Some(manifest) => {
                let workspace = self.store.workspace_root().to_path_buf();
                let mut copied = Vec::new();
                for entry in manifest.changed_files() {
                    let raw = PathBuf::from(&entry);
                    let (source, rel) = if raw.is_absolute() {
                        let rel = raw
                            .strip_prefix(&workspace)
                            .map(Path::to_path_buf)
                            .unwrap_or_else(|_| {
                                PathBuf::from(raw.file_name().unwrap_or(raw.as_os_str()))
                            });
                        (raw.clone(), rel)
                    } else {
                        (workspace.join(&raw), raw)
                    };
                    if !matches!(fs::try_exists(&source).await, Ok(true)) {
                        warn!(file = %entry, "manifest names a missing file, skipping");
                        continue;
                    }
                    let dest = self.paths.mrp_code_dir().join(&rel);
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent).await?;
                    }
                    fs::copy(&source, &dest).await?;
                    copied.push(rel.to_string_lossy().into_owned());
                }
                Ok(copied)
            }
            None => {
                // No manifest: fall back to the builder's output tree.
                let output_dir = self.paths.builder_output_dir();
                let mut copied = Vec::new();
                for rel in fsutil::list_files_recursive(&output_dir).await? {
                    if rel == Path::new("manifest.json") {
                        continue;
                    }
                    let dest = self.paths.mrp_code_dir().join(&rel);
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent).await?;
                    }
                    fs::copy(output_dir.join(&rel), &dest).await?;
                    copied.push(rel.to_string_lossy().into_owned());
                }
                Ok(copied)
            }
        }
    }

    async fn render_summary(&self, evidence: &MrpEvidence) -> Result<String> {
        let mut out = String::new();
        out.push_str("# Merge-Readiness Pack\n\n");
        out.push_str(&format!("- Run: {}\n", evidence.run_id));
        out.push_str(&format!("- Iteration: {}\n", evidence.iteration));
        out.push_str(&format!(
            "- Completed: {}\n\n",
            evidence
                .completed_at
                .to_rfc3339_opts(SecondsFormat::Secs, true)
        ));

        out.push_str("## Changed files\n\n");
        if evidence.changed_files.is_empty() {
            out.push_str("(none)\n");
        }
        for file in &evidence.changed_files {
            out.push_str(&format!("- `{file}`\n"));
        }

        out.push_str(&format!(
            "\n## Tests\n\n{} total, {} passed, {} failed\n",
            evidence.tests.total, evidence.tests.passed, evidence.tests.failed
        ));

        out.push_str("\n## Design decisions\n\n");
        if evidence.decisions.is_empty() {
            out.push_str("(no human decisions were needed)\n");
        }
        for vcr_id in &evidence.decisions {
            out.push_str(&format!("- `{vcr_id}`\n"));
        }

        match fs::read_to_string(self.paths.gatekeeper_review()).await {
            Ok(review) => {
                out.push_str("\n## Gatekeeper review\n\n");
                out.push_str(&review);
                if !review.ends_with('\n') {
                    out.push('\n');
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(out)
    }
}

fn totals(results: &VerifierResults) -> TestTotals {
    TestTotals {
        total: results.total,
        passed: results.passed,
        failed: results.failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestral_core::model::Phase;
    use tempfile::TempDir;

    fn run_id() -> RunId {
        RunId::new("run-20260101120000").unwrap()
    }

    async fn setup(dir: &TempDir) -> (RunStore, MrpAssembler, RunState) {
        let store = RunStore::new(dir.path());
        let paths = store.create_run(&run_id(), "briefing", 3).await.unwrap();

        // Workspace sources the manifest points at.
        fs::create_dir_all(dir.path().join("src")).await.unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn f() {}")
            .await
            .unwrap();
        fs::write(dir.path().join("src/new.rs"), "pub fn g() {}")
            .await
            .unwrap();
        fs::write(
            paths.builder_manifest(),
            r#"{"files_created":["src/new.rs"],"files_modified":["src/lib.rs","src/new.rs"]}"#,
        )
        .await
        .unwrap();
        fs::write(paths.verifier_tests_dir().join("smoke.rs"), "#[test] fn t() {}")
            .await
            .unwrap();
        fs::write(
            paths.verifier_results(),
            r#"{"total":5,"passed":5,"failed":0}"#,
        )
        .await
        .unwrap();
        fs::write(
            paths.gatekeeper_verdict(),
            r#"{"verdict":"PASS","summary":"clean"}"#,
        )
        .await
        .unwrap();
        fs::write(paths.gatekeeper_review(), "Looks solid.\n")
            .await
            .unwrap();

        let mut state = RunState::new(run_id(), 3, Utc::now());
        state.phase = Phase::Gate;
        state.iteration = 2;

        let assembler = MrpAssembler::new(store.clone(), run_id()).unwrap();
        (store, assembler, state)
    }

    #[tokio::test]
    async fn test_generate_copies_manifest_files() {
        let dir = TempDir::new().unwrap();
        let (store, assembler, state) = setup(&dir).await;

        let evidence = assembler.generate(&state).await.unwrap();
        // Union preserves order and drops the duplicate.
        assert_eq!(evidence.changed_files, vec!["src/new.rs", "src/lib.rs"]);
        assert_eq!(evidence.tests.passed, 5);
        assert_eq!(evidence.iteration, 2);

        let paths = store.paths(&run_id()).unwrap();
        assert!(paths.mrp_code_dir().join("src/new.rs").exists());
        assert!(paths.mrp_code_dir().join("src/lib.rs").exists());
        assert!(paths.mrp_tests_dir().join("smoke.rs").exists());

        let summary = store.read_mrp_summary(&run_id()).await.unwrap().unwrap();
        assert!(summary.contains("run-20260101120000"));
        assert!(summary.contains("5 total, 5 passed, 0 failed"));
        assert!(summary.contains("Looks solid."));
    }

    #[tokio::test]
    async fn test_generate_is_idempotent_modulo_timestamp() {
        let dir = TempDir::new().unwrap();
        let (_store, assembler, state) = setup(&dir).await;

        let first = assembler.generate(&state).await.unwrap();
        let second = assembler.generate(&state).await.unwrap();

        let mut first_cmp = first.clone();
        first_cmp.completed_at = second.completed_at;
        assert_eq!(first_cmp, second);
    }

    #[tokio::test]
    async fn test_fallback_without_manifest() {
        let dir = TempDir::new().unwrap();
        let (store, assembler, state) = setup(&dir).await;
        let paths = store.paths(&run_id()).unwrap();
        fs::remove_file(paths.builder_manifest()).await.unwrap();
        fs::create_dir_all(paths.builder_output_dir().join("src"))
            .await
            .unwrap();
        fs::write(paths.builder_output_dir().join("src/out.rs"), "pub fn h() {}")
            .await
            .unwrap();

        let evidence = assembler.generate(&state).await.unwrap();
        assert_eq!(evidence.changed_files, vec!["src/out.rs"]);
        assert!(paths.mrp_code_dir().join("src/out.rs").exists());
    }

    #[tokio::test]
    async fn test_missing_manifest_entries_skipped() {
        let dir = TempDir::new().unwrap();
        let (store, assembler, state) = setup(&dir).await;
        let paths = store.paths(&run_id()).unwrap();
        fs::write(
            paths.builder_manifest(),
            r#"{"files_created":["src/ghost.rs"],"files_modified":["src/lib.rs"]}"#,
        )
        .await
        .unwrap();

        let evidence = assembler.generate(&state).await.unwrap();
        assert_eq!(evidence.changed_files, vec!["src/lib.rs"]);
    }
}
