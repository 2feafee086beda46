//! End-to-end pipeline flow against a scripted worker surface.
//!
//! Workers are simulated by dropping the artifacts they would write into
//! the run directory; the orchestrator must route the resulting events
//! through the phase machine exactly as a real run would.

mod common;

use std::time::Duration;

use tempfile::TempDir;

use common::{orchestrator_in, wait_for_phase, wait_for_state, ScriptedRunner};
use orchestral_core::errors::OrchestralError;
use orchestral_core::ids::CrpId;
use orchestral_core::model::{
    AgentName, AgentStatus, Crp, CrpBody, CrpOption, CrpStatus, Decision, Phase, Vcr,
};

#[tokio::test]
async fn test_start_run_launches_refiner() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let orchestrator = orchestrator_in(dir.path(), runner.clone());

    let run_id = orchestrator.start_run("Build a feature").await.unwrap();

    let state = wait_for_state(orchestrator.store(), &run_id, Duration::from_secs(2), |s| {
        s.agent(AgentName::Refiner).map(|a| a.status) == Some(AgentStatus::Running)
    })
    .await;
    assert_eq!(state.phase, Phase::Refine);
    assert_eq!(state.iteration, 1);
    assert_eq!(runner.launches_of(AgentName::Refiner).len(), 1);

    // The refiner prompt was generated before launch.
    let prompt = tokio::fs::read_to_string(
        orchestrator
            .store()
            .paths(&run_id)
            .unwrap()
            .prompt(AgentName::Refiner),
    )
    .await
    .unwrap();
    assert!(prompt.contains("iteration: 1"));

    orchestrator.stop_run().await.unwrap();
}

#[tokio::test]
async fn test_second_start_is_busy() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let orchestrator = orchestrator_in(dir.path(), runner.clone());

    orchestrator.start_run("First briefing").await.unwrap();
    let err = orchestrator.start_run("Second briefing").await.unwrap_err();
    assert!(matches!(err, OrchestralError::Busy));

    orchestrator.stop_run().await.unwrap();
}

#[tokio::test]
async fn test_refined_briefing_advances_to_build() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let orchestrator = orchestrator_in(dir.path(), runner.clone());
    let run_id = orchestrator.start_run("Build a feature").await.unwrap();
    let paths = orchestrator.store().paths(&run_id).unwrap();

    tokio::fs::write(paths.briefing_refined(), "# Refined briefing")
        .await
        .unwrap();

    // Within the 2s window the run must be building with the Builder armed.
    let state = wait_for_phase(orchestrator.store(), &run_id, Phase::Build, Duration::from_secs(2)).await;
    assert_eq!(
        state.agent(AgentName::Refiner).unwrap().status,
        AgentStatus::Completed
    );
    assert_eq!(
        state.agent(AgentName::Builder).unwrap().status,
        AgentStatus::Running
    );
    assert!(state.agent(AgentName::Builder).unwrap().timeout_at.is_some());
    assert_eq!(runner.launches_of(AgentName::Builder).len(), 1);

    orchestrator.stop_run().await.unwrap();
}

fn single_crp(id: &str, created_by: AgentName) -> Crp {
    Crp {
        crp_id: CrpId::new(id).unwrap(),
        created_by,
        created_at: chrono::Utc::now(),
        status: CrpStatus::Pending,
        body: CrpBody::Single {
            question: "Which approach?".to_string(),
            options: vec![
                CrpOption {
                    id: "A".to_string(),
                    label: "Incremental rollout".to_string(),
                    description: None,
                },
                CrpOption {
                    id: "B".to_string(),
                    label: "Big bang".to_string(),
                    description: None,
                },
            ],
            recommendation: Some("A".to_string()),
        },
    }
}

#[tokio::test]
async fn test_crp_wins_over_refiner_completion() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let orchestrator = orchestrator_in(dir.path(), runner.clone());
    let run_id = orchestrator.start_run("Build a feature").await.unwrap();
    let paths = orchestrator.store().paths(&run_id).unwrap();

    // Refiner finishes, then asks for clarification 200ms later — inside
    // the CRP-detection window.
    tokio::fs::write(paths.briefing_refined(), "# Refined")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let crp = single_crp("crp-001", AgentName::Refiner);
    tokio::fs::write(
        paths.crp_dir().join("crp-001.json"),
        serde_json::to_vec_pretty(&crp).unwrap(),
    )
    .await
    .unwrap();

    let state = wait_for_phase(
        orchestrator.store(),
        &run_id,
        Phase::WaitingHuman,
        Duration::from_secs(3),
    )
    .await;
    assert_eq!(state.pending_crp, Some(CrpId::new("crp-001").unwrap()));
    assert_eq!(
        state.agent(AgentName::Refiner).unwrap().status,
        AgentStatus::WaitingHuman
    );
    // The CRP won: the Builder must not have started.
    assert!(runner.launches_of(AgentName::Builder).is_empty());

    orchestrator.stop_run().await.unwrap();
}

#[tokio::test]
async fn test_vcr_resumes_refiner_with_decision_label() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let orchestrator = orchestrator_in(dir.path(), runner.clone());
    let run_id = orchestrator.start_run("Build a feature").await.unwrap();
    let paths = orchestrator.store().paths(&run_id).unwrap();

    tokio::fs::write(paths.briefing_refined(), "# Refined")
        .await
        .unwrap();
    let crp = single_crp("crp-001", AgentName::Refiner);
    tokio::fs::write(
        paths.crp_dir().join("crp-001.json"),
        serde_json::to_vec_pretty(&crp).unwrap(),
    )
    .await
    .unwrap();
    wait_for_phase(
        orchestrator.store(),
        &run_id,
        Phase::WaitingHuman,
        Duration::from_secs(3),
    )
    .await;

    let vcr = Vcr::new(CrpId::new("crp-001").unwrap(), Decision::Single("A".into()));
    orchestrator.submit_vcr(&run_id, &vcr).await.unwrap();

    let state = wait_for_phase(orchestrator.store(), &run_id, Phase::Refine, Duration::from_secs(2)).await;
    assert!(state.pending_crp.is_none());
    assert_eq!(
        state.agent(AgentName::Refiner).unwrap().status,
        AgentStatus::Running
    );

    let relaunches = runner.launches_of(AgentName::Refiner);
    assert_eq!(relaunches.len(), 2);
    assert!(relaunches[1].via_vcr);
    // The continuation prompt carries the label of option A.
    let prompt = tokio::fs::read_to_string(&relaunches[1].prompt_file)
        .await
        .unwrap();
    assert!(prompt.contains("Incremental rollout (`A`)"));

    // The CRP file is now marked resolved.
    let crp = orchestrator
        .store()
        .get_crp(&run_id, &CrpId::new("crp-001").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(crp.is_resolved());

    orchestrator.stop_run().await.unwrap();
}

async fn drive_to_gate(
    orchestrator: &orchestral_agent::Orchestrator,
    run_id: &orchestral_core::ids::RunId,
) {
    let paths = orchestrator.store().paths(run_id).unwrap();
    let store = orchestrator.store();

    let current = store
        .state_store(run_id, Duration::from_millis(0))
        .unwrap()
        .load()
        .await
        .unwrap()
        .unwrap();
    if current.phase == Phase::Refine {
        tokio::fs::write(paths.briefing_refined(), "# Refined")
            .await
            .unwrap();
        wait_for_phase(store, run_id, Phase::Build, Duration::from_secs(3)).await;
    }

    tokio::fs::write(paths.agent_done_flag(AgentName::Builder), "")
        .await
        .unwrap();
    wait_for_phase(store, run_id, Phase::Verify, Duration::from_secs(3)).await;

    tokio::fs::write(paths.agent_done_flag(AgentName::Verifier), "")
        .await
        .unwrap();
    wait_for_phase(store, run_id, Phase::Gate, Duration::from_secs(3)).await;
}

#[tokio::test]
async fn test_fail_verdicts_iterate_then_fail_the_run() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let orchestrator = orchestrator_in(dir.path(), runner.clone()).with_max_iterations(2);
    let run_id = orchestrator.start_run("Build a feature").await.unwrap();
    let paths = orchestrator.store().paths(&run_id).unwrap();

    drive_to_gate(&orchestrator, &run_id).await;

    // First FAIL: one iteration left, so a rebuild starts.
    tokio::fs::write(paths.gatekeeper_verdict(), r#"{"verdict":"FAIL"}"#)
        .await
        .unwrap();
    let state = wait_for_phase(orchestrator.store(), &run_id, Phase::Build, Duration::from_secs(5)).await;
    assert_eq!(state.iteration, 2);
    assert_eq!(state.minor_fix_attempts, 0);
    assert_eq!(
        state.agent(AgentName::Verifier).unwrap().status,
        AgentStatus::Pending
    );
    assert_eq!(
        state.agent(AgentName::Gatekeeper).unwrap().status,
        AgentStatus::Pending
    );
    // Prompts were regenerated with the review attached.
    let prompt = tokio::fs::read_to_string(paths.prompt(AgentName::Builder))
        .await
        .unwrap();
    assert!(prompt.contains("has_review: true"));
    assert!(prompt.contains("iteration: 2"));

    // Walk the second iteration back to the gate and fail it again.
    drive_to_gate(&orchestrator, &run_id).await;
    tokio::fs::write(paths.gatekeeper_verdict(), r#"{"verdict":"FAIL","summary":"still broken"}"#)
        .await
        .unwrap();

    let state = wait_for_phase(orchestrator.store(), &run_id, Phase::Failed, Duration::from_secs(5)).await;
    assert_eq!(state.iteration, state.max_iterations);
    assert!(!state.errors.is_empty());
    assert!(state.no_agent_running());

    orchestrator.stop_run().await.unwrap();
}

#[tokio::test]
async fn test_minor_fail_reruns_verifier_only() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let orchestrator = orchestrator_in(dir.path(), runner.clone());
    let run_id = orchestrator.start_run("Build a feature").await.unwrap();
    let paths = orchestrator.store().paths(&run_id).unwrap();

    drive_to_gate(&orchestrator, &run_id).await;
    let builder_launches = runner.launches_of(AgentName::Builder).len();

    tokio::fs::write(paths.gatekeeper_verdict(), r#"{"verdict":"MINOR_FAIL"}"#)
        .await
        .unwrap();

    let state = wait_for_state(orchestrator.store(), &run_id, Duration::from_secs(5), |s| {
        s.phase == Phase::Verify && s.minor_fix_attempts == 1
    })
    .await;
    // Same iteration: a minor fix consumes no iteration slot.
    assert_eq!(state.iteration, 1);
    assert_eq!(
        state.agent(AgentName::Verifier).unwrap().status,
        AgentStatus::Running
    );
    // The verifier's stale artifacts were cleared for the re-run.
    assert!(!paths.agent_done_flag(AgentName::Verifier).exists());
    // The Builder was not relaunched.
    assert_eq!(runner.launches_of(AgentName::Builder).len(), builder_launches);

    orchestrator.stop_run().await.unwrap();
}

#[tokio::test]
async fn test_pass_verdict_assembles_mrp_and_completes() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let orchestrator = orchestrator_in(dir.path(), runner.clone());
    let run_id = orchestrator.start_run("Build a feature").await.unwrap();
    let paths = orchestrator.store().paths(&run_id).unwrap();

    // Give the pack something to copy.
    tokio::fs::create_dir_all(dir.path().join("src")).await.unwrap();
    tokio::fs::write(dir.path().join("src/lib.rs"), "pub fn f() {}")
        .await
        .unwrap();
    tokio::fs::write(
        paths.builder_manifest(),
        r#"{"files_created":[],"files_modified":["src/lib.rs"]}"#,
    )
    .await
    .unwrap();
    tokio::fs::write(paths.verifier_results(), r#"{"total":3,"passed":3,"failed":0}"#)
        .await
        .unwrap();

    drive_to_gate(&orchestrator, &run_id).await;
    tokio::fs::write(paths.gatekeeper_verdict(), r#"{"verdict":"PASS"}"#)
        .await
        .unwrap();

    let state = wait_for_phase(
        orchestrator.store(),
        &run_id,
        Phase::ReadyForMerge,
        Duration::from_secs(5),
    )
    .await;
    assert!(state.no_agent_running());

    let evidence = orchestrator
        .store()
        .read_mrp_evidence(&run_id)
        .await
        .unwrap()
        .expect("evidence must exist after PASS");
    assert_eq!(evidence.changed_files, vec!["src/lib.rs"]);
    assert_eq!(evidence.tests.passed, 3);
    assert!(paths.mrp_code_dir().join("src/lib.rs").exists());
    let summary = orchestrator
        .store()
        .read_mrp_summary(&run_id)
        .await
        .unwrap()
        .unwrap();
    assert!(summary.contains(run_id.as_str()));

    orchestrator.stop_run().await.unwrap();
}

#[tokio::test]
async fn test_stop_run_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let orchestrator = orchestrator_in(dir.path(), runner.clone());
    orchestrator.start_run("Build a feature").await.unwrap();

    orchestrator.stop_run().await.unwrap();
    orchestrator.stop_run().await.unwrap();
    assert!(!orchestrator.get_is_running().await);
}
