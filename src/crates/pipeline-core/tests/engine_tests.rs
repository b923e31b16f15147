//! End-to-end engine tests over the in-memory stores.

use pipeline_checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use pipeline_core::{
    ChannelEventSink, EngineError, InMemoryStateStore, JobStatus, PipelineEngine, PipelineEvent,
    PipelineState, StateStore, StepDefinition, StepRegistry,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn names(steps: &[&str]) -> Vec<String> {
    steps.iter().map(|s| s.to_string()).collect()
}

async fn seeded_store(job_id: &str) -> Arc<InMemoryStateStore> {
    let store = Arc::new(InMemoryStateStore::new());
    store.insert(PipelineState::new(job_id, "proj-1", "user-1")).await;
    store
}

fn engine(
    registry: StepRegistry,
    store: Arc<InMemoryStateStore>,
    checkpoints: Arc<InMemoryCheckpointStore>,
) -> PipelineEngine {
    PipelineEngine::new(Arc::new(registry), store, checkpoints)
}

#[tokio::test]
async fn linear_run_with_flaky_step_retries_and_recovers() {
    // S1: A, B, C where B fails on the first attempt and succeeds on the second
    let mut registry = StepRegistry::new();
    registry.register(StepDefinition::new("step_a", |state, _| async move {
        Ok(Some(state.with_updates(|s| {
            s.normalized_video_url = Some("http://x/a.mp4".into())
        })))
    }));

    let b_attempts = Arc::new(AtomicU32::new(0));
    let counter = b_attempts.clone();
    registry.register(
        StepDefinition::new("step_b", move |state, _| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(EngineError::StepFailed {
                        step: "step_b".into(),
                        message: "transient".into(),
                    });
                }
                Ok(Some(state))
            }
        })
        .with_retries(true, 2),
    );
    registry.register(StepDefinition::new("step_c", |state, _| async move {
        Ok(Some(state))
    }));

    let store = seeded_store("job-1").await;
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let engine = engine(registry, store.clone(), checkpoints.clone());

    let state = engine
        .run("job-1", &names(&["step_a", "step_b", "step_c"]), None, None)
        .await
        .unwrap();

    assert_eq!(state.completed_steps, names(&["step_a", "step_b", "step_c"]));
    assert_eq!(state.step_timings["step_b"].attempt, 2);
    assert!(state.step_timings.values().all(|t| t.duration_ms >= 0));
    assert!(state.step_timings.values().all(|t| t.attempt >= 1));

    // One checkpoint per completed step, timestamps non-decreasing
    let history = checkpoints.list("job-1").await.unwrap();
    let cp_names: Vec<_> = history.iter().map(|c| c.step_name.as_str()).collect();
    assert_eq!(cp_names, vec!["step_a", "step_b", "step_c"]);
    assert!(history.windows(2).all(|w| w[0].created_at <= w[1].created_at));
}

#[tokio::test]
async fn rerun_skips_already_completed_steps() {
    // S1 continuation: interrupting after B and re-invoking runs only C
    let c_runs = Arc::new(AtomicU32::new(0));

    let mut registry = StepRegistry::new();
    for name in ["step_a", "step_b"] {
        registry.register(StepDefinition::new(name, |state, _| async move {
            Ok(Some(state))
        }));
    }
    let counter = c_runs.clone();
    registry.register(StepDefinition::new("step_c", move |state, _| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Some(state))
        }
    }));

    let store = Arc::new(InMemoryStateStore::new());
    let mut state = PipelineState::new("job-1", "p", "u");
    state.mark_completed("step_a");
    state.mark_completed("step_b");
    store.insert(state).await;

    let engine = engine(registry, store.clone(), Arc::new(InMemoryCheckpointStore::new()));
    let state = engine
        .run("job-1", &names(&["step_a", "step_b", "step_c"]), None, None)
        .await
        .unwrap();

    assert_eq!(c_runs.load(Ordering::SeqCst), 1);
    assert_eq!(state.completed_steps, names(&["step_a", "step_b", "step_c"]));
    // No new timing entries for the skipped prefix
    assert!(!state.step_timings.contains_key("step_a"));
}

#[tokio::test]
async fn optional_step_failure_is_skipped_not_fatal() {
    // S2: optional step that always fails
    let mut registry = StepRegistry::new();
    registry.register(
        StepDefinition::new("step_x", |_state, _| async move {
            Err(EngineError::StepFailed {
                step: "step_x".into(),
                message: "always broken".into(),
            })
        })
        .optional()
        .with_retries(false, 0),
    );

    let store = seeded_store("job-1").await;
    let engine = engine(registry, store.clone(), Arc::new(InMemoryCheckpointStore::new()));

    let state = engine
        .run("job-1", &names(&["step_x"]), None, None)
        .await
        .unwrap();

    assert_eq!(state.skipped_steps, names(&["step_x"]));
    assert!(state.failed_step.is_none());
    let timing = &state.step_timings["step_x"];
    assert!(timing.skipped);
    assert!(timing.error.as_deref().unwrap().contains("always broken"));

    // completed/skipped/failed are pairwise disjoint
    assert!(state.completed_steps.iter().all(|s| !state.skipped_steps.contains(s)));

    // The skip is persisted
    let stored = store.load("job-1").await.unwrap().unwrap();
    assert_eq!(stored.skipped_steps, names(&["step_x"]));
}

#[tokio::test]
async fn required_step_failure_marks_job_failed() {
    let mut registry = StepRegistry::new();
    registry.register(
        StepDefinition::new("broken", |_state, _| async move {
            Err(EngineError::StepFailed {
                step: "broken".into(),
                message: "no input video".into(),
            })
        })
        .with_retries(false, 0),
    );

    let store = seeded_store("job-1").await;
    let (sink, mut rx) = ChannelEventSink::new(16);
    let engine = engine(registry, store.clone(), Arc::new(InMemoryCheckpointStore::new()))
        .with_events(Arc::new(sink));

    let err = engine
        .run("job-1", &names(&["broken"]), None, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no input video"));

    let state = store.load("job-1").await.unwrap().unwrap();
    assert_eq!(state.failed_step.as_deref(), Some("broken"));
    assert!(state.error_message.is_some());
    let (status, error) = store.status("job-1").await.unwrap();
    assert_eq!(status, JobStatus::Failed);
    assert!(error.unwrap().contains("no input video"));

    // job_start, step_start, step_error, job_error
    let mut saw_job_error = false;
    while let Ok(event) = rx.try_recv() {
        if let PipelineEvent::JobError { step, .. } = event {
            assert_eq!(step.as_deref(), Some("broken"));
            saw_job_error = true;
        }
    }
    assert!(saw_job_error);
}

#[tokio::test]
async fn stop_after_pauses_for_review() {
    let mut registry = StepRegistry::new();
    let late_runs = Arc::new(AtomicU32::new(0));
    registry.register(StepDefinition::new("classify", |state, _| async move {
        Ok(Some(state))
    }));
    let counter = late_runs.clone();
    registry.register(StepDefinition::new("render", move |state, _| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Some(state))
        }
    }));

    let store = seeded_store("job-1").await;
    let engine = engine(registry, store.clone(), Arc::new(InMemoryCheckpointStore::new()));

    let state = engine
        .run("job-1", &names(&["classify", "render"]), None, Some("classify"))
        .await
        .unwrap();

    assert_eq!(state.completed_steps, names(&["classify"]));
    assert_eq!(late_runs.load(Ordering::SeqCst), 0);
    assert_eq!(store.status("job-1").await.unwrap().0, JobStatus::AwaitingReview);
}

#[tokio::test]
async fn async_step_fires_early_and_merges_at_await_point() {
    // S3: F async produces result_url; G awaits F; S1/S2 run in between.
    let mut registry = StepRegistry::new();

    let f_started = Arc::new(AtomicU32::new(0));
    let f_flag = f_started.clone();
    registry.register(
        StepDefinition::new("step_f", move |state, _| {
            let flag = f_flag.clone();
            async move {
                flag.store(1, Ordering::SeqCst);
                // Slow enough that the sequential steps overtake it
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Some(state.with_updates(|s| {
                    s.video_clipper_track = Some(json!([{"src": "http://x/broll.mp4"}]));
                })))
            }
        })
        .async_mode()
        .with_produces(["video_clipper_track"]),
    );

    let saw_f_started = Arc::new(AtomicU32::new(0));
    let saw_track_midway = Arc::new(AtomicU32::new(0));
    let f_flag = f_started.clone();
    let started = saw_f_started.clone();
    let midway = saw_track_midway.clone();
    registry.register(StepDefinition::new("step_s1", move |state, _| {
        let f_flag = f_flag.clone();
        let started = started.clone();
        let midway = midway.clone();
        async move {
            // F was fired before S1; give its task a moment to start
            for _ in 0..100 {
                if f_flag.load(Ordering::SeqCst) == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            started.store(f_flag.load(Ordering::SeqCst), Ordering::SeqCst);
            // F's output must NOT be visible between fire and await
            if state.video_clipper_track.is_some() {
                midway.store(1, Ordering::SeqCst);
            }
            Ok(Some(state))
        }
    }));
    registry.register(StepDefinition::new("step_s2", |state, _| async move {
        Ok(Some(state))
    }));

    let g_saw_track = Arc::new(AtomicU32::new(0));
    let g_flag = g_saw_track.clone();
    registry.register(
        StepDefinition::new("step_g", move |state, _| {
            let g_flag = g_flag.clone();
            async move {
                if state.video_clipper_track.is_some() {
                    g_flag.store(1, Ordering::SeqCst);
                }
                Ok(Some(state))
            }
        })
        .with_await_async(["step_f"]),
    );

    let store = seeded_store("job-1").await;
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let engine = engine(registry, store.clone(), checkpoints.clone());

    let state = engine
        .run(
            "job-1",
            &names(&["step_f", "step_s1", "step_s2", "step_g"]),
            None,
            None,
        )
        .await
        .unwrap();

    assert_eq!(saw_f_started.load(Ordering::SeqCst), 1, "F fired before S1 ran");
    assert_eq!(saw_track_midway.load(Ordering::SeqCst), 0, "F output hidden before await");
    assert_eq!(g_saw_track.load(Ordering::SeqCst), 1, "G saw merged F output");

    assert!(state.completed_steps.contains(&"step_f".to_string()));
    assert!(state.completed_steps.contains(&"step_g".to_string()));
    assert!(state.step_timings.contains_key("step_f"));
    assert!(state.video_clipper_track.is_some());

    // The merge leaves an await_<step> checkpoint behind
    let cp = checkpoints.get("job-1", "await_step_f").await.unwrap().unwrap();
    assert!(cp.state["video_clipper_track"].is_array());
}

#[tokio::test]
async fn fast_async_step_does_not_block_await() {
    let mut registry = StepRegistry::new();
    registry.register(
        StepDefinition::new("fast_async", |state, _| async move {
            Ok(Some(state.with_updates(|s| {
                s.matting_segments = Some(json!([{"start": 0}]));
                s.matted_video_url = Some("http://x/matted.mp4".into());
            })))
        })
        .async_mode()
        .with_produces(["matting_segments"]),
    );
    registry.register(StepDefinition::new("slow_mid", |state, _| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(Some(state))
    }));
    registry.register(
        StepDefinition::new("awaiter", |state, _| async move { Ok(Some(state)) })
            .with_await_async(["fast_async"]),
    );

    let store = seeded_store("job-1").await;
    let engine = engine(registry, store.clone(), Arc::new(InMemoryCheckpointStore::new()));

    let start = std::time::Instant::now();
    let state = engine
        .run("job-1", &names(&["fast_async", "slow_mid", "awaiter"]), None, None)
        .await
        .unwrap();

    // The await point found the task already finished; no extra 200ms+ wait
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(state.matting_segments.is_some());
    // Extra well-known field merged even though not in `produces`
    assert_eq!(state.matted_video_url.as_deref(), Some("http://x/matted.mp4"));
}

#[tokio::test]
async fn unawaited_async_steps_are_drained_before_completion() {
    let mut registry = StepRegistry::new();
    registry.register(
        StepDefinition::new("bg", |state, _| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Some(state.with_updates(|s| {
                s.title_track = Some(json!([{"text": "Title"}]))
            })))
        })
        .async_mode()
        .with_produces(["title_track"]),
    );
    registry.register(StepDefinition::new("main", |state, _| async move {
        Ok(Some(state))
    }));

    let store = seeded_store("job-1").await;
    let engine = engine(registry, store.clone(), Arc::new(InMemoryCheckpointStore::new()));

    let state = engine
        .run("job-1", &names(&["bg", "main"]), None, None)
        .await
        .unwrap();

    assert!(state.title_track.is_some());
    assert!(state.completed_steps.contains(&"bg".to_string()));
}

#[tokio::test]
async fn job_completes_when_output_url_is_set() {
    let mut registry = StepRegistry::new();
    registry.register(StepDefinition::new("render", |state, _| async move {
        Ok(Some(state.with_updates(|s| {
            s.output_video_url = Some("http://cdn/final.mp4".into())
        })))
    }));

    let store = seeded_store("job-1").await;
    let (sink, mut rx) = ChannelEventSink::new(16);
    let engine = engine(registry, store.clone(), Arc::new(InMemoryCheckpointStore::new()))
        .with_events(Arc::new(sink));

    engine.run("job-1", &names(&["render"]), None, None).await.unwrap();

    assert_eq!(store.status("job-1").await.unwrap().0, JobStatus::Completed);
    let mut saw_complete = false;
    while let Ok(event) = rx.try_recv() {
        if let PipelineEvent::JobComplete { output_url, .. } = event {
            assert_eq!(output_url, "http://cdn/final.mp4");
            saw_complete = true;
        }
    }
    assert!(saw_complete);
}

#[tokio::test]
async fn run_step_returns_result_for_external_drivers() {
    let mut registry = StepRegistry::new();
    registry.register(StepDefinition::new("classify", |state, params| async move {
        let style = params.get("style").and_then(|v| v.as_str()).unwrap_or("default");
        Ok(Some(state.with_updates(|s| {
            s.content_type_detected = Some(style.to_string())
        })))
    }));

    let store = seeded_store("job-1").await;
    let engine = engine(registry, store.clone(), Arc::new(InMemoryCheckpointStore::new()));

    let result = engine
        .run_step("job-1", "classify", json!({"style": "vlog"}))
        .await;
    assert!(result.success);
    assert_eq!(result.step_name, "classify");
    assert!(result.state_summary.is_some());

    let missing = engine.run_step("job-1", "ghost", json!({})).await;
    assert!(!missing.success);
    assert!(missing.error.unwrap().contains("not registered"));

    let no_job = engine.run_step("nope", "classify", json!({})).await;
    assert!(!no_job.success);
}

#[tokio::test]
async fn per_attempt_timeout_counts_as_failure() {
    let mut registry = StepRegistry::new();
    registry.register(
        StepDefinition::new("hang", |state, _| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Some(state))
        })
        .with_timeout(1)
        .with_retries(false, 0)
        .optional(),
    );

    let store = seeded_store("job-1").await;
    let engine = engine(registry, store.clone(), Arc::new(InMemoryCheckpointStore::new()));

    let state = engine
        .run("job-1", &names(&["hang"]), None, None)
        .await
        .unwrap();
    assert_eq!(state.skipped_steps, names(&["hang"]));
    assert!(state.step_timings["hang"]
        .error
        .as_deref()
        .unwrap()
        .contains("timed out"));
}

#[tokio::test]
async fn debug_info_lists_populated_fields() {
    let mut registry = StepRegistry::new();
    registry.register(StepDefinition::new("transcribe", |state, _| async move {
        Ok(Some(state.with_updates(|s| {
            s.transcription_text = Some("hello world".into())
        })))
    }));

    let store = seeded_store("job-1").await;
    let engine = engine(registry, store.clone(), Arc::new(InMemoryCheckpointStore::new()));
    engine.run("job-1", &names(&["transcribe"]), None, None).await.unwrap();

    let debug = engine.get_debug_info("job-1").await.unwrap();
    assert_eq!(debug["has_transcription"], json!(true));
    let keys: Vec<String> = debug["state_keys_with_data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert!(keys.contains(&"transcription_text".to_string()));
    assert!(!keys.contains(&"png_results".to_string()));
}
