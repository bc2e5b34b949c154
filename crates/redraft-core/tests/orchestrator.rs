use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use redraft_core::{Orchestrator, OrchestratorHandle, StaticSource, EMPTY_INPUT_NOTICE};
use redraft_providers::{GenerationBackend, TaskHandle, TaskOutcome, WorkerEvent};
use redraft_types::{EngineEvent, Mode, ModeReport, TaskStatus};

struct StartedTask {
    prompt: String,
    events: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
}

/// Backend double: records every `start` call and leaves the event channel
/// in the test's hands, so tasks complete exactly when the test says so.
#[derive(Clone, Default)]
struct ScriptedBackend {
    started: Arc<Mutex<Vec<StartedTask>>>,
}

impl ScriptedBackend {
    fn new() -> Self {
        Self::default()
    }

    fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    fn prompt(&self, index: usize) -> String {
        self.started.lock().unwrap()[index].prompt.clone()
    }

    fn sender(&self, index: usize) -> mpsc::Sender<WorkerEvent> {
        self.started.lock().unwrap()[index].events.clone()
    }

    fn cancel_token(&self, index: usize) -> CancellationToken {
        self.started.lock().unwrap()[index].cancel.clone()
    }
}

impl GenerationBackend for ScriptedBackend {
    fn start(&self, prompt: String) -> TaskHandle {
        let (events, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        self.started.lock().unwrap().push(StartedTask {
            prompt,
            events,
            cancel: cancel.clone(),
        });
        TaskHandle::from_parts(rx, cancel)
    }
}

fn test_modes(count: usize) -> Vec<Mode> {
    (1..=count)
        .map(|i| Mode::new(format!("Mode {i}"), format!("Instruction {i}:")))
        .collect()
}

fn spawn_orchestrator(
    backend: &ScriptedBackend,
    modes: usize,
    max_concurrent: usize,
) -> OrchestratorHandle {
    Orchestrator::spawn(
        test_modes(modes),
        Arc::new(backend.clone()),
        Arc::new(StaticSource::new("the shared input")),
        max_concurrent,
    )
}

async fn chunk(backend: &ScriptedBackend, index: usize, text: &str) {
    backend
        .sender(index)
        .send(WorkerEvent::Chunk(text.to_string()))
        .await
        .unwrap();
}

async fn finish(backend: &ScriptedBackend, index: usize, outcome: TaskOutcome) {
    backend
        .sender(index)
        .send(WorkerEvent::Finished(outcome))
        .await
        .unwrap();
}

async fn wait_for_started(backend: &ScriptedBackend, count: usize) {
    timeout(Duration::from_secs(2), async {
        while backend.started_count() < count {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for task starts");
}

async fn wait_cancelled(backend: &ScriptedBackend, index: usize) {
    let token = backend.cancel_token(index);
    timeout(Duration::from_secs(2), token.cancelled())
        .await
        .expect("timed out waiting for cancellation request");
}

async fn snapshot_when<F>(handle: &OrchestratorHandle, mut pred: F) -> Vec<ModeReport>
where
    F: FnMut(&[ModeReport]) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            let snapshot = handle.snapshot().await.unwrap();
            if pred(&snapshot) {
                return snapshot;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for snapshot condition")
}

fn status_of(snapshot: &[ModeReport], mode: &str) -> TaskStatus {
    snapshot
        .iter()
        .find(|report| report.mode == mode)
        .unwrap_or_else(|| panic!("mode {mode} missing from snapshot"))
        .status
}

fn count_with_status(snapshot: &[ModeReport], status: TaskStatus) -> usize {
    snapshot
        .iter()
        .filter(|report| report.status == status)
        .count()
}

async fn collect_until_mode_finished(
    events: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
    mode: &str,
) -> Vec<EngineEvent> {
    let mut seen = Vec::new();
    timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.unwrap();
            let done = matches!(&event, EngineEvent::ModeFinished { mode: m } if m == mode);
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for mode to finish");
    seen
}

#[tokio::test]
async fn run_all_starts_up_to_the_limit_and_backfills_in_order() {
    let backend = ScriptedBackend::new();
    let handle = spawn_orchestrator(&backend, 9, 3);

    handle.run_all().await.unwrap();
    wait_for_started(&backend, 3).await;
    sleep(Duration::from_millis(30)).await;
    assert_eq!(backend.started_count(), 3, "concurrency ceiling exceeded");

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(count_with_status(&snapshot, TaskStatus::Running), 3);
    assert_eq!(count_with_status(&snapshot, TaskStatus::Queued), 6);

    // Prompts follow the table order and embed the shared input.
    assert!(backend.prompt(0).starts_with("Instruction 1:"));
    assert!(backend.prompt(2).starts_with("Instruction 3:"));
    assert!(backend.prompt(0).ends_with("the shared input"));

    chunk(&backend, 0, "out").await;
    finish(&backend, 0, TaskOutcome::Ok).await;

    // Exactly one new task starts, from the front of the queue.
    wait_for_started(&backend, 4).await;
    sleep(Duration::from_millis(30)).await;
    assert_eq!(backend.started_count(), 4);
    assert!(backend.prompt(3).starts_with("Instruction 4:"));

    let snapshot = snapshot_when(&handle, |s| status_of(s, "Mode 1") == TaskStatus::Done).await;
    assert_eq!(count_with_status(&snapshot, TaskStatus::Running), 3);
    let report = snapshot.iter().find(|r| r.mode == "Mode 1").unwrap();
    assert_eq!(report.text, "out");
}

#[tokio::test]
async fn empty_input_emits_one_notice_and_starts_nothing() {
    let backend = ScriptedBackend::new();
    let handle = Orchestrator::spawn(
        test_modes(3),
        Arc::new(backend.clone()),
        Arc::new(StaticSource::new("   \n")),
        3,
    );
    let mut events = handle.subscribe();

    handle.run_all().await.unwrap();

    match timeout(Duration::from_secs(1), events.recv()).await.unwrap() {
        Ok(EngineEvent::Notice { message }) => assert_eq!(message, EMPTY_INPUT_NOTICE),
        other => panic!("expected notice, got {other:?}"),
    }
    sleep(Duration::from_millis(30)).await;
    assert_eq!(backend.started_count(), 0);
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn refresh_suppresses_stale_events_from_the_superseded_attempt() {
    let backend = ScriptedBackend::new();
    let handle = spawn_orchestrator(&backend, 3, 3);

    handle.run_all().await.unwrap();
    wait_for_started(&backend, 3).await;
    let mut events = handle.subscribe();

    chunk(&backend, 0, "Hel").await;

    handle.refresh("Mode 1").await.unwrap();
    wait_cancelled(&backend, 0).await;

    // Late output from the superseded attempt: dropped, but its finish frees
    // the slot for the replacement waiting at the queue front.
    chunk(&backend, 0, "lo").await;
    finish(&backend, 0, TaskOutcome::Cancelled).await;

    wait_for_started(&backend, 4).await;
    assert!(backend.prompt(3).starts_with("Instruction 1:"));

    chunk(&backend, 3, "fresh").await;
    finish(&backend, 3, TaskOutcome::Ok).await;

    let seen = collect_until_mode_finished(&mut events, "Mode 1").await;
    assert!(seen.contains(&EngineEvent::Chunk {
        mode: "Mode 1".to_string(),
        text: "Hel".to_string(),
    }));
    assert!(seen.contains(&EngineEvent::Chunk {
        mode: "Mode 1".to_string(),
        text: "fresh".to_string(),
    }));
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, EngineEvent::Chunk { text, .. } if text == "lo")),
        "stale chunk leaked through: {seen:?}"
    );

    // The refresh reset the accumulated text; only the new attempt remains.
    let snapshot = handle.snapshot().await.unwrap();
    let report = snapshot.iter().find(|r| r.mode == "Mode 1").unwrap();
    assert_eq!(report.text, "fresh");
    assert_eq!(report.status, TaskStatus::Done);
}

#[tokio::test]
async fn refresh_while_slots_full_jumps_the_queue() {
    let backend = ScriptedBackend::new();
    let handle = spawn_orchestrator(&backend, 9, 3);

    handle.run_all().await.unwrap();
    wait_for_started(&backend, 3).await;

    handle.refresh("Mode 9").await.unwrap();
    let snapshot = snapshot_when(&handle, |s| {
        s.iter()
            .any(|r| r.mode == "Mode 9" && r.generation == 2 && r.status == TaskStatus::Queued)
    })
    .await;
    assert_eq!(count_with_status(&snapshot, TaskStatus::Running), 3);

    finish(&backend, 1, TaskOutcome::Ok).await;
    wait_for_started(&backend, 4).await;
    assert!(
        backend.prompt(3).starts_with("Instruction 9:"),
        "refreshed mode should start before the rest of the batch"
    );
}

#[tokio::test]
async fn rerun_does_not_let_stale_finishes_disturb_the_new_batch() {
    let backend = ScriptedBackend::new();
    let handle = spawn_orchestrator(&backend, 4, 2);

    handle.run_all().await.unwrap();
    wait_for_started(&backend, 2).await;

    handle.run_all().await.unwrap();
    wait_for_started(&backend, 4).await;
    wait_cancelled(&backend, 0).await;
    wait_cancelled(&backend, 1).await;

    // The first batch resolves late; its slots now belong to the new batch,
    // so nothing extra may start.
    finish(&backend, 0, TaskOutcome::Cancelled).await;
    finish(&backend, 1, TaskOutcome::Cancelled).await;
    sleep(Duration::from_millis(30)).await;
    assert_eq!(backend.started_count(), 4);

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(status_of(&snapshot, "Mode 1"), TaskStatus::Running);
    assert_eq!(status_of(&snapshot, "Mode 2"), TaskStatus::Running);

    // A real completion of the new batch still backfills from the queue.
    finish(&backend, 2, TaskOutcome::Ok).await;
    wait_for_started(&backend, 5).await;
    assert!(backend.prompt(4).starts_with("Instruction 3:"));
}

#[tokio::test]
async fn cancel_all_resolves_running_and_queued_modes() {
    let backend = ScriptedBackend::new();
    let handle = spawn_orchestrator(&backend, 5, 2);

    handle.run_all().await.unwrap();
    wait_for_started(&backend, 2).await;
    let mut events = handle.subscribe();

    chunk(&backend, 0, "Hel").await;
    chunk(&backend, 0, "lo").await;

    handle.cancel_all().await.unwrap();
    wait_cancelled(&backend, 0).await;
    wait_cancelled(&backend, 1).await;

    // Workers observe the request at their next boundary.
    finish(&backend, 0, TaskOutcome::Cancelled).await;
    finish(&backend, 1, TaskOutcome::Cancelled).await;

    let snapshot =
        snapshot_when(&handle, |s| count_with_status(s, TaskStatus::Cancelled) == 5).await;
    assert_eq!(count_with_status(&snapshot, TaskStatus::Running), 0);
    sleep(Duration::from_millis(30)).await;
    assert_eq!(backend.started_count(), 2, "queue must not refill");

    let seen = collect_until_mode_finished(&mut events, "Mode 1").await;
    let chunks: Vec<&EngineEvent> = seen
        .iter()
        .filter(|e| matches!(e, EngineEvent::Chunk { .. }))
        .collect();
    assert_eq!(
        chunks,
        vec![
            &EngineEvent::Chunk {
                mode: "Mode 1".to_string(),
                text: "Hel".to_string(),
            },
            &EngineEvent::Chunk {
                mode: "Mode 1".to_string(),
                text: "lo".to_string(),
            },
        ]
    );
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, EngineEvent::ModeError { .. })),
        "cancellation must not surface an error"
    );
}

#[tokio::test]
async fn mode_error_does_not_block_the_rest_of_the_queue() {
    let backend = ScriptedBackend::new();
    let handle = spawn_orchestrator(&backend, 4, 2);
    handle.run_all().await.unwrap();
    wait_for_started(&backend, 2).await;
    let mut events = handle.subscribe();

    finish(&backend, 0, TaskOutcome::Error("boom".to_string())).await;

    let seen = collect_until_mode_finished(&mut events, "Mode 1").await;
    assert!(seen.contains(&EngineEvent::ModeError {
        mode: "Mode 1".to_string(),
        message: "boom".to_string(),
    }));

    wait_for_started(&backend, 3).await;
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(status_of(&snapshot, "Mode 1"), TaskStatus::Error);
    assert_eq!(status_of(&snapshot, "Mode 3"), TaskStatus::Running);
    let report = snapshot.iter().find(|r| r.mode == "Mode 1").unwrap();
    assert_eq!(report.error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn refine_runs_outside_the_slot_accounting() {
    let backend = ScriptedBackend::new();
    let handle = spawn_orchestrator(&backend, 3, 3);

    handle.run_all().await.unwrap();
    wait_for_started(&backend, 3).await;
    let mut events = handle.subscribe();

    handle.refine("## Mode 1\nsome text").await.unwrap();
    wait_for_started(&backend, 4).await;
    assert!(backend.prompt(3).starts_with("Review all the following"));

    // All three mode slots stay occupied while refine streams.
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(count_with_status(&snapshot, TaskStatus::Running), 3);

    chunk(&backend, 3, "polished").await;
    finish(&backend, 3, TaskOutcome::Ok).await;

    let mut saw_chunk = false;
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await.unwrap() {
                EngineEvent::RefineChunk { text } => {
                    assert_eq!(text, "polished");
                    saw_chunk = true;
                }
                EngineEvent::RefineFinished => break,
                _ => {}
            }
        }
    })
    .await
    .expect("timed out waiting for refine to finish");
    assert!(saw_chunk);
}

#[tokio::test]
async fn a_new_refine_supersedes_the_previous_one() {
    let backend = ScriptedBackend::new();
    let handle = spawn_orchestrator(&backend, 1, 1);

    handle.refine("first draft").await.unwrap();
    wait_for_started(&backend, 1).await;
    let mut events = handle.subscribe();

    handle.refine("second draft").await.unwrap();
    wait_cancelled(&backend, 0).await;
    wait_for_started(&backend, 2).await;

    // Output from the first refine is stale once the second is live.
    chunk(&backend, 0, "old").await;
    finish(&backend, 0, TaskOutcome::Cancelled).await;

    chunk(&backend, 1, "new").await;
    finish(&backend, 1, TaskOutcome::Ok).await;

    let mut texts = Vec::new();
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await.unwrap() {
                EngineEvent::RefineChunk { text } => texts.push(text),
                EngineEvent::RefineFinished => break,
                _ => {}
            }
        }
    })
    .await
    .expect("timed out waiting for refine to finish");
    assert_eq!(texts, vec!["new".to_string()]);
}
