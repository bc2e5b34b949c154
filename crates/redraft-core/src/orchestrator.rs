use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use redraft_providers::{GenerationBackend, TaskHandle, TaskOutcome, WorkerEvent};
use redraft_types::{
    build_prompt, build_refine_prompt, EngineEvent, Generation, Mode, ModeReport, TaskStatus,
};

use crate::event_bus::EventBus;
use crate::input::InputSource;

pub const DEFAULT_MAX_CONCURRENT: usize = 3;
pub const EMPTY_INPUT_NOTICE: &str = "Shared input text is empty; nothing to generate.";

enum Command {
    RunAll,
    Refresh { mode: String },
    CancelAll,
    Refine { combined: String },
    Snapshot { reply: oneshot::Sender<Vec<ModeReport>> },
    Shutdown,
}

#[derive(Clone)]
enum SignalTarget {
    Mode(String),
    Refine,
}

enum SignalPayload {
    Chunk(String),
    Finished(TaskOutcome),
}

/// Generation-tagged message from a task worker into the actor loop. Workers
/// never touch orchestrator state directly; everything funnels through here.
struct TaskSignal {
    target: SignalTarget,
    generation: Generation,
    payload: SignalPayload,
}

struct ModeState {
    mode: Mode,
    generation: Generation,
    status: TaskStatus,
    text: String,
    error: Option<String>,
}

struct LiveTask {
    generation: Generation,
    cancel: CancellationToken,
}

/// Client side of the orchestrator actor. Cheap to clone; all operations are
/// non-blocking sends into the actor's command queue.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    bus: EventBus,
}

impl OrchestratorHandle {
    pub async fn run_all(&self) -> anyhow::Result<()> {
        self.send(Command::RunAll).await
    }

    pub async fn refresh(&self, mode: impl Into<String>) -> anyhow::Result<()> {
        self.send(Command::Refresh { mode: mode.into() }).await
    }

    pub async fn cancel_all(&self) -> anyhow::Result<()> {
        self.send(Command::CancelAll).await
    }

    pub async fn refine(&self, combined: impl Into<String>) -> anyhow::Result<()> {
        self.send(Command::Refine {
            combined: combined.into(),
        })
        .await
    }

    pub async fn snapshot(&self) -> anyhow::Result<Vec<ModeReport>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| anyhow::anyhow!("orchestrator stopped"))
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.send(Command::Shutdown).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    async fn send(&self, command: Command) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("orchestrator stopped"))
    }
}

/// Single-owner actor for all scheduling state: generation map, running
/// slots, pending queue, per-mode results. Mutations are linearized by the
/// actor loop, so a "task finished" signal can never race a "refresh"
/// command.
pub struct Orchestrator {
    backend: Arc<dyn GenerationBackend>,
    input: Arc<dyn InputSource>,
    bus: EventBus,
    max_concurrent: usize,
    commands: mpsc::Receiver<Command>,
    signal_tx: mpsc::Sender<TaskSignal>,
    signals: mpsc::Receiver<TaskSignal>,
    order: Vec<String>,
    states: HashMap<String, ModeState>,
    running: HashMap<String, LiveTask>,
    pending: VecDeque<String>,
    next_generation: Generation,
    input_text: String,
    refine: Option<LiveTask>,
}

impl Orchestrator {
    pub fn spawn(
        modes: Vec<Mode>,
        backend: Arc<dyn GenerationBackend>,
        input: Arc<dyn InputSource>,
        max_concurrent: usize,
    ) -> OrchestratorHandle {
        let bus = EventBus::new();
        let (command_tx, commands) = mpsc::channel(64);
        let (signal_tx, signals) = mpsc::channel(256);
        let order: Vec<String> = modes.iter().map(|mode| mode.name.clone()).collect();
        let states = modes
            .into_iter()
            .map(|mode| {
                let name = mode.name.clone();
                let state = ModeState {
                    mode,
                    generation: 0,
                    status: TaskStatus::Queued,
                    text: String::new(),
                    error: None,
                };
                (name, state)
            })
            .collect();

        let actor = Orchestrator {
            backend,
            input,
            bus: bus.clone(),
            max_concurrent: max_concurrent.max(1),
            commands,
            signal_tx,
            signals,
            order,
            states,
            running: HashMap::new(),
            pending: VecDeque::new(),
            next_generation: 0,
            input_text: String::new(),
            refine: None,
        };
        tokio::spawn(actor.run());

        OrchestratorHandle {
            commands: command_tx,
            bus,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::RunAll) => self.handle_run_all(),
                        Some(Command::Refresh { mode }) => self.handle_refresh(mode),
                        Some(Command::CancelAll) => self.handle_cancel_all(),
                        Some(Command::Refine { combined }) => self.handle_refine(combined),
                        Some(Command::Snapshot { reply }) => {
                            let _ = reply.send(self.snapshot());
                        }
                        Some(Command::Shutdown) | None => break,
                    }
                }
                Some(signal) = self.signals.recv() => self.handle_signal(signal),
            }
        }
        self.cancel_live_tasks();
    }

    fn handle_run_all(&mut self) {
        let text = match self.input.read() {
            Ok(text) => text,
            Err(err) => {
                warn!(%err, "failed to read shared input text");
                self.bus.publish(EngineEvent::Notice {
                    message: format!("Failed to read input text: {err}"),
                });
                return;
            }
        };
        if text.trim().is_empty() {
            self.bus.publish(EngineEvent::Notice {
                message: EMPTY_INPUT_NOTICE.to_string(),
            });
            return;
        }
        self.input_text = text;

        self.next_generation += 1;
        let generation = self.next_generation;
        info!(generation, "starting full generation batch");

        // Best effort: late events from the old batch are dropped by the
        // generation check, not relied on to stop promptly.
        for task in self.running.values() {
            task.cancel.cancel();
        }
        self.running.clear();
        self.pending.clear();

        for name in self.order.clone() {
            if let Some(state) = self.states.get_mut(&name) {
                state.generation = generation;
                state.status = TaskStatus::Queued;
                state.text.clear();
                state.error = None;
            }
            self.pending.push_back(name);
        }
        self.fill_slots();
    }

    fn handle_refresh(&mut self, name: String) {
        if !self.states.contains_key(&name) {
            warn!(mode = %name, "refresh requested for unknown mode");
            return;
        }
        if self.input_text.trim().is_empty() {
            self.bus.publish(EngineEvent::Notice {
                message: EMPTY_INPUT_NOTICE.to_string(),
            });
            return;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        debug!(mode = %name, generation, "refreshing mode");

        let was_running = match self.running.get(&name) {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        };
        self.pending.retain(|queued| queued != &name);

        if let Some(state) = self.states.get_mut(&name) {
            state.generation = generation;
            state.status = TaskStatus::Queued;
            state.text.clear();
            state.error = None;
        }

        // The superseded attempt keeps its slot until its finished signal
        // arrives; the refreshed job waits at the queue front so the freed
        // slot goes to it ahead of the original batch order.
        if was_running || self.running.len() >= self.max_concurrent {
            self.pending.push_front(name);
        } else {
            self.start_task(name);
        }
    }

    fn handle_cancel_all(&mut self) {
        info!("cancelling all tasks");
        for name in std::mem::take(&mut self.pending) {
            if let Some(state) = self.states.get_mut(&name) {
                state.status = TaskStatus::Cancelled;
            }
            self.bus.publish(EngineEvent::ModeFinished { mode: name });
        }
        for task in self.running.values() {
            task.cancel.cancel();
        }
        if let Some(refine) = &self.refine {
            refine.cancel.cancel();
        }
    }

    fn handle_refine(&mut self, combined: String) {
        if combined.trim().is_empty() {
            return;
        }
        if let Some(refine) = self.refine.take() {
            refine.cancel.cancel();
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        debug!(generation, "starting refine task");

        // Refine is one-shot and slotless: it never touches the pending
        // queue or the running map.
        let handle = self.backend.start(build_refine_prompt(&combined));
        let cancel = handle.cancel_token();
        self.refine = Some(LiveTask { generation, cancel });
        pump(handle, SignalTarget::Refine, generation, self.signal_tx.clone());
    }

    fn fill_slots(&mut self) {
        while self.running.len() < self.max_concurrent {
            let Some(name) = self.pending.pop_front() else {
                break;
            };
            self.start_task(name);
        }
    }

    fn start_task(&mut self, name: String) {
        let Some(state) = self.states.get_mut(&name) else {
            return;
        };
        state.status = TaskStatus::Running;
        let generation = state.generation;
        let prompt = build_prompt(&state.mode, &self.input_text);
        let handle = self.backend.start(prompt);
        let cancel = handle.cancel_token();
        debug!(mode = %name, generation, "task started");
        self.running
            .insert(name.clone(), LiveTask { generation, cancel });
        pump(
            handle,
            SignalTarget::Mode(name),
            generation,
            self.signal_tx.clone(),
        );
    }

    fn handle_signal(&mut self, signal: TaskSignal) {
        match signal.target {
            SignalTarget::Mode(name) => {
                self.handle_mode_signal(name, signal.generation, signal.payload)
            }
            SignalTarget::Refine => self.handle_refine_signal(signal.generation, signal.payload),
        }
    }

    fn handle_mode_signal(&mut self, name: String, generation: Generation, payload: SignalPayload) {
        let is_current = self
            .states
            .get(&name)
            .is_some_and(|state| state.generation == generation);
        match payload {
            SignalPayload::Chunk(text) => {
                if !is_current {
                    debug!(mode = %name, generation, "dropping stale chunk");
                    return;
                }
                if let Some(state) = self.states.get_mut(&name) {
                    state.text.push_str(&text);
                }
                self.bus.publish(EngineEvent::Chunk { mode: name, text });
            }
            SignalPayload::Finished(outcome) => {
                // The slot is freed only while this attempt still occupies
                // it; a newer attempt for the same mode may have taken over.
                let owns_slot = self
                    .running
                    .get(&name)
                    .is_some_and(|task| task.generation == generation);
                if owns_slot {
                    self.running.remove(&name);
                }
                if is_current {
                    self.finish_mode(&name, outcome);
                } else {
                    debug!(mode = %name, generation, "stale task finished");
                }
                if owns_slot {
                    self.fill_slots();
                }
            }
        }
    }

    fn finish_mode(&mut self, name: &str, outcome: TaskOutcome) {
        let Some(state) = self.states.get_mut(name) else {
            return;
        };
        match outcome {
            TaskOutcome::Ok => {
                if state.status != TaskStatus::Error {
                    state.status = TaskStatus::Done;
                }
            }
            TaskOutcome::Error(message) => {
                state.status = TaskStatus::Error;
                state.error = Some(message.clone());
                self.bus.publish(EngineEvent::ModeError {
                    mode: name.to_string(),
                    message,
                });
            }
            TaskOutcome::Cancelled => {
                state.status = TaskStatus::Cancelled;
            }
        }
        self.bus.publish(EngineEvent::ModeFinished {
            mode: name.to_string(),
        });
    }

    fn handle_refine_signal(&mut self, generation: Generation, payload: SignalPayload) {
        let is_current = self
            .refine
            .as_ref()
            .is_some_and(|task| task.generation == generation);
        if !is_current {
            debug!(generation, "dropping stale refine event");
            return;
        }
        match payload {
            SignalPayload::Chunk(text) => {
                self.bus.publish(EngineEvent::RefineChunk { text });
            }
            SignalPayload::Finished(outcome) => {
                self.refine = None;
                if let TaskOutcome::Error(message) = outcome {
                    self.bus.publish(EngineEvent::RefineError { message });
                }
                self.bus.publish(EngineEvent::RefineFinished);
            }
        }
    }

    fn snapshot(&self) -> Vec<ModeReport> {
        self.order
            .iter()
            .filter_map(|name| self.states.get(name))
            .map(|state| ModeReport {
                mode: state.mode.name.clone(),
                generation: state.generation,
                status: state.status,
                text: state.text.clone(),
                error: state.error.clone(),
            })
            .collect()
    }

    fn cancel_live_tasks(&mut self) {
        for task in self.running.values() {
            task.cancel.cancel();
        }
        if let Some(refine) = &self.refine {
            refine.cancel.cancel();
        }
    }
}

// Forward worker events into the actor's signal queue. Chunk order is
// preserved per task; the terminal signal is always last.
fn pump(
    mut handle: TaskHandle,
    target: SignalTarget,
    generation: Generation,
    signals: mpsc::Sender<TaskSignal>,
) {
    tokio::spawn(async move {
        let mut finished = false;
        while let Some(event) = handle.next_event().await {
            let payload = match event {
                WorkerEvent::Chunk(text) => SignalPayload::Chunk(text),
                WorkerEvent::Finished(outcome) => {
                    finished = true;
                    SignalPayload::Finished(outcome)
                }
            };
            let signal = TaskSignal {
                target: target.clone(),
                generation,
                payload,
            };
            if signals.send(signal).await.is_err() || finished {
                return;
            }
        }
        if !finished {
            // Worker stopped without a terminal event; free the slot anyway.
            let _ = signals
                .send(TaskSignal {
                    target,
                    generation,
                    payload: SignalPayload::Finished(TaskOutcome::Error(
                        "worker stopped without completing".to_string(),
                    )),
                })
                .await;
        }
    });
}
