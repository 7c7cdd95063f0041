//! Shared test doubles for the oracle and snapshot publishing.

#![allow(dead_code)]

use async_trait::async_trait;
use llm_chess_arena::{
    LlmError, LlmErrorKind, OracleClient, OracleSettings, Prompt, SamplingOptions,
    SessionHandle, SessionSnapshot, SnapshotPublisher, TextGenerator,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted generator response.
#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    Fail(LlmErrorKind),
    Delay(Duration, String),
    Hang,
}

pub fn reply(text: &str) -> Step {
    Step::Reply(text.to_string())
}

/// Generator that plays back a fixed script and records every request.
///
/// Once the script runs out every call fails with a transport error.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    requests: Mutex<Vec<(String, Prompt, SamplingOptions)>>,
    agents: Vec<String>,
}

impl ScriptedGenerator {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn with_agents(agents: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            agents: agents.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most `generate` calls that were pending at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(String, Prompt, SamplingOptions)> {
        self.requests.lock().expect("requests lock poisoned").clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn list_agents(&self) -> Result<Vec<String>, LlmError> {
        if self.agents.is_empty() {
            return Err(LlmError::new(LlmErrorKind::Transport, "listing unavailable"));
        }
        Ok(self.agents.clone())
    }

    async fn generate(
        &self,
        agent: &str,
        prompt: &Prompt,
        options: &SamplingOptions,
    ) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _pending = InFlight::enter(self);
        self.requests
            .lock()
            .expect("requests lock poisoned")
            .push((agent.to_string(), prompt.clone(), *options));

        let step = self.steps.lock().expect("steps lock poisoned").pop_front();
        match step {
            Some(Step::Reply(text)) => Ok(text),
            Some(Step::Fail(kind)) => Err(LlmError::new(kind, "scripted failure")),
            Some(Step::Delay(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            Some(Step::Hang) => std::future::pending().await,
            None => Err(LlmError::new(LlmErrorKind::Transport, "script exhausted")),
        }
    }
}

/// Counts a pending `generate` call until completed or dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(generator: &'a ScriptedGenerator) -> Self {
        let now = generator.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        generator.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(&generator.in_flight)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Oracle over a scripted generator with default settings.
pub fn oracle(generator: &Arc<ScriptedGenerator>) -> OracleClient {
    OracleClient::new(generator.clone(), OracleSettings::default())
}

/// Publisher that keeps every snapshot it receives.
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    pub snapshots: Arc<Mutex<Vec<SessionSnapshot>>>,
}

impl SnapshotPublisher for RecordingPublisher {
    fn publish(&mut self, snapshot: SessionSnapshot) {
        self.snapshots
            .lock()
            .expect("snapshots lock poisoned")
            .push(snapshot);
    }
}

/// Polls the session until `done` holds, advancing paused time in small steps.
pub async fn wait_for(
    handle: &SessionHandle,
    done: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    for _ in 0..10_000 {
        let snapshot = handle.snapshot().await.expect("session alive");
        if done(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
