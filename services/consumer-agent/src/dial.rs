//! Consumption dial control loop.
//!
//! Each dial is one task owning one mutable target level. The loop reacts to
//! three event sources, checked in this order when several are ready:
//!
//! - the shutdown watch: exit for good
//! - the reassertion deadline: dispatch the target, then re-arm the deadline
//!   `reassert_interval` after the dispatch completed
//! - a `SetLevel` command: overwrite the target (no dispatch, timer untouched)
//!
//! The first deadline is zero and the target is seeded before the task
//! starts, so the first dispatch carries the initial level even if an update
//! is already queued.
//!
//! `set_level` hands the value over through a single-slot inbox and waits
//! for the loop to acknowledge it. While a dispatch is in flight the loop is
//! not selecting, so callers wait for the call to finish.
//!
//! A failed dispatch ends the loop and is published on [`DialFailures`],
//! shared by all dials of one agent. The first failure sticks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::dispatch::{DialKind, StimulusDispatcher, StimulusRequest};
use crate::error::{AgentError, DispatchError, Result};

/// Per-dial parameters fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialSettings {
    pub kind: DialKind,

    /// Units a single replica should consume per request.
    pub request_size: i64,

    /// How long the controller should sustain each dispatched level.
    pub duration_secs: u64,

    /// Delay between two dispatches of the same dial.
    pub reassert_interval: Duration,
}

/// What a dial loop did before it exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialSummary {
    pub kind: DialKind,
    pub dispatches: u64,
    pub last_level: i64,
}

/// A dispatch failure recorded by a dial loop.
#[derive(Debug, Clone)]
pub struct DialFailure {
    pub dial: DialKind,
    pub source: Arc<DispatchError>,
}

impl DialFailure {
    pub fn to_error(&self) -> AgentError {
        AgentError::Dispatch {
            dial: self.dial,
            source: Arc::clone(&self.source),
        }
    }
}

/// First dispatch failure across a group of dials.
#[derive(Debug, Clone)]
pub struct DialFailures {
    tx: Arc<watch::Sender<Option<DialFailure>>>,
}

impl DialFailures {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Keep `failure` unless an earlier one is already recorded.
    fn record(&self, failure: DialFailure) {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(failure);
            true
        });
    }

    /// The recorded failure, if any.
    pub fn first(&self) -> Option<AgentError> {
        self.tx.borrow().as_ref().map(DialFailure::to_error)
    }

    /// Resolve once any dial has failed.
    pub async fn wait(&self) -> AgentError {
        let mut rx = self.tx.subscribe();
        loop {
            let current = rx.borrow_and_update().as_ref().map(DialFailure::to_error);
            if let Some(e) = current {
                return e;
            }
            if rx.changed().await.is_err() {
                // Unreachable while `self` holds the sender.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `fut`, giving up as soon as a dial fails.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        if let Some(e) = self.first() {
            return Err(e);
        }
        tokio::select! {
            biased;

            e = self.wait() => Err(e),
            result = fut => result,
        }
    }
}

impl Default for DialFailures {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
enum DialCommand {
    SetLevel { level: i64, ack: oneshot::Sender<()> },
}

/// Handle to a running dial loop.
pub struct DialHandle {
    kind: DialKind,
    tx: mpsc::Sender<DialCommand>,
    task: JoinHandle<Result<DialSummary>>,
    failures: DialFailures,
}

impl DialHandle {
    pub fn kind(&self) -> DialKind {
        self.kind
    }

    /// Hand a new target to the loop. Returns once the loop accepted it.
    ///
    /// If the loop is gone because a dispatch failed, that failure is
    /// returned; otherwise `DialStopped`.
    pub async fn set_level(&self, level: i64) -> Result<()> {
        let (ack, accepted) = oneshot::channel();
        if self.tx.send(DialCommand::SetLevel { level, ack }).await.is_err() {
            return Err(self.stopped());
        }
        accepted.await.map_err(|_| self.stopped())
    }

    fn stopped(&self) -> AgentError {
        self.failures
            .first()
            .unwrap_or(AgentError::DialStopped(self.kind))
    }

    /// Check if the loop task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    /// Wait for the loop to exit and return its outcome.
    pub async fn join(self) -> Result<DialSummary> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(AgentError::DialAborted {
                dial: self.kind,
                reason: e.to_string(),
            }),
        }
    }
}

/// Start a dial loop seeded with `initial`.
pub fn spawn_dial(
    agent: &str,
    settings: DialSettings,
    initial: i64,
    dispatcher: Arc<dyn StimulusDispatcher>,
    shutdown: watch::Receiver<bool>,
    failures: DialFailures,
) -> DialHandle {
    let (tx, inbox) = mpsc::channel(1);
    let kind = settings.kind;

    let dial = DialLoop {
        agent: agent.to_string(),
        settings,
        target: initial,
        dispatches: 0,
        dispatcher,
        failures: failures.clone(),
    };

    info!(agent, dial = %kind, initial, "Starting dial loop");
    let task = tokio::spawn(dial.run(inbox, shutdown));

    DialHandle {
        kind,
        tx,
        task,
        failures,
    }
}

struct DialLoop {
    agent: String,
    settings: DialSettings,
    target: i64,
    dispatches: u64,
    dispatcher: Arc<dyn StimulusDispatcher>,
    failures: DialFailures,
}

impl DialLoop {
    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<DialCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<DialSummary> {
        let kind = self.settings.kind;
        let reassert = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(reassert);

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!(agent = %self.agent, dial = %kind, "Shutdown sender dropped");
                        break;
                    }
                }
                () = &mut reassert => {
                    self.dispatch().await?;
                    reassert
                        .as_mut()
                        .reset(Instant::now() + self.settings.reassert_interval);
                }
                Some(cmd) = inbox.recv() => {
                    let DialCommand::SetLevel { level, ack } = cmd;
                    self.target = level;
                    info!(
                        agent = %self.agent,
                        dial = %kind,
                        level,
                        unit = kind.unit(),
                        "Setting consumption target"
                    );
                    let _ = ack.send(());
                }
            }
        }

        info!(
            agent = %self.agent,
            dial = %kind,
            dispatches = self.dispatches,
            "Dial loop stopped"
        );

        Ok(DialSummary {
            kind,
            dispatches: self.dispatches,
            last_level: self.target,
        })
    }

    async fn dispatch(&mut self) -> Result<()> {
        let kind = self.settings.kind;
        let request = StimulusRequest {
            dial: kind,
            level: self.target,
            duration_secs: self.settings.duration_secs,
            request_size: self.settings.request_size,
        };

        info!(
            agent = %self.agent,
            dial = %kind,
            level = request.level,
            unit = kind.unit(),
            "Sending consume request"
        );

        if let Err(source) = self.dispatcher.dispatch(&request).await {
            error!(agent = %self.agent, dial = %kind, error = %source, "Dispatch failed");
            let failure = DialFailure {
                dial: kind,
                source: Arc::new(source),
            };
            self.failures.record(failure.clone());
            return Err(failure.to_error());
        }

        self.dispatches += 1;
        Ok(())
    }
}
