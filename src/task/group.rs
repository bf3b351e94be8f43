//! Runs part tasks on a bounded pool of workers and records their results in the checkpoint.
//!

use crate::checkpoint::Checkpoint;
use crate::checkpoint::TransferKind;
use crate::error::{Error, Result};
use crate::event::EventSink;
use crate::part::Part;
use crate::task::BoxedTask;
use async_channel::{bounded, Receiver, Sender};
use futures_util::future::join_all;
use std::result;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// The maximum number of workers.
pub const MAX_TASK_NUM: usize = 1000;

/// The result of one task, with the part number on failure.
type PartResult = result::Result<Part, (u64, Error)>;

/// How a group finished.
#[derive(Debug)]
pub enum GroupState {
    /// Every task succeeded.
    Completed,
    /// All tasks ran but some failed with errors that may succeed on a later attempt.
    Incomplete(Vec<Error>),
    /// A task failed in a way that cannot be fixed by retrying, or the checkpoint could not
    /// be written. Remaining tasks were stopped.
    Aborted(Error),
    /// The group was cancelled from outside.
    Cancelled,
}

/// The outcome of running a group.
#[derive(Debug)]
pub struct GroupOutcome {
    pub workers: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub state: GroupState,
}

/// A set of part tasks run with bounded concurrency.
pub struct TaskGroup {
    tasks: Vec<BoxedTask>,
    concurrency: usize,
    cancel: CancellationToken,
    persist: bool,
    events: EventSink,
}

impl TaskGroup {
    /// Create a group. Concurrency is clamped to `[1, MAX_TASK_NUM]`. The group stops when
    /// `cancel` is cancelled.
    pub fn new(tasks: Vec<BoxedTask>, concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            tasks,
            concurrency: concurrency.clamp(1, MAX_TASK_NUM),
            cancel,
            persist: false,
            events: EventSink::disabled(TransferKind::Upload),
        }
    }

    /// Write the checkpoint after every completed part.
    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Post part events to the sink.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Run every task, updating the checkpoint as parts complete.
    pub async fn run(self, checkpoint: &mut Checkpoint) -> Result<GroupOutcome> {
        let Self {
            mut tasks,
            concurrency,
            cancel,
            persist,
            events,
        } = self;

        let total = tasks.len();
        let workers = concurrency.min(total);
        if total == 0 {
            return Ok(GroupOutcome {
                workers,
                total,
                succeeded: 0,
                failed: 0,
                state: GroupState::Completed,
            });
        }

        tasks.sort_by_key(|task| task.part().part_number());
        debug!(total, workers, "starting part tasks");

        // Aborting stops the workers without cancelling the caller's token.
        let abort = cancel.child_token();
        let (task_tx, task_rx) = bounded(workers);
        let (result_tx, mut result_rx) = unbounded_channel();

        let scheduler = tokio::spawn(schedule(tasks, task_tx, abort.clone()));
        let handles = (0..workers)
            .map(|_| tokio::spawn(work(task_rx.clone(), result_tx.clone(), abort.clone())))
            .collect::<Vec<_>>();
        drop(task_rx);
        drop(result_tx);

        let mut control = Control {
            checkpoint,
            persist,
            events: &events,
            total,
            succeeded: 0,
            failed: 0,
        };
        let state = control.wait(&mut result_rx, &cancel, &abort).await;
        let (succeeded, failed) = (control.succeeded, control.failed);

        // Stop anything still running before returning.
        abort.cancel();
        scheduler.await?;
        for handle in join_all(handles).await {
            handle?;
        }

        Ok(GroupOutcome {
            workers,
            total,
            succeeded,
            failed,
            state,
        })
    }
}

/// The control loop which owns the checkpoint while workers run.
struct Control<'a> {
    checkpoint: &'a mut Checkpoint,
    persist: bool,
    events: &'a EventSink,
    total: usize,
    succeeded: usize,
    failed: usize,
}

impl Control<'_> {
    async fn wait(
        &mut self,
        results: &mut UnboundedReceiver<PartResult>,
        cancel: &CancellationToken,
        abort: &CancellationToken,
    ) -> GroupState {
        let mut errors = vec![];

        while self.succeeded + self.failed < self.total {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("part tasks cancelled");
                    return self.drain(results).await;
                }
                result = results.recv() => result,
            };

            match result {
                Some(Ok(part)) => {
                    if let Err(err) = self.record(part.clone()).await {
                        warn!(%err, "failed to record part, aborting");
                        abort.cancel();
                        return GroupState::Aborted(err);
                    }
                    self.succeeded += 1;
                    self.events.part_succeeded(&part);
                }
                Some(Err((part_number, err))) if err.is_fatal() => {
                    warn!(part_number, %err, "part failed with a fatal error, aborting");
                    abort.cancel();
                    self.events.part_aborted(part_number, &err);
                    return GroupState::Aborted(err);
                }
                Some(Err((part_number, err))) => {
                    warn!(part_number, %err, "part failed");
                    self.failed += 1;
                    self.events.part_failed(part_number, &err);
                    errors.push(err);
                }
                // Workers only stop early when cancelled.
                None => return GroupState::Cancelled,
            }
        }

        if errors.is_empty() {
            GroupState::Completed
        } else {
            GroupState::Incomplete(errors)
        }
    }

    /// Record results that arrived before the group was cancelled so that finished parts are
    /// not transferred again when resuming.
    async fn drain(&mut self, results: &mut UnboundedReceiver<PartResult>) -> GroupState {
        while let Ok(result) = results.try_recv() {
            match result {
                Ok(part) => {
                    if let Err(err) = self.record(part.clone()).await {
                        warn!(%err, "failed to record part, aborting");
                        return GroupState::Aborted(err);
                    }
                    self.succeeded += 1;
                    self.events.part_succeeded(&part);
                }
                Err((part_number, err)) => {
                    self.failed += 1;
                    self.events.part_failed(part_number, &err);
                }
            }
        }

        GroupState::Cancelled
    }

    async fn record(&mut self, part: Part) -> Result<()> {
        trace!(part_number = part.part_number(), "part completed");
        self.checkpoint.update_part(part)?;
        if self.persist {
            self.checkpoint.persist().await?;
        }
        Ok(())
    }
}

/// Feed tasks to the workers in part number order until done or aborted.
async fn schedule(tasks: Vec<BoxedTask>, sender: Sender<BoxedTask>, abort: CancellationToken) {
    for task in tasks {
        tokio::select! {
            biased;
            _ = abort.cancelled() => break,
            sent = sender.send(task) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

/// Run tasks until the channel closes or the group is aborted. An in-flight task is dropped
/// when the group is aborted.
async fn work(
    tasks: Receiver<BoxedTask>,
    results: UnboundedSender<PartResult>,
    abort: CancellationToken,
) {
    loop {
        let task = tokio::select! {
            biased;
            _ = abort.cancelled() => return,
            task = tasks.recv() => match task {
                Ok(task) => task,
                Err(_) => return,
            },
        };

        let part_number = task.part().part_number();
        let result = tokio::select! {
            biased;
            _ = abort.cancelled() => return,
            result = task.run() => result,
        };

        if results
            .send(result.map_err(|err| (part_number, err)))
            .is_err()
        {
            return;
        }
    }
}
