//! The per-folder resolution control loop.
//!
//! Requests are deduplicated and superseded work is canceled under one
//! narrow lock; accepted requests go onto a queue consumed by a single
//! worker task, so at most one attempt runs at a time while `resolve`
//! itself never blocks. Requests carrying the tag of a running resolution
//! (issued from inside that resolution, e.g. by the sync it triggers) are
//! ignored.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use tlfcr_core::config::ResolverConfig;
use tlfcr_core::{CrError, CrResult};

use crate::attempts::{AttemptLog, StuckChange};
use crate::folder::{ConflictInput, Folder, RequestContext};
use crate::pipeline::{panic_error, panic_message, Attempt, Outcome, Phase};
use crate::renamer::{ConflictRenamer, WriterRevisionRenamer};

struct Job {
    input: ConflictInput,
    cancel: CancellationToken,
}

/// Mutable loop state, only ever touched under `Inner::state`.
#[derive(Default)]
struct LoopState {
    current: ConflictInput,
    cancel: Option<CancellationToken>,
    paused: bool,
    /// Accepted requests whose job hasn't finished yet
    outstanding: usize,
    canceled_count: usize,
    lock_next_time: bool,
}

impl LoopState {
    /// Whether `input` is dominated by the input already being handled.
    fn is_stale(&self, input: ConflictInput) -> bool {
        input.unmerged <= self.current.unmerged && input.merged <= self.current.merged
    }
}

struct Inner {
    folder: Arc<dyn Folder>,
    renamer: Arc<dyn ConflictRenamer>,
    attempts: Arc<AttemptLog>,
    config: ResolverConfig,
    state: Mutex<LoopState>,
    idle: Notify,
}

/// Drives conflict resolution for one folder.
pub struct ConflictResolver {
    inner: Arc<Inner>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl ConflictResolver {
    /// Start the resolver's worker. Must be called from within a Tokio
    /// runtime.
    pub fn new(folder: Arc<dyn Folder>, config: ResolverConfig, attempts: Arc<AttemptLog>) -> Self {
        let renamer = Arc::new(WriterRevisionRenamer::new(config.conflict_suffix.clone()));
        Self::with_renamer(folder, config, attempts, renamer)
    }

    pub fn with_renamer(
        folder: Arc<dyn Folder>,
        config: ResolverConfig,
        attempts: Arc<AttemptLog>,
        renamer: Arc<dyn ConflictRenamer>,
    ) -> Self {
        let inner = Arc::new(Inner {
            folder,
            renamer,
            attempts,
            config,
            state: Mutex::new(LoopState::default()),
            idle: Notify::new(),
        });
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(inner.clone(), rx));
        ConflictResolver { inner, jobs }
    }

    /// Queue a resolution of `input`. Stale requests, requests made while
    /// paused and requests from inside a running resolution are dropped.
    pub fn resolve(&self, ctx: &RequestContext, input: ConflictInput) {
        if ctx.is_resolution() {
            debug!(folder = %self.inner.folder.id(), %input, "ignoring resolve issued by a resolution");
            return;
        }
        let mut state = self.inner.state();
        if state.paused {
            debug!(folder = %self.inner.folder.id(), %input, "resolver paused, dropping request");
            return;
        }
        state.outstanding += 1;
        if state.is_stale(input) {
            debug!(folder = %self.inner.folder.id(), %input, current = %state.current, "dropping stale request");
            self.inner.finish_locked(&mut state);
            return;
        }
        if let Some(previous) = state.cancel.take() {
            previous.cancel();
        }
        let cancel = CancellationToken::new();
        state.current = input;
        state.cancel = Some(cancel.clone());
        if self.jobs.send(Job { input, cancel }).is_err() {
            warn!(folder = %self.inner.folder.id(), "resolver worker gone, dropping request");
            self.inner.finish_locked(&mut state);
        }
    }

    /// Block until every accepted request has finished, or `ctx` is
    /// canceled.
    pub async fn wait(&self, ctx: &RequestContext) -> CrResult<()> {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state().outstanding == 0 {
                return Ok(());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = ctx.cancel.cancelled() => return Err(CrError::Canceled),
            }
        }
    }

    /// Cancel whatever attempt is running.
    pub fn force_cancel(&self) {
        if let Some(cancel) = &self.inner.state().cancel {
            cancel.cancel();
        }
    }

    /// Cancel the running attempt and drop new requests until
    /// [`ConflictResolver::restart`].
    pub fn pause(&self) {
        let mut state = self.inner.state();
        state.paused = true;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
    }

    pub fn restart(&self) {
        self.inner.state().paused = false;
    }

    /// The local branch changed identity: earlier inputs no longer make
    /// new ones stale.
    pub fn begin_new_branch(&self) {
        self.inner.state().current = ConflictInput::default();
    }

    pub fn current_input(&self) -> ConflictInput {
        self.inner.state().current
    }

    pub fn is_stuck(&self) -> CrResult<bool> {
        self.inner.attempts.is_stuck(self.inner.folder.id())
    }

    /// Operator reset of the folder's attempt log.
    pub fn clear_attempts(&self) -> CrResult<()> {
        let change = self.inner.attempts.clear(self.inner.folder.id())?;
        self.inner.notify_stuck(change);
        Ok(())
    }
}

async fn worker(inner: Arc<Inner>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        if job.cancel.is_cancelled() {
            debug!(folder = %inner.folder.id(), input = %job.input, "skipping superseded request");
        } else {
            let span = info_span!(
                "conflict_resolution",
                folder = %inner.folder.id(),
                unmerged = %job.input.unmerged,
                merged = %job.input.merged,
            );
            inner.run(job).instrument(span).await;
        }
        inner.finish_locked(&mut inner.state());
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_locked(&self, state: &mut LoopState) {
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.outstanding == 0 {
            self.idle.notify_waiters();
        }
    }

    fn notify_stuck(&self, change: StuckChange) {
        match change {
            StuckChange::BecameStuck => self.folder.notify_stuck_changed(true),
            StuckChange::BecameUnstuck => self.folder.notify_stuck_changed(false),
            StuckChange::Unchanged => {}
        }
    }

    /// Whether this attempt has to block unmerged writes.
    fn should_escalate(&self) -> bool {
        if self.state().lock_next_time {
            return true;
        }
        match self.folder.unmerged_branch() {
            Ok(branch) => {
                branch.revisions.len() > self.config.max_revs_threshold
                    || branch.revisions.iter().any(|md| md.branch.is_squash())
            }
            Err(_) => false,
        }
    }

    async fn run(&self, job: Job) {
        let id = self.folder.id();
        // Records left unfinished by a crash turn into failures inside
        // `begin`, which can be what makes the folder stuck.
        let was_stuck = self.attempts.is_stuck(id).unwrap_or(false);
        match self.attempts.begin(id, job.input) {
            Ok(()) => {}
            Err(err @ CrError::TooManyAttempts { .. }) => {
                warn!(folder = %id, error = %err, "refusing to resolve stuck folder");
                self.folder.report_error(&err);
                if !was_stuck {
                    self.notify_stuck(StuckChange::BecameStuck);
                }
                return;
            }
            Err(err) => warn!(folder = %id, error = %err, "failed to record attempt start"),
        }

        let escalate = self.should_escalate();
        if escalate {
            debug!(folder = %id, "blocking unmerged writes for this attempt");
            self.folder.set_unmerged_writes_blocked(true);
        }

        // The deadline cancels through the attempt's own token so that the
        // attempt unwinds on its error path and cleans up written blocks.
        let deadline = escalate.then(|| {
            let cancel = job.cancel.clone();
            let limit = self.config.write_lock_timeout();
            let folder = id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                if !cancel.is_cancelled() {
                    warn!(folder = %folder, ?limit, "write-blocking attempt ran out of time, canceling");
                    cancel.cancel();
                }
            })
        });

        let ctx = RequestContext::for_resolution(job.cancel.clone());
        let mut attempt = Attempt::new(self.folder.as_ref(), self.renamer.as_ref(), &ctx);
        let result = AssertUnwindSafe(attempt.run()).catch_unwind().await;
        let phase = attempt.phase();
        if let Some(timer) = deadline {
            timer.abort();
        }

        if escalate {
            self.folder.set_unmerged_writes_blocked(false);
        }

        match result {
            Ok(Ok(outcome)) => self.succeeded(outcome),
            Ok(Err(err)) if err.is_canceled() => self.canceled(phase),
            Ok(Err(err)) => self.failed(phase, &err, None),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.failed(phase, &panic_error(&message), Some(message));
            }
        }
    }

    fn succeeded(&self, outcome: Outcome) {
        let id = self.folder.id();
        info!(folder = %id, ?outcome, "conflict resolution finished");
        {
            let mut state = self.state();
            state.canceled_count = 0;
            state.lock_next_time = false;
        }
        match self.attempts.record_success(id) {
            Ok(change) => self.notify_stuck(change),
            Err(err) => warn!(folder = %id, error = %err, "failed to clear attempt log"),
        }
    }

    fn canceled(&self, phase: Phase) {
        let id = self.folder.id();
        debug!(folder = %id, %phase, "conflict resolution canceled");
        {
            let mut state = self.state();
            state.canceled_count += 1;
            if state.canceled_count > self.config.max_revs_threshold && !state.lock_next_time {
                warn!(
                    folder = %id,
                    canceled = state.canceled_count,
                    "too many canceled attempts, blocking unmerged writes next time"
                );
                state.lock_next_time = true;
            }
        }
        if let Err(err) = self.attempts.record_canceled(id) {
            warn!(folder = %id, error = %err, "failed to drop canceled attempt record");
        }
    }

    fn failed(&self, phase: Phase, err: &CrError, panic: Option<String>) {
        let id = self.folder.id();
        error!(folder = %id, %phase, error = %err, "conflict resolution failed");
        self.folder.report_error(err);
        match self.attempts.record_failure(id, &err.to_string(), panic) {
            Ok(change) => self.notify_stuck(change),
            Err(log_err) => warn!(folder = %id, error = %log_err, "failed to record failed attempt"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Edit, MemoryFolder};
    use tlfcr_core::Revision;

    fn input(u: u64, m: u64) -> ConflictInput {
        ConflictInput::new(Revision(u), Revision(m))
    }

    #[test]
    fn test_stale_inputs() {
        let state = LoopState {
            current: input(5, 7),
            ..LoopState::default()
        };
        assert!(state.is_stale(input(5, 7)));
        assert!(state.is_stale(input(4, 7)));
        assert!(!state.is_stale(input(6, 7)));
        assert!(!state.is_stale(input(5, 8)));
        assert!(!state.is_stale(input(4, 8)));
    }

    async fn diverged_folder() -> Arc<MemoryFolder> {
        let folder = Arc::new(MemoryFolder::new("folder").await.unwrap());
        folder
            .unmerged_edit("bob", vec![Edit::Create("mine".into(), b"b".to_vec())])
            .await
            .unwrap();
        folder
            .merged_edit("alice", vec![Edit::Create("theirs".into(), b"a".to_vec())])
            .await
            .unwrap();
        folder
    }

    #[tokio::test]
    async fn test_pause_drops_requests_until_restart() {
        let folder = diverged_folder().await;
        let resolver = ConflictResolver::new(
            folder.clone(),
            ResolverConfig::default(),
            Arc::new(AttemptLog::in_memory(10)),
        );
        let ctx = RequestContext::new();

        resolver.pause();
        resolver.resolve(&ctx, folder.conflict_input());
        resolver.wait(&ctx).await.unwrap();
        assert_eq!(folder.sync_count(), 0);
        assert_eq!(resolver.current_input(), ConflictInput::default());

        resolver.restart();
        resolver.resolve(&ctx, folder.conflict_input());
        resolver.wait(&ctx).await.unwrap();
        assert_eq!(folder.merged_head(), Revision(3));
        assert!(folder.errors().is_empty());
    }

    #[tokio::test]
    async fn test_begin_new_branch_resets_dedup() {
        let folder = Arc::new(MemoryFolder::new("folder").await.unwrap());
        let resolver = ConflictResolver::new(
            folder.clone(),
            ResolverConfig::default(),
            Arc::new(AttemptLog::in_memory(10)),
        );
        let ctx = RequestContext::new();
        resolver.resolve(&ctx, input(3, 2));
        resolver.wait(&ctx).await.unwrap();
        resolver.resolve(&ctx, input(3, 2));
        resolver.wait(&ctx).await.unwrap();
        assert_eq!(folder.sync_count(), 1);

        resolver.begin_new_branch();
        resolver.resolve(&ctx, input(3, 2));
        resolver.wait(&ctx).await.unwrap();
        assert_eq!(folder.sync_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_honors_cancellation() {
        let folder = Arc::new(MemoryFolder::new("folder").await.unwrap());
        // Hold the worker inside the sync so the request stays outstanding.
        let gate = Arc::new(std::sync::Barrier::new(2));
        let hook_gate = gate.clone();
        folder.set_on_sync(move |_| {
            hook_gate.wait();
        });
        let resolver = ConflictResolver::new(
            folder.clone(),
            ResolverConfig::default(),
            Arc::new(AttemptLog::in_memory(10)),
        );
        resolver.resolve(&RequestContext::new(), input(2, 2));

        let waiter = RequestContext::new();
        waiter.cancel.cancel();
        assert!(resolver.wait(&waiter).await.unwrap_err().is_canceled());

        let release = tokio::task::spawn_blocking(move || gate.wait());
        resolver.wait(&RequestContext::new()).await.unwrap();
        release.await.unwrap();
    }

    #[tokio::test]
    async fn test_failures_are_reported_and_counted() {
        let folder = diverged_folder().await;
        folder.fail_next_commits(1);
        let attempts = Arc::new(AttemptLog::in_memory(10));
        let resolver = ConflictResolver::new(folder.clone(), ResolverConfig::default(), attempts.clone());
        let ctx = RequestContext::new();
        resolver.resolve(&ctx, folder.conflict_input());
        resolver.wait(&ctx).await.unwrap();

        assert_eq!(folder.errors().len(), 1);
        assert_eq!(attempts.failures("folder").unwrap(), 1);
        assert!(!resolver.is_stuck().unwrap());

        resolver.resolve(&ctx, input(2, 3));
        resolver.wait(&ctx).await.unwrap();
        assert!(attempts.records("folder").unwrap().is_empty());
        assert_eq!(folder.merged_head(), Revision(3));
    }
}
