//! Classification job lifecycle.
//!
//! A [`ClassificationJob`] is a single pass through the state machine
//!
//! ```text
//! Idle --start--> Running --tick--> Running
//!                 Running --cancel--> Cancelled
//!                 Running --finish--> Completed
//!                 Running --fail----> Failed
//! ```
//!
//! Every read and write of the state goes through one mutex, so a snapshot
//! never shows `Completed` without its [`Outcome`]. [`JobController`] holds the
//! one live job, spawns the worker thread that runs the [`Classifier`] and
//! refuses to start another job while the current one is running.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use crate::classifier::{CancelToken, Classifier};
use crate::error::{ClassificationError, JobError, JobFailure, PipelineError};
use crate::outcome::{Label, Outcome};
use crate::pipeline::{self, Image, TargetSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Idle,
    Running,
    Cancelled,
    Completed,
    Failed,
}

impl JobState {
    /// No transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Cancelled | JobState::Completed | JobState::Failed
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Cancelled => "cancelled",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        })
    }
}

/// Transition names used in [`JobError::IllegalTransition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Start,
    Tick,
    Finish,
    Fail,
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobAction::Start => "start",
            JobAction::Tick => "tick",
            JobAction::Finish => "finish",
            JobAction::Fail => "fail",
        })
    }
}

/// Observational progress readout; never drives completion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Elapsed / expected duration, clamped to `[0, 1]`.
    pub fraction: f32,
    pub elapsed: Duration,
}

impl Progress {
    const ZERO: Progress = Progress {
        fraction: 0.0,
        elapsed: Duration::ZERO,
    };
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The job was not running; nothing changed.
    NothingToCancel,
}

/// A consistent view of one job, taken under its lock.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub id: u64,
    pub state: JobState,
    pub progress: Progress,
    pub outcome: Option<Outcome>,
    pub failure: Option<JobFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Started { job_id: u64 },
    Cancelled { job_id: u64, elapsed: Duration },
    Completed { job_id: u64, outcome: Outcome },
    Failed { job_id: u64, failure: JobFailure },
    /// The classifier returned after the job was cancelled. Always follows
    /// the job's `Cancelled` event.
    ResultDiscarded { job_id: u64 },
}

/// Receives lifecycle events, e.g. to wake a UI loop.
///
/// Events are delivered after the job's lock is released, so a sink may call
/// back into the job or its controller. Delivery follows the order in which
/// the transitions happened: `Cancelled` always reaches the sink before the
/// `ResultDiscarded` of the same job. Deliveries for one job never overlap.
pub trait JobEventSink: Send + Sync {
    fn on_event(&self, event: JobEvent);
}

#[derive(Debug)]
enum Phase {
    Idle,
    Running {
        started: Instant,
    },
    Cancelled {
        started: Instant,
        ended: Instant,
    },
    Completed {
        outcome: Outcome,
    },
    Failed {
        started: Instant,
        ended: Instant,
        failure: JobFailure,
    },
}

impl Phase {
    fn state(&self) -> JobState {
        match self {
            Phase::Idle => JobState::Idle,
            Phase::Running { .. } => JobState::Running,
            Phase::Cancelled { .. } => JobState::Cancelled,
            Phase::Completed { .. } => JobState::Completed,
            Phase::Failed { .. } => JobState::Failed,
        }
    }
}

/// One run of the classification state machine.
pub struct ClassificationJob {
    id: u64,
    expected: Duration,
    phase: Mutex<Phase>,
    settled: Condvar,
    cancel: CancelToken,
    events: Option<Arc<dyn JobEventSink>>,
    // Filled under `phase`, drained by whichever thread holds `delivering`.
    pending: Mutex<VecDeque<JobEvent>>,
    delivering: Mutex<()>,
}

impl fmt::Debug for ClassificationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassificationJob")
            .field("id", &self.id)
            .field("expected", &self.expected)
            .field("phase", &*self.phase())
            .finish_non_exhaustive()
    }
}

impl ClassificationJob {
    /// A new job in `Idle`. `expected` scales the progress readout.
    pub fn new(id: u64, expected: Duration) -> Self {
        Self {
            id,
            expected,
            phase: Mutex::new(Phase::Idle),
            settled: Condvar::new(),
            cancel: CancelToken::new(),
            events: None,
            pending: Mutex::new(VecDeque::new()),
            delivering: Mutex::new(()),
        }
    }

    /// A new job in `Idle` that reports its transitions to `sink`.
    pub fn with_event_sink(id: u64, expected: Duration, sink: Arc<dyn JobEventSink>) -> Self {
        Self::new(id, expected).with_events(Some(sink))
    }

    fn with_events(mut self, events: Option<Arc<dyn JobEventSink>>) -> Self {
        self.events = events;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Token handed to the classifier call; set by [`cancel`](Self::cancel).
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<JobEvent>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called with the phase lock held, so queue order is transition order.
    fn queue(&self, event: JobEvent) {
        if self.events.is_some() {
            self.pending().push_back(event);
        }
    }

    /// Hands queued events to the sink. Must be called without the phase lock.
    fn deliver(&self) {
        let Some(sink) = &self.events else {
            return;
        };
        loop {
            {
                let _delivering = match self.delivering.try_lock() {
                    Ok(guard) => guard,
                    Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                    // The holder drains what we queued.
                    Err(TryLockError::WouldBlock) => return,
                };
                loop {
                    let next = self.pending().pop_front();
                    match next {
                        Some(event) => sink.on_event(event),
                        None => break,
                    }
                }
            }
            // An event queued between the last pop and the unlock would
            // otherwise wait for the next transition.
            if self.pending().is_empty() {
                return;
            }
        }
    }

    fn progress_between(&self, started: Instant, now: Instant) -> Progress {
        let elapsed = now.saturating_duration_since(started);
        let fraction = if self.expected.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f32() / self.expected.as_secs_f32()).clamp(0.0, 1.0)
        };
        Progress { fraction, elapsed }
    }

    fn snapshot_of(&self, phase: &Phase) -> JobSnapshot {
        let (progress, outcome, failure) = match phase {
            Phase::Idle => (Progress::ZERO, None, None),
            Phase::Running { started } => {
                (self.progress_between(*started, Instant::now()), None, None)
            }
            Phase::Cancelled { started, ended } => {
                (self.progress_between(*started, *ended), None, None)
            }
            Phase::Completed { outcome } => (
                Progress {
                    fraction: 1.0,
                    elapsed: outcome.elapsed(),
                },
                Some(*outcome),
                None,
            ),
            Phase::Failed {
                started,
                ended,
                failure,
            } => (
                self.progress_between(*started, *ended),
                None,
                Some(failure.clone()),
            ),
        };
        JobSnapshot {
            id: self.id,
            state: phase.state(),
            progress,
            outcome,
            failure,
        }
    }

    pub fn state(&self) -> JobState {
        self.phase().state()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.snapshot_of(&self.phase())
    }

    /// `Idle -> Running`; records the start time.
    pub fn start(&self) -> Result<(), JobError> {
        self.begin()?;
        self.deliver();
        Ok(())
    }

    /// The `start` transition with its `Started` event queued, not delivered.
    fn begin(&self) -> Result<(), JobError> {
        let mut phase = self.phase();
        match phase.state() {
            JobState::Idle => {
                *phase = Phase::Running {
                    started: Instant::now(),
                };
                self.queue(JobEvent::Started { job_id: self.id });
            }
            JobState::Running => return Err(JobError::AlreadyRunning { job_id: self.id }),
            state => {
                return Err(JobError::IllegalTransition {
                    action: JobAction::Start,
                    state,
                });
            }
        }
        drop(phase);
        tracing::debug!(job_id = self.id, "job running");
        Ok(())
    }

    /// Current progress; only legal while running.
    pub fn tick(&self) -> Result<Progress, JobError> {
        match &*self.phase() {
            Phase::Running { started } => Ok(self.progress_between(*started, Instant::now())),
            other => Err(JobError::IllegalTransition {
                action: JobAction::Tick,
                state: other.state(),
            }),
        }
    }

    /// `Running -> Cancelled` and signals the classifier call to stop.
    pub fn cancel(&self) -> CancelOutcome {
        let mut phase = self.phase();
        let Phase::Running { started } = *phase else {
            return CancelOutcome::NothingToCancel;
        };
        let ended = Instant::now();
        let elapsed = ended.saturating_duration_since(started);
        *phase = Phase::Cancelled { started, ended };
        self.cancel.cancel();
        self.queue(JobEvent::Cancelled {
            job_id: self.id,
            elapsed,
        });
        self.settled.notify_all();
        drop(phase);

        tracing::info!(job_id = self.id, ?elapsed, "job cancelled");
        self.deliver();
        CancelOutcome::Cancelled
    }

    /// `Running -> Completed` with `label`.
    ///
    /// Rejected once the job is cancelled; the label is then dropped.
    pub fn finish(&self, label: Label) -> Result<Outcome, JobError> {
        let mut phase = self.phase();
        let Phase::Running { started } = *phase else {
            let state = phase.state();
            self.reject_late(JobAction::Finish, state);
            drop(phase);
            self.deliver();
            return Err(JobError::IllegalTransition {
                action: JobAction::Finish,
                state,
            });
        };
        let outcome = Outcome::new(label, started.elapsed());
        *phase = Phase::Completed { outcome };
        self.queue(JobEvent::Completed {
            job_id: self.id,
            outcome,
        });
        self.settled.notify_all();
        drop(phase);

        tracing::info!(
            job_id = self.id,
            label = %outcome.label(),
            elapsed = ?outcome.elapsed(),
            "job completed"
        );
        self.deliver();
        Ok(outcome)
    }

    /// `Running -> Failed` carrying `failure`.
    pub fn fail(&self, failure: JobFailure) -> Result<(), JobError> {
        let mut phase = self.phase();
        let Phase::Running { started } = *phase else {
            let state = phase.state();
            self.reject_late(JobAction::Fail, state);
            drop(phase);
            self.deliver();
            return Err(JobError::IllegalTransition {
                action: JobAction::Fail,
                state,
            });
        };
        *phase = Phase::Failed {
            started,
            ended: Instant::now(),
            failure: failure.clone(),
        };
        self.queue(JobEvent::Failed {
            job_id: self.id,
            failure: failure.clone(),
        });
        self.settled.notify_all();
        drop(phase);

        tracing::warn!(job_id = self.id, error = %failure, "job failed");
        self.deliver();
        Ok(())
    }

    /// Called with the phase lock held.
    fn reject_late(&self, action: JobAction, state: JobState) {
        if state == JobState::Cancelled {
            tracing::info!(job_id = self.id, %action, "discarding result of cancelled job");
            self.queue(JobEvent::ResultDiscarded { job_id: self.id });
        } else {
            tracing::debug!(job_id = self.id, %action, %state, "illegal transition rejected");
        }
    }

    /// Blocks until the job is terminal or `timeout` passes.
    pub fn wait_timeout(&self, timeout: Duration) -> JobSnapshot {
        let (phase, _) = self
            .settled
            .wait_timeout_while(self.phase(), timeout, |p| !p.state().is_terminal())
            .unwrap_or_else(PoisonError::into_inner);
        self.snapshot_of(&phase)
    }

    /// Blocks until the job is terminal.
    pub fn wait(&self) -> JobSnapshot {
        let phase = self
            .settled
            .wait_while(self.phase(), |p| !p.state().is_terminal())
            .unwrap_or_else(PoisonError::into_inner);
        self.snapshot_of(&phase)
    }
}

/// What a job classifies: a file still to decode, or a decoded image.
#[derive(Debug, Clone)]
pub enum JobInput {
    Path(PathBuf),
    Image(Image),
}

impl JobInput {
    fn into_image(self) -> Result<Image, PipelineError> {
        match self {
            JobInput::Path(path) => pipeline::load_image(path),
            JobInput::Image(image) => Ok(image),
        }
    }
}

impl From<PathBuf> for JobInput {
    fn from(path: PathBuf) -> Self {
        JobInput::Path(path)
    }
}

impl From<&Path> for JobInput {
    fn from(path: &Path) -> Self {
        JobInput::Path(path.to_path_buf())
    }
}

impl From<Image> for JobInput {
    fn from(image: Image) -> Self {
        JobInput::Image(image)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobSettings {
    pub target_size: TargetSize,
    /// Denominator of the progress fraction.
    pub expected_duration: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            target_size: TargetSize::default(),
            expected_duration: Duration::from_secs(5),
        }
    }
}

/// Owns the single live job and the classifier it runs.
pub struct JobController {
    classifier: Arc<dyn Classifier>,
    settings: JobSettings,
    current: Mutex<Option<Arc<ClassificationJob>>>,
    next_id: AtomicU64,
    events: Option<Arc<dyn JobEventSink>>,
}

impl JobController {
    pub fn new(classifier: Arc<dyn Classifier>, settings: JobSettings) -> Self {
        Self {
            classifier,
            settings,
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
            events: None,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn JobEventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn settings(&self) -> JobSettings {
        self.settings
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<ClassificationJob>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a new job and returns immediately.
    ///
    /// Decoding, normalization and classification run on a worker thread;
    /// their errors end the job in `Failed` instead of being returned here.
    pub fn start(&self, input: impl Into<JobInput>) -> Result<Arc<ClassificationJob>, JobError> {
        let mut slot = self.slot();
        if let Some(job) = slot.as_ref()
            && job.state() == JobState::Running
        {
            return Err(JobError::AlreadyRunning { job_id: job.id() });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = Arc::new(
            ClassificationJob::new(id, self.settings.expected_duration)
                .with_events(self.events.clone()),
        );
        job.begin()?;
        *slot = Some(Arc::clone(&job));
        drop(slot);
        job.deliver();

        tracing::info!(job_id = id, classifier = self.classifier.name(), "job started");
        let worker_job = Arc::clone(&job);
        let classifier = Arc::clone(&self.classifier);
        let target = self.settings.target_size;
        let input = input.into();
        let spawned = thread::Builder::new()
            .name(format!("classify-{id}"))
            .spawn(move || run_job(&worker_job, input, classifier.as_ref(), target));
        if let Err(err) = spawned {
            let failure = ClassificationError::Model(format!("cannot spawn worker: {err}"));
            let _ = job.fail(failure.into());
        }
        Ok(job)
    }

    /// Cancels the live job if it is running.
    pub fn cancel(&self) -> CancelOutcome {
        match self.current() {
            Some(job) => job.cancel(),
            None => CancelOutcome::NothingToCancel,
        }
    }

    /// Progress of the live job.
    pub fn tick(&self) -> Result<Progress, JobError> {
        match self.current() {
            Some(job) => job.tick(),
            None => Err(JobError::IllegalTransition {
                action: JobAction::Tick,
                state: JobState::Idle,
            }),
        }
    }

    pub fn current(&self) -> Option<Arc<ClassificationJob>> {
        self.slot().clone()
    }

    /// State of the live job, `Idle` before the first start.
    pub fn state(&self) -> JobState {
        self.current().map_or(JobState::Idle, |job| job.state())
    }

    pub fn snapshot(&self) -> Option<JobSnapshot> {
        self.current().map(|job| job.snapshot())
    }
}

fn run_job(
    job: &ClassificationJob,
    input: JobInput,
    classifier: &dyn Classifier,
    target: TargetSize,
) {
    let normalized = match input
        .into_image()
        .and_then(|image| pipeline::normalize(&image, target))
    {
        Ok(normalized) => normalized,
        Err(err) => {
            let _ = job.fail(err.into());
            return;
        }
    };
    if job.cancel_token().is_cancelled() {
        tracing::debug!(job_id = job.id(), "cancelled before classification");
        return;
    }
    let _ = match classifier.classify(&normalized, job.cancel_token()) {
        Ok(label) => job.finish(label).map(|_| ()),
        Err(err) => job.fail(err.into()),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use approx::assert_relative_eq;
    use crate::pipeline::NormalizedImage;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::{OnceLock, Weak};

    const WAIT: Duration = Duration::from_secs(10);

    type Verdict = Result<Label, ClassificationError>;

    /// Blocks inside `classify` until the test sends a verdict.
    struct GatedClassifier {
        entered: Mutex<Sender<()>>,
        release: Mutex<Receiver<Verdict>>,
    }

    impl Classifier for GatedClassifier {
        fn name(&self) -> &str {
            "gated"
        }

        fn classify(&self, _image: &NormalizedImage, _cancel: &CancelToken) -> Verdict {
            let _ = self.entered.lock().unwrap().send(());
            let rx = self.release.lock().unwrap();
            rx.recv_timeout(WAIT)
                .unwrap_or(Err(ClassificationError::Model("gate closed".into())))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<JobEvent>>,
    }

    fn eventually(pred: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    impl RecordingSink {
        fn wait_for(&self, pred: impl Fn(&JobEvent) -> bool) -> bool {
            eventually(|| self.events.lock().unwrap().iter().any(&pred))
        }

        fn recorded(&self) -> Vec<JobEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl JobEventSink for RecordingSink {
        fn on_event(&self, event: JobEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn sample_image() -> Image {
        Image::from_raw(6, 4, (0..72).collect()).unwrap()
    }

    struct Harness {
        controller: JobController,
        release: Sender<Verdict>,
        entered: Receiver<()>,
        sink: Arc<RecordingSink>,
    }

    fn gated() -> (Arc<GatedClassifier>, Sender<Verdict>, Receiver<()>) {
        let (release, release_rx) = mpsc::channel();
        let (entered_tx, entered) = mpsc::channel();
        let clf = Arc::new(GatedClassifier {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        (clf, release, entered)
    }

    fn test_settings() -> JobSettings {
        JobSettings {
            target_size: TargetSize::square(16),
            expected_duration: Duration::from_secs(60),
        }
    }

    fn harness() -> Harness {
        let (clf, release, entered) = gated();
        let sink = Arc::new(RecordingSink::default());
        Harness {
            controller: JobController::new(clf, test_settings()).with_event_sink(sink.clone()),
            release,
            entered,
            sink,
        }
    }

    /// Reads the controller's state from inside every event.
    #[derive(Default)]
    struct StateReadingSink {
        controller: OnceLock<Weak<JobController>>,
        seen: Mutex<Vec<JobState>>,
    }

    impl JobEventSink for StateReadingSink {
        fn on_event(&self, _event: JobEvent) {
            if let Some(controller) = self.controller.get().and_then(Weak::upgrade) {
                let state = controller.state();
                self.seen.lock().unwrap().push(state);
            }
        }
    }

    /// Cancels the job it observes as soon as it sees `Started`.
    #[derive(Default)]
    struct CancelOnStart {
        job: OnceLock<Weak<ClassificationJob>>,
        events: Mutex<Vec<JobEvent>>,
    }

    impl JobEventSink for CancelOnStart {
        fn on_event(&self, event: JobEvent) {
            let started = matches!(event, JobEvent::Started { .. });
            self.events.lock().unwrap().push(event);
            if started && let Some(job) = self.job.get().and_then(Weak::upgrade) {
                job.cancel();
            }
        }
    }

    #[test]
    fn idle_job_accepts_only_start() {
        let job = ClassificationJob::new(1, Duration::from_secs(1));
        assert!(matches!(
            job.tick(),
            Err(JobError::IllegalTransition {
                action: JobAction::Tick,
                state: JobState::Idle
            })
        ));
        assert_eq!(job.cancel(), CancelOutcome::NothingToCancel);
        assert!(job.finish(Label::Tumor).is_err());
        assert!(job.fail(ClassificationError::Model("x".into()).into()).is_err());
        assert_eq!(job.state(), JobState::Idle);
        assert!(job.start().is_ok());
        assert_eq!(job.state(), JobState::Running);
    }

    #[test]
    fn running_job_rejects_second_start() {
        let job = ClassificationJob::new(3, Duration::from_secs(1));
        job.start().unwrap();
        assert_eq!(job.start(), Err(JobError::AlreadyRunning { job_id: 3 }));
        assert_eq!(job.state(), JobState::Running);
    }

    #[test]
    fn terminal_states_accept_nothing() {
        let completed = ClassificationJob::new(1, Duration::from_secs(1));
        completed.start().unwrap();
        completed.finish(Label::NoTumor).unwrap();

        let cancelled = ClassificationJob::new(2, Duration::from_secs(1));
        cancelled.start().unwrap();
        assert_eq!(cancelled.cancel(), CancelOutcome::Cancelled);

        let failed = ClassificationJob::new(3, Duration::from_secs(1));
        failed.start().unwrap();
        failed
            .fail(ClassificationError::Model("boom".into()).into())
            .unwrap();

        for job in [&completed, &cancelled, &failed] {
            let before = job.snapshot();
            assert!(before.state.is_terminal());
            assert!(job.start().is_err());
            assert!(job.tick().is_err());
            assert_eq!(job.cancel(), CancelOutcome::NothingToCancel);
            assert!(job.finish(Label::Tumor).is_err());
            assert!(job.fail(ClassificationError::Abandoned.into()).is_err());
            let after = job.snapshot();
            assert_eq!(after.state, before.state);
            assert_eq!(after.outcome, before.outcome);
            assert_eq!(after.failure, before.failure);
        }
    }

    #[test]
    fn snapshots_pair_state_with_payload() {
        let job = ClassificationJob::new(1, Duration::from_secs(1));
        let idle = job.snapshot();
        assert_eq!((idle.state, idle.outcome, idle.failure), (JobState::Idle, None, None));

        job.start().unwrap();
        let running = job.snapshot();
        assert_eq!(running.state, JobState::Running);
        assert!(running.outcome.is_none());
        assert!(running.failure.is_none());

        let outcome = job.finish(Label::Tumor).unwrap();
        let snap = job.snapshot();
        assert_eq!(snap.state, JobState::Completed);
        assert_eq!(snap.outcome, Some(outcome));
        assert_relative_eq!(snap.progress.fraction, 1.0);
        assert!(snap.failure.is_none());

        let failed = ClassificationJob::new(2, Duration::from_secs(1));
        failed.start().unwrap();
        let failure: JobFailure = ClassificationError::Model("boom".into()).into();
        failed.fail(failure.clone()).unwrap();
        let snap = failed.snapshot();
        assert_eq!(snap.state, JobState::Failed);
        assert_eq!(snap.failure, Some(failure));
        assert!(snap.outcome.is_none());
    }

    #[test]
    fn progress_is_monotonic_and_clamped() {
        let job = ClassificationJob::new(1, Duration::from_millis(40));
        job.start().unwrap();
        let mut last = 0.0;
        for _ in 0..10 {
            let p = job.tick().unwrap();
            assert!(p.fraction >= last);
            assert!((0.0..=1.0).contains(&p.fraction));
            last = p.fraction;
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(50));
        let p = job.tick().unwrap();
        assert_relative_eq!(p.fraction, 1.0);
        assert!(p.elapsed >= Duration::from_millis(40));
        assert_eq!(job.state(), JobState::Running);
    }

    #[test]
    fn controller_completes_job_from_worker() -> Result<()> {
        let h = harness();
        let job = h.controller.start(sample_image())?;
        assert_eq!(h.controller.state(), JobState::Running);
        h.release.send(Ok(Label::Tumor))?;
        let snap = job.wait_timeout(WAIT);
        assert_eq!(snap.state, JobState::Completed);
        assert_eq!(snap.outcome.map(|o| o.label()), Some(Label::Tumor));
        assert!(h.sink.wait_for(|e| matches!(e, JobEvent::Completed { .. })));
        Ok(())
    }

    #[test]
    fn start_while_running_is_rejected() -> Result<()> {
        let h = harness();
        let first = h.controller.start(sample_image())?;
        let err = h.controller.start(sample_image()).unwrap_err();
        assert_eq!(err, JobError::AlreadyRunning { job_id: first.id() });
        assert_eq!(first.state(), JobState::Running);
        assert_eq!(h.controller.current().map(|j| j.id()), Some(first.id()));

        h.release.send(Ok(Label::NoTumor))?;
        first.wait_timeout(WAIT);
        let second = h.controller.start(sample_image())?;
        assert_ne!(second.id(), first.id());
        assert_eq!(second.state(), JobState::Running);
        h.release.send(Ok(Label::NoTumor))?;
        assert_eq!(second.wait_timeout(WAIT).state, JobState::Completed);
        Ok(())
    }

    #[test]
    fn late_result_after_cancel_is_discarded() -> Result<()> {
        let h = harness();
        let job = h.controller.start(sample_image())?;
        h.entered.recv_timeout(WAIT)?;
        assert_eq!(h.controller.cancel(), CancelOutcome::Cancelled);
        assert!(job.cancel_token().is_cancelled());
        h.release.send(Ok(Label::Tumor))?;
        assert!(h.sink.wait_for(|e| matches!(e, JobEvent::ResultDiscarded { .. })));
        let snap = job.snapshot();
        assert_eq!(snap.state, JobState::Cancelled);
        assert!(snap.outcome.is_none());
        assert_eq!(h.controller.cancel(), CancelOutcome::NothingToCancel);
        assert!(matches!(
            h.sink.recorded().as_slice(),
            [
                JobEvent::Started { .. },
                JobEvent::Cancelled { .. },
                JobEvent::ResultDiscarded { .. }
            ]
        ));
        Ok(())
    }

    #[test]
    fn late_error_after_cancel_keeps_cancelled() -> Result<()> {
        let h = harness();
        let job = h.controller.start(sample_image())?;
        h.entered.recv_timeout(WAIT)?;
        let running = job.snapshot();
        assert_eq!(running.state, JobState::Running);
        assert!(running.outcome.is_none() && running.failure.is_none());

        assert_eq!(h.controller.cancel(), CancelOutcome::Cancelled);
        h.release
            .send(Err(ClassificationError::Model("too late".into())))?;
        assert!(h.sink.wait_for(|e| matches!(e, JobEvent::ResultDiscarded { .. })));

        let snap = job.snapshot();
        assert_eq!(snap.state, JobState::Cancelled);
        assert!(snap.failure.is_none());
        assert!(snap.outcome.is_none());
        assert!(
            !h.sink
                .recorded()
                .iter()
                .any(|e| matches!(e, JobEvent::Failed { .. }))
        );
        Ok(())
    }

    #[test]
    fn sink_may_call_back_into_controller() -> Result<()> {
        let (clf, release, _entered) = gated();
        let sink = Arc::new(StateReadingSink::default());
        let controller =
            Arc::new(JobController::new(clf, test_settings()).with_event_sink(sink.clone()));
        let _ = sink.controller.set(Arc::downgrade(&controller));

        // Started is delivered from inside start(); run it off the test thread
        // so a lock held across delivery shows up as a timeout.
        let (done_tx, done_rx) = mpsc::channel();
        let starter = Arc::clone(&controller);
        thread::spawn(move || {
            let _ = done_tx.send(starter.start(sample_image()).map(|job| job.id()));
        });
        let job_id = done_rx.recv_timeout(WAIT)??;
        assert_eq!(sink.seen.lock().unwrap().first(), Some(&JobState::Running));

        release.send(Ok(Label::Tumor))?;
        assert!(eventually(|| sink.seen.lock().unwrap().len() == 2));
        assert_eq!(
            sink.seen.lock().unwrap().as_slice(),
            [JobState::Running, JobState::Completed]
        );
        assert_eq!(controller.current().map(|job| job.id()), Some(job_id));
        Ok(())
    }

    #[test]
    fn sink_may_drive_the_job_it_observes() {
        let sink = Arc::new(CancelOnStart::default());
        let job = Arc::new(ClassificationJob::with_event_sink(
            7,
            Duration::from_secs(1),
            sink.clone(),
        ));
        let _ = sink.job.set(Arc::downgrade(&job));

        job.start().unwrap();
        assert_eq!(job.state(), JobState::Cancelled);
        assert!(job.finish(Label::Tumor).is_err());
        let events = sink.events.lock().unwrap();
        assert!(matches!(
            events.as_slice(),
            [
                JobEvent::Started { job_id: 7 },
                JobEvent::Cancelled { job_id: 7, .. },
                JobEvent::ResultDiscarded { job_id: 7 }
            ]
        ));
    }

    #[test]
    fn classifier_error_fails_job() -> Result<()> {
        let h = harness();
        let job = h.controller.start(sample_image())?;
        h.release
            .send(Err(ClassificationError::Model("weights missing".into())))?;
        let snap = job.wait_timeout(WAIT);
        assert_eq!(snap.state, JobState::Failed);
        assert_eq!(
            snap.failure,
            Some(JobFailure::Classification(ClassificationError::Model(
                "weights missing".into()
            )))
        );
        Ok(())
    }

    #[test]
    fn undecodable_file_fails_job() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not an image")?;
        let h = harness();
        let job = h.controller.start(path)?;
        let snap = job.wait_timeout(WAIT);
        assert_eq!(snap.state, JobState::Failed);
        assert!(matches!(snap.failure, Some(JobFailure::Decode(_))));

        // A failed job does not block the next one.
        let next = h.controller.start(sample_image())?;
        h.release.send(Ok(Label::NoTumor))?;
        assert_eq!(next.wait_timeout(WAIT).state, JobState::Completed);
        Ok(())
    }

    #[test]
    fn idle_controller_has_nothing_to_cancel_or_tick() {
        let h = harness();
        assert_eq!(h.controller.state(), JobState::Idle);
        assert_eq!(h.controller.cancel(), CancelOutcome::NothingToCancel);
        assert!(h.controller.tick().is_err());
        assert!(h.controller.snapshot().is_none());
    }
}
