//! Periodic per-stream jobs.

use crate::config::SchedulerConfig;
use crate::outcome::JobOutcome;
use crate::power::PowerStateProvider;
use crate::worker::SyncWorker;
use evsync_protocol::{StreamKind, SyncStreamId, UserId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a job is doing right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobState {
    /// Sleeping until its next run.
    #[default]
    Waiting,
    /// Sleeping because its constraints are not met.
    Blocked,
    /// Running the worker.
    Running,
}

/// Observable state of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobStatus {
    /// Current state.
    pub state: JobState,
    /// Completed runs.
    pub runs: u64,
    /// Retries since the last non-retry outcome.
    pub consecutive_retries: u32,
    /// Times the retry warning threshold was exceeded.
    pub retry_warnings: u64,
    /// Outcome of the last run.
    pub last_outcome: Option<JobOutcome>,
    /// Delay before the next run or constraint check.
    pub next_delay: Duration,
}

struct Job {
    stream: SyncStreamId,
    tags: [String; 3],
    status: Arc<RwLock<JobStatus>>,
    handle: JoinHandle<()>,
}

/// Runs a periodic sync job per stream on the tokio runtime.
///
/// Jobs are keyed by [`SyncStreamId::key`]. Enqueuing a stream that already
/// has a job aborts the old job and starts a new one, so at most one job, and
/// therefore at most one run, exists per stream.
///
/// After each run the job sleeps for:
/// - the backoff delay if the run asked for a retry
/// - the foreground interval while the app is foregrounded
/// - otherwise the background interval of the current standby bucket
///
/// Methods that start jobs must be called from within a tokio runtime.
pub struct SyncScheduler<W: SyncWorker, P: PowerStateProvider> {
    worker: Arc<W>,
    power: Arc<P>,
    config: Arc<SchedulerConfig>,
    jobs: Mutex<HashMap<String, Job>>,
}

impl<W, P> SyncScheduler<W, P>
where
    W: SyncWorker + 'static,
    P: PowerStateProvider + 'static,
{
    /// Creates a scheduler with no jobs.
    pub fn new(worker: Arc<W>, power: Arc<P>, config: SchedulerConfig) -> Self {
        Self {
            worker,
            power,
            config: Arc::new(config),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Returns the worker.
    pub fn worker(&self) -> &Arc<W> {
        &self.worker
    }

    /// Starts the periodic job of `stream`, replacing any existing one.
    ///
    /// A replaced job is aborted, and the new job's first run waits until the
    /// old job has been torn down, so their runs never overlap.
    ///
    /// Returns true if a job was replaced.
    pub fn enqueue(&self, stream: SyncStreamId) -> bool {
        let key = stream.key();
        let mut jobs = self.jobs.lock();

        let previous = jobs.remove(&key).map(|old| {
            old.handle.abort();
            old.handle
        });
        let replaced = previous.is_some();

        let status = Arc::new(RwLock::new(JobStatus::default()));
        let handle = tokio::spawn(run_job(
            stream.clone(),
            previous,
            self.worker.clone(),
            self.power.clone(),
            self.config.clone(),
            status.clone(),
        ));
        jobs.insert(
            key.clone(),
            Job {
                tags: stream.tags(),
                stream,
                status,
                handle,
            },
        );

        if replaced {
            info!(stream = %key, "replaced sync job");
        } else {
            info!(stream = %key, "scheduled sync job");
        }
        replaced
    }

    /// Cancels the job of `stream`. Returns true if it existed.
    pub fn cancel(&self, stream: &SyncStreamId) -> bool {
        let removed = self.jobs.lock().remove(&stream.key());
        match removed {
            Some(job) => {
                job.handle.abort();
                info!(stream = %stream, "cancelled sync job");
                true
            }
            None => false,
        }
    }

    /// Cancels every job of `user`. Returns the number cancelled.
    pub fn cancel_user(&self, user: &UserId) -> usize {
        let cancelled = self.cancel_where(|job| job.stream.user_id() == user);
        info!(user = %user, cancelled, "cancelled sync jobs of user");
        cancelled
    }

    /// Cancels every job of streams of `kind`. Returns the number cancelled.
    pub fn cancel_kind(&self, kind: StreamKind) -> usize {
        let cancelled = self.cancel_where(|job| job.stream.kind() == kind);
        info!(kind = %kind.as_str(), cancelled, "cancelled sync jobs of kind");
        cancelled
    }

    /// Cancels every job carrying `tag`. Returns the number cancelled.
    ///
    /// User-id and kind tags share one namespace: `cancel_tag("core")` also
    /// cancels the streams of a user whose id is `core`. Use [`cancel_user`]
    /// or [`cancel_kind`] to match only one of them.
    ///
    /// [`cancel_user`]: SyncScheduler::cancel_user
    /// [`cancel_kind`]: SyncScheduler::cancel_kind
    pub fn cancel_tag(&self, tag: &str) -> usize {
        self.cancel_where(|job| job.tags.iter().any(|t| t == tag))
    }

    /// Cancels all jobs. Returns the number cancelled.
    pub fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true)
    }

    fn cancel_where(&self, mut predicate: impl FnMut(&Job) -> bool) -> usize {
        let mut jobs = self.jobs.lock();
        let keys: Vec<String> = jobs
            .iter()
            .filter(|(_, job)| predicate(job))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            if let Some(job) = jobs.remove(key) {
                job.handle.abort();
            }
        }
        keys.len()
    }

    /// Returns true if `stream` has a live job.
    pub fn is_scheduled(&self, stream: &SyncStreamId) -> bool {
        self.jobs
            .lock()
            .get(&stream.key())
            .is_some_and(|job| !job.handle.is_finished())
    }

    /// Returns true if the job of `stream` is running its worker.
    pub fn is_running(&self, stream: &SyncStreamId) -> bool {
        self.jobs.lock().get(&stream.key()).is_some_and(|job| {
            !job.handle.is_finished() && job.status.read().state == JobState::Running
        })
    }

    /// Returns the status of the job of `stream`.
    pub fn status(&self, stream: &SyncStreamId) -> Option<JobStatus> {
        self.jobs
            .lock()
            .get(&stream.key())
            .map(|job| job.status.read().clone())
    }

    /// Returns the streams with a job, sorted by key.
    pub fn streams(&self) -> Vec<SyncStreamId> {
        let mut streams: Vec<SyncStreamId> =
            self.jobs.lock().values().map(|job| job.stream.clone()).collect();
        streams.sort_by_key(|stream| stream.key());
        streams
    }

    /// Returns the streams whose job carries `tag`, sorted by key.
    ///
    /// Like [`cancel_tag`](SyncScheduler::cancel_tag), a tag equal to both a
    /// user id and a kind name matches streams of either.
    pub fn streams_with_tag(&self, tag: &str) -> Vec<SyncStreamId> {
        let mut streams: Vec<SyncStreamId> = self
            .jobs
            .lock()
            .values()
            .filter(|job| job.tags.iter().any(|t| t == tag))
            .map(|job| job.stream.clone())
            .collect();
        streams.sort_by_key(|stream| stream.key());
        streams
    }

    /// Returns the number of jobs.
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Returns true if there are no jobs.
    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

impl<W: SyncWorker, P: PowerStateProvider> Drop for SyncScheduler<W, P> {
    fn drop(&mut self) {
        for job in self.jobs.get_mut().values() {
            job.handle.abort();
        }
    }
}

impl<W: SyncWorker, P: PowerStateProvider> std::fmt::Debug for SyncScheduler<W, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self.jobs.lock().keys().cloned().collect();
        keys.sort();
        f.debug_struct("SyncScheduler").field("jobs", &keys).finish()
    }
}

async fn run_job<W, P>(
    stream: SyncStreamId,
    previous: Option<JoinHandle<()>>,
    worker: Arc<W>,
    power: Arc<P>,
    config: Arc<SchedulerConfig>,
    status: Arc<RwLock<JobStatus>>,
) where
    W: SyncWorker,
    P: PowerStateProvider,
{
    if let Some(previous) = previous {
        // Resolves once the aborted job's in-flight run has been dropped.
        let _ = previous.await;
    }
    if !config.initial_delay.is_zero() {
        tokio::time::sleep(config.initial_delay).await;
    }

    let mut retries: u32 = 0;
    loop {
        if !config.constraints.is_satisfied(&*power) {
            let delay = config.repeat_interval(&*power);
            {
                let mut status = status.write();
                status.state = JobState::Blocked;
                status.next_delay = delay;
            }
            debug!(stream = %stream, delay = ?delay, "sync job constraints not met");
            tokio::time::sleep(delay).await;
            continue;
        }

        status.write().state = JobState::Running;
        let outcome = worker.do_work(&stream).await;

        let delay = match outcome {
            JobOutcome::Retry => {
                retries = retries.saturating_add(1);
                if retries > config.max_retries_before_warning {
                    warn!(stream = %stream, retries, "max retries exceeded");
                    status.write().retry_warnings += 1;
                }
                config.backoff.delay_for_attempt(retries)
            }
            JobOutcome::Success | JobOutcome::Failure => {
                retries = 0;
                config.repeat_interval(&*power)
            }
        };

        {
            let mut status = status.write();
            status.state = JobState::Waiting;
            status.runs += 1;
            status.consecutive_retries = retries;
            status.last_outcome = Some(outcome);
            status.next_delay = delay;
        }
        debug!(stream = %stream, outcome = %outcome, delay = ?delay, "sync job sleeping");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::config::JobConstraints;
    use crate::power::{StandbyBucket, StaticPowerState};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Instant};

    #[derive(Default)]
    struct ScriptedWorker {
        outcomes: Mutex<VecDeque<JobOutcome>>,
        calls: Mutex<Vec<(SyncStreamId, Instant)>>,
        hold: Option<Duration>,
        active: AtomicUsize,
    }

    struct ActiveGuard<'a>(&'a ScriptedWorker);

    impl Drop for ActiveGuard<'_> {
        fn drop(&mut self) {
            self.0.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl ScriptedWorker {
        fn with_outcomes(outcomes: impl IntoIterator<Item = JobOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                ..Default::default()
            }
        }

        fn holding(hold: Duration) -> Self {
            Self {
                hold: Some(hold),
                ..Default::default()
            }
        }

        fn gaps(&self) -> Vec<u64> {
            self.calls
                .lock()
                .windows(2)
                .map(|w| (w[1].1 - w[0].1).as_secs())
                .collect()
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl SyncWorker for ScriptedWorker {
        async fn do_work(&self, stream: &SyncStreamId) -> JobOutcome {
            self.calls.lock().push((stream.clone(), Instant::now()));
            self.active.fetch_add(1, Ordering::SeqCst);
            let _guard = ActiveGuard(self);
            if let Some(hold) = self.hold {
                sleep(hold).await;
            }
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or(JobOutcome::Success)
        }
    }

    fn scheduler(
        worker: ScriptedWorker,
        power: StaticPowerState,
        config: SchedulerConfig,
    ) -> (
        SyncScheduler<ScriptedWorker, StaticPowerState>,
        Arc<ScriptedWorker>,
        Arc<StaticPowerState>,
    ) {
        let worker = Arc::new(worker);
        let power = Arc::new(power);
        (
            SyncScheduler::new(worker.clone(), power.clone(), config),
            worker,
            power,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retries_back_off_then_resume_interval() {
        let (scheduler, worker, _) = scheduler(
            ScriptedWorker::with_outcomes([JobOutcome::Retry, JobOutcome::Retry]),
            StaticPowerState::new(),
            SchedulerConfig::default(),
        );
        let stream = SyncStreamId::core("u1");

        scheduler.enqueue(stream.clone());
        sleep(Duration::from_secs(30 + 60 + 1800 + 1)).await;

        assert_eq!(worker.gaps(), vec![30, 60, 1800]);
        let status = scheduler.status(&stream).unwrap();
        assert_eq!(status.consecutive_retries, 0);
        assert_eq!(status.last_outcome, Some(JobOutcome::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_follows_power_state() {
        let power = StaticPowerState::foreground();
        let (scheduler, worker, power) =
            scheduler(ScriptedWorker::default(), power, SchedulerConfig::default());

        scheduler.enqueue(SyncStreamId::core("u1"));
        sleep(Duration::from_secs(300 * 2 + 1)).await;
        assert_eq!(worker.gaps(), vec![300, 300]);

        // The next sleep was chosen while foregrounded.
        power.set_foreground(false);
        power.set_bucket(StandbyBucket::WorkingSet);
        sleep(Duration::from_secs(300 + 7200)).await;
        assert_eq!(worker.gaps(), vec![300, 300, 300, 7200]);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_waits_for_next_interval() {
        let (scheduler, worker, _) = scheduler(
            ScriptedWorker::with_outcomes([JobOutcome::Failure]),
            StaticPowerState::new(),
            SchedulerConfig::default()
                .with_standby_aware(false)
                .with_background_flat_interval(Duration::from_secs(600)),
        );

        scheduler.enqueue(SyncStreamId::core("u1"));
        sleep(Duration::from_secs(601)).await;
        assert_eq!(worker.gaps(), vec![600]);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_delay_defers_first_run() {
        let (scheduler, worker, _) = scheduler(
            ScriptedWorker::default(),
            StaticPowerState::new(),
            SchedulerConfig::default().with_initial_delay(Duration::from_secs(60)),
        );

        scheduler.enqueue(SyncStreamId::core("u1"));
        sleep(Duration::from_secs(59)).await;
        assert_eq!(worker.call_count(), 0);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(worker.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_retries_raise_warning_and_keep_going() {
        let (scheduler, worker, _) = scheduler(
            ScriptedWorker::with_outcomes([JobOutcome::Retry; 5]),
            StaticPowerState::new(),
            SchedulerConfig::default()
                .with_backoff(
                    BackoffPolicy::new(Duration::from_secs(1)).with_max_delay(Duration::from_secs(1)),
                )
                .with_max_retries_before_warning(2),
        );
        let stream = SyncStreamId::core("u1");

        scheduler.enqueue(stream.clone());
        sleep(Duration::from_secs(10)).await;

        assert_eq!(worker.call_count(), 6);
        let status = scheduler.status(&stream).unwrap();
        assert_eq!(status.retry_warnings, 3);
        assert_eq!(status.last_outcome, Some(JobOutcome::Success));
        assert!(scheduler.is_scheduled(&stream));
    }

    #[tokio::test(start_paused = true)]
    async fn unmet_constraints_block_runs() {
        let power = StaticPowerState::foreground();
        power.set_battery_low(true);
        let (scheduler, worker, power) = scheduler(
            ScriptedWorker::default(),
            power,
            SchedulerConfig::default().with_constraints(JobConstraints {
                requires_battery_not_low: true,
                requires_storage_not_low: false,
            }),
        );
        let stream = SyncStreamId::core("u1");

        scheduler.enqueue(stream.clone());
        sleep(Duration::from_secs(1000)).await;
        assert_eq!(worker.call_count(), 0);
        assert_eq!(scheduler.status(&stream).unwrap().state, JobState::Blocked);

        power.set_battery_low(false);
        sleep(Duration::from_secs(301)).await;
        assert_eq!(worker.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_replaces_existing_job() {
        let (scheduler, worker, _) = scheduler(
            ScriptedWorker::holding(Duration::from_secs(60)),
            StaticPowerState::new(),
            SchedulerConfig::default(),
        );
        let stream = SyncStreamId::core("u1");

        assert!(!scheduler.enqueue(stream.clone()));
        sleep(Duration::from_millis(1)).await;
        assert!(scheduler.is_running(&stream));
        assert_eq!(worker.active.load(Ordering::SeqCst), 1);

        assert!(scheduler.enqueue(stream.clone()));
        sleep(Duration::from_millis(1)).await;

        assert_eq!(scheduler.len(), 1);
        assert_eq!(worker.call_count(), 2);
        assert_eq!(worker.active.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_running(&stream));

        sleep(Duration::from_secs(61)).await;
        assert!(!scheduler.is_running(&stream));
        assert!(scheduler.is_scheduled(&stream));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_by_user_and_kind() {
        let (scheduler, _, _) = scheduler(
            ScriptedWorker::default(),
            StaticPowerState::new(),
            SchedulerConfig::default(),
        );
        scheduler.enqueue(SyncStreamId::core("u1"));
        scheduler.enqueue(SyncStreamId::calendar("u1", "cal", 1));
        scheduler.enqueue(SyncStreamId::core("u2"));
        scheduler.enqueue(SyncStreamId::drive("u2", "s1"));

        assert_eq!(
            scheduler.streams_with_tag("core"),
            vec![SyncStreamId::core("u1"), SyncStreamId::core("u2")]
        );
        assert_eq!(scheduler.cancel_user(&UserId::from("u1")), 2);
        assert_eq!(scheduler.cancel_kind(StreamKind::Drive), 1);
        assert_eq!(scheduler.streams(), vec![SyncStreamId::core("u2")]);

        assert!(!scheduler.cancel(&SyncStreamId::core("u1")));
        assert!(scheduler.cancel(&SyncStreamId::core("u2")));
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn user_named_like_a_kind() {
        let (scheduler, _, _) = scheduler(
            ScriptedWorker::default(),
            StaticPowerState::new(),
            SchedulerConfig::default(),
        );
        scheduler.enqueue(SyncStreamId::drive("core", "s1"));
        scheduler.enqueue(SyncStreamId::core("u2"));
        scheduler.enqueue(SyncStreamId::drive("u3", "s1"));

        assert_eq!(
            scheduler.streams_with_tag("core"),
            vec![SyncStreamId::core("u2"), SyncStreamId::drive("core", "s1")]
        );
        assert_eq!(scheduler.cancel_kind(StreamKind::Core), 1);
        assert_eq!(scheduler.cancel_user(&UserId::from("core")), 1);
        assert_eq!(scheduler.streams(), vec![SyncStreamId::drive("u3", "s1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_job_stops_running() {
        let (scheduler, worker, _) = scheduler(
            ScriptedWorker::holding(Duration::from_secs(60)),
            StaticPowerState::new(),
            SchedulerConfig::default(),
        );
        let stream = SyncStreamId::core("u1");

        scheduler.enqueue(stream.clone());
        sleep(Duration::from_millis(1)).await;
        assert_eq!(worker.active.load(Ordering::SeqCst), 1);

        assert_eq!(scheduler.cancel_tag(&stream.key()), 1);
        sleep(Duration::from_secs(3600)).await;

        assert_eq!(worker.active.load(Ordering::SeqCst), 0);
        assert_eq!(worker.call_count(), 1);
        assert!(!scheduler.is_scheduled(&stream));
    }
}
