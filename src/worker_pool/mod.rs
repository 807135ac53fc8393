//! The priority-queued worker pool that executes batches of LLM requests
//! (C3): scheduling, retry, phase tracking, and the termination guarantee.

pub mod handlers;
pub mod queue;
pub mod tracking;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{sync::Mutex, task::JoinSet};

use crate::{
    error::ErrorKind,
    events::Event,
    model::{BatchStats, LlmResult, Request, RequestPhase, ResultMap},
    ports::LlmClient,
    prelude::*,
    rate_limiter::RateLimiter,
};

use handlers::{Routing, route_result};
use queue::PriorityQueue;
use tracking::PhaseTracker;

/// A worker is considered stuck (and logged) after this much idle time with
/// outstanding work.
const WATCHDOG_IDLE_THRESHOLD: Duration = Duration::from_secs(30);
/// Minimum time between watchdog log lines, to avoid spamming under
/// sustained idle conditions.
const WATCHDOG_MIN_LOG_INTERVAL: Duration = Duration::from_secs(60);
/// Cap on how many missing ids a single watchdog log line names.
const WATCHDOG_MAX_IDS_LOGGED: usize = 10;
/// Floor on the wait applied when a worker is rate-limited, even if the
/// bucket's own ETA estimate comes back smaller.
const MIN_RATE_LIMIT_WAIT: Duration = Duration::from_millis(100);

/// Tunables for the worker pool (§6 "C3").
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker tasks draining the queue.
    pub max_workers: usize,
    /// Retry budget for transport-classified failures.
    pub max_retries: u32,
    /// Retry budget for `JsonParse` failures specifically, configured
    /// independently so a host can set it to 0 without weakening transport
    /// retry tolerance (§9 open question).
    pub max_retries_json_parse: u32,
    /// Uniform random backoff range applied before a retry.
    pub retry_jitter: (Duration, Duration),
    /// How often `BatchStats` snapshots are suitable for a host to poll
    /// (informational; the pool itself doesn't emit on a timer).
    pub progress_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            max_retries: 5,
            max_retries_json_parse: 5,
            retry_jitter: (Duration::from_secs(1), Duration::from_secs(3)),
            progress_interval: Duration::from_secs(1),
        }
    }
}

/// Shared state every worker task operates on.
struct Shared {
    config: WorkerPoolConfig,
    rate_limiter: Arc<RateLimiter>,
    llm_client: Arc<dyn LlmClient>,
    queue: PriorityQueue,
    phases: PhaseTracker,
    results: Mutex<ResultMap>,
    expected: HashSet<String>,
    on_event: Arc<dyn Fn(Event) + Send + Sync>,
    last_watchdog_log: Mutex<Option<Instant>>,
    idle_since: Mutex<Option<Instant>>,
    model: String,
    started_at: Instant,
}

impl Shared {
    async fn is_done(&self) -> bool {
        self.results.lock().await.len() >= self.expected.len()
    }

    async fn store_result(&self, result: LlmResult) {
        let request_id = result.request_id.clone();
        self.phases.remove(&request_id).await;
        (self.on_event)(terminal_event(&result));
        self.results.lock().await.insert(request_id, result);
    }

    /// Called whenever a worker finds the queue empty. Only actually warns
    /// once the pool has stayed idle with outstanding work for at least
    /// [`WATCHDOG_IDLE_THRESHOLD`], and no more than once per
    /// [`WATCHDOG_MIN_LOG_INTERVAL`] after that.
    async fn maybe_log_watchdog(&self) {
        let now = Instant::now();
        let results = self.results.lock().await;
        if results.len() >= self.expected.len() {
            *self.idle_since.lock().await = None;
            return;
        }
        drop(results);

        let mut idle_since = self.idle_since.lock().await;
        let since = *idle_since.get_or_insert(now);
        if now.duration_since(since) < WATCHDOG_IDLE_THRESHOLD {
            return;
        }
        drop(idle_since);

        let mut last = self.last_watchdog_log.lock().await;
        if let Some(last_log) = *last {
            if now.duration_since(last_log) < WATCHDOG_MIN_LOG_INTERVAL {
                return;
            }
        }
        let results = self.results.lock().await;
        let missing: Vec<&String> = self
            .expected
            .iter()
            .filter(|id| !results.contains_key(*id))
            .take(WATCHDOG_MAX_IDS_LOGGED)
            .collect();
        drop(results);
        warn!(?missing, "worker pool watchdog: requests still outstanding");
        *last = Some(now);
    }

    /// An on-demand [`BatchStats`] snapshot, recomputed from the results and
    /// phase maps rather than tracked incrementally (§9).
    async fn stats(&self) -> BatchStats {
        let results = self.results.lock().await;
        let phases = self.phases.snapshot().await;
        let rate_limit_utilization = self.rate_limiter.status().await.utilization;
        BatchStats::snapshot(&results, &phases, self.started_at.elapsed(), rate_limit_utilization)
    }
}

/// Stringify a caught panic payload for logging.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

fn terminal_event(result: &LlmResult) -> Event {
    if result.success {
        Event::Completed {
            request_id: result.request_id.clone(),
            total_tokens: result.usage.total(),
            cost_usd: result.cost_usd,
        }
    } else {
        Event::Failed {
            request_id: result.request_id.clone(),
            error_kind: result.error_kind.map(|k| k.as_tag().to_owned()).unwrap_or_default(),
            error_message: result.error_message.clone().unwrap_or_default(),
        }
    }
}

/// The worker pool itself. Stateless between `process_batch` calls — build
/// a fresh one (or reuse the rate limiter/client across batches, which is
/// cheap since both are `Arc`s) for each batch of requests.
#[derive(Debug)]
pub struct WorkerPool {
    config: WorkerPoolConfig,
    rate_limiter: Arc<RateLimiter>,
    llm_client: Arc<dyn LlmClient>,
}

impl WorkerPool {
    /// Build a worker pool against a shared rate limiter and LLM client.
    pub fn new(config: WorkerPoolConfig, rate_limiter: Arc<RateLimiter>, llm_client: Arc<dyn LlmClient>) -> Self {
        Self {
            config,
            rate_limiter,
            llm_client,
        }
    }

    /// Run `requests` against `model` to completion, calling `on_result`
    /// exactly once per request id with its terminal (success or failure)
    /// result. Returns the full result map once every id is terminal.
    ///
    /// `on_event` receives lifecycle events for live progress display; pass
    /// [`crate::events::ignore_event`] wrapped in an `Arc` if you don't need
    /// one.
    #[instrument(level = "info", skip_all, fields(n = requests.len(), model = %model))]
    pub async fn process_batch(
        &self,
        requests: Vec<Request>,
        model: &str,
        on_result: impl Fn(&LlmResult) + Send + Sync + 'static,
        on_event: Arc<dyn Fn(Event) + Send + Sync>,
    ) -> ResultMap {
        let shared = self.admit(requests, model, on_event).await;
        Self::drain(shared, Arc::new(on_result)).await
    }

    /// Like [`Self::process_batch`], but returns immediately with a
    /// [`BatchHandle`] a host can poll for [`BatchStats`] snapshots while the
    /// batch runs in the background.
    pub async fn spawn_batch(
        &self,
        requests: Vec<Request>,
        model: &str,
        on_result: impl Fn(&LlmResult) + Send + Sync + 'static,
        on_event: Arc<dyn Fn(Event) + Send + Sync>,
    ) -> BatchHandle {
        let shared = self.admit(requests, model, on_event).await;
        let stats_shared = shared.clone();
        let join = tokio::spawn(Self::drain(shared, Arc::new(on_result)));
        BatchHandle {
            shared: stats_shared,
            join,
        }
    }

    /// Stamp, admit, and enqueue every request, returning the shared state a
    /// batch run (`drain`) operates on.
    async fn admit(&self, requests: Vec<Request>, model: &str, on_event: Arc<dyn Fn(Event) + Send + Sync>) -> Arc<Shared> {
        let expected: HashSet<String> = requests.iter().map(|r| r.id.clone()).collect();
        let shared = Arc::new(Shared {
            config: self.config.clone(),
            rate_limiter: self.rate_limiter.clone(),
            llm_client: self.llm_client.clone(),
            queue: PriorityQueue::new(),
            phases: PhaseTracker::new(),
            results: Mutex::new(HashMap::new()),
            expected,
            on_event,
            last_watchdog_log: Mutex::new(None),
            idle_since: Mutex::new(None),
            model: model.to_owned(),
            started_at: Instant::now(),
        });

        for mut request in requests {
            let now = Instant::now();
            request.queued_at = Some(now);
            shared.phases.admit(&request.id, now).await;
            (shared.on_event)(Event::Queued {
                request_id: request.id.clone(),
            });
            shared.queue.push(request).await;
        }

        shared
    }

    /// Spawn workers and drain the queue to completion, returning the full
    /// result map once every admitted id is terminal.
    async fn drain(shared: Arc<Shared>, on_result: Arc<dyn Fn(&LlmResult) + Send + Sync>) -> ResultMap {
        let mut workers = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, Arc<Mutex<Option<String>>>> = HashMap::new();
        for worker_index in 0..shared.config.max_workers.max(1) {
            let slot = Arc::new(Mutex::new(None));
            let abort_handle = spawn_worker(&mut workers, shared.clone(), on_result.clone(), worker_index, slot.clone());
            in_flight.insert(abort_handle.id(), slot);
        }

        while let Some(join_result) = workers.join_next_with_id().await {
            match join_result {
                Ok((_id, Ok(()))) => {}
                Ok((_id, Err(err))) => error!(%err, "worker task returned an error"),
                Err(join_err) => {
                    // Find the in-flight slot for the task that just panicked
                    // and synthesize a terminal result for whatever id it was
                    // holding, so that id still reaches a terminal state.
                    let held_id = match in_flight.get(&join_err.id()) {
                        Some(slot) => slot.lock().await.take(),
                        None => None,
                    };
                    match held_id {
                        Some(request_id) => {
                            error!(%join_err, request_id = %request_id, "worker task panicked with a request in flight");
                            let result = LlmResult::failure(&request_id, ErrorKind::WorkerException, format!("worker task panicked: {join_err}"));
                            shared.store_result(result).await;
                        }
                        None => error!(%join_err, "worker task panicked with no request in flight"),
                    }
                    if !shared.is_done().await {
                        let slot = Arc::new(Mutex::new(None));
                        let abort_handle = spawn_worker(&mut workers, shared.clone(), on_result.clone(), 0, slot.clone());
                        in_flight.insert(abort_handle.id(), slot);
                    }
                }
            }
        }

        let results = shared.results.lock().await;
        for id in &shared.expected {
            if !results.contains_key(id) {
                error!(request_id = %id, "process_batch returning without a terminal result for this id");
            }
        }
        results.clone()
    }
}

/// A handle to a batch running in the background, returned by
/// [`WorkerPool::spawn_batch`]. Poll [`Self::stats`] for live [`BatchStats`],
/// or consume [`Self::join`] to wait for the final result map.
pub struct BatchHandle {
    shared: Arc<Shared>,
    join: tokio::task::JoinHandle<ResultMap>,
}

impl BatchHandle {
    /// An on-demand snapshot of batch-wide progress, computed from the
    /// worker pool's result/phase maps.
    pub async fn stats(&self) -> BatchStats {
        self.shared.stats().await
    }

    /// Wait for the batch to finish and return its full result map.
    pub async fn join(self) -> ResultMap {
        self.join.await.unwrap_or_default()
    }
}

fn spawn_worker(
    workers: &mut JoinSet<Result<()>>,
    shared: Arc<Shared>,
    on_result: Arc<dyn Fn(&LlmResult) + Send + Sync>,
    worker_index: usize,
    in_flight: Arc<Mutex<Option<String>>>,
) -> tokio::task::AbortHandle {
    workers.spawn(async move { worker_loop(shared, on_result, worker_index, in_flight).await })
}

async fn worker_loop(
    shared: Arc<Shared>,
    on_result: Arc<dyn Fn(&LlmResult) + Send + Sync>,
    _worker_index: usize,
    in_flight: Arc<Mutex<Option<String>>>,
) -> Result<()> {
    loop {
        if shared.is_done().await {
            return Ok(());
        }

        let Some(request) = shared.queue.pop_wait().await else {
            shared.maybe_log_watchdog().await;
            continue;
        };

        *shared.idle_since.lock().await = None;
        *in_flight.lock().await = Some(request.id.clone());

        if !shared.rate_limiter.can_execute().await {
            let eta = shared.rate_limiter.time_until_token().await;
            shared.phases.set_rate_limited(&request.id, eta.as_secs_f64()).await;
            (shared.on_event)(Event::RateLimited {
                request_id: request.id.clone(),
                eta_secs: eta.as_secs_f64(),
            });
            tokio::time::sleep(eta.max(MIN_RATE_LIMIT_WAIT)).await;
            shared.queue.push(request).await;
            *in_flight.lock().await = None;
            continue;
        }

        shared.rate_limiter.consume(1).await;
        shared.phases.set_phase(&request.id, RequestPhase::Dequeued).await;
        (shared.on_event)(Event::Dequeued {
            request_id: request.id.clone(),
        });
        shared.phases.set_phase(&request.id, RequestPhase::Executing).await;

        let result = execute_one(&shared, &request).await;
        handle_result(&shared, &on_result, request, result).await;
        *in_flight.lock().await = None;
    }
}

async fn execute_one(shared: &Shared, request: &Request) -> LlmResult {
    let queued_at = request.queued_at.expect("admitted requests are always stamped");
    let call = if let Some(tools) = &request.tools {
        shared.llm_client.call_with_tools(request, &shared.model, tools)
    } else {
        shared.llm_client.call(request, &shared.model)
    };

    let outcome = tokio::time::timeout(request.timeout, call).await;
    let mut result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(engine_err)) => {
            let mut result = LlmResult::failure(&request.id, ErrorKind::Unknown, engine_err.to_string());
            result.request = Some(request.clone());
            result
        }
        Err(_elapsed) => {
            let mut result = LlmResult::failure(&request.id, ErrorKind::ThreadTimeout, "worker task timed out waiting for the LLM call");
            result.request = Some(request.clone());
            result
        }
    };
    result.queue_time = queued_at.elapsed().saturating_sub(result.execution_time);
    result.attempts = request.retry_count + 1;
    result
}

async fn handle_result(shared: &Arc<Shared>, on_result: &Arc<dyn Fn(&LlmResult) + Send + Sync>, mut request: Request, result: LlmResult) {
    if !result.success {
        if result.error_kind == Some(ErrorKind::RateLimit429) {
            let retry_after = result.retry_after.map(Duration::from_secs);
            shared.rate_limiter.record_429(retry_after).await;
        }
    }

    match route_result(
        result,
        request.retry_count,
        shared.config.max_retries,
        shared.config.max_retries_json_parse,
        shared.config.retry_jitter,
    ) {
        Routing::Terminal(result) => {
            let for_callback = result.clone();
            shared.store_result(result).await;
            if let Err(panic_payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| on_result(&for_callback))) {
                error!(request_id = %for_callback.request_id, panic = %panic_message(&panic_payload), "on_result callback panicked; swallowing");
            }
        }
        Routing::Retry { backoff, retry_count } => {
            (shared.on_event)(Event::RetryQueued {
                request_id: request.id.clone(),
                attempt: retry_count,
                error_kind: "retryable".to_owned(),
                backoff,
            });
            tokio::time::sleep(backoff).await;
            request.retry_count = retry_count;
            shared.phases.requeue_with_retry(&request.id, retry_count).await;
            shared.queue.push(request).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct ScriptedClient {
        attempts: Mutex<HashMap<String, u32>>,
        fail_times: u32,
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn call(&self, request: &Request, _model: &str) -> Result<LlmResult, crate::error::EngineError> {
            let mut attempts = self.attempts.lock().await;
            let count = attempts.entry(request.id.clone()).or_insert(0);
            *count += 1;
            if *count <= self.fail_times {
                Ok(LlmResult::failure(&request.id, ErrorKind::Server5xx, "boom"))
            } else {
                let mut result = LlmResult::failure(&request.id, ErrorKind::Unknown, "");
                result.success = true;
                result.error_kind = None;
                result.response = "ok".to_owned();
                Ok(result)
            }
        }

        async fn call_with_tools(&self, request: &Request, model: &str, _tools: &[Value]) -> Result<LlmResult, crate::error::EngineError> {
            self.call(request, model).await
        }
    }

    fn test_requests(n: usize) -> Vec<Request> {
        (0..n)
            .map(|i| Request::new(format!("req-{i}"), "m", vec![Message::text("user", "hi")]))
            .collect()
    }

    #[tokio::test]
    async fn every_admitted_request_gets_a_terminal_result() {
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                max_workers: 3,
                ..Default::default()
            },
            Arc::new(RateLimiter::new(6000)),
            Arc::new(ScriptedClient {
                attempts: Mutex::new(HashMap::new()),
                fail_times: 0,
            }),
        );
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let results = pool
            .process_batch(
                test_requests(10),
                "m",
                move |_r| {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                },
                Arc::new(|_event| {}),
            )
            .await;
        assert_eq!(results.len(), 10);
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert!(results.values().all(|r| r.success));
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                max_workers: 2,
                max_retries: 3,
                retry_jitter: (Duration::from_millis(1), Duration::from_millis(2)),
                ..Default::default()
            },
            Arc::new(RateLimiter::new(6000)),
            Arc::new(ScriptedClient {
                attempts: Mutex::new(HashMap::new()),
                fail_times: 2,
            }),
        );
        let results = pool
            .process_batch(test_requests(1), "m", |_r| {}, Arc::new(|_event| {}))
            .await;
        let result = &results["req-0"];
        assert!(result.success);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn empty_batch_returns_immediately() {
        let pool = WorkerPool::new(
            WorkerPoolConfig::default(),
            Arc::new(RateLimiter::new(60)),
            Arc::new(ScriptedClient {
                attempts: Mutex::new(HashMap::new()),
                fail_times: 0,
            }),
        );
        let results = pool.process_batch(vec![], "m", |_r| {}, Arc::new(|_event| {})).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn non_retryable_failure_gets_one_attempt() {
        #[derive(Debug)]
        struct AlwaysClientError;
        #[async_trait]
        impl LlmClient for AlwaysClientError {
            async fn call(&self, request: &Request, _model: &str) -> Result<LlmResult, crate::error::EngineError> {
                Ok(LlmResult::failure(&request.id, ErrorKind::Client4xx, "bad request"))
            }
            async fn call_with_tools(&self, request: &Request, model: &str, _tools: &[Value]) -> Result<LlmResult, crate::error::EngineError> {
                self.call(request, model).await
            }
        }
        let pool = WorkerPool::new(
            WorkerPoolConfig::default(),
            Arc::new(RateLimiter::new(600)),
            Arc::new(AlwaysClientError),
        );
        let results = pool
            .process_batch(test_requests(1), "m", |_r| {}, Arc::new(|_event| {}))
            .await;
        assert_eq!(results["req-0"].attempts, 1);
        assert!(!results["req-0"].success);
    }

    #[derive(Debug)]
    struct PanicOnceClient {
        panicked: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl LlmClient for PanicOnceClient {
        async fn call(&self, request: &Request, _model: &str) -> Result<LlmResult, crate::error::EngineError> {
            if request.id == "req-0" && !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("simulated worker crash");
            }
            let mut result = LlmResult::failure(&request.id, ErrorKind::Unknown, "");
            result.success = true;
            result.error_kind = None;
            result.response = "ok".to_owned();
            Ok(result)
        }

        async fn call_with_tools(&self, request: &Request, model: &str, _tools: &[Value]) -> Result<LlmResult, crate::error::EngineError> {
            self.call(request, model).await
        }
    }

    #[tokio::test]
    async fn panicking_worker_gets_a_worker_exception_result_for_its_in_flight_request() {
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                max_workers: 1,
                ..Default::default()
            },
            Arc::new(RateLimiter::new(6000)),
            Arc::new(PanicOnceClient {
                panicked: std::sync::atomic::AtomicBool::new(false),
            }),
        );
        let results = pool
            .process_batch(test_requests(2), "m", |_r| {}, Arc::new(|_event| {}))
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(results["req-0"].error_kind, Some(ErrorKind::WorkerException));
        assert!(!results["req-0"].success);
        assert!(results["req-1"].success);
    }

    #[derive(Debug)]
    struct SlowClient {
        delay: Duration,
    }

    #[async_trait]
    impl LlmClient for SlowClient {
        async fn call(&self, request: &Request, _model: &str) -> Result<LlmResult, crate::error::EngineError> {
            tokio::time::sleep(self.delay).await;
            let mut result = LlmResult::failure(&request.id, ErrorKind::Unknown, "");
            result.success = true;
            result.error_kind = None;
            result.response = "ok".to_owned();
            Ok(result)
        }

        async fn call_with_tools(&self, request: &Request, model: &str, _tools: &[Value]) -> Result<LlmResult, crate::error::EngineError> {
            self.call(request, model).await
        }
    }

    #[tokio::test]
    async fn spawn_batch_reports_live_stats_before_join() {
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                max_workers: 4,
                ..Default::default()
            },
            Arc::new(RateLimiter::new(6000)),
            Arc::new(SlowClient {
                delay: Duration::from_millis(200),
            }),
        );
        let handle = pool
            .spawn_batch(test_requests(4), "m", |_r| {}, Arc::new(|_event| {}))
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mid_flight = handle.stats().await;
        assert_eq!(mid_flight.completed, 0);
        assert_eq!(mid_flight.failed, 0);
        assert_eq!(mid_flight.in_progress + mid_flight.queued, 4);

        let results = handle.join().await;
        assert_eq!(results.len(), 4);
        assert!(results.values().all(|r| r.success));
    }

    #[tokio::test]
    async fn on_result_panic_is_swallowed_and_result_is_still_stored() {
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                max_workers: 2,
                ..Default::default()
            },
            Arc::new(RateLimiter::new(6000)),
            Arc::new(ScriptedClient {
                attempts: Mutex::new(HashMap::new()),
                fail_times: 0,
            }),
        );
        let results = pool
            .process_batch(
                test_requests(3),
                "m",
                |_r| panic!("host callback blew up"),
                Arc::new(|_event| {}),
            )
            .await;
        assert_eq!(results.len(), 3);
        assert!(results.values().all(|r| r.success));
    }
}
