//! Worker manager behavior with custom worker types.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use harvester::database::time::now_secs;
use harvester::pipeline::{JobSpec, Worker, WorkerContext, WorkerDescriptor, WorkerRegistry};
use harvester::{Error, Result};

#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    done: AtomicUsize,
}

struct SlowWorker {
    gauge: Arc<Gauge>,
}

#[async_trait]
impl Worker for SlowWorker {
    async fn work(&mut self, ctx: &WorkerContext) -> Result<()> {
        ctx.require_job()?;
        let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);

        let slept = ctx.sleep(Duration::from_millis(150)).await;

        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
        slept?;
        self.gauge.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FlakyWorker;

#[async_trait]
impl Worker for FlakyWorker {
    async fn work(&mut self, _ctx: &WorkerContext) -> Result<()> {
        Err(Error::transient("upstream returned 503"))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_exceeds_max_workers() {
    const MAX_WORKERS: usize = 2;
    const JOBS: usize = 7;

    let env = common::setup().await;
    let queue = env.container.queue.clone();
    let gauge = Arc::new(Gauge::default());

    let mut registry = WorkerRegistry::new();
    let factory_gauge = gauge.clone();
    registry
        .register(
            WorkerDescriptor::new("scrape-thing").with_max_workers(MAX_WORKERS),
            move || {
                Box::new(SlowWorker {
                    gauge: factory_gauge.clone(),
                }) as Box<dyn Worker>
            },
        )
        .unwrap();

    for i in 0..JOBS {
        queue
            .add_job(JobSpec::new("scrape-thing", i.to_string()))
            .await
            .unwrap();
    }

    let manager = env.container.manager(registry);
    let handle = manager.handle();
    let pool = handle.pool().clone();
    let running = tokio::spawn(manager.run());

    let mut live_peak = 0;
    let drained = common::wait_until(Duration::from_secs(20), || {
        live_peak = live_peak.max(pool.live_count("scrape-thing"));
        let gauge = gauge.clone();
        async move { gauge.done.load(Ordering::SeqCst) == JOBS }
    })
    .await;
    assert!(drained, "only {} jobs done", gauge.done.load(Ordering::SeqCst));

    assert!(gauge.peak.load(Ordering::SeqCst) <= MAX_WORKERS);
    assert!(live_peak <= MAX_WORKERS);
    assert_eq!(queue.get_job_count(Some("scrape-thing")).await.unwrap(), 0);

    handle.shutdown();
    let report = running.await.unwrap().unwrap();
    assert!(report.all_graceful());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_failure_releases_job_with_attempt() {
    let env = common::setup().await;
    let queue = env.container.queue.clone();

    let mut registry = WorkerRegistry::new();
    registry
        .register(WorkerDescriptor::new("scrape-thing"), || {
            Box::new(FlakyWorker) as Box<dyn Worker>
        })
        .unwrap();
    queue
        .add_job(JobSpec::new("scrape-thing", "42").with_claim_after(0))
        .await
        .unwrap();

    let manager = env.container.manager(registry);
    let handle = manager.handle();
    let running = tokio::spawn(manager.run());

    let released = common::wait_until(Duration::from_secs(10), || {
        let queue = queue.clone();
        async move {
            queue
                .find_job("scrape-thing", "42")
                .await
                .unwrap()
                .is_some_and(|job| job.attempts == 1 && !job.is_claimed())
        }
    })
    .await;
    assert!(released, "job was not released for retry");

    let job = queue.find_job("scrape-thing", "42").await.unwrap().unwrap();
    assert!(job.claim_after > now_secs(), "retry must be delayed");

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recurring_type_gets_its_job_ensured() {
    let env = common::setup().await;
    let queue = env.container.queue.clone();
    let gauge = Arc::new(Gauge::default());

    let mut registry = WorkerRegistry::new();
    let factory_gauge = gauge.clone();
    registry
        .register(
            WorkerDescriptor::new("refresh-boards").recurring("all", 3600),
            move || {
                Box::new(SlowWorker {
                    gauge: factory_gauge.clone(),
                }) as Box<dyn Worker>
            },
        )
        .unwrap();

    let manager = env.container.manager(registry);
    let handle = manager.handle();
    let running = tokio::spawn(manager.run());

    let ran = common::wait_until(Duration::from_secs(10), || {
        let gauge = gauge.clone();
        async move { gauge.done.load(Ordering::SeqCst) == 1 }
    })
    .await;
    assert!(ran, "recurring job never ran");

    let rescheduled = common::wait_until(Duration::from_secs(5), || {
        let queue = queue.clone();
        async move {
            queue
                .find_job("refresh-boards", "all")
                .await
                .unwrap()
                .is_some_and(|job| !job.is_claimed() && job.claim_after > now_secs())
        }
    })
    .await;
    assert!(rescheduled, "recurring job was not rescheduled");

    handle.shutdown();
    running.await.unwrap().unwrap();
}
