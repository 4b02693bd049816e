//! Execution policy: where a decoded call runs.
//!
//! Serial runs the method inline on the connection task. Pool moves it to a
//! fixed set of OS worker threads consuming a lock-free bounded MPMC queue,
//! freeing the connection task to process more requests.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::Error;
use crate::proto::{Fault, Params, Response};

use super::dispatch::{Method, MethodContext};
use super::interceptor::{run_chain, Interceptor};

/// Chooses the execution policy for a server's methods.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutorConfig {
    /// Execute on the connection task; no internal synchronization.
    #[default]
    Serial,
    /// Execute on a fixed pool of worker threads.
    Pool { threads: usize },
}

pub(crate) enum Executor {
    Serial,
    Pool(Arc<Pool>),
}

impl Executor {
    pub(crate) fn new(config: ExecutorConfig) -> Executor {
        match config {
            ExecutorConfig::Serial => Executor::Serial,
            ExecutorConfig::Pool { threads } => Executor::Pool(Pool::new(threads.max(1))),
        }
    }

    pub(crate) async fn execute(
        &self,
        mut method: Box<dyn Method>,
        interceptors: Vec<Arc<dyn Interceptor>>,
        ctx: MethodContext,
        params: Params,
    ) -> crate::Result<Response> {
        match *self {
            Executor::Serial => Ok(run_method(
                method.as_mut(),
                &interceptors,
                &ctx,
                &params,
                -32500,
            )),
            Executor::Pool(ref pool) => {
                let (tx, rx) = oneshot::channel();
                let item = WorkItem {
                    run: Box::new(move || {
                        let mut method = method;
                        let resp = run_method(method.as_mut(), &interceptors, &ctx, &params, -1);
                        let _ = tx.send(resp);
                    }),
                };
                pool.register(item).await?;
                rx.await.map_err(|_| Error::new_canceled())
            }
        }
    }
}

fn run_method(
    method: &mut dyn Method,
    interceptors: &[Arc<dyn Interceptor>],
    ctx: &MethodContext,
    params: &Params,
    panic_fault_code: i32,
) -> Response {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        run_chain(interceptors, method, ctx, params)
    }));
    match result {
        Ok(Ok(value)) => Response::from_value(value),
        Ok(Err(fault)) => Response::from_fault(fault),
        Err(_) => Response::from_fault(Fault::new(panic_fault_code, "Unknown Error")),
    }
}

pub(crate) struct WorkItem {
    run: Box<dyn FnOnce() + Send + 'static>,
}

const QUEUE_CAPACITY: usize = 1024;
const DRAIN_WARN_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) struct Pool {
    queue: ArrayQueue<WorkItem>,
    pending: AtomicUsize,
    outstanding: AtomicUsize,
    shutdown: AtomicBool,
    wait_mutex: Mutex<()>,
    wait_cv: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    pub(crate) fn new(threads: usize) -> Arc<Pool> {
        let pool = Arc::new(Pool {
            queue: ArrayQueue::new(QUEUE_CAPACITY),
            pending: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            wait_mutex: Mutex::new(()),
            wait_cv: Condvar::new(),
            workers: Mutex::new(Vec::with_capacity(threads)),
        });
        let mut workers = pool.workers.lock().expect("pool workers lock");
        for _ in 0..threads {
            let pool = pool.clone();
            workers.push(std::thread::spawn(move || worker_loop(pool)));
        }
        drop(workers);
        pool
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) async fn register(&self, item: WorkItem) -> crate::Result<()> {
        if self.is_shutdown() {
            return Err(Error::new_canceled());
        }
        self.outstanding.fetch_add(1, Ordering::Relaxed);

        let mut item = item;
        loop {
            match self.queue.push(item) {
                Ok(()) => break,
                Err(rejected) => {
                    // queue saturated; rare with proper sizing
                    if self.is_shutdown() {
                        self.outstanding.fetch_sub(1, Ordering::Relaxed);
                        return Err(Error::new_canceled());
                    }
                    item = rejected;
                    tokio::task::yield_now().await;
                }
            }
        }

        self.pending.fetch_add(1, Ordering::Release);
        let _guard = self.wait_mutex.lock().expect("pool wait lock");
        self.wait_cv.notify_one();
        Ok(())
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Waits for in-flight executors to finish, bounded by `deadline`,
    /// logging while work remains.
    pub(crate) async fn drain(&self, deadline: Duration) {
        let start = Instant::now();
        let mut last_warn = start;
        while self.outstanding() > 0 {
            if start.elapsed() >= deadline {
                warn!(
                    "giving up on {} in-flight executors after {:?}",
                    self.outstanding(),
                    deadline
                );
                return;
            }
            if last_warn.elapsed() >= DRAIN_WARN_INTERVAL {
                warn!("waiting for {} in-flight executors", self.outstanding());
                last_warn = Instant::now();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Signals shutdown, joins every worker, then destroys whatever the
    /// queue still holds. Orphaned executors resolve their callers with a
    /// canceled error.
    pub(crate) fn shutdown_and_join(&self) {
        self.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.wait_mutex.lock().expect("pool wait lock");
            self.wait_cv.notify_all();
        }
        let handles = std::mem::take(&mut *self.workers.lock().expect("pool workers lock"));
        for handle in handles {
            let _ = handle.join();
        }
        while let Some(item) = self.queue.pop() {
            self.outstanding.fetch_sub(1, Ordering::Relaxed);
            drop(item);
        }
        debug!("executor pool shut down");
    }
}

fn worker_loop(pool: Arc<Pool>) {
    loop {
        let item = loop {
            if let Some(item) = pool.queue.pop() {
                break item;
            }
            if pool.is_shutdown() {
                return;
            }
            // the predicate re-checks on spurious wakeups and closes the
            // window between the empty pop and the wait
            let guard = pool.wait_mutex.lock().expect("pool wait lock");
            let _guard = pool
                .wait_cv
                .wait_while(guard, |_| {
                    pool.pending.load(Ordering::Acquire) == 0 && !pool.is_shutdown()
                })
                .expect("pool wait");
            if pool.is_shutdown() {
                return;
            }
        };

        pool.pending.fetch_sub(1, Ordering::Relaxed);
        (item.run)();
        pool.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_runs_registered_work() {
        let pool = Pool::new(4);
        let mut rxs = Vec::new();
        for i in 0..64usize {
            let (tx, rx) = oneshot::channel();
            pool.register(WorkItem {
                run: Box::new(move || {
                    let _ = tx.send(i * 2);
                }),
            })
            .await
            .unwrap();
            rxs.push(rx);
        }
        for (i, rx) in rxs.into_iter().enumerate() {
            assert_eq!(rx.await.unwrap(), i * 2);
        }
        pool.drain(Duration::from_secs(5)).await;
        assert_eq!(pool.outstanding(), 0);
        pool.shutdown_and_join();
    }

    #[tokio::test]
    async fn shutdown_drains_queue_and_cancels_orphans() {
        // no workers: registered work stays queued
        let pool = Pool::new(0);
        let (tx, rx) = oneshot::channel::<Response>();
        pool.register(WorkItem {
            run: Box::new(move || {
                let _ = tx.send(Response::from_value(crate::value::Value::Nil));
            }),
        })
        .await
        .unwrap();
        assert_eq!(pool.outstanding(), 1);

        pool.shutdown_and_join();
        assert_eq!(pool.outstanding(), 0);
        // the orphaned sender is dropped, so the caller observes cancellation
        assert!(rx.await.is_err());
        assert!(pool
            .register(WorkItem { run: Box::new(|| {}) })
            .await
            .is_err());
    }
}
