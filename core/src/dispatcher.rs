//! Offloads CPU-bound ranking work from the I/O event loop onto a fixed-size
//! worker pool.
//!
//! `submit` returns a [`JobHandle`] immediately. The handle is a future, so a
//! connection task can await it and yield to the scheduler, and it can also be
//! checked without blocking through [`JobHandle::try_result`]. A pending check
//! never consumes the eventual result.

use crate::document::Document;
use crate::engine::{RankedResult, RetrainOutcome};
use crate::error::{SearchError, SearchResult};
use crate::settings::Settings;
use crate::store::SharedEngine;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

pub struct Dispatcher {
    pool: ThreadPool,
    workers: usize,
    queue_limit: Option<usize>,
    in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// `queue_limit` bounds queued plus running jobs; `None` queues without bound.
    pub fn new(workers: usize, queue_limit: Option<usize>) -> SearchResult<Self> {
        let workers = workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("rank-worker-{i}"))
            .build()
            .map_err(|e| SearchError::ComputeFailed(format!("worker pool: {e}")))?;
        tracing::info!(workers, ?queue_limit, "dispatcher started");
        Ok(Self { pool, workers, queue_limit, in_flight: Arc::new(AtomicUsize::new(0)) })
    }

    pub fn from_settings(settings: &Settings) -> SearchResult<Self> {
        Self::new(settings.workers(), settings.queue_limit())
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Jobs accepted but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn reserve(&self) -> SearchResult<()> {
        let Some(limit) = self.queue_limit else {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        };
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= limit {
                tracing::warn!(limit, "dispatcher queue full, rejecting job");
                return Err(SearchError::Overloaded { limit });
            }
            match self.in_flight.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Queues `job` (FIFO) and returns its handle without waiting.
    pub fn submit<F, T>(&self, job: F) -> SearchResult<JobHandle<T>>
    where
        F: FnOnce() -> SearchResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.reserve()?;
        let (tx, rx) = oneshot::channel();
        let in_flight = Arc::clone(&self.in_flight);
        self.pool.spawn_fifo(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                tracing::error!(%message, "ranking job panicked");
                Err(SearchError::ComputeFailed(message))
            });
            in_flight.fetch_sub(1, Ordering::AcqRel);
            if tx.send(outcome).is_err() {
                tracing::debug!("job finished after its handle was dropped");
            }
        });
        Ok(JobHandle { rx })
    }

    pub fn rank(
        &self,
        engine: SharedEngine,
        query: String,
        filter: Option<BTreeSet<String>>,
    ) -> SearchResult<JobHandle<Vec<RankedResult>>> {
        self.submit(move || engine.read().rank(&query, filter.as_ref()))
    }

    pub fn absorb_feedback(&self, engine: SharedEngine, query: String, url: String, clicked: bool) -> SearchResult<JobHandle<()>> {
        self.submit(move || engine.write().absorb_feedback(&query, &url, clicked))
    }

    pub fn retrain(&self, engine: SharedEngine) -> SearchResult<JobHandle<RetrainOutcome>> {
        self.submit(move || engine.write().retrain())
    }

    pub fn append_documents(&self, engine: SharedEngine, documents: Vec<Document>) -> SearchResult<JobHandle<usize>> {
        self.submit(move || {
            let mut engine = engine.write();
            engine.append_documents(documents)?;
            Ok(engine.len())
        })
    }

    pub fn remove_document(&self, engine: SharedEngine, url: String) -> SearchResult<JobHandle<Document>> {
        self.submit(move || engine.write().remove_document(&url))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Result of a non-blocking completion check.
#[derive(Debug)]
pub enum JobState<T> {
    Pending,
    Ready(SearchResult<T>),
}

/// Eventual result of a submitted job.
#[derive(Debug)]
pub struct JobHandle<T> {
    rx: oneshot::Receiver<SearchResult<T>>,
}

impl<T> JobHandle<T> {
    /// Checks for completion without blocking. `Pending` leaves the result in
    /// place for a later check or await.
    pub fn try_result(&mut self) -> JobState<T> {
        match self.rx.try_recv() {
            Ok(outcome) => JobState::Ready(outcome),
            Err(TryRecvError::Empty) => JobState::Pending,
            Err(TryRecvError::Closed) => JobState::Ready(Err(lost())),
        }
    }
}

fn lost() -> SearchError {
    SearchError::ComputeFailed("worker dropped the job before finishing".to_string())
}

impl<T> Future for JobHandle<T> {
    type Output = SearchResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.unwrap_or_else(|_| Err(lost())))
    }
}
