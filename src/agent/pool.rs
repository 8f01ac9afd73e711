//! Bounded-parallel execution of a set of agent runners.
//!
//! The pool is a per-task execution helper: it does not persist anything.
//! Runners are dispatched through a semaphore, report state changes to a
//! progress callback, and can be stopped cooperatively.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;

use super::runner::{AgentInvocation, AgentInvoker, AgentOutput};

pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

/// States a pooled runner moves through, reported via the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl RunnerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Callback invoked on every runner state change: `(runner_id, state)`.
pub type PoolProgressFn = Arc<dyn Fn(&str, RunnerState) + Send + Sync>;

pub struct AgentPool {
    invoker: Arc<dyn AgentInvoker>,
    max_concurrency: usize,
    runners: Vec<(String, AgentInvocation)>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl AgentPool {
    pub fn new(invoker: Arc<dyn AgentInvoker>, max_concurrency: usize) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            invoker,
            max_concurrency: max_concurrency.max(1),
            runners: Vec::new(),
            stop_tx,
            stop_rx,
        }
    }

    /// Register a pending runner. Duplicate ids are an error.
    pub fn add(&mut self, id: impl Into<String>, invocation: AgentInvocation) -> Result<()> {
        let id = id.into();
        if self.runners.iter().any(|(existing, _)| *existing == id) {
            bail!("Runner '{}' already registered", id);
        }
        self.runners.push((id, invocation));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Request a cooperative stop: pending runners are skipped and running
    /// runners are terminated (their child processes die on abort).
    pub fn stop_handle(&self) -> PoolStopHandle {
        PoolStopHandle {
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Dispatch all registered runners through the semaphore and wait for
    /// them. Returns a mapping from runner id to output-or-error.
    pub async fn run_all(
        self,
        progress: Option<PoolProgressFn>,
    ) -> HashMap<String, Result<AgentOutput>> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let results: Arc<Mutex<HashMap<String, Result<AgentOutput>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        for (id, invocation) in self.runners {
            if let Some(progress) = &progress {
                progress(&id, RunnerState::Pending);
            }
            let semaphore = semaphore.clone();
            let invoker = self.invoker.clone();
            let results = results.clone();
            let progress = progress.clone();
            let mut stop_rx = self.stop_rx.clone();

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                if *stop_rx.borrow() {
                    if let Some(progress) = &progress {
                        progress(&id, RunnerState::Skipped);
                    }
                    results
                        .lock()
                        .await
                        .insert(id, Err(anyhow::anyhow!("Pool stopped before dispatch")));
                    return;
                }
                if let Some(progress) = &progress {
                    progress(&id, RunnerState::Running);
                }

                // A stop request aborts the in-flight invocation; the child
                // process is killed on drop.
                let outcome = tokio::select! {
                    outcome = invoker.invoke(invocation) => outcome,
                    _ = stop_rx.wait_for(|stopped| *stopped) => {
                        Err(anyhow::anyhow!("Runner stopped"))
                    }
                };

                if let Some(progress) = &progress {
                    let state = match &outcome {
                        Ok(out) if out.success => RunnerState::Completed,
                        _ => RunnerState::Failed,
                    };
                    progress(&id, state);
                }
                results.lock().await.insert(id, outcome);
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        Arc::try_unwrap(results)
            .map(|m| m.into_inner())
            .unwrap_or_default()
    }
}

/// Clonable handle for requesting a pool stop from elsewhere.
#[derive(Clone)]
pub struct PoolStopHandle {
    stop_tx: watch::Sender<bool>,
}

impl PoolStopHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StubInvoker {
        running_peak: Arc<AtomicUsize>,
        running_now: Arc<AtomicUsize>,
        delay: Duration,
        fail_ids: Vec<String>,
    }

    #[async_trait]
    impl AgentInvoker for StubInvoker {
        async fn invoke(&self, invocation: AgentInvocation) -> Result<AgentOutput> {
            let now = self.running_now.fetch_add(1, Ordering::SeqCst) + 1;
            self.running_peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running_now.fetch_sub(1, Ordering::SeqCst);
            if self.fail_ids.contains(&invocation.prompt) {
                bail!("stub failure");
            }
            Ok(AgentOutput {
                success: true,
                output: invocation.prompt,
                ..Default::default()
            })
        }
    }

    fn stub(delay: Duration, fail_ids: Vec<String>) -> (Arc<StubInvoker>, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        let invoker = Arc::new(StubInvoker {
            running_peak: peak.clone(),
            running_now: Arc::new(AtomicUsize::new(0)),
            delay,
            fail_ids,
        });
        (invoker, peak)
    }

    #[test]
    fn duplicate_id_is_an_error() {
        let (invoker, _) = stub(Duration::ZERO, vec![]);
        let mut pool = AgentPool::new(invoker, 2);
        pool.add("a", AgentInvocation::new("/tmp", "x")).unwrap();
        assert!(pool.add("a", AgentInvocation::new("/tmp", "y")).is_err());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let (invoker, peak) = stub(Duration::from_millis(50), vec![]);
        let mut pool = AgentPool::new(invoker, 2);
        for i in 0..6 {
            pool.add(format!("r{}", i), AgentInvocation::new("/tmp", format!("p{}", i)))
                .unwrap();
        }
        let results = pool.run_all(None).await;
        assert_eq!(results.len(), 6);
        assert!(results.values().all(|r| r.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn failures_are_reported_per_runner() {
        let (invoker, _) = stub(Duration::ZERO, vec!["bad".to_string()]);
        let mut pool = AgentPool::new(invoker, 4);
        pool.add("ok", AgentInvocation::new("/tmp", "good")).unwrap();
        pool.add("broken", AgentInvocation::new("/tmp", "bad")).unwrap();

        let states: Arc<std::sync::Mutex<Vec<(String, RunnerState)>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let states_cb = states.clone();
        let progress: PoolProgressFn = Arc::new(move |id, state| {
            states_cb.lock().unwrap().push((id.to_string(), state));
        });

        let results = pool.run_all(Some(progress)).await;
        assert!(results["ok"].is_ok());
        assert!(results["broken"].is_err());

        let states = states.lock().unwrap();
        assert!(states.contains(&("ok".to_string(), RunnerState::Completed)));
        assert!(states.contains(&("broken".to_string(), RunnerState::Failed)));
    }

    #[tokio::test]
    async fn stop_skips_pending_runners() {
        let (invoker, _) = stub(Duration::from_millis(100), vec![]);
        let mut pool = AgentPool::new(invoker, 1);
        for i in 0..4 {
            pool.add(format!("r{}", i), AgentInvocation::new("/tmp", format!("p{}", i)))
                .unwrap();
        }
        let stop = pool.stop_handle();
        let task = tokio::spawn(pool.run_all(None));
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.stop();
        let results = task.await.unwrap();
        // At least one runner never completed successfully.
        assert!(results.values().any(|r| r.is_err()));
    }
}
