//! Parallel loading of the modules a resolution run asks for.
//!
//! A fixed pool of workers pulls load jobs from a channel for as long as the graph builder runs.
//! The builder hands over the unseen dependencies of the node it is expanding as one batch and
//! waits for the whole batch; every name is dispatched at most once, the first request wins. The
//! builder still decides which modules to load and in which order it attaches them, so the graph
//! and the set of loaded modules do not depend on the number of workers or on scheduling.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::common::LookupError;
use crate::module::{canonical_key, ModuleInspector, ResolvedModule};
use crate::progress::ProgressSink;
use crate::resolver::ModuleSource;

enum Slot {
    InProgress,
    Resolved(Arc<ResolvedModule>),
}

#[derive(Default)]
struct State {
    slots: HashMap<String, Slot>,
    dispatched: usize,
    finished: usize,
}

struct Job {
    key: String,
    name: String,
}

enum Message {
    Resolve(Job),
    Stop,
}

/// Sends one `Stop` per worker when dropped, also when the builder unwinds
struct StopWorkers<'s> {
    sender: &'s Sender<Message>,
    workers: usize,
}

impl Drop for StopWorkers<'_> {
    fn drop(&mut self) {
        for _ in 0..self.workers {
            // the receiving end is owned by the coordinator, sending cannot fail
            let _ = self.sender.send(Message::Stop);
        }
    }
}

/// Loads batches of modules with a bounded number of worker threads
pub struct Coordinator<'c, 'a> {
    inspector: &'c ModuleInspector<'a>,
    progress: &'c dyn ProgressSink,
    workers: usize,
    state: Mutex<State>,
    done: Condvar,
    sender: Sender<Message>,
    receiver: Receiver<Message>,
}

impl<'c, 'a> Coordinator<'c, 'a> {
    pub fn new(inspector: &'c ModuleInspector<'a>, progress: &'c dyn ProgressSink, workers: usize) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            inspector,
            progress,
            workers: workers.max(1),
            state: Mutex::new(State::default()),
            done: Condvar::new(),
            sender,
            receiver,
        }
    }

    /// Start the workers, run `build` on the calling thread with the coordinator as its module
    /// source, then stop the workers
    pub fn run<T, F>(&self, build: F) -> Result<T, LookupError>
    where
        F: FnOnce(&dyn ModuleSource) -> T,
    {
        let result = crossbeam::scope(|scope| {
            for _ in 0..self.workers {
                scope.spawn(move |_| self.work());
            }
            let _stop = StopWorkers {
                sender: &self.sender,
                workers: self.workers,
            };
            build(self)
        })
        .map_err(|_| LookupError::ScanError("a resolution worker panicked".to_owned()))?;

        let state = self.lock();
        tracing::debug!(
            loads = state.dispatched,
            workers = self.workers,
            "parallel resolution complete"
        );
        Ok(result)
    }

    /// Must be called with the state lock held, so that insertion and dispatch count stay in step
    fn request(&self, state: &mut State, name: &str) {
        let key = canonical_key(name);
        if state.slots.contains_key(&key) {
            return;
        }
        state.slots.insert(key.clone(), Slot::InProgress);
        state.dispatched += 1;
        let _ = self.sender.send(Message::Resolve(Job {
            key,
            name: name.to_owned(),
        }));
    }

    fn work(&self) {
        while let Ok(Message::Resolve(job)) = self.receiver.recv() {
            self.progress.report("Resolving", &job.name);
            let module = catch_unwind(AssertUnwindSafe(|| self.inspector.inspect(&job.name)))
                .unwrap_or_else(|_| {
                    tracing::error!(module = job.name.as_str(), "inspection panicked");
                    ResolvedModule::unresolved(&job.name, "module inspection panicked".to_owned())
                });
            self.complete(job, Arc::new(module));
        }
    }

    fn complete(&self, job: Job, module: Arc<ResolvedModule>) {
        let mut state = self.lock();
        state.slots.insert(job.key, Slot::Resolved(module));
        state.finished += 1;
        if state.finished == state.dispatched {
            self.done.notify_all();
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ModuleSource for Coordinator<'_, '_> {
    fn fetch(&self, name: &str) -> Arc<ResolvedModule> {
        self.fetch_all(&[name])
            .pop()
            .unwrap_or_else(|| Arc::new(self.inspector.inspect(name)))
    }

    fn fetch_all(&self, names: &[&str]) -> Vec<Arc<ResolvedModule>> {
        let mut state = self.lock();
        for name in names {
            self.request(&mut state, name);
        }
        while state.finished < state.dispatched {
            state = self.done.wait(state).unwrap_or_else(PoisonError::into_inner);
        }

        names
            .iter()
            .map(|name| match state.slots.get(&canonical_key(name)) {
                Some(Slot::Resolved(module)) => Arc::clone(module),
                _ => {
                    tracing::debug!(module = *name, "no worker result, loading inline");
                    Arc::new(self.inspector.inspect(name))
                }
            })
            .collect()
    }
}
