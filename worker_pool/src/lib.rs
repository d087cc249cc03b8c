//! A process-wide pool of worker threads for data-parallel solver passes.
//!
//! The pool owns `n - 1` background workers; the thread calling
//! [`ThreadPool::execute`] participates as the n-th worker. Producers stage
//! tasks locally with [`ThreadPool::add_task`], then publish the whole batch
//! and block until the shared `tasks_left` counter drains to zero. Workers
//! park on a manual-reset gate while the queue is empty; whether the gate is
//! closed between batches is controlled by the [`ThreadModel`].

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use crossbeam_utils::Backoff;
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Exit,
}

/// How worker threads behave between batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadModel {
    /// The gate stays open after a batch; idle workers keep re-polling the
    /// queue. Lowest wake latency, occupies the cores.
    Persistent,
    /// The gate is closed at the end of each batch and workers block on it.
    #[default]
    Regular,
}

/// Manual-reset gate. While closed, waiting threads block on the condvar;
/// once signalled, every waiter passes through until the gate is reset.
struct Gate {
    open: Mutex<bool>,
    condvar: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self { open: Mutex::new(false), condvar: Condvar::new() }
    }

    fn signal(&self) {
        let mut open = self.open.lock().expect("gate mutex poisoned");
        *open = true;
        self.condvar.notify_all();
    }

    fn reset(&self) {
        let mut open = self.open.lock().expect("gate mutex poisoned");
        *open = false;
    }

    fn wait(&self) {
        let mut open = self.open.lock().expect("gate mutex poisoned");
        while !*open {
            open = self.condvar.wait(open).expect("gate mutex poisoned");
        }
    }
}

/// State shared with the worker threads.
struct Shared {
    tasks_left: AtomicUsize,
    gate: Gate,
}

struct PoolState {
    workers: Vec<JoinHandle<()>>,
    staging: Vec<Task>,
}

/// The worker pool. One instance exists per process, obtained with
/// [`ThreadPool::global`].
pub struct ThreadPool {
    state: Mutex<PoolState>,
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    shared: Arc<Shared>,
    persistent: AtomicBool,
}

static POOL: OnceLock<ThreadPool> = OnceLock::new();

impl ThreadPool {
    /// The process-wide pool, started on first use with one worker per
    /// available core.
    pub fn global() -> &'static ThreadPool {
        POOL.get_or_init(|| {
            let pool = ThreadPool::new();
            let threads = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            pool.change_thread_count(threads);
            pool
        })
    }

    fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            state: Mutex::new(PoolState { workers: Vec::new(), staging: Vec::new() }),
            sender,
            receiver,
            shared: Arc::new(Shared {
                tasks_left: AtomicUsize::new(0),
                gate: Gate::new(),
            }),
            persistent: AtomicBool::new(false),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.state.lock().expect("pool mutex poisoned").workers.len() + 1
    }

    pub fn set_model(&self, model: ThreadModel) {
        self.persistent
            .store(model == ThreadModel::Persistent, Ordering::Relaxed);
    }

    /// Replaces the worker set so that `threads` threads (including the
    /// caller) participate in future batches.
    ///
    /// Joins every existing worker, then spawns fresh ones; each new worker
    /// reports readiness through a one-shot handshake before this returns.
    /// Must not be called while another thread is inside
    /// [`execute`](Self::execute).
    pub fn change_thread_count(&self, threads: usize) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        let workers = threads.saturating_sub(1);

        for _ in 0..state.workers.len() {
            self.sender
                .send(Message::Exit)
                .expect("pool channel closed");
        }
        // wake parked workers so they can observe the exit request
        self.shared.gate.signal();
        for handle in state.workers.drain(..) {
            let _ = handle.join();
        }
        if !self.persistent.load(Ordering::Relaxed) {
            self.shared.gate.reset();
        }

        debug!("worker pool restarting with {} background workers", workers);
        for id in 0..workers {
            let receiver = self.receiver.clone();
            let shared = Arc::clone(&self.shared);
            let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<()>(1);
            let handle = std::thread::Builder::new()
                .name(format!("solver-worker-{id}"))
                .spawn(move || {
                    ready_tx.send(()).expect("pool handshake failed");
                    worker_loop(&shared, &receiver);
                })
                .expect("failed to spawn worker thread");
            ready_rx.recv().expect("pool handshake failed");
            state.workers.push(handle);
        }
    }

    /// Stages a task for the next [`execute`](Self::execute). Staged tasks
    /// are not visible to workers until the batch is published.
    pub fn add_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state
            .lock()
            .expect("pool mutex poisoned")
            .staging
            .push(Box::new(task));
    }

    /// Publishes the staged batch, opens the gate, and works the queue
    /// until every task of the batch has completed.
    pub fn execute(&self) {
        let staged: Vec<Task> = {
            let mut state = self.state.lock().expect("pool mutex poisoned");
            state.staging.drain(..).collect()
        };
        if staged.is_empty() {
            return;
        }

        self.shared
            .tasks_left
            .fetch_add(staged.len(), Ordering::SeqCst);
        for task in staged {
            self.sender
                .send(Message::Run(task))
                .expect("pool channel closed");
        }
        self.signal_wait();

        // participate until the queue is drained
        while let Ok(Message::Run(task)) = self.receiver.try_recv() {
            task();
            self.shared.tasks_left.fetch_sub(1, Ordering::SeqCst);
        }

        // tasks grabbed by workers may still be running; spin the tail out
        // rather than blocking, wake latency matters more here than the cpu
        let backoff = Backoff::new();
        while self.shared.tasks_left.load(Ordering::SeqCst) > 0 {
            backoff.snooze();
        }

        if !self.persistent.load(Ordering::Relaxed) {
            self.signal_reset();
        }
    }

    /// Opens the gate, releasing parked workers.
    pub fn signal_wait(&self) {
        self.shared.gate.signal();
    }

    /// Closes the gate; workers park on it once the queue is empty.
    pub fn signal_reset(&self) {
        self.shared.gate.reset();
    }
}

fn worker_loop(shared: &Shared, receiver: &Receiver<Message>) {
    loop {
        match receiver.try_recv() {
            Ok(Message::Run(task)) => {
                task();
                shared.tasks_left.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(Message::Exit) => break,
            Err(TryRecvError::Empty) => {
                // blocks only while the gate is closed; in persistent mode
                // this returns immediately and the worker re-polls
                shared.gate.wait();
                std::hint::spin_loop();
            }
            Err(TryRecvError::Disconnected) => break,
        }
    }
}
