use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Error returned when submitting work to a pool that has been shut down.
#[derive(Debug, Eq, PartialEq)]
pub struct PoolClosed;

struct Queue {
    tasks: VecDeque<Task>,
    stop: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    ready: Condvar,
}

/// Fixed set of worker threads draining a FIFO task queue. The queue mutex
/// is released before a task runs, so tasks may block freely.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` workers.
    pub fn new(size: usize) -> WorkerPool {
        if size == 0 {
            panic!("Worker pool requires at least one thread");
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                stop: false,
            }),
            ready: Condvar::new(),
        });

        let workers = (0..size)
            .map(|index| {
                let shared = shared.clone();

                thread::Builder::new()
                    .name(format!("worker-{}", index))
                    .spawn(move || Self::run_worker(&shared))
                    .expect("Error spawning pool worker")
            })
            .collect();

        WorkerPool { shared, workers }
    }

    /// Appends a task to the queue and wakes one worker.
    pub fn enqueue<F: FnOnce() + Send + 'static>(&self, task: F) -> Result<(), PoolClosed> {
        {
            let mut queue = self.shared.queue.lock().expect("Pool queue poisoned");

            if queue.stop {
                return Err(PoolClosed);
            }

            queue.tasks.push_back(Box::new(task));
        }

        self.shared.ready.notify_one();
        Ok(())
    }

    /// Stops accepting tasks and wakes every worker. Queued tasks still run;
    /// workers exit once the queue is drained.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock().expect("Pool queue poisoned");
            queue.stop = true;
        }

        self.shared.ready.notify_all();
    }

    fn run_worker(shared: &Shared) {
        loop {
            let task = {
                let mut queue = shared.queue.lock().expect("Pool queue poisoned");

                loop {
                    if let Some(task) = queue.tasks.pop_front() {
                        break task;
                    }

                    if queue.stop {
                        return;
                    }

                    queue = shared.ready.wait(queue).expect("Pool queue poisoned");
                }
            };

            task();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();

        for worker in self.workers.drain(..) {
            drop(worker.join());
        }
    }
}
