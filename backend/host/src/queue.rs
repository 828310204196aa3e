use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{
    unbounded,
    Receiver,
    Sender,
};
use log::error;
use parking_lot::{
    Condvar,
    Mutex,
};
use tensorstream_core::gpu::{
    CompletionHandler,
    Queue,
};

use super::command::{
    execute_copy,
    execute_dispatch,
    HostCommand,
};
use super::{
    HostBackend,
    HostCommandBuffer,
};

struct Work {
    command_buffer: HostCommandBuffer,
    completion: CompletionHandler,
}

struct IdleTracker {
    pending: Mutex<u64>,
    condvar: Condvar,
}

/// FIFO execution queue. A single worker thread replays command buffers in
/// submission order and fires each completion handler afterwards, which gives
/// the in-order completion guarantee the runtime's batch tracker relies on.
pub struct HostQueue {
    sender: ManuallyDrop<Sender<Work>>,
    idle: Arc<IdleTracker>,
    worker: Option<thread::JoinHandle<()>>,
}

impl HostQueue {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = unbounded::<Work>();
        let idle = Arc::new(IdleTracker {
            pending: Mutex::new(0),
            condvar: Condvar::new(),
        });
        let worker_idle = idle.clone();
        let worker = thread::Builder::new()
            .name("tensorstream-gpu".to_string())
            .spawn(move || worker_loop(receiver, worker_idle))
            .expect("failed to spawn executor thread");
        Self {
            sender: ManuallyDrop::new(sender),
            idle,
            worker: Some(worker),
        }
    }
}

fn worker_loop(receiver: Receiver<Work>, idle: Arc<IdleTracker>) {
    while let Ok(work) = receiver.recv() {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            for command in &work.command_buffer.commands {
                unsafe {
                    match command {
                        HostCommand::Dispatch(dispatch) => execute_dispatch(dispatch),
                        HostCommand::Copy(copy) => execute_copy(copy),
                    }
                }
            }
            (work.completion)();
        }));
        if result.is_err() {
            // A wedged executor cannot make progress; completion order would
            // be violated by continuing.
            error!("executor thread failed while replaying a command buffer");
            std::process::abort();
        }

        let mut pending = idle.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            idle.condvar.notify_all();
        }
    }
}

impl Queue<HostBackend> for HostQueue {
    unsafe fn submit(&self, command_buffer: HostCommandBuffer, completion: CompletionHandler) {
        {
            let mut pending = self.idle.pending.lock();
            *pending += 1;
        }
        self.sender
            .send(Work {
                command_buffer,
                completion,
            })
            .expect("executor thread is gone");
    }

    unsafe fn wait_for_idle(&self) {
        let mut pending = self.idle.pending.lock();
        while *pending != 0 {
            self.idle.condvar.wait(&mut pending);
        }
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        // Disconnect the channel so the worker drains and exits.
        unsafe {
            ManuallyDrop::drop(&mut self.sender);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
