use std::cell::Cell;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use log::{debug, error};

use crate::event_loop::{EventLoop, LoopHandle};

/// Per-loop setup hook, run on each worker thread before its loop starts
/// (and once on the base loop when there are no workers).
pub type ThreadInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;

/// A thread running one event loop. Joined, after asking the loop to
/// quit, on drop.
pub struct EventLoopThread {
    name: String,
    handle: Option<LoopHandle>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new(name: &str) -> EventLoopThread {
        EventLoopThread {
            name: name.to_string(),
            handle: None,
            thread: None,
        }
    }

    /// Spawn the thread and hand back the loop's handle. Returns only
    /// after the worker has its loop up, so the handle is immediately
    /// usable.
    pub fn start_loop(&mut self, init: Option<ThreadInitCallback>) -> LoopHandle {
        assert!(self.thread.is_none(), "loop thread already started");
        let (tx, rx) = mpsc::channel();
        let name = self.name.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut event_loop = match EventLoop::new() {
                    Ok(event_loop) => event_loop,
                    Err(e) => {
                        error!("loop thread {}: creating EventLoop: {}", name, e);
                        panic!("failed to create EventLoop: {}", e);
                    }
                };
                let handle = event_loop.handle();
                if let Some(init) = init {
                    init(&handle);
                }
                let _ = tx.send(handle);
                event_loop.run();
                debug!("loop thread {} exiting", name);
            })
            .expect("failed to spawn loop thread");

        let handle = match rx.recv() {
            Ok(handle) => handle,
            Err(_) => panic!("loop thread died during startup"),
        };
        self.thread = Some(thread);
        self.handle = Some(handle.clone());
        handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// N worker loops behind one base loop.
///
/// With `thread_num == 0` everything runs on the base loop. The getters
/// must be called on the base loop thread; assignment is round-robin, with
/// a hash-stable variant for affinity.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    started: bool,
    thread_num: usize,
    next: Cell<usize>,
    threads: Vec<EventLoopThread>,
    handles: Vec<LoopHandle>,
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle, name: &str) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.to_string(),
            started: false,
            thread_num: 0,
            next: Cell::new(0),
            threads: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// Intended worker count; call before [`start`](Self::start).
    pub fn set_thread_num(&mut self, thread_num: usize) {
        assert!(!self.started);
        self.thread_num = thread_num;
    }

    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        assert!(!self.started);
        assert!(self.base.is_in_loop_thread());
        self.started = true;

        for i in 0..self.thread_num {
            let mut thread = EventLoopThread::new(&format!("{}-io-{}", self.name, i));
            self.handles.push(thread.start_loop(init.clone()));
            self.threads.push(thread);
        }
        if self.thread_num == 0 {
            if let Some(init) = init {
                init(&self.base);
            }
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Round-robin pick of a worker loop; the base loop when there are no
    /// workers. Base-loop thread only.
    pub fn get_next_loop(&self) -> LoopHandle {
        assert!(self.base.is_in_loop_thread());
        assert!(self.started);
        if self.handles.is_empty() {
            return self.base.clone();
        }
        let next = self.next.get();
        let handle = self.handles[next].clone();
        self.next.set((next + 1) % self.handles.len());
        handle
    }

    /// Hash-stable pick: the same `hash` always lands on the same loop.
    pub fn get_loop_for_hash(&self, hash: usize) -> LoopHandle {
        assert!(self.base.is_in_loop_thread());
        if self.handles.is_empty() {
            self.base.clone()
        } else {
            self.handles[hash % self.handles.len()].clone()
        }
    }

    pub fn get_all_loops(&self) -> Vec<LoopHandle> {
        assert!(self.base.is_in_loop_thread());
        assert!(self.started);
        if self.handles.is_empty() {
            vec![self.base.clone()]
        } else {
            self.handles.clone()
        }
    }
}
