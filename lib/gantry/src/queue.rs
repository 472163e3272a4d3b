//! The two FIFOs that connect the reactor and worker threads. Entries carry
//! either a package reference or a deferred task; tasks own their captures by
//! value, so nothing on the submitting thread's stack can leak across.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::reactor::Reactor;
use crate::worker::WorkerCtx;
use crate::{ConnId, PackageId, ServiceId};

const DEFAULT_CAPACITY: usize = 4096;
const PUSH_RETRIES: usize = 3;
const PUSH_RETRY_SLEEP: Duration = Duration::from_millis(1);

/// A package handed from one thread to the other, addressed by connection or
/// by symbolic service.
#[derive(Debug, Clone, Copy)]
pub struct NetworkMsg {
    pub conn_id: ConnId,
    pub service_id: ServiceId,
    pub package_id: PackageId,
}

/// Deferred closure executed on the receiving thread, tagged for logging.
pub struct DeferredTask<F> {
    pub caller: &'static str,
    pub action: F,
}

pub type ReactorTask = Box<dyn FnOnce(&mut Reactor) + Send>;
pub type WorkerTask = Box<dyn FnOnce(&mut WorkerCtx<'_>) + Send>;

/// Entry bound for the worker thread.
pub enum InboundEntry {
    Network(NetworkMsg),
    Task(DeferredTask<WorkerTask>),
}

/// Entry bound for the reactor thread.
pub enum OutboundEntry {
    Network(NetworkMsg),
    Task(DeferredTask<ReactorTask>),
}

/// Bounded mutex-guarded FIFO.
pub struct MessageQueue<T> {
    capacity: usize,
    inner: Mutex<VecDeque<T>>,
}

impl<T> MessageQueue<T> {
    pub fn new(capacity: usize) -> MessageQueue<T> {
        MessageQueue {
            capacity,
            inner: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().expect("message queue lock poisoned")
    }

    /// Appends an entry, blocking briefly when the queue is full before
    /// failing the operation.
    pub fn push(&self, entry: T) -> Result<()> {
        for attempt in 0.. {
            {
                let mut queue = self.lock();
                if queue.len() < self.capacity {
                    queue.push_back(entry);
                    return Ok(());
                }
            }

            if attempt == PUSH_RETRIES {
                break;
            }
            thread::sleep(PUSH_RETRY_SLEEP);
        }

        Err(Error::QueueFull)
    }

    pub fn pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }
}

/// The inbound/outbound pair shared by the two threads.
pub struct MessageQueues {
    pub inbound: MessageQueue<InboundEntry>,
    pub outbound: MessageQueue<OutboundEntry>,
}

impl MessageQueues {
    pub fn new() -> MessageQueues {
        MessageQueues {
            inbound: MessageQueue::new(DEFAULT_CAPACITY),
            outbound: MessageQueue::new(DEFAULT_CAPACITY),
        }
    }
}
