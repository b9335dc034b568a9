use crate::packet::Packet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// FIFO of packets owned by one side of a session's pipeline.
#[derive(Default)]
pub(crate) struct PacketQueue {
    packets: Mutex<VecDeque<Packet>>,
}

impl PacketQueue {
    pub(crate) fn push(&self, packet: Packet) {
        self.packets
            .lock()
            .expect("PacketQueue.push() mutex guard poison")
            .push_back(packet);
    }

    pub(crate) fn pop(&self) -> Option<Packet> {
        self.packets
            .lock()
            .expect("PacketQueue.pop() mutex guard poison")
            .pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.packets
            .lock()
            .expect("PacketQueue.is_empty() mutex guard poison")
            .is_empty()
    }
}

/// Count of packets queued or being processed on one side. Only flush waits on it.
#[derive(Default)]
pub(crate) struct InflightCounter {
    count: AtomicUsize,
    zero: Notify,
}

impl InflightCounter {
    pub(crate) fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::SeqCst);
    }

    pub(crate) fn sub(&self, n: usize) {
        if n == 0 {
            return;
        }
        let previous = self.count.fetch_sub(n, Ordering::SeqCst);
        assert!(previous >= n, "in-flight counter underflow");
        if previous == n {
            self.zero.notify_waiters();
        }
    }

    pub(crate) fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_until_zero(&self) {
        loop {
            // Register before checking so a concurrent drop to zero can't be missed.
            let notified = self.zero.notified();
            if self.get() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Guarantees at most one scheduled drain task per queue.
#[derive(Default)]
pub(crate) struct DrainSlot {
    scheduled: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DrainSlot {
    /// Runs `spawn` only if no drain is currently scheduled.
    pub(crate) fn schedule<F>(&self, spawn: F)
    where
        F: FnOnce() -> JoinHandle<()>,
    {
        let mut handle = self.handle.lock().expect("DrainSlot.schedule() mutex guard poison");
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        *handle = Some(spawn());
    }

    /// Called by the drain task when its queue looked empty. Returns true if the task should
    /// keep draining because the slot was re-claimed for work that raced in.
    pub(crate) fn finish(&self, queue: &PacketQueue) -> bool {
        self.scheduled.store(false, Ordering::SeqCst);
        !queue.is_empty() && !self.scheduled.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn abort(&self) {
        if let Some(handle) = self.handle.lock().expect("DrainSlot.abort() mutex guard poison").take() {
            handle.abort();
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Normal,
    Recovering,
    Errored,
}

pub(crate) struct StateCell {
    state: AtomicU8,
}

const NORMAL: u8 = 0;
const RECOVERING: u8 = 1;
const ERRORED: u8 = 2;

impl StateCell {
    pub(crate) fn new() -> Self {
        StateCell {
            state: AtomicU8::new(NORMAL),
        }
    }

    pub(crate) fn get(&self) -> SessionState {
        match self.state.load(Ordering::SeqCst) {
            NORMAL => SessionState::Normal,
            RECOVERING => SessionState::Recovering,
            _ => SessionState::Errored,
        }
    }

    /// Errored is terminal, so only a normal session can start recovering.
    pub(crate) fn mark_recovering(&self) {
        let _ = self
            .state
            .compare_exchange(NORMAL, RECOVERING, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub(crate) fn mark_errored(&self) {
        self.state.store(ERRORED, Ordering::SeqCst);
    }
}
