//! Event dispatch and the handler registry.
//!
//! Inbound command frames whose `rqid` lies in the event range never reach
//! the request engine. Each one is ACKed on a single-worker queue (so ACK
//! order matches receive order) and dispatched to its registered handler
//! on a second, multi-worker queue, or inline, for handler classes that
//! opt into immediate dispatch.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, warn};

use crate::frame::encode_ack;
use crate::transport::Transport;
use crate::Event;

/// When a handler should run relative to ACK emission. Fixed per
/// registration rather than recomputed per event: the original's
/// `delay_fn` is consulted synchronously at dispatch time and can return a
/// different delay for the same `rqid` on different calls, which this enum
/// cannot express. Immediate-vs-queued dispatch is preserved; a
/// dynamically computed delay value is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Run synchronously on the receive path, before this call returns.
    /// Handlers registered this way must never call back into the request
    /// engine: the receive path does not hold the controller mutex free,
    /// and a reentrant `rqst` would deadlock against it.
    Immediate,
    /// Enqueue on the (possibly multi-worker) event queue.
    Queued,
}

pub type HandlerFn = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Clone)]
struct Slot {
    handler: HandlerFn,
    delay: Delay,
}

/// Per-`rqid` handler table, indexed `rqid - 1`. `remove` drains the event
/// queue before returning so that no invocation of the removed handler can
/// still be in flight afterward.
pub struct Registry {
    slots: Mutex<Vec<Option<Slot>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            slots: Mutex::new(vec![None; crate::NUM_EVENT_TYPES]),
        }
    }

    fn index(rqid: u16) -> Option<usize> {
        if crate::rqid_is_event(rqid) {
            Some(rqid as usize - 1)
        } else {
            None
        }
    }

    pub fn set(&self, rqid: u16, delay: Delay, handler: HandlerFn) -> crate::Result<()> {
        let idx = Self::index(rqid)
            .ok_or(crate::Error::InvalidArgument("rqid not in event range"))?;
        let mut slots = self.slots.lock().unwrap();
        slots[idx] = Some(Slot { handler, delay });
        Ok(())
    }

    /// Clears the slot, then waits for the event queue (owned by the
    /// caller's [`Dispatcher`]) to drain before returning, so no
    /// in-flight invocation of the removed handler survives this call.
    pub fn remove(&self, rqid: u16, dispatcher: &Dispatcher) -> crate::Result<()> {
        let idx = Self::index(rqid)
            .ok_or(crate::Error::InvalidArgument("rqid not in event range"))?;
        {
            let mut slots = self.slots.lock().unwrap();
            slots[idx] = None;
        }
        dispatcher.drain_event_queue();
        Ok(())
    }

    fn lookup(&self, rqid: u16) -> Option<Slot> {
        let idx = Self::index(rqid)?;
        self.slots.lock().unwrap()[idx].clone()
    }

    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap();
        for s in slots.iter_mut() {
            *s = None;
        }
    }
}

enum AckTask {
    Ack(u16 /* seq encoded as u16 to keep the channel type uniform; always 0..=255 */),
    Drain(Sender<()>),
}

enum EventTask {
    Run(Event),
    Drain(Sender<()>),
}

/// The two work queues: a strictly-ordered ack queue and
/// a (here, still single-worker, but independently schedulable) event
/// queue. `immediate` handlers bypass the event queue entirely.
pub struct Dispatcher {
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    ack_tx: Mutex<Option<Sender<AckTask>>>,
    evt_tx: Mutex<Option<Sender<EventTask>>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, transport: Arc<dyn Transport>) -> Arc<Self> {
        let this = Arc::new(Dispatcher {
            registry,
            transport,
            ack_tx: Mutex::new(None),
            evt_tx: Mutex::new(None),
        });
        this.start();
        this
    }

    fn start(self: &Arc<Self>) {
        let (ack_tx, ack_rx) = mpsc::channel::<AckTask>();
        let (evt_tx, evt_rx) = mpsc::channel::<EventTask>();

        *self.ack_tx.lock().unwrap() = Some(ack_tx);
        *self.evt_tx.lock().unwrap() = Some(evt_tx);

        let transport = self.transport.clone();
        thread::Builder::new()
            .name("ssh-ec-ack".into())
            .spawn(move || {
                for task in ack_rx {
                    match task {
                        AckTask::Ack(seq) => {
                            let frame = encode_ack(seq as u8);
                            if let Err(e) = transport.write(&frame, crate::WRITE_TIMEOUT) {
                                warn!(target: "ssh::events", "failed to ack event: {}", e);
                            }
                        }
                        AckTask::Drain(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
            .expect("failed to spawn ack worker");

        let registry = self.registry.clone();
        thread::Builder::new()
            .name("ssh-ec-event".into())
            .spawn(move || {
                for task in evt_rx {
                    match task {
                        EventTask::Run(event) => Self::invoke(&registry, &event),
                        EventTask::Drain(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
            .expect("failed to spawn event worker");
    }

    fn invoke(registry: &Registry, event: &Event) {
        match registry.lookup(event.rqid) {
            Some(slot) => (slot.handler)(event),
            None => warn!(target: "ssh::events", "unhandled event (rqid: {:#06x})", event.rqid),
        }
    }

    /// Entry point from the receive path. `initialized`
    /// reflects the controller's current state at enqueue time: the ack
    /// queue only emits while it is still `Initialized`.
    pub fn on_event_frame(&self, seq: u8, event: Event, initialized: bool) {
        debug!(target: "ssh::events", "dispatching event rqid={:#06x}", event.rqid);

        if initialized {
            if let Some(tx) = self.ack_tx.lock().unwrap().as_ref() {
                let _ = tx.send(AckTask::Ack(seq as u16));
            }
        }

        let delay = self
            .registry
            .lookup(event.rqid)
            .map(|s| s.delay)
            .unwrap_or(Delay::Queued);

        match delay {
            Delay::Immediate => Self::invoke(&self.registry, &event),
            Delay::Queued => {
                if let Some(tx) = self.evt_tx.lock().unwrap().as_ref() {
                    let _ = tx.send(EventTask::Run(event));
                }
            }
        }
    }

    /// Blocks until every task enqueued on the ack queue before this call
    /// has been processed.
    pub fn drain_ack_queue(&self) {
        let (tx, rx) = mpsc::channel();
        if let Some(sender) = self.ack_tx.lock().unwrap().as_ref() {
            let _ = sender.send(AckTask::Drain(tx));
            let _ = rx.recv();
        }
    }

    /// Blocks until every task enqueued on the event queue before this call
    /// has been processed. Used both at teardown and by
    /// [`Registry::remove`]'s post-removal drain barrier.
    pub fn drain_event_queue(&self) {
        let (tx, rx) = mpsc::channel();
        if let Some(sender) = self.evt_tx.lock().unwrap().as_ref() {
            let _ = sender.send(EventTask::Drain(tx));
            let _ = rx.recv();
        }
    }

    /// Tears down both worker threads by dropping their senders; called
    /// during controller teardown after the double-drain.
    pub fn shutdown(&self) {
        *self.ack_tx.lock().unwrap() = None;
        *self.evt_tx.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct RecordingTransport {
        written: StdMutex<Vec<Vec<u8>>>,
    }

    impl Transport for RecordingTransport {
        fn open(&self) -> std::io::Result<()> {
            Ok(())
        }
        fn close(&self) -> std::io::Result<()> {
            Ok(())
        }
        fn write(&self, buf: &[u8], _timeout: Duration) -> std::io::Result<()> {
            self.written.lock().unwrap().push(buf.to_vec());
            Ok(())
        }
        fn configure(&self, _cfg: crate::transport::UartConfig) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sample_event(rqid: u16) -> Event {
        Event {
            rqid,
            tc: 0x08,
            iid: 0,
            cid: 0x02,
            payload: vec![1, 2],
        }
    }

    #[test]
    fn unhandled_event_still_acks() {
        let transport = Arc::new(RecordingTransport {
            written: StdMutex::new(Vec::new()),
        });
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(registry, transport.clone());

        dispatcher.on_event_frame(0x05, sample_event(3), true);
        dispatcher.drain_ack_queue();

        assert_eq!(transport.written.lock().unwrap().len(), 1);
    }

    #[test]
    fn no_ack_while_not_initialized() {
        let transport = Arc::new(RecordingTransport {
            written: StdMutex::new(Vec::new()),
        });
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(registry, transport.clone());

        dispatcher.on_event_frame(0x05, sample_event(3), false);
        dispatcher.drain_ack_queue();

        assert!(transport.written.lock().unwrap().is_empty());
    }

    #[test]
    fn registered_handler_is_invoked() {
        let transport = Arc::new(RecordingTransport {
            written: StdMutex::new(Vec::new()),
        });
        let registry = Arc::new(Registry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        registry
            .set(
                3,
                Delay::Queued,
                Arc::new(move |_e: &Event| {
                    calls2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let dispatcher = Dispatcher::new(registry, transport);
        dispatcher.on_event_frame(0x01, sample_event(3), true);
        dispatcher.drain_event_queue();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_handler_never_runs_after_remove_returns() {
        let transport = Arc::new(RecordingTransport {
            written: StdMutex::new(Vec::new()),
        });
        let registry = Arc::new(Registry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        registry
            .set(3, Delay::Queued, Arc::new(move |_e: &Event| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        let dispatcher = Dispatcher::new(registry.clone(), transport);
        registry.remove(3, &dispatcher).unwrap();
        dispatcher.on_event_frame(0x01, sample_event(3), true);
        dispatcher.drain_event_queue();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn set_rejects_non_event_rqid() {
        let registry = Registry::new();
        let result = registry.set(1 << crate::EVENT_BITS, Delay::Queued, Arc::new(|_: &Event| {}));
        assert!(result.is_err());
    }
}
