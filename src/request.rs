//! The retry-driven request/response state machine. One call is in flight
//! per controller at a time; the caller (`controller::SshController::rqst`)
//! is responsible for holding the controller mutex for the call's duration
//! so that guarantee holds.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::warn;

use crate::error::Error;
use crate::frame::{encode_ack, encode_command, Frame};
use crate::transport::Transport;
use crate::{Request, ResponseBuffer, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Discard,
    AwaitControl,
    AwaitCommand,
}

#[derive(Debug, Clone, Copy)]
struct Expectation {
    expect_seq: u8,
    expect_rqid: u16,
}

enum IncomingRecord {
    Ack { seq: u8 },
    Command { seq: u8, payload: Vec<u8> },
}

struct ReceiverState {
    mode: Mode,
    expect: Expectation,
    record: Option<IncomingRecord>,
}

/// Owns the receiver-side expectation (what seq or rqid is currently
/// awaited) and drives the send/retry/response algorithm. Frames recognized
/// here never reach the event dispatcher, and vice versa; classification
/// happens before either is called.
pub struct RequestEngine {
    state: Mutex<ReceiverState>,
    signal: Condvar,
}

impl RequestEngine {
    pub fn new() -> Self {
        RequestEngine {
            state: Mutex::new(ReceiverState {
                mode: Mode::Discard,
                expect: Expectation {
                    expect_seq: 0,
                    expect_rqid: 0,
                },
                record: None,
            }),
            signal: Condvar::new(),
        }
    }

    /// Offers a decoded frame to the request engine. Returns `true` if the
    /// frame matched the current expectation and was consumed.
    pub fn feed_frame(&self, frame: &Frame) -> bool {
        let mut guard = self.state.lock().unwrap();
        let consumed = match (guard.mode, frame) {
            (Mode::AwaitControl, Frame::Ack { seq }) if *seq == guard.expect.expect_seq => {
                guard.record = Some(IncomingRecord::Ack { seq: *seq });
                true
            }
            (
                Mode::AwaitCommand,
                Frame::Command {
                    rqid, seq, payload, ..
                },
            ) if *rqid == guard.expect.expect_rqid => {
                guard.record = Some(IncomingRecord::Command {
                    seq: *seq,
                    payload: payload.clone(),
                });
                true
            }
            _ => false,
        };
        if consumed {
            drop(guard);
            self.signal.notify_one();
        }
        consumed
    }

    fn set_mode(&self, mode: Mode, expect: Expectation) {
        let mut guard = self.state.lock().unwrap();
        guard.mode = mode;
        guard.expect = expect;
        guard.record = None;
    }

    fn discard(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.mode = Mode::Discard;
        guard.record = None;
    }

    /// Waits up to `timeout` for a frame matching the current expectation.
    /// Does not clear a record that arrived before this call started: the
    /// slot already auto-clears on `take`, and resetting it here would race
    /// a frame that lands between the preceding write and this wait.
    fn wait(&self, timeout: Duration) -> Option<IncomingRecord> {
        let mut guard = self.state.lock().unwrap();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(rec) = guard.record.take() {
                return Some(rec);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (g, result) = self.signal.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
            if result.timed_out() {
                return guard.record.take();
            }
        }
    }

    /// Runs one complete `rqst` call: encode, retry-send until ACKed,
    /// optionally wait for and copy out a response, emit the final ACK.
    /// Leaves the receiver in `Discard` on every exit path. `on_ack` fires
    /// once the ACK lands, before the (possible) response wait, so the
    /// caller can advance its `seq`/`rqid` counters right away: per spec
    /// §8 those advance on ACK, not on the later response frame, so a
    /// timed-out response must not leave them stuck re-using a completed
    /// exchange's `seq`/`rqid`.
    pub fn rqst(
        &self,
        transport: &dyn Transport,
        seq: u8,
        wire_rqid: u16,
        request: &Request,
        response: Option<&mut ResponseBuffer>,
        on_ack: impl FnOnce(),
    ) -> Result<()> {
        if request.payload.len() > crate::MAX_PAYLOAD {
            return Err(Error::InvalidArgument("request payload too large"));
        }

        let encoded = encode_command(request, seq, wire_rqid);
        self.set_mode(
            Mode::AwaitControl,
            Expectation {
                expect_seq: seq,
                expect_rqid: wire_rqid,
            },
        );

        let outcome = self.run(transport, &encoded, seq, wire_rqid, request, response, on_ack);
        self.discard();
        outcome
    }

    fn run(
        &self,
        transport: &dyn Transport,
        encoded: &[u8],
        seq: u8,
        wire_rqid: u16,
        request: &Request,
        response: Option<&mut ResponseBuffer>,
        on_ack: impl FnOnce(),
    ) -> Result<()> {
        let mut acked = false;
        for attempt in 0..crate::NUM_RETRY {
            if let Err(e) = transport.write(encoded, crate::WRITE_TIMEOUT) {
                warn!(target: "ssh::request", "write failed on attempt {}: {}", attempt, e);
                continue;
            }
            match self.wait(crate::READ_TIMEOUT) {
                Some(IncomingRecord::Ack { .. }) => {
                    acked = true;
                    break;
                }
                _ => continue,
            }
        }

        if !acked {
            return Err(Error::IoFailed(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no ack within retry budget",
            )));
        }

        on_ack();

        if !request.has_response {
            return Ok(());
        }

        self.set_mode(
            Mode::AwaitCommand,
            Expectation {
                expect_seq: seq,
                expect_rqid: wire_rqid,
            },
        );

        match self.wait(crate::READ_TIMEOUT) {
            Some(IncomingRecord::Command {
                seq: resp_seq,
                payload,
            }) => {
                if let Some(buf) = response {
                    buf.fill(&payload)?;
                }
                let ack = encode_ack(resp_seq);
                transport.write(&ack, crate::WRITE_TIMEOUT)?;
                Ok(())
            }
            _ => Err(Error::IoFailed(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "response frame never arrived",
            ))),
        }
    }
}
