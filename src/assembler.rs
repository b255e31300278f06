//! Receive assembler: accumulates inbound bytes into a bounded
//! evaluation buffer and repeatedly attempts to decode one complete frame
//! at a time, discarding on framing errors and resynchronizing on the next
//! SYN.

use log::{debug, warn};

use crate::frame::{decode, Decoded, Frame};

pub struct Assembler {
    buf: Vec<u8>,
    cap: usize,
}

impl Assembler {
    pub fn new(cap: usize) -> Self {
        Assembler {
            buf: Vec::with_capacity(cap),
            cap,
        }
    }

    /// Appends as much of `chunk` as fits, then decodes everything it can
    /// out of the buffer, invoking `on_frame` for each decoded frame.
    /// Returns the number of bytes accepted from `chunk` (for transport
    /// backpressure).
    pub fn feed(&mut self, chunk: &[u8], mut on_frame: impl FnMut(Frame)) -> usize {
        let remaining = self.cap.saturating_sub(self.buf.len());
        let used = remaining.min(chunk.len());
        self.buf.extend_from_slice(&chunk[..used]);

        let mut offs = 0;
        while offs < self.buf.len() {
            match decode(&self.buf[offs..]) {
                Decoded::Need => break,
                Decoded::Drop(k) => {
                    warn!(target: "ssh::assembler", "discarding {} byte(s): framing error", k);
                    offs += k;
                }
                Decoded::Frame(k, frame) => {
                    debug!(target: "ssh::assembler", "decoded frame, {} byte(s) consumed", k);
                    on_frame(frame);
                    offs += k;
                }
            }
        }
        self.buf.drain(0..offs);
        used
    }
}
