//! Wire framing for the SSH link.
//!
//! ```text
//! MSG        := SYN FRAME CRC16 [TAIL]
//! SYN        := 0xAA 0x55
//! TAIL       := 0xFF 0xFF        ; present on ACK/RETRY
//! CtrlFrame  := type len pad seq        ; 4 bytes
//! CmdFrame   := 0x80 tc 0x01 0x00 iid rqid_lo rqid_hi cid PAYLOAD
//! ```
//!
//! CRCs are CCITT-FALSE, seed `0xffff`, and each one covers the frame body
//! starting immediately after the SYN or the previous CRC, up to but
//! excluding its own two bytes.

use crate::crc::crc16;
use crate::Request;

pub const SYN: [u8; 2] = [0xaa, 0x55];
pub const TAIL: [u8; 2] = [0xff, 0xff];

pub const FRAME_TYPE_CMD: u8 = 0x80;
pub const FRAME_TYPE_ACK: u8 = 0x40;
pub const FRAME_TYPE_RETRY: u8 = 0x04;

const LEN_SYNC: usize = 2;
const LEN_CTRL: usize = 4;
const LEN_CRC: usize = 2;
const LEN_TERM: usize = 2;
const LEN_CMDFRAME: usize = 8; // without payload

const OFFS_CTRL: usize = LEN_SYNC;
const OFFS_CTRL_CRC: usize = OFFS_CTRL + LEN_CTRL;
const OFFS_TERM: usize = OFFS_CTRL_CRC + LEN_CRC;
const OFFS_CMD: usize = OFFS_TERM; // either TAIL or CmdFrame starts here
const OFFS_CMD_PLD: usize = OFFS_CMD + LEN_CMDFRAME;

const MSG_LEN_CTRL: usize = LEN_SYNC + LEN_CTRL + LEN_CRC + LEN_TERM;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Command {
        seq: u8,
        rqid: u16,
        tc: u8,
        iid: u8,
        cid: u8,
        payload: Vec<u8>,
    },
    Ack {
        seq: u8,
    },
    Retry,
}

/// Result of attempting to decode a prefix of the evaluation buffer.
pub enum Decoded {
    /// Not enough bytes buffered yet; no bytes were consumed.
    Need,
    /// `usize` bytes should be discarded: framing was invalid or the
    /// message was not one we could use.
    Drop(usize),
    /// A full frame was decoded, consuming `usize` bytes.
    Frame(usize, Frame),
}

fn write_u16_le(out: &mut Vec<u8>, v: u16) {
    out.push((v & 0xff) as u8);
    out.push((v >> 8) as u8);
}

/// Encodes an outbound command frame using the given `seq`/`rqid` counters.
/// `rqid` here is already the raw counter value; the wire field is
/// `rqid << EVENT_BITS` per [`crate::rqid_to_wire`].
pub fn encode_command(request: &Request, seq: u8, wire_rqid: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        LEN_SYNC + LEN_CTRL + LEN_CRC + LEN_CMDFRAME + request.payload.len() + LEN_CRC,
    );
    out.extend_from_slice(&SYN);

    let ctrl_start = out.len();
    out.push(FRAME_TYPE_CMD);
    out.push((LEN_CMDFRAME + request.payload.len()) as u8);
    out.push(0x00);
    out.push(seq);
    let ctrl_crc = crc16(&out[ctrl_start..]);
    write_u16_le(&mut out, ctrl_crc);

    let cmd_start = out.len();
    out.push(FRAME_TYPE_CMD);
    out.push(request.tc);
    out.push(0x01);
    out.push(0x00);
    out.push(request.iid);
    out.push((wire_rqid & 0xff) as u8);
    out.push((wire_rqid >> 8) as u8);
    out.push(request.cid);
    out.extend_from_slice(&request.payload);
    let cmd_crc = crc16(&out[cmd_start..]);
    write_u16_le(&mut out, cmd_crc);

    out
}

/// Encodes a fixed-length ACK frame.
pub fn encode_ack(seq: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(MSG_LEN_CTRL);
    out.extend_from_slice(&SYN);
    let ctrl_start = out.len();
    out.push(FRAME_TYPE_ACK);
    out.push(0x00);
    out.push(0x00);
    out.push(seq);
    let crc = crc16(&out[ctrl_start..]);
    write_u16_le(&mut out, crc);
    out.extend_from_slice(&TAIL);
    out
}

fn crc_ok(body: &[u8], crc_bytes: &[u8]) -> bool {
    let crc = crc16(body);
    crc_bytes.len() == 2 && crc_bytes[0] == (crc & 0xff) as u8 && crc_bytes[1] == (crc >> 8) as u8
}

/// Scans `buf[1..]` for the next occurrence of `SYN`, so a garbage prefix
/// can be dropped without discarding a well-formed frame that follows it
/// in the same buffer. Returns `buf.len()` if `SYN` does not reappear.
fn resync_point(buf: &[u8]) -> usize {
    for i in 1..=buf.len() - LEN_SYNC {
        if buf[i..i + LEN_SYNC] == SYN {
            return i;
        }
    }
    buf.len()
}

/// Attempts to decode one frame from the front of `buf`.
pub fn decode(buf: &[u8]) -> Decoded {
    if buf.len() < LEN_SYNC + LEN_CTRL {
        return Decoded::Need;
    }
    if buf[0..LEN_SYNC] != SYN {
        return Decoded::Drop(resync_point(buf));
    }

    let ctrl = &buf[OFFS_CTRL..OFFS_CTRL_CRC];
    let frame_type = ctrl[0];
    let ctrl_len = ctrl[1];
    let seq = ctrl[3];

    match frame_type {
        FRAME_TYPE_ACK | FRAME_TYPE_RETRY => {
            if buf.len() < MSG_LEN_CTRL {
                return Decoded::Need;
            }
            if !crc_ok(ctrl, &buf[OFFS_CTRL_CRC..OFFS_TERM]) {
                // Cannot trust anything past this point without a valid CRC.
                return Decoded::Drop(buf.len());
            }
            if buf[OFFS_TERM..OFFS_TERM + LEN_TERM] != TAIL {
                return Decoded::Drop(buf.len());
            }
            let frame = if frame_type == FRAME_TYPE_ACK {
                Frame::Ack { seq }
            } else {
                Frame::Retry
            };
            Decoded::Frame(MSG_LEN_CTRL, frame)
        }
        FRAME_TYPE_CMD => {
            if !crc_ok(ctrl, &buf[OFFS_CTRL_CRC..OFFS_TERM]) {
                return Decoded::Drop(buf.len());
            }
            let msg_len = LEN_SYNC + LEN_CTRL + LEN_CRC + ctrl_len as usize + LEN_CRC;
            if buf.len() < msg_len {
                return Decoded::Need;
            }

            let cmd_begin = OFFS_CMD;
            let cmd_end = cmd_begin + ctrl_len as usize;
            let cmd = &buf[cmd_begin..cmd_end];

            if cmd[0] != FRAME_TYPE_CMD {
                return Decoded::Drop(buf.len());
            }

            let cmd_crc_bytes = &buf[cmd_end..cmd_end + LEN_CRC];
            if !crc_ok(cmd, cmd_crc_bytes) {
                return Decoded::Drop(msg_len);
            }

            let tc = cmd[1];
            let iid = cmd[4];
            let rqid = (cmd[5] as u16) | ((cmd[6] as u16) << 8);
            let cid = cmd[7];
            let payload = buf[OFFS_CMD_PLD..cmd_end].to_vec();

            Decoded::Frame(
                msg_len,
                Frame::Command {
                    seq,
                    rqid,
                    tc,
                    iid,
                    cid,
                    payload,
                },
            )
        }
        _ => Decoded::Drop(buf.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Request {
        Request {
            tc: 0x01,
            iid: 0x00,
            cid: 0x16,
            has_response: false,
            payload: Vec::new(),
        }
    }

    #[test]
    fn roundtrip_zero_payload() {
        let req = sample_request();
        let encoded = encode_command(&req, 0x00, crate::rqid_to_wire(1));
        match decode(&encoded) {
            Decoded::Frame(consumed, Frame::Command { seq, rqid, tc, iid, cid, payload }) => {
                assert_eq!(consumed, encoded.len());
                assert_eq!(seq, 0x00);
                assert_eq!(rqid, crate::rqid_to_wire(1));
                assert_eq!(tc, req.tc);
                assert_eq!(iid, req.iid);
                assert_eq!(cid, req.cid);
                assert!(payload.is_empty());
            }
            other => panic!("expected Command frame, got something else: {:?}", matches_kind(&other)),
        }
    }

    #[test]
    fn roundtrip_with_payload() {
        let req = Request {
            tc: 0x02,
            iid: 0x03,
            cid: 0x04,
            has_response: true,
            payload: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let encoded = encode_command(&req, 0x07, crate::rqid_to_wire(9));
        match decode(&encoded) {
            Decoded::Frame(consumed, Frame::Command { payload, .. }) => {
                assert_eq!(consumed, encoded.len());
                assert_eq!(payload, req.payload);
            }
            _ => panic!("expected Command frame"),
        }
    }

    #[test]
    fn ack_roundtrip() {
        let encoded = encode_ack(0x42);
        match decode(&encoded) {
            Decoded::Frame(consumed, Frame::Ack { seq }) => {
                assert_eq!(consumed, encoded.len());
                assert_eq!(seq, 0x42);
            }
            _ => panic!("expected Ack frame"),
        }
    }

    #[test]
    fn bit_flip_causes_drop_not_frame() {
        let req = sample_request();
        let encoded = encode_command(&req, 0x00, crate::rqid_to_wire(1));
        for i in 0..encoded.len() {
            for bit in 0..8u8 {
                let mut corrupt = encoded.clone();
                corrupt[i] ^= 1 << bit;
                match decode(&corrupt) {
                    Decoded::Frame(_, _) => {
                        panic!("bit flip at byte {} bit {} was not rejected", i, bit)
                    }
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn short_buffer_needs_more() {
        assert!(matches!(decode(&[0xaa]), Decoded::Need));
        assert!(matches!(decode(&SYN), Decoded::Need));
    }

    #[test]
    fn bad_syn_drops_everything() {
        let buf = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05];
        match decode(&buf) {
            Decoded::Drop(n) => assert_eq!(n, buf.len()),
            _ => panic!("expected Drop"),
        }
    }

    #[test]
    fn garbage_prefix_resyncs_to_next_syn_without_eating_it() {
        let ack = encode_ack(0x05);
        let mut buf = vec![0x00, 0x01, 0x02, 0x03];
        buf.extend_from_slice(&ack);
        match decode(&buf) {
            Decoded::Drop(n) => assert_eq!(n, 4),
            other => panic!("expected Drop(4), got {:?}", matches_kind(&other)),
        }
        // Decoding again from the resync point recovers the trailing frame.
        match decode(&buf[4..]) {
            Decoded::Frame(consumed, Frame::Ack { seq }) => {
                assert_eq!(consumed, ack.len());
                assert_eq!(seq, 0x05);
            }
            _ => panic!("expected Ack frame after resync"),
        }
    }

    fn matches_kind(d: &Decoded) -> &'static str {
        match d {
            Decoded::Need => "Need",
            Decoded::Drop(_) => "Drop",
            Decoded::Frame(_, _) => "Frame",
        }
    }
}
