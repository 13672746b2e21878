//! Stateless MT frame codec (spec §4.1).
//!
//! Wire format: `[0xFE?] LEN(1|2) CMD0 CMD1 PAYLOAD[LEN] [XOR?]`.
//!
//! Grounded on the teacher's `socket/framing.rs` encode/decode pair, reworked
//! for a length-then-type-then-payload layout with optional sync/checksum
//! bytes and a configurable 1- or 2-byte length field instead of a fixed
//! `u32 LE` length + type byte.

use anyhow::{bail, Result};

use crate::constants::{
    CMD0_CLASS_SHIFT, CMD0_EXTENDED_BIT, CMD0_SUBSYSTEM_MASK, EXT_MINOR_SHIFT, FRAME_SYNC_BYTE,
};
use crate::message::{BaseClass, Message, MessageKind};

/// Per-interface framing options that the `Framer` needs but does not own
/// (mirrors the relevant subset of `MsgInterface`'s fields).
#[derive(Debug, Clone, Copy)]
pub struct FrameOptions {
    pub frame_sync: bool,
    pub include_chksum: bool,
    pub len_2bytes: bool,
}

impl FrameOptions {
    /// Header length in bytes (sync, if present, plus the length field),
    /// not including `cmd0`/`cmd1`.
    pub fn length_field_width(&self) -> usize {
        if self.len_2bytes {
            2
        } else {
            1
        }
    }

    /// Total bytes preceding the payload: sync (optional) + length field +
    /// cmd0 + cmd1.
    pub fn header_len(&self) -> usize {
        (if self.frame_sync { 1 } else { 0 }) + self.length_field_width() + 2
    }

    /// Trailer length: the checksum byte, if enabled.
    pub fn trailer_len(&self) -> usize {
        if self.include_chksum {
            1
        } else {
            0
        }
    }
}

/// Fold an 8-bit XOR checksum over `bytes`. Per spec §4.1 the checksum
/// covers everything *after* the sync byte (if any sync is present); callers
/// pass the already-sync-stripped slice.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Classify a (possibly extended) message from its `cmd0` and, for extended
/// messages, the first payload byte (the extension descriptor).
///
/// Per spec §9 design notes, this should only be called once the RX worker
/// has at least `header_len + 1` bytes for extended messages, and the
/// result must never be mutated afterward.
pub fn classify(cmd0: u8, ext_descriptor: Option<u8>) -> MessageKind {
    let class = BaseClass::from_bits(cmd0 >> CMD0_CLASS_SHIFT);
    if cmd0 & CMD0_EXTENDED_BIT == 0 {
        return MessageKind::Plain(class);
    }
    let minor = ext_descriptor.unwrap_or(0) >> EXT_MINOR_SHIFT;
    match minor {
        1 => MessageKind::StackScoped(class),
        2 => MessageKind::FragData,
        3 => MessageKind::FragAck,
        4 => MessageKind::ExtStatus,
        _ => MessageKind::Plain(class),
    }
}

/// `frame(msg, opts)`: rewrite `msg`'s buffer in place to hold the on-wire
/// bytes, using whatever is currently in the payload region (bytes
/// `0..valid_len` as set by `Message::set_payload`/cursor writes) as the
/// payload.
pub fn frame(msg: &mut Message, opts: FrameOptions) -> Result<()> {
    let payload = msg.bytes().to_vec();
    let payload_len = payload.len();
    if opts.len_2bytes && payload_len > u16::MAX as usize {
        bail!("payload too large for 2-byte length field: {payload_len}");
    }
    if !opts.len_2bytes && payload_len > u8::MAX as usize {
        bail!("payload too large for 1-byte length field: {payload_len}");
    }

    let mut framed = Vec::with_capacity(opts.header_len() + payload_len + opts.trailer_len());
    if opts.frame_sync {
        framed.push(FRAME_SYNC_BYTE);
    }
    if opts.len_2bytes {
        framed.extend_from_slice(&(payload_len as u16).to_le_bytes());
    } else {
        framed.push(payload_len as u8);
    }
    framed.push(msg.cmd0);
    framed.push(msg.cmd1);
    framed.extend_from_slice(&payload);

    if opts.include_chksum {
        let checksum_region_start = if opts.frame_sync { 1 } else { 0 };
        let sum = checksum(&framed[checksum_region_start..]);
        framed.push(sum);
        msg.checksum = Some(sum);
    }

    let valid_len = framed.len();
    *msg.bytes_mut() = framed;
    msg.set_cursor(valid_len);
    msg.expected_len = Some(payload_len as u16);
    Ok(())
}

/// `parse_header`: decode `(payload_len, cmd0, cmd1)` from a buffer that
/// already holds a complete, sync-stripped frame header. Used by the RX
/// worker once it has read the fixed-size header portion.
pub fn parse_header(header: &[u8], opts: FrameOptions) -> Result<(u16, u8, u8)> {
    let width = opts.length_field_width();
    if header.len() < width + 2 {
        bail!("short header: need {} bytes, have {}", width + 2, header.len());
    }
    let len = if opts.len_2bytes {
        u16::from_le_bytes([header[0], header[1]])
    } else {
        header[0] as u16
    };
    let cmd0 = header[width];
    let cmd1 = header[width + 1];
    Ok((len, cmd0, cmd1))
}

/// Verify a complete framed buffer's checksum (if `opts.include_chksum`).
/// `framed` must be the raw bytes exactly as placed on the wire, including
/// the leading sync byte if present.
pub fn verify_checksum(framed: &[u8], opts: FrameOptions) -> bool {
    if !opts.include_chksum {
        return true;
    }
    if framed.is_empty() {
        return false;
    }
    let (body, trailer) = framed.split_at(framed.len() - 1);
    let region_start = if opts.frame_sync { 1 } else { 0 };
    if region_start > body.len() {
        return false;
    }
    checksum(&body[region_start..]) == trailer[0]
}

/// `reformat(msg, from, to)`: slide the payload region in place to match a
/// target interface's header width, without reallocating (spec §9: messages
/// carry an oversized buffer precisely so this can happen in place).
///
/// `msg` must currently hold a *parsed* (unframed) payload at offset 0 with
/// `expected_len` set; this produces a fresh framed buffer for `to`.
pub fn reformat(msg: &mut Message, to: FrameOptions) -> Result<()> {
    frame(msg, to)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(frame_sync: bool, include_chksum: bool, len_2bytes: bool) -> FrameOptions {
        FrameOptions {
            frame_sync,
            include_chksum,
            len_2bytes,
        }
    }

    #[test]
    fn scenario_1_frame_3_byte_payload_sync_chksum_1byte_len() {
        let mut msg = Message::with_payload(0x22, 0x05, &[0x01, 0x02, 0x03], "[test]");
        frame(&mut msg, opts(true, true, false)).unwrap();
        assert_eq!(
            msg.bytes(),
            &[0xFE, 0x03, 0x22, 0x05, 0x01, 0x02, 0x03, 0x24]
        );
    }

    #[test]
    fn round_trip_all_option_combinations() {
        for frame_sync in [false, true] {
            for include_chksum in [false, true] {
                for len_2bytes in [false, true] {
                    let o = opts(frame_sync, include_chksum, len_2bytes);
                    let payload = [0xDE, 0xAD, 0xBE, 0xEF];
                    let mut msg = Message::with_payload(0x61, 0x02, &payload, "[test]");
                    frame(&mut msg, o).unwrap();
                    assert!(verify_checksum(msg.bytes(), o));

                    let framed = msg.bytes().to_vec();
                    let mut cursor = if frame_sync { 1 } else { 0 };
                    let width = o.length_field_width();
                    let (len, cmd0, cmd1) =
                        parse_header(&framed[cursor..], o).unwrap();
                    cursor += width + 2;
                    assert_eq!(len as usize, payload.len());
                    assert_eq!(cmd0, 0x61);
                    assert_eq!(cmd1, 0x02);
                    assert_eq!(&framed[cursor..cursor + len as usize], &payload);
                }
            }
        }
    }

    #[test]
    fn checksum_flip_is_detected() {
        let o = opts(true, true, false);
        let mut msg = Message::with_payload(0x22, 0x05, &[0x01, 0x02, 0x03], "[test]");
        frame(&mut msg, o).unwrap();
        let mut framed = msg.bytes().to_vec();
        framed[3] ^= 0xFF; // flip cmd1
        assert!(!verify_checksum(&framed, o));
    }

    #[test]
    fn classify_plain_vs_extended() {
        assert_eq!(classify(0x21, None), MessageKind::Plain(BaseClass::Sreq));
        assert_eq!(
            classify(CMD0_EXTENDED_BIT | 0x21, Some(2 << EXT_MINOR_SHIFT)),
            MessageKind::FragData
        );
        assert_eq!(
            classify(CMD0_EXTENDED_BIT | 0x21, Some(3 << EXT_MINOR_SHIFT)),
            MessageKind::FragAck
        );
    }
}
