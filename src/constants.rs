//! Wire-protocol constants for the MT transport.
//!
//! Centralizes the magic numbers from spec §4.1/§4.3/§6 so the framer,
//! fragment engine, and device-message helpers agree on a single source.

/// Leading frame-sync byte, present only when `frame_sync` is enabled.
pub const FRAME_SYNC_BYTE: u8 = 0xFE;

/// `cmd0` bit7: set for extended (fragmentation / stack-scoped) messages.
pub const CMD0_EXTENDED_BIT: u8 = 0x80;

/// `cmd0` bits [6:5]: base request class (POLL/SREQ/AREQ/SRSP).
pub const CMD0_CLASS_SHIFT: u8 = 5;
/// Mask isolating the 5-bit subsystem id in the low bits of `cmd0`.
pub const CMD0_SUBSYSTEM_MASK: u8 = 0x1F;

/// Minor type occupies the top 3 bits of the extension descriptor byte.
pub const EXT_MINOR_SHIFT: u8 = 5;

/// Extension minor type: stack-scoped plain message.
pub const EXT_MINOR_STACK_SCOPED: u8 = 1;
/// Extension minor type: fragment data carrier.
pub const EXT_MINOR_FRAG_DATA: u8 = 2;
/// Extension minor type: fragment ACK.
pub const EXT_MINOR_FRAG_ACK: u8 = 3;
/// Extension minor type: extended status (out-of-band, informational).
pub const EXT_MINOR_EXT_STATUS: u8 = 4;

/// Fragment/extended-status codes (spec §4.1).
pub mod frag_status {
    pub const SUCCESS: u8 = 0;
    pub const RESEND_LAST: u8 = 1;
    pub const UNSUPPORTED_STACK_ID: u8 = 2;
    pub const BLOCK_OUT_OF_ORDER: u8 = 3;
    pub const BLOCK_LEN_CHANGED: u8 = 4;
    pub const MEM_ALLOC_ERROR: u8 = 5;
    pub const FRAG_COMPLETE: u8 = 6;
    pub const FRAG_ABORTED: u8 = 7;
    pub const UNSUPPORTED_ACK: u8 = 8;
}

/// Minimum message buffer capacity (spec §3.1: "≥4 KiB").
pub const MIN_MESSAGE_CAPACITY: usize = 4096;

/// Default outbound fragmentation threshold in bytes: the per-block *chunk*
/// size, not the framed wire size. A fragment-data carrier adds 4 bytes of
/// its own header (ext-desc + block_index + 2-byte total_size) on top of the
/// chunk, and on a 1-byte-length interface the framed message itself costs
/// another 5 (sync + len + cmd0 + cmd1 + chksum) — 247 is `mt_msg.c`'s
/// derived budget of 256 − 9, chosen so the worst case still fits the
/// 1-byte length field (`components/api/src/mt_msg.c:2350-2366`).
pub const DEFAULT_TX_FRAG_SIZE: usize = 247;
/// Default maximum resends per fragment block.
pub const DEFAULT_RETRY_MAX: u32 = 3;
/// Default per-fragment ACK timeout, milliseconds.
pub const DEFAULT_FRAG_TIMEOUT_MS: u64 = 2000;
/// Default SREQ→SRSP timeout, milliseconds.
pub const DEFAULT_SRSP_TIMEOUT_MS: u64 = 3000;
/// Default idle read-block timeout for the RX worker, milliseconds.
pub const DEFAULT_INTERMSG_TIMEOUT_MS: u64 = 3000;
/// Default in-message inter-byte read timeout, milliseconds.
pub const DEFAULT_INTERSYMBOL_TIMEOUT_MS: u64 = 100;
/// Default RX drain timeout when recovering from a corrupt frame, milliseconds.
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 50;
/// Default TX-lock acquisition timeout, milliseconds.
pub const DEFAULT_TX_LOCK_TIMEOUT_MS: u64 = 3000;

/// Non-framed length above which fragmentation kicks in for a 1-byte-length
/// interface even if the payload is under `tx_frag_size` (spec §4.2).
pub const SINGLE_BYTE_LEN_FRAME_LIMIT: usize = 256;

/// Bytes of fragment-data carrier header in front of the chunk itself:
/// ext-descriptor + block_index + 2-byte total_size.
pub const FRAG_CARRIER_HEADER_LEN: usize = 4;

/// `app_main.c` drains at most this many messages hunting for `SYS_RESET_IND`
/// before giving up (original_source/example/npi_server2/app_main.c).
pub const SERVER_RESET_DRAIN_LIMIT: usize = 20;

/// Device-level command byte pairs used by the transport core (spec §6).
pub mod device_cmd {
    pub const SYS_RESET_REQ: (u8, u8) = (0x41, 0x00);
    pub const SYS_RESET_IND: (u8, u8) = (0x41, 0x80);
    pub const SYS_VERSION_REQ: (u8, u8) = (0x21, 0x02);
    pub const MT_UTIL_GET_EXT_ADDR: (u8, u8) = (0x27, 0xEE);
    pub const MT_UTIL_LOOPBACK: (u8, u8) = (0x27, 0x10);
}
