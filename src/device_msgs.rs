//! Device-level message helpers used by the transport core itself (spec §6).
//!
//! Not a general API-MAC PIB surface (explicitly out of scope) — just the
//! handful of device messages the reset handshake sends/expects and the two
//! helpers recovered from `original_source/` as diagnostic/self-test payloads
//! for the fragmentation engine (`SPEC_FULL.md`'s "Supplemented features").

use crate::constants::device_cmd;
use crate::message::Message;

/// Build a `SYS_RESET_REQ` request. `hard` selects a hard (vs. soft) reset.
pub fn sys_reset_req(hard: bool) -> Message {
    let (cmd0, cmd1) = device_cmd::SYS_RESET_REQ;
    let mut msg = Message::new(cmd0, cmd1, "[Device]");
    msg.set_payload(&[if hard { 0 } else { 1 }]);
    msg
}

/// Parsed `SYS_RESET_IND` payload: reason, transport, product, major,
/// minor, maint (spec §6).
#[derive(Debug, Clone, Copy)]
pub struct ResetIndication {
    pub reason: u8,
    pub transport: u8,
    pub product: u8,
    pub major: u8,
    pub minor: u8,
    pub maint: u8,
}

pub fn is_sys_reset_ind(msg: &Message) -> bool {
    (msg.cmd0, msg.cmd1) == device_cmd::SYS_RESET_IND
}

/// Parse a `SYS_RESET_IND` message's six-octet payload.
pub fn parse_reset_ind(msg: &Message) -> Option<ResetIndication> {
    if !is_sys_reset_ind(msg) {
        return None;
    }
    let bytes = msg.bytes();
    if bytes.len() < 6 {
        return None;
    }
    Some(ResetIndication {
        reason: bytes[0],
        transport: bytes[1],
        product: bytes[2],
        major: bytes[3],
        minor: bytes[4],
        maint: bytes[5],
    })
}

/// Build a `SYS_VERSION_REQ` request (empty payload).
pub fn sys_version_req() -> Message {
    let (cmd0, cmd1) = device_cmd::SYS_VERSION_REQ;
    Message::new(cmd0, cmd1, "[Device]")
}

/// Parsed `SYS_VERSION_REQ` response: same five-octet tail layout as
/// `SYS_RESET_IND` minus the leading `reason` field (spec §6).
#[derive(Debug, Clone, Copy)]
pub struct VersionResponse {
    pub transport: u8,
    pub product: u8,
    pub major: u8,
    pub minor: u8,
    pub maint: u8,
}

pub fn parse_version_resp(msg: &Message) -> Option<VersionResponse> {
    let bytes = msg.bytes();
    if bytes.len() < 5 {
        return None;
    }
    Some(VersionResponse {
        transport: bytes[0],
        product: bytes[1],
        major: bytes[2],
        minor: bytes[3],
        maint: bytes[4],
    })
}

/// Selector for `MT_UTIL_GET_EXT_ADDR` (spec §6).
#[derive(Debug, Clone, Copy)]
pub enum ExtAddrSelector {
    Pib = 0,
    Primary = 1,
    UsrCfg = 2,
}

/// Build an `MT_UTIL_GET_EXT_ADDR` request.
pub fn get_ext_addr_req(selector: ExtAddrSelector) -> Message {
    let (cmd0, cmd1) = device_cmd::MT_UTIL_GET_EXT_ADDR;
    let mut msg = Message::new(cmd0, cmd1, "[Device]");
    msg.set_payload(&[selector as u8]);
    msg
}

/// Parse an `MT_UTIL_GET_EXT_ADDR` response: selector + 8-octet address.
pub fn parse_ext_addr_resp(msg: &Message) -> Option<(u8, [u8; 8])> {
    let bytes = msg.bytes();
    if bytes.len() < 9 {
        return None;
    }
    let mut addr = [0u8; 8];
    addr.copy_from_slice(&bytes[1..9]);
    Some((bytes[0], addr))
}

/// Build an `MT_UTIL_LOOPBACK` request. `original_source/`'s `api_mac.c`
/// uses a large loopback payload as a self-test of the fragmentation path,
/// since the loopback request round-trips whatever payload size is given.
pub fn loopback_req(repeat: u8, interval_ms: u32, payload: &[u8]) -> Message {
    let (cmd0, cmd1) = device_cmd::MT_UTIL_LOOPBACK;
    let mut msg = Message::new(cmd0, cmd1, "[Device]");
    let mut body = Vec::with_capacity(5 + payload.len());
    body.push(repeat);
    body.extend_from_slice(&interval_ms.to_le_bytes());
    body.extend_from_slice(payload);
    msg.set_payload(&body);
    msg
}

/// Parse an `MT_UTIL_LOOPBACK` response: echoes `(repeat, interval_ms, payload)`.
pub fn parse_loopback_resp(msg: &Message) -> Option<(u8, u32, Vec<u8>)> {
    let bytes = msg.bytes();
    if bytes.len() < 5 {
        return None;
    }
    let repeat = bytes[0];
    let interval_ms = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    Some((repeat, interval_ms, bytes[5..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_req_payload_encodes_hard_soft() {
        assert_eq!(sys_reset_req(true).bytes(), &[0]);
        assert_eq!(sys_reset_req(false).bytes(), &[1]);
    }

    #[test]
    fn loopback_round_trips_fields() {
        let req = loopback_req(3, 500, &[0xAA; 300]);
        let (repeat, interval_ms, payload) = parse_loopback_resp(&req).unwrap();
        assert_eq!(repeat, 3);
        assert_eq!(interval_ms, 500);
        assert_eq!(payload.len(), 300);
    }

    #[test]
    fn version_resp_parses_five_octet_tail() {
        let mut resp = Message::new(device_cmd::SYS_VERSION_REQ.0, device_cmd::SYS_VERSION_REQ.1, "[Device]");
        resp.set_payload(&[2, 3, 4, 5, 6]);
        let parsed = parse_version_resp(&resp).unwrap();
        assert_eq!(parsed.transport, 2);
        assert_eq!(parsed.maint, 6);
    }

    #[test]
    fn reset_ind_recognition() {
        let mut ind = Message::new(device_cmd::SYS_RESET_IND.0, device_cmd::SYS_RESET_IND.1, "[Device]");
        ind.set_payload(&[1, 2, 3, 4, 5, 6]);
        assert!(is_sys_reset_ind(&ind));
        let parsed = parse_reset_ind(&ind).unwrap();
        assert_eq!(parsed.maint, 6);
    }
}
