/// RSP payload parsing
///
/// Hex helpers plus parsers for stop replies, `qSupported` replies and the
/// textual register dumps printed by monitor commands.

use crate::types::*;
use regex::Regex;
use std::sync::OnceLock;

/// Lowercase hex encoding, two digits per byte
pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Decode a hex string into raw bytes
pub fn decode_hex(text: &str) -> Result<Vec<u8>, String> {
    if text.len() % 2 != 0 {
        return Err(format!("Odd number of hex digits: {}", text.len()));
    }

    text.as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                .ok_or_else(|| format!("Invalid hex byte '{}'", String::from_utf8_lossy(pair)))
        })
        .collect()
}

/// Decode hex-encoded ASCII text, as carried by `O` packets
pub fn decode_hex_text(text: &str) -> Result<String, String> {
    decode_hex(text).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

/// Parse a hex number with an optional `0x` prefix
pub fn parse_hex_u64(text: &str) -> Result<u64, String> {
    let digits = text
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u64::from_str_radix(digits, 16).map_err(|e| format!("Invalid hex number '{}': {}", text, e))
}

fn stop_reply_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([STWX])([0-9a-fA-F]{2})(.*)$").unwrap())
}

/// Parse a stop reply payload (`S05`, `T05thread:01;swbreak:;`, `W00`, `X09`)
pub fn parse_stop_reply(payload: &str) -> Result<StopReply, String> {
    let caps = stop_reply_regex()
        .captures(payload)
        .ok_or_else(|| format!("Invalid stop reply: {}", payload))?;

    let code = u8::from_str_radix(&caps[2], 16)
        .map_err(|e| format!("Invalid stop code in '{}': {}", payload, e))?;

    let kind = match &caps[1] {
        "S" | "T" => StopKind::Signal(code),
        "W" => StopKind::Exited(code),
        "X" => StopKind::Terminated(code),
        other => return Err(format!("Unknown stop reply type: {}", other)),
    };

    let mut reply = StopReply {
        kind,
        thread: None,
        core: None,
        reason: None,
        registers: Vec::new(),
    };

    if &caps[1] != "T" {
        return Ok(reply);
    }

    for pair in caps[3].split(';').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once(':').unwrap_or((pair, ""));
        match key {
            "thread" => reply.thread = Some(value.to_string()),
            "core" => reply.core = u32::from_str_radix(value, 16).ok(),
            _ => {
                if let Some(reason) = StopReason::from_pair(key, value) {
                    reply.reason = Some(reason);
                } else if let Ok(regno) = u32::from_str_radix(key, 16) {
                    reply.registers.push((regno, value.to_string()));
                } else {
                    log::debug!("Ignoring stop reply field '{}'", pair);
                }
            }
        }
    }

    Ok(reply)
}

/// Parse the feature list of a `qSupported` reply
pub fn parse_supported(payload: &str) -> RemoteFeatures {
    let mut features = RemoteFeatures::default();

    for item in payload.split(';').filter(|i| !i.is_empty()) {
        if let Some(size) = item.strip_prefix("PacketSize=") {
            features.packet_size = usize::from_str_radix(size, 16).ok();
            continue;
        }

        let supported = item.ends_with('+');
        let name = item.trim_end_matches(['+', '-', '?']);
        match name {
            "qXfer:features:read" => features.xml_target = supported,
            "multiprocess" => features.multiprocess = supported,
            "vContSupported" => features.vcont = supported,
            "QStartNoAckMode" => features.no_ack_mode = supported,
            "swbreak" => features.swbreak = supported,
            "hwbreak" => features.hwbreak = supported,
            _ => {}
        }
    }

    features
}

fn scalar_register_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\w+)\s*=\s*(?:0x)?([0-9a-fA-F]+)").unwrap())
}

fn table_register_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\w+)\s+base\s*=\s*(?:0x)?([0-9a-fA-F]+)\s+limit\s*=\s*(?:0x)?([0-9a-fA-F]+)")
            .unwrap()
    })
}

/// Parse monitor output of the form `cr0=0x80050033`. The register name must
/// match, otherwise the reply belongs to some other query.
pub fn parse_scalar_register(text: &str, name: &str) -> Result<u64, String> {
    let text = text.trim();
    let caps = scalar_register_regex()
        .captures(text)
        .ok_or_else(|| format!("Unexpected register output: {}", text))?;

    if &caps[1] != name {
        return Err(format!("Expected '{}' but got '{}'", name, &caps[1]));
    }
    parse_hex_u64(&caps[2])
}

/// Parse monitor output of the form `idtr base=0xfffff80000001000 limit=0xfff`
pub fn parse_table_register(text: &str, name: &str) -> Result<DescriptorTable, String> {
    let text = text.trim();
    let caps = table_register_regex()
        .captures(text)
        .ok_or_else(|| format!("Unexpected table register output: {}", text))?;

    if &caps[1] != name {
        return Err(format!("Expected '{}' but got '{}'", name, &caps[1]));
    }

    let base = parse_hex_u64(&caps[2])?;
    let limit = parse_hex_u64(&caps[3])?;
    Ok(DescriptorTable {
        base,
        limit: limit as u16,
    })
}
