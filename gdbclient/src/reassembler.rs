/// Incremental reassembly of the inbound RSP byte stream
///
/// TCP reads land on arbitrary boundaries, so bytes are buffered until a full
/// `$...#xx` frame (or a bare `+`/`-` token) can be extracted.

use std::collections::HashSet;

use crate::packet::{Packet, PacketError};

/// One item extracted from the inbound stream
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ack,
    Nack,
    Packet(Packet),
    /// A complete frame that failed validation; the sender should be NACKed
    Corrupt { raw: Vec<u8>, error: PacketError },
}

#[derive(Debug, Default)]
pub struct StreamReassembler {
    buffer: Vec<u8>,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Append freshly read bytes and extract everything that is complete
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Inbound> {
        self.buffer.extend_from_slice(bytes);

        let mut out = Vec::new();
        let mut seen: HashSet<Vec<u8>> = HashSet::new();

        loop {
            match self.buffer.first() {
                None => break,
                Some(b'+') => {
                    self.buffer.drain(..1);
                    out.push(Inbound::Ack);
                    continue;
                }
                Some(b'-') => {
                    self.buffer.drain(..1);
                    out.push(Inbound::Nack);
                    continue;
                }
                _ => {}
            }

            // resync on the next frame start
            let start = match self.buffer.iter().position(|b| *b == b'$') {
                Some(start) => start,
                None => {
                    log::trace!("Discarding {} bytes without frame start", self.buffer.len());
                    self.buffer.clear();
                    break;
                }
            };
            if start > 0 {
                log::trace!("Discarding {} bytes before frame start", start);
                self.buffer.drain(..start);
            }

            let hash = match self.buffer.iter().position(|b| *b == b'#') {
                Some(hash) => hash,
                None => break,
            };
            if self.buffer.len() < hash + 3 {
                break;
            }

            let raw: Vec<u8> = self.buffer.drain(..hash + 3).collect();
            if !seen.insert(raw.clone()) {
                log::debug!("Skipping duplicate frame {}", String::from_utf8_lossy(&raw));
                continue;
            }

            match Packet::decode(&raw) {
                Ok(packet) => out.push(Inbound::Packet(packet)),
                Err(error) => {
                    log::warn!(
                        "Dropping corrupt frame {}: {}",
                        String::from_utf8_lossy(&raw),
                        error
                    );
                    out.push(Inbound::Corrupt { raw, error });
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packets(items: &[Inbound]) -> Vec<String> {
        items
            .iter()
            .filter_map(|item| match item {
                Inbound::Packet(p) => Some(p.payload().to_string()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_whole_packet() {
        let mut r = StreamReassembler::new();
        let items = r.feed(b"$OK#9a");
        assert_eq!(packets(&items), vec!["OK"]);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_byte_at_a_time_matches_whole_feed() {
        let wire = b"+$T05thread:01;#07";
        let mut whole = StreamReassembler::new();
        let expected = whole.feed(wire);

        let mut split = StreamReassembler::new();
        let mut collected = Vec::new();
        for byte in wire.iter() {
            collected.extend(split.feed(std::slice::from_ref(byte)));
        }

        assert_eq!(collected, expected);
        assert_eq!(packets(&collected).len(), 1);
        assert_eq!(collected[0], Inbound::Ack);
    }

    #[test]
    fn test_incomplete_checksum_waits() {
        let mut r = StreamReassembler::new();
        assert!(r.feed(b"$OK#9").is_empty());
        assert_eq!(r.buffered(), 5);
        assert_eq!(packets(&r.feed(b"a")), vec!["OK"]);
    }

    #[test]
    fn test_ack_nack_tokens() {
        let mut r = StreamReassembler::new();
        let items = r.feed(b"+-+$OK#9a");
        assert_eq!(items[0], Inbound::Ack);
        assert_eq!(items[1], Inbound::Nack);
        assert_eq!(items[2], Inbound::Ack);
        assert_eq!(packets(&items), vec!["OK"]);
    }

    #[test]
    fn test_garbage_is_discarded() {
        let mut r = StreamReassembler::new();
        assert!(r.feed(b"noise").is_empty());
        assert_eq!(r.buffered(), 0);

        let items = r.feed(b"junk$OK#9a");
        assert_eq!(packets(&items), vec!["OK"]);
    }

    #[test]
    fn test_duplicate_in_same_feed_is_skipped() {
        let mut r = StreamReassembler::new();
        let items = r.feed(b"$OK#9a$OK#9a");
        assert_eq!(packets(&items), vec!["OK"]);

        // a later feed is a new cycle
        assert_eq!(packets(&r.feed(b"$OK#9a")), vec!["OK"]);
    }

    #[test]
    fn test_corrupt_frame_is_reported() {
        let mut r = StreamReassembler::new();
        let items = r.feed(b"$OK#00$E01#a6");
        assert!(matches!(
            items[0],
            Inbound::Corrupt {
                error: PacketError::ChecksumMismatch { .. },
                ..
            }
        ));
        assert_eq!(packets(&items), vec!["E01"]);
    }
}
