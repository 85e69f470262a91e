//! Statement helpers: fingerprints, read/write classification, bind pairs

use super::codes;
use super::frame::Frame;

/// murmur3 x86 32-bit
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    let mut k: u32 = 0;
    if tail.len() >= 3 {
        k ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        k ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        k ^= u32::from(tail[0]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Fingerprint of a statement text
pub fn sql_hash(sql: &str) -> u32 {
    murmur3_32(sql.as_bytes(), 0)
}

/// Decides whether a statement only reads
pub trait StatementClassifier: Send + Sync {
    fn is_read(&self, sql: &str) -> bool;
}

/// Leading keyword classifier: `select` and `with ... select` read, the rest
/// write. `select ... for update` writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordClassifier;

impl StatementClassifier for KeywordClassifier {
    fn is_read(&self, sql: &str) -> bool {
        let text = skip_comments(sql);
        let lower = text.to_ascii_lowercase();
        let first = lower.split_whitespace().next().unwrap_or("");
        let reads = match first {
            "select" => true,
            "with" => !contains_word(&lower, "insert")
                && !contains_word(&lower, "update")
                && !contains_word(&lower, "delete")
                && !contains_word(&lower, "merge"),
            _ => false,
        };
        reads && !lower.contains("for update")
    }
}

fn skip_comments(sql: &str) -> &str {
    let mut s = sql.trim_start();
    loop {
        if let Some(rest) = s.strip_prefix("/*") {
            match rest.find("*/") {
                Some(end) => s = rest[end + 2..].trim_start(),
                None => return "",
            }
        } else if let Some(rest) = s.strip_prefix("--") {
            match rest.find('\n') {
                Some(end) => s = rest[end + 1..].trim_start(),
                None => return "",
            }
        } else {
            return s;
        }
    }
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|w| w == word)
}

/// One bound parameter of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindPair {
    pub name: String,
    pub value: String,
}

/// Collect (name, value) pairs from request sub-frames
///
/// A bind name is paired with the next bind value; bind type, array count and
/// max size frames in between are skipped.
pub fn parse_binds(frames: &[Frame]) -> Vec<BindPair> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < frames.len() {
        if frames[i].cmd != codes::BIND_NAME {
            i += 1;
            continue;
        }
        let name = frames[i].payload_str().into_owned();
        let mut j = i + 1;
        while j < frames.len() {
            match frames[j].cmd {
                codes::BIND_NUM | codes::BIND_TYPE | codes::BIND_VALUE_MAX_SIZE => j += 1,
                _ => break,
            }
        }
        if j < frames.len() && frames[j].cmd == codes::BIND_VALUE {
            out.push(BindPair {
                name,
                value: frames[j].payload_str().into_owned(),
            });
            i = j + 1;
        } else {
            i = j;
        }
    }
    out
}

/// First statement text in a request, if any
pub fn statement_text(frames: &[Frame]) -> Option<String> {
    frames
        .iter()
        .find(|f| codes::is_prepare(f.cmd))
        .map(|f| f.payload_str().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur3_reference_values() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3_32(b"hello", 0), 0x248b_fa47);
        assert_eq!(murmur3_32(b"The quick brown fox jumps over the lazy dog", 0), 0x2e4f_f723);
    }

    #[test]
    fn test_classifier() {
        let c = KeywordClassifier;
        assert!(c.is_read("select * from t"));
        assert!(c.is_read("  /* hint */ SELECT id FROM t"));
        assert!(c.is_read("with x as (select 1 from dual) select * from x"));
        assert!(!c.is_read("select * from t for update"));
        assert!(!c.is_read("update t set a = 1"));
        assert!(!c.is_read("insert into t values (1)"));
        assert!(!c.is_read("with x as (select 1 from dual) insert into t select * from x"));
    }

    #[test]
    fn test_parse_binds_skips_type_frames() {
        let frames = vec![
            Frame::new(codes::PREPARE, "select * from t where id = :id and n = :num1"),
            Frame::new(codes::BIND_NAME, ":id"),
            Frame::new(codes::BIND_TYPE, "1"),
            Frame::new(codes::BIND_VALUE, "12345678"),
            Frame::new(codes::BIND_NAME, ":num1"),
            Frame::new(codes::BIND_NUM, "1"),
            Frame::new(codes::BIND_VALUE_MAX_SIZE, "8"),
            Frame::new(codes::BIND_VALUE, "99"),
            Frame::empty(codes::EXECUTE),
        ];

        let binds = parse_binds(&frames);
        assert_eq!(binds.len(), 2);
        assert_eq!(binds[0].name, ":id");
        assert_eq!(binds[0].value, "12345678");
        assert_eq!(binds[1].name, ":num1");
        assert_eq!(binds[1].value, "99");
    }
}
