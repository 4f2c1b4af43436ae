//! Server-compatible record IDs: 15 characters over `[a-z0-9]`, drawn from
//! the OS RNG. Because locally generated IDs share the server's format, the
//! server accepts them verbatim on replay and ID remapping stays rare.

const ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

pub const RECORD_ID_LEN: usize = 15;

/// Generate a new record ID.
///
/// Uses rejection sampling so every character is uniform over the alphabet.
pub fn record_id() -> String {
    let mut out = String::with_capacity(RECORD_ID_LEN);
    let mut buf = [0u8; 32];
    while out.len() < RECORD_ID_LEN {
        getrandom::getrandom(&mut buf).expect("OS RNG unavailable");
        for &byte in buf.iter() {
            // 252 = 36 * 7; bytes at or above it would bias the tail.
            if byte < 252 {
                out.push(ALPHABET[(byte % 36) as usize] as char);
                if out.len() == RECORD_ID_LEN {
                    break;
                }
            }
        }
    }
    out
}

/// Whether `s` looks like a server-format record ID.
pub fn is_record_id(s: &str) -> bool {
    s.len() == RECORD_ID_LEN
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}
