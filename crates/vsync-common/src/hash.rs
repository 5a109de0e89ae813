//! Stable hashing helpers used to derive host names and label keys.
//!
//! Everything here feeds the wire contract with the host cluster, so the
//! output must stay byte-for-byte stable across releases.

use std::fmt::Write;

use aws_lc_rs::digest;

/// SHA-256 of `input`, lowercase hex encoded (64 chars)
pub fn sha256_hex(input: &str) -> String {
    hex(digest::digest(&digest::SHA256, input.as_bytes()).as_ref())
}

/// First `len` hex chars of the SHA-256 of `input`
pub fn sha256_hex_prefix(input: &str, len: usize) -> String {
    let mut full = sha256_hex(input);
    full.truncate(len);
    full
}

/// SHA-256 of `input` rendered as a lowercase base36 number
///
/// The digest is read as one big-endian integer, so leading zero bytes do
/// not contribute digits.
pub fn sha256_base36(input: &str) -> String {
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    base36(hash.as_ref())
}

fn base36(bytes: &[u8]) -> String {
    const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    let mut number: Vec<u8> = bytes.iter().copied().skip_while(|b| *b == 0).collect();
    if number.is_empty() {
        return "0".to_string();
    }

    // repeated long division by 36, collecting remainders least significant first
    let mut digits = Vec::with_capacity(bytes.len() * 2);
    while !number.is_empty() {
        let mut remainder: u32 = 0;
        let mut quotient = Vec::with_capacity(number.len());
        for byte in &number {
            let acc = (remainder << 8) | u32::from(*byte);
            let q = (acc / 36) as u8;
            remainder = acc % 36;
            if !(quotient.is_empty() && q == 0) {
                quotient.push(q);
            }
        }
        digits.push(ALPHABET[remainder as usize]);
        number = quotient;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}
