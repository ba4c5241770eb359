//! Wire framing for the plug protocol.
//!
//! ```text
//! ┌──────────────────┬──────────────────────────────┐
//! │ Length (4 bytes) │ Body (Length bytes)          │
//! │ Big-endian u32   │ XOR-stream obfuscated JSON   │
//! └──────────────────┴──────────────────────────────┘
//! ```
//!
//! The body cipher is autokey XOR: the key starts at `0xAB` and each
//! ciphertext byte becomes the key for the next one. It hides nothing.

pub const INITIAL_KEY: u8 = 0xAB;

/// Length of the big-endian size prefix.
pub const HEADER_LEN: usize = 4;

/// Frame `plaintext` for sending: size prefix followed by the ciphered body.
pub fn encode(plaintext: &[u8]) -> Vec<u8> {
    let len = u32::try_from(plaintext.len()).unwrap_or(u32::MAX);
    let mut frame = Vec::with_capacity(HEADER_LEN + plaintext.len());
    frame.extend_from_slice(&len.to_be_bytes());

    let mut key = INITIAL_KEY;
    for &byte in plaintext {
        let cipher = byte ^ key;
        frame.push(cipher);
        key = cipher;
    }
    frame
}

/// Recover the plaintext of a frame body (the bytes after the size prefix).
pub fn decode(body: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    body.iter()
        .map(|&cipher| {
            let plain = cipher ^ key;
            key = cipher;
            plain
        })
        .collect()
}

/// Read the declared body length from a size prefix.
pub fn body_len(header: [u8; HEADER_LEN]) -> usize {
    u32::from_be_bytes(header) as usize
}
