//! Base64 codec (RFC 4648, standard alphabet with padding).
//!
//! Used as a fixture wherever tests need a printable rendition of binary
//! cookie payloads. Implemented from the RFC alphabet; the decode table is
//! derived from the encode table at compile time.

use thiserror::Error;

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
const PAD: u8 = b'=';

/// Sentinel marking bytes outside the alphabet.
const INVALID: u8 = 0xFF;

const DECODE: [u8; 256] = {
    let mut table = [INVALID; 256];
    let mut i = 0;
    while i < ALPHABET.len() {
        table[ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    table
};

/// Decoding failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Base64Error {
    #[error("input length is not a multiple of four")]
    BadLength,
    #[error("byte {byte:#04x} at offset {offset} is not in the alphabet")]
    BadByte { byte: u8, offset: usize },
    #[error("misplaced padding at offset {offset}")]
    BadPadding { offset: usize },
}

/// Encode `input` with padding.
#[must_use]
pub fn encode(input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len().div_ceil(3) * 4);

    let mut chunks = input.chunks_exact(3);
    for chunk in &mut chunks {
        let group = (u32::from(chunk[0]) << 16) | (u32::from(chunk[1]) << 8) | u32::from(chunk[2]);
        out.push(ALPHABET[(group >> 18) as usize & 0x3F]);
        out.push(ALPHABET[(group >> 12) as usize & 0x3F]);
        out.push(ALPHABET[(group >> 6) as usize & 0x3F]);
        out.push(ALPHABET[group as usize & 0x3F]);
    }

    match chunks.remainder() {
        [] => {}
        [a] => {
            let group = u32::from(*a) << 16;
            out.push(ALPHABET[(group >> 18) as usize & 0x3F]);
            out.push(ALPHABET[(group >> 12) as usize & 0x3F]);
            out.push(PAD);
            out.push(PAD);
        }
        [a, b] => {
            let group = (u32::from(*a) << 16) | (u32::from(*b) << 8);
            out.push(ALPHABET[(group >> 18) as usize & 0x3F]);
            out.push(ALPHABET[(group >> 12) as usize & 0x3F]);
            out.push(ALPHABET[(group >> 6) as usize & 0x3F]);
            out.push(PAD);
        }
        _ => unreachable!("chunks_exact(3) remainder is at most two bytes"),
    }

    // The alphabet is ASCII by construction.
    String::from_utf8(out).expect("base64 output is ASCII")
}

/// Decode a padded base64 string.
pub fn decode(input: &[u8]) -> Result<Vec<u8>, Base64Error> {
    if input.len() % 4 != 0 {
        return Err(Base64Error::BadLength);
    }
    if input.is_empty() {
        return Ok(Vec::new());
    }

    // Padding may only appear as the last one or two bytes.
    let pad = match input {
        [.., a, b] if *a == PAD && *b == PAD => 2,
        [.., b] if *b == PAD => 1,
        _ => 0,
    };
    if let Some(offset) = input[..input.len() - pad]
        .iter()
        .position(|&b| b == PAD)
    {
        return Err(Base64Error::BadPadding { offset });
    }

    let mut out = Vec::with_capacity(input.len() / 4 * 3);
    for (chunk_index, chunk) in input.chunks_exact(4).enumerate() {
        let mut group = 0_u32;
        let mut significant = 0;
        for (i, &byte) in chunk.iter().enumerate() {
            if byte == PAD {
                group <<= 6;
                continue;
            }
            let value = DECODE[byte as usize];
            if value == INVALID {
                return Err(Base64Error::BadByte {
                    byte,
                    offset: chunk_index * 4 + i,
                });
            }
            group = (group << 6) | u32::from(value);
            significant = i + 1;
        }
        out.push((group >> 16) as u8);
        if significant >= 3 {
            out.push((group >> 8) as u8);
        }
        if significant == 4 {
            out.push(group as u8);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // RFC 4648 §10 test vectors.
    #[test]
    fn test_rfc_vectors_encode() {
        assert_eq!(encode(b""), "");
        assert_eq!(encode(b"f"), "Zg==");
        assert_eq!(encode(b"fo"), "Zm8=");
        assert_eq!(encode(b"foo"), "Zm9v");
        assert_eq!(encode(b"foob"), "Zm9vYg==");
        assert_eq!(encode(b"fooba"), "Zm9vYmE=");
        assert_eq!(encode(b"foobar"), "Zm9vYmFy");
    }

    #[test]
    fn test_rfc_vectors_decode() {
        assert_eq!(decode(b"").unwrap(), b"");
        assert_eq!(decode(b"Zg==").unwrap(), b"f");
        assert_eq!(decode(b"Zm8=").unwrap(), b"fo");
        assert_eq!(decode(b"Zm9v").unwrap(), b"foo");
        assert_eq!(decode(b"Zm9vYg==").unwrap(), b"foob");
        assert_eq!(decode(b"Zm9vYmE=").unwrap(), b"fooba");
        assert_eq!(decode(b"Zm9vYmFy").unwrap(), b"foobar");
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        assert_eq!(decode(b"Zm9").unwrap_err(), Base64Error::BadLength);
    }

    #[test]
    fn test_decode_rejects_bad_byte() {
        assert!(matches!(
            decode(b"Zm9v!A=="),
            Err(Base64Error::BadByte { byte: b'!', .. })
        ));
    }

    #[test]
    fn test_decode_rejects_interior_padding() {
        assert!(matches!(
            decode(b"Zm=vZm9v"),
            Err(Base64Error::BadPadding { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let encoded = encode(&bytes);
            let decoded = decode(encoded.as_bytes()).unwrap();
            prop_assert_eq!(decoded, bytes);
        }

        #[test]
        fn prop_encode_inverts_decode(groups in proptest::collection::vec(0_u32..64, 0..128)) {
            // Build a valid unpadded base64 string from alphabet indices.
            let text: Vec<u8> = groups
                .chunks(4)
                .filter(|chunk| chunk.len() == 4)
                .flatten()
                .map(|&i| ALPHABET[i as usize])
                .collect();
            let decoded = decode(&text).unwrap();
            let reencoded = encode(&decoded);
            prop_assert_eq!(reencoded.as_bytes(), text);
        }
    }
}
