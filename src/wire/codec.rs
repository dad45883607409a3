//! Octet run-length codec.
//!
//! Grounded on `ce2103::mm::session::serialize_octets` /
//! `deserialize_octets` / `deserialized_size` (`src/session.cpp`). A
//! JSON array alternates hex-pair strings and integer zero-run lengths;
//! a zero-run is only extracted as an integer when it is at least three
//! bytes long, which guarantees the encoded form is never longer than
//! plain hex.

use serde_json::{json, Value};

fn nibble_char(nibble: u8) -> char {
    if nibble < 0x0a {
        (b'0' + nibble) as char
    } else {
        (b'a' + nibble - 0x0a) as char
    }
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 0x0a),
        _ => None,
    }
}

fn find_zero_run(data: &[u8]) -> Option<usize> {
    data.windows(3).position(|window| window == [0, 0, 0])
}

fn find_first_nonzero_from(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?.iter().position(|&b| b != 0).map(|p| p + from)
}

/// Encodes a byte buffer as alternating hex-pair strings and zero-run
/// lengths. Empty input encodes to an empty array.
pub fn serialize_octets(mut input: &[u8]) -> Value {
    let mut fragments: Vec<Value> = Vec::new();

    while !input.is_empty() {
        let found = find_zero_run(input);
        let is_break = found == Some(0);

        let mut barrier = found.unwrap_or(input.len());
        if is_break {
            barrier = find_first_nonzero_from(input, 3).unwrap_or(input.len());
        }

        if is_break {
            fragments.push(json!(barrier));
        } else {
            let mut fragment = String::with_capacity(barrier * 2);
            for &byte in &input[..barrier] {
                fragment.push(nibble_char(byte >> 4));
                fragment.push(nibble_char(byte & 0b0000_1111));
            }
            fragments.push(json!(fragment));
        }

        input = &input[barrier..];
    }

    json!(fragments)
}

/// Computes the total decoded byte length an encoded value would
/// produce, without decoding it. Returns `None` if `input` is not a
/// well-formed encoding (wrong element types, odd-length hex strings).
pub fn deserialized_size(input: &Value) -> Option<usize> {
    let fragments = input.as_array()?;

    let mut size = 0usize;
    for fragment in fragments {
        if let Some(run) = fragment.as_u64() {
            size += run as usize;
        } else if let Some(hex) = fragment.as_str() {
            if hex.len() % 2 != 0 {
                return None;
            }
            size += hex.len() / 2;
        } else {
            return None;
        }
    }

    Some(size)
}

/// Decodes `input` into `output`, which must be exactly as long as the
/// encoding's total byte length. Returns whether decoding succeeded.
pub fn deserialize_octets(input: &Value, output: &mut [u8]) -> bool {
    let Some(fragments) = input.as_array() else {
        return false;
    };

    let mut remaining = output.len();
    let mut cursor = 0usize;

    for fragment in fragments {
        let is_break;
        let length;
        let hex_text;

        if let Some(run) = fragment.as_u64() {
            is_break = true;
            length = run as usize;
            hex_text = None;
        } else if let Some(text) = fragment.as_str() {
            is_break = false;
            length = text.len() / 2;
            hex_text = Some(text);
        } else {
            return false;
        }

        if length > remaining || (!is_break && hex_text.map(str::len) != Some(length * 2)) {
            return false;
        }

        if is_break {
            for byte in &mut output[cursor..cursor + length] {
                *byte = 0;
            }
        } else {
            let bytes = hex_text.expect("non-break fragment carries hex text").as_bytes();
            for i in 0..length {
                let (Some(hi), Some(lo)) = (hex_nibble(bytes[2 * i]), hex_nibble(bytes[2 * i + 1])) else {
                    return false;
                };

                output[cursor + i] = (hi << 4) | lo;
            }
        }

        cursor += length;
        remaining -= length;
    }

    remaining == 0
}

/// Decodes a self-describing encoded value into a fresh `Vec<u8>`.
pub fn decode_to_vec(input: &Value) -> Option<Vec<u8>> {
    let size = deserialized_size(input)?;
    let mut output = vec![0u8; size];
    deserialize_octets(input, &mut output).then_some(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_zero_run_stays_inline() {
        // S2: two zeros (< 3) do not break the hex string.
        let encoded = serialize_octets(&[0xaa, 0x00, 0x00, 0xbb]);
        assert_eq!(encoded, json!(["aa0000bb"]));
    }

    #[test]
    fn long_zero_run_becomes_integer() {
        // S2: three zeros (>= 3) are extracted as a run-length integer.
        let encoded = serialize_octets(&[0xaa, 0x00, 0x00, 0x00, 0xbb]);
        assert_eq!(encoded, json!(["aa", 3, "bb"]));
    }

    #[test]
    fn empty_input_encodes_to_empty_array() {
        assert_eq!(serialize_octets(&[]), json!([]));
    }

    #[test]
    fn round_trips_arbitrary_buffers() {
        let samples: &[&[u8]] = &[
            &[],
            &[0x00, 0x00, 0x00, 0x00, 0x00],
            &[0xff; 10],
            &[0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x03],
        ];

        for sample in samples {
            let encoded = serialize_octets(sample);
            let decoded = decode_to_vec(&encoded).expect("well-formed encoding decodes");
            assert_eq!(&decoded, sample);
        }
    }

    #[test]
    fn rejects_malformed_encodings() {
        assert_eq!(deserialized_size(&json!(["ab", "c"])), None); // odd hex length
        assert_eq!(deserialized_size(&json!([true])), None); // wrong element type
        assert_eq!(deserialized_size(&json!("not an array")), None);

        let mut output = [0u8; 1];
        assert!(!deserialize_octets(&json!(["zz"]), &mut output)); // non-hex chars
    }

    #[test]
    fn encoded_length_never_exceeds_plain_hex() {
        for len in 0..64 {
            let buffer = vec![0u8; len];
            let encoded = serialize_octets(&buffer).to_string();
            assert!(encoded.len() <= 2 * len + 16);
        }
    }
}
