//! Shader permutation blob container.
//!
//! A blob starts with the ASCII signature `NVSP` followed by entries of
//! `{ u32 permutation_size, u32 data_size }`, the permutation key, then the
//! byte-code. The key is the space-delimited `NAME=VALUE` list with a
//! trailing space. Keys are unescaped, so names and values must not contain
//! spaces or `=`.

use crate::types::ShaderConstant;

pub const BLOB_SIGNATURE: &[u8; 4] = b"NVSP";

const HEADER_SIZE: usize = 8;

/// Builds the lookup key from constants in input order.
pub fn format_permutation_key(constants: &[ShaderConstant]) -> String {
    let mut key = String::new();
    for constant in constants {
        key.push_str(&constant.name);
        key.push('=');
        key.push_str(&constant.value);
        key.push(' ');
    }
    key
}

pub fn blob_has_signature(blob: &[u8]) -> bool {
    blob.len() >= BLOB_SIGNATURE.len() && &blob[..BLOB_SIGNATURE.len()] == BLOB_SIGNATURE
}

/// Finds the byte-code for one permutation.
///
/// A blob without the signature is treated as a single unconditional
/// permutation: it is returned whole when no constants are requested, and
/// never matches otherwise.
pub fn find_permutation_in_blob<'a>(
    blob: &'a [u8],
    constants: &[ShaderConstant],
) -> Option<&'a [u8]> {
    if !blob_has_signature(blob) {
        return if constants.is_empty() { Some(blob) } else { None };
    }

    let key = format_permutation_key(constants);
    let mut cursor = BLOB_SIGNATURE.len();
    while cursor + HEADER_SIZE <= blob.len() {
        let permutation_size = read_u32(blob, cursor) as usize;
        let data_size = read_u32(blob, cursor + 4) as usize;
        if data_size == 0 {
            break;
        }
        cursor += HEADER_SIZE;
        if cursor + permutation_size + data_size > blob.len() {
            break;
        }
        let entry_key = &blob[cursor..cursor + permutation_size];
        if entry_key == key.as_bytes() {
            return Some(&blob[cursor + permutation_size..cursor + permutation_size + data_size]);
        }
        cursor += permutation_size + data_size;
    }
    None
}

/// Lists the keys of every permutation in the blob, for error reporting.
pub fn enumerate_permutations_in_blob(blob: &[u8]) -> Vec<String> {
    let mut keys = Vec::new();
    if !blob_has_signature(blob) {
        return keys;
    }
    let mut cursor = BLOB_SIGNATURE.len();
    while cursor + HEADER_SIZE <= blob.len() {
        let permutation_size = read_u32(blob, cursor) as usize;
        let data_size = read_u32(blob, cursor + 4) as usize;
        if data_size == 0 {
            break;
        }
        cursor += HEADER_SIZE;
        if cursor + permutation_size + data_size > blob.len() {
            break;
        }
        keys.push(String::from_utf8_lossy(&blob[cursor..cursor + permutation_size]).into_owned());
        cursor += permutation_size + data_size;
    }
    keys
}

/// Assembles a blob from `(constants, byte_code)` pairs. Used by the shader
/// compiler tool and by tests.
pub struct BlobWriter {
    bytes: Vec<u8>,
}

impl Default for BlobWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobWriter {
    pub fn new() -> Self {
        Self {
            bytes: BLOB_SIGNATURE.to_vec(),
        }
    }

    pub fn add_permutation(&mut self, constants: &[ShaderConstant], data: &[u8]) {
        let key = format_permutation_key(constants);
        self.bytes.extend_from_slice(&(key.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(key.as_bytes());
        self.bytes.extend_from_slice(data);
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

#[inline]
fn read_u32(blob: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(blob[offset..offset + 4].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(name: &str, value: &str) -> ShaderConstant {
        ShaderConstant {
            name: name.into(),
            value: value.into(),
        }
    }

    #[test]
    fn key_preserves_input_order_and_trailing_space() {
        let key = format_permutation_key(&[constant("B", "1"), constant("A", "0")]);
        assert_eq!(key, "B=1 A=0 ");
    }

    #[test]
    fn round_trip_every_permutation() {
        let mut writer = BlobWriter::new();
        writer.add_permutation(&[constant("A", "0")], b"payload0");
        writer.add_permutation(&[constant("A", "1")], b"payload1");
        let blob = writer.finish();

        assert_eq!(
            find_permutation_in_blob(&blob, &[constant("A", "0")]),
            Some(b"payload0".as_slice())
        );
        assert_eq!(
            find_permutation_in_blob(&blob, &[constant("A", "1")]),
            Some(b"payload1".as_slice())
        );
        assert_eq!(find_permutation_in_blob(&blob, &[constant("A", "2")]), None);
    }

    #[test]
    fn plain_blob_is_a_single_permutation() {
        let blob = b"raw spirv words";
        assert_eq!(find_permutation_in_blob(blob, &[]), Some(blob.as_slice()));
        assert_eq!(find_permutation_in_blob(blob, &[constant("A", "0")]), None);
    }

    #[test]
    fn truncated_entry_terminates_the_scan() {
        let mut writer = BlobWriter::new();
        writer.add_permutation(&[constant("A", "0")], b"payload0");
        let mut blob = writer.finish();
        blob.extend_from_slice(&100u32.to_le_bytes());
        blob.extend_from_slice(&100u32.to_le_bytes());
        // Header promises more bytes than exist; lookup must not panic.
        assert_eq!(find_permutation_in_blob(&blob, &[constant("A", "1")]), None);
        assert_eq!(enumerate_permutations_in_blob(&blob), vec!["A=0 ".to_string()]);
    }
}
