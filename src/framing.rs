//! Hex framing used by Profile B's socket data commands: payload bytes are
//! carried as an uppercase hex string, but the `<size>` field that precedes
//! it in the AT command is the *unencoded* byte length, not the length of
//! the hex string.

/// Uppercase-hex-encode `data`, and return the length to put in the `<size>`
/// field alongside it.
#[must_use]
pub fn encode(data: &[u8]) -> (usize, String) {
    (data.len(), hex::encode_upper(data))
}

/// Decode a hex string back to bytes. Accepts either case; the modem always
/// sends uppercase but nothing requires it.
pub fn decode(hex_str: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(hex_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let data = b"hello";
        let (size, encoded) = encode(data);
        assert_eq!(size, 5);
        assert_eq!(encoded, "68656C6C6F");
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_size_is_byte_length_not_hex_length() {
        let data = [0u8; 100];
        let (size, encoded) = encode(&data);
        assert_eq!(size, 100);
        assert_eq!(encoded.len(), 200);
    }

    #[test]
    fn test_empty_payload() {
        let (size, encoded) = encode(&[]);
        assert_eq!(size, 0);
        assert_eq!(encoded, "");
        assert_eq!(decode(&encoded).unwrap(), Vec::<u8>::new());
    }
}
