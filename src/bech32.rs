//! Bech32 and Bech32m strings.
//!
//! Thin layer over the `bech32` crate that reports which checksum variant
//! matched and exposes both the raw 5-bit groups and the regrouped bytes.
//! Lightning strings (invoices, offers, LNURLs) are longer than the 90
//! characters segwit addresses allow, so only the checksum's own code length
//! limit applies.

use std::iter::Empty;

use ::bech32::primitives::decode::{CheckedHrpstring, CheckedHrpstringError};
use ::bech32::{Bech32, Bech32m, Fe32, Hrp};
use thiserror::Error;

/// Checksum constant that validated a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// BIP-173, used by bolt11 invoices and LNURLs.
    Bech32,
    /// BIP-350, used by bolt12 offers and invoices.
    Bech32m,
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Variant::Bech32 => f.write_str("bech32"),
            Variant::Bech32m => f.write_str("bech32m"),
        }
    }
}

/// Errors from decoding or encoding.
#[derive(Debug, Error)]
pub enum Bech32Error {
    /// Bad characters, mixed case, missing separator, or checksum mismatch.
    #[error(transparent)]
    Decode(#[from] CheckedHrpstringError),

    #[error(transparent)]
    Encode(#[from] ::bech32::EncodeError),

    #[error("invalid human-readable part: {0}")]
    Hrp(#[from] ::bech32::primitives::hrp::Error),

    /// Decoded fine, but under a different prefix than expected.
    #[error("expected prefix {expected:?}, found {found:?}")]
    UnexpectedHrp { expected: String, found: String },
}

/// A successfully decoded string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Lower-cased human-readable part.
    pub hrp: String,
    /// Data part as 5-bit values, checksum removed.
    pub data: Vec<u8>,
    /// Data regrouped into bytes, trailing padding bits dropped.
    pub bytes: Vec<u8>,
    pub variant: Variant,
}

/// Decode `s`, accepting either checksum variant.
///
/// A string whose checksum matches neither variant is an error; it is never
/// returned with partially trusted data.
pub fn decode(s: &str) -> Result<Decoded, Bech32Error> {
    let (checked, variant) = match CheckedHrpstring::new::<Bech32m>(s) {
        Ok(checked) => (checked, Variant::Bech32m),
        Err(_) => (CheckedHrpstring::new::<Bech32>(s)?, Variant::Bech32),
    };

    // The type parameter of `fe32_iter` is unused by the crate.
    let data = checked.fe32_iter::<Empty<u8>>().map(Fe32::to_u8).collect();

    Ok(Decoded {
        hrp: checked.hrp().as_str().to_ascii_lowercase(),
        data,
        bytes: checked.byte_iter().collect(),
        variant,
    })
}

/// Decode `s` and require its prefix to be `expected`.
pub fn decode_with_hrp(s: &str, expected: &str) -> Result<Decoded, Bech32Error> {
    let decoded = decode(s)?;
    if decoded.hrp != expected {
        return Err(Bech32Error::UnexpectedHrp {
            expected: expected.to_string(),
            found: decoded.hrp,
        });
    }
    Ok(decoded)
}

/// Encode `bytes` under `hrp` in lower case.
pub fn encode(hrp: &str, bytes: &[u8], variant: Variant) -> Result<String, Bech32Error> {
    let hrp = Hrp::parse(hrp)?;
    let encoded = match variant {
        Variant::Bech32 => ::bech32::encode::<Bech32>(hrp, bytes)?,
        Variant::Bech32m => ::bech32::encode::<Bech32m>(hrp, bytes)?,
    };
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_checksums() {
        for s in [
            "A12UEL5L",
            "a12uel5l",
            "abcdef1qpzry9x8gf2tvdw0s3jn54khce6mua7lmqqqxw",
            "split1checkupstagehandshakeupstreamerranterredcaperred2y9e3w",
        ] {
            let decoded = decode(s).unwrap();
            assert_eq!(decoded.variant, Variant::Bech32, "{}", s);
        }
    }

    #[test]
    fn test_bech32m_detected() {
        let decoded = decode("abcdef1l7aum6echk45nj3s0wdvt2fg8x9yrzpqzd3ryx").unwrap();
        assert_eq!(decoded.variant, Variant::Bech32m);
        assert_eq!(decoded.hrp, "abcdef");
        assert_eq!(decoded.data.len(), 32);
        assert_eq!(decoded.data[0], 31);
    }

    #[test]
    fn test_data_values() {
        let decoded = decode("abcdef1qpzry9x8gf2tvdw0s3jn54khce6mua7lmqqqxw").unwrap();
        assert_eq!(decoded.hrp, "abcdef");
        assert_eq!(decoded.data, (0u8..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_invalid_checksum_rejected() {
        // Last character flipped.
        assert!(decode("abcdef1qpzry9x8gf2tvdw0s3jn54khce6mua7lmqqqxx").is_err());
        assert!(decode("a12uel5m").is_err());
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(decode("A12uEL5L").is_err(), "mixed case");
        assert!(decode("pzry9x0s0muk").is_err(), "no separator");
        assert!(decode("1pzry9x0s0muk").is_err(), "empty hrp");
        assert!(decode("x1b4n0q5v").is_err(), "invalid data character");
        assert!(decode("li1dgmt3").is_err(), "checksum too short");
    }

    #[test]
    fn test_encode_decode_bytes() {
        let bytes = b"https://example.com/lnurl";
        for variant in [Variant::Bech32, Variant::Bech32m] {
            let encoded = encode("lnurl", bytes, variant).unwrap();
            assert!(encoded.starts_with("lnurl1"));

            let decoded = decode(&encoded).unwrap();
            assert_eq!(decoded.variant, variant);
            assert_eq!(decoded.bytes, bytes);
        }
    }

    #[test]
    fn test_decode_with_hrp() {
        let encoded = encode("lnurl", b"x", Variant::Bech32).unwrap();
        assert!(decode_with_hrp(&encoded, "lnurl").is_ok());
        assert!(matches!(
            decode_with_hrp(&encoded, "lno"),
            Err(Bech32Error::UnexpectedHrp { .. })
        ));
    }

    #[test]
    fn test_long_strings_allowed() {
        let bytes = vec![0xabu8; 200];
        let encoded = encode("lnbc", &bytes, Variant::Bech32).unwrap();
        assert!(encoded.len() > 90);
        assert_eq!(decode(&encoded).unwrap().bytes, bytes);
    }

    #[test]
    fn test_data_and_bytes_agree() {
        use ::bech32::ByteIterExt;

        let bytes = [0xffu8, 0x00, 0x5a];
        let decoded = decode(&encode("lnurl", &bytes, Variant::Bech32).unwrap()).unwrap();
        let expected: Vec<u8> = bytes.iter().copied().bytes_to_fes().map(Fe32::to_u8).collect();
        assert_eq!(decoded.data, expected);
        assert_eq!(decoded.data.len(), 5);
        assert_eq!(decoded.bytes, bytes);
    }

    #[test]
    fn test_uppercase_data_decodes() {
        let lower = decode("abcdef1qpzry9x8gf2tvdw0s3jn54khce6mua7lmqqqxw").unwrap();
        let upper = decode("ABCDEF1QPZRY9X8GF2TVDW0S3JN54KHCE6MUA7LMQQQXW").unwrap();
        assert_eq!(lower, upper);
    }
}
