//! Quick inspection of payment strings.
//!
//! Reads the amount out of a bolt11 invoice's human-readable part and
//! recognizes bolt12 offers, without decoding the tagged fields. Also turns
//! an LNURL back into the URL it wraps.

use thiserror::Error;

use crate::bech32::{self as codec, Bech32Error, Variant};

/// Millisatoshis per bitcoin.
const MSAT_PER_BTC: u64 = 100_000_000_000;

/// Currency prefixes of bolt11 invoices, longest first.
const INVOICE_PREFIXES: &[&str] = &["lnbcrt", "lntbs", "lntb", "lnbc", "lni"];

/// Prefix of a bolt12 offer.
const OFFER_PREFIX: &str = "lno1";

/// Amount requested by an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceAmount {
    /// Fixed amount in millisatoshis.
    Amount(u64),
    /// Payer chooses the amount.
    Any,
}

/// What kind of payment string was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeType {
    /// A bolt12 offer; the amount is negotiated later.
    Offer,
    /// A bolt11 invoice.
    Invoice(InvoiceAmount),
}

#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error("not a lightning invoice or offer")]
    UnknownPrefix,

    #[error("invalid amount {0:?}")]
    InvalidAmount(String),

    #[error("amount overflows")]
    Overflow,

    #[error(transparent)]
    Bech32(#[from] Bech32Error),

    #[error("lnurl does not contain UTF-8: {0}")]
    NotUtf8(#[from] std::string::FromUtf8Error),
}

/// Identify `s` and read its amount.
///
/// Only the prefix and human-readable part are inspected; the checksum is
/// not verified. Use [`validate_invoice`] before paying.
pub fn parse_invoice(s: &str) -> Result<DecodeType, InvoiceError> {
    let s = s.trim().to_ascii_lowercase();
    let s = s.strip_prefix("lightning:").unwrap_or(&s);

    if s.starts_with(OFFER_PREFIX) {
        return Ok(DecodeType::Offer);
    }

    let prefix = INVOICE_PREFIXES
        .iter()
        .find(|p| s.starts_with(**p))
        .ok_or(InvoiceError::UnknownPrefix)?;

    // The human-readable part ends at the last separator.
    let hrp = match s.rfind('1') {
        Some(pos) if pos >= prefix.len() => &s[..pos],
        _ => return Err(InvoiceError::UnknownPrefix),
    };
    let amount = &hrp[prefix.len()..];

    if amount.is_empty() {
        return Ok(DecodeType::Invoice(InvoiceAmount::Any));
    }
    parse_amount(amount).map(|msat| DecodeType::Invoice(InvoiceAmount::Amount(msat)))
}

/// Convert a bolt11 amount (`<digits>[m|u|n|p]`) to millisatoshis.
fn parse_amount(amount: &str) -> Result<u64, InvoiceError> {
    let invalid = || InvoiceError::InvalidAmount(amount.to_string());

    let (digits, multiplier) = match amount.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&amount[..i], Some(c)),
        _ => (amount, None),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let n: u64 = digits.parse().map_err(|_| InvoiceError::Overflow)?;

    let msat = match multiplier {
        None => n.checked_mul(MSAT_PER_BTC),
        Some('m') => n.checked_mul(MSAT_PER_BTC / 1_000),
        Some('u') => n.checked_mul(MSAT_PER_BTC / 1_000_000),
        Some('n') => n.checked_mul(MSAT_PER_BTC / 1_000_000_000),
        // Pico-bitcoin is a tenth of a millisatoshi.
        Some('p') => {
            if n % 10 != 0 {
                return Err(invalid());
            }
            Some(n / 10)
        }
        Some(_) => return Err(invalid()),
    };
    msat.ok_or(InvoiceError::Overflow)
}

/// Check that `s` is a well-formed, checksummed invoice or offer.
pub fn validate_invoice(s: &str) -> Result<DecodeType, InvoiceError> {
    let kind = parse_invoice(s)?;
    let trimmed = s.trim();
    let bare = trimmed
        .strip_prefix("lightning:")
        .or_else(|| trimmed.strip_prefix("LIGHTNING:"))
        .unwrap_or(trimmed);
    codec::decode(bare)?;
    Ok(kind)
}

/// Decode an `lnurl1...` string into the URL it carries.
pub fn decode_lnurl(s: &str) -> Result<String, InvoiceError> {
    let decoded = codec::decode_with_hrp(s.trim(), "lnurl")?;
    if decoded.variant != Variant::Bech32 {
        tracing::debug!("lnurl encoded as {}", decoded.variant);
    }
    Ok(String::from_utf8(decoded.bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    // BOLT #11 test vectors.
    const DONATION: &str = "lnbc1pvjluezsp5zyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zygspp5qqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqypqdpl2pkx2ctnv5sxxmmwwd5kgetjypeh2ursdae8g6twvus8g6rfwvs8qun0dfjkxaq9qrsgq357wnc5r2ueh7ck6q93dj32dlqnls087fxdwk8qakdyafkq3yap9us6v52vjjsrvywa6rt52cm9r9zqt8r2t7mlcwspyetp5h2tztugp9lfyql";
    const COFFEE: &str = "lnbc2500u1pvjluezsp5zyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zygspp5qqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqypqdq5xysxxatsyp3k7enxv4jsxqzpu9qrsgquk0rl77nj30yxdy8j9vdx85fkpmdla2087ne0xh8nhedh8w27kyke0lp53ut353s06fv3qfegext0eh0ymjpf39tuven09sam30g4vgpfna3rh";

    #[test]
    fn test_amountless_invoice() {
        assert_eq!(
            parse_invoice(DONATION).unwrap(),
            DecodeType::Invoice(InvoiceAmount::Any)
        );
    }

    #[test]
    fn test_micro_amount() {
        // 2500 uBTC = 250,000 sat.
        assert_eq!(
            parse_invoice(COFFEE).unwrap(),
            DecodeType::Invoice(InvoiceAmount::Amount(250_000_000))
        );
    }

    #[test]
    fn test_multipliers() {
        assert_eq!(parse_amount("20m").unwrap(), 2_000_000_000);
        assert_eq!(parse_amount("1u").unwrap(), 100_000);
        assert_eq!(parse_amount("10n").unwrap(), 1_000);
        assert_eq!(parse_amount("10p").unwrap(), 1);
        assert_eq!(parse_amount("1").unwrap(), MSAT_PER_BTC);
    }

    #[test]
    fn test_bad_amounts() {
        assert!(parse_amount("15p").is_err());
        assert!(parse_amount("u").is_err());
        assert!(parse_amount("1x").is_err());
        assert!(parse_amount("1.5m").is_err());
        assert!(matches!(
            parse_amount("99999999999999999999"),
            Err(InvoiceError::Overflow)
        ));
        assert!(matches!(parse_amount("999999999"), Err(InvoiceError::Overflow)));
    }

    #[test]
    fn test_offer_and_prefixes() {
        assert_eq!(parse_invoice("lno1qcp4256ypq").unwrap(), DecodeType::Offer);
        assert_eq!(
            parse_invoice("LIGHTNING:LNBC20M1PVJLUEZ").unwrap(),
            DecodeType::Invoice(InvoiceAmount::Amount(2_000_000_000))
        );
        assert_eq!(
            parse_invoice("lnbcrt5u1pjq").unwrap(),
            DecodeType::Invoice(InvoiceAmount::Amount(500_000))
        );
        assert!(matches!(
            parse_invoice("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"),
            Err(InvoiceError::UnknownPrefix)
        ));
    }

    #[test]
    fn test_validate_checks_checksum() {
        let invoice = codec::encode("lnbc2500u", &[7u8; 40], Variant::Bech32).unwrap();
        assert_eq!(
            validate_invoice(&invoice).unwrap(),
            DecodeType::Invoice(InvoiceAmount::Amount(250_000_000))
        );

        let mut corrupted = invoice.clone();
        let last = corrupted.pop().unwrap();
        corrupted.push(if last == 'q' { 'p' } else { 'q' });
        assert!(matches!(
            validate_invoice(&corrupted),
            Err(InvoiceError::Bech32(_))
        ));
    }

    #[test]
    fn test_decode_lnurl() {
        let url = "https://service.com/api?q=3fc3645b439ce8e7f2553a69e5267081d96dcd340693afabe04be7b0ccd178df";
        let lnurl = codec::encode("lnurl", url.as_bytes(), Variant::Bech32)
            .unwrap()
            .to_uppercase();
        assert_eq!(decode_lnurl(&lnurl).unwrap(), url);
        assert!(decode_lnurl("lnurl1qqqqqq").is_err());
    }
}
