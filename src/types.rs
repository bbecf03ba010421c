//! Core types for sefaz-dfe

use chrono::{DateTime, FixedOffset, NaiveDate};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Number of digits in a serialized NSU
pub const NSU_DIGITS: usize = 15;

/// Number of digits in an NF-e access key
pub const ACCESS_KEY_DIGITS: usize = 44;

/// Unique sequential number (NSU): the server-assigned cursor position of an
/// identity's document feed
///
/// Always rendered as a 15-digit zero-padded decimal string.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Nsu(u64);

impl Nsu {
    /// The "from the beginning" sentinel, `000000000000000`
    pub const ZERO: Nsu = Nsu(0);

    const MAX: u64 = 999_999_999_999_999;

    /// Create an NSU from its numeric value
    pub fn new(value: u64) -> Result<Self> {
        if value > Self::MAX {
            return Err(Error::invalid("nsu", format!("{value} exceeds 15 digits")));
        }
        Ok(Self(value))
    }

    /// Numeric value of the cursor
    pub fn get(&self) -> u64 {
        self.0
    }

    /// Whether this is the zero sentinel
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl FromStr for Nsu {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.len() > NSU_DIGITS || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::invalid(
                "nsu",
                format!("expected 1 to {NSU_DIGITS} digits, got {s:?}"),
            ));
        }
        s.parse::<u64>()
            .map(Nsu)
            .map_err(|e| Error::invalid("nsu", e.to_string()))
    }
}

impl TryFrom<String> for Nsu {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Nsu> for String {
    fn from(nsu: Nsu) -> Self {
        nsu.to_string()
    }
}

impl fmt::Display for Nsu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:015}", self.0)
    }
}

/// Kind of taxpayer registration carried by a [`TaxId`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaxIdKind {
    /// Company registration, 14 digits
    Cnpj,
    /// Individual registration, 11 digits
    Cpf,
}

/// Digits-only CNPJ or CPF
///
/// Punctuation (`.`, `/`, `-`) and whitespace are stripped when parsing, so
/// `"49.091.246/0001-05"` and `"49091246000105"` are the same tax-id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaxId(String);

impl TaxId {
    /// Normalize and validate a tax-id
    pub fn parse(raw: &str) -> Result<Self> {
        let digits: String = raw
            .chars()
            .filter(|c| !matches!(c, '.' | '/' | '-') && !c.is_whitespace())
            .collect();

        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::invalid(
                "tax_id",
                format!("{raw:?} contains non-digit characters"),
            ));
        }
        match digits.len() {
            11 | 14 => Ok(Self(digits)),
            n => Err(Error::invalid(
                "tax_id",
                format!("expected 11 (CPF) or 14 (CNPJ) digits, got {n}"),
            )),
        }
    }

    /// CNPJ or CPF, by length
    pub fn kind(&self) -> TaxIdKind {
        if self.0.len() == 14 {
            TaxIdKind::Cnpj
        } else {
            TaxIdKind::Cpf
        }
    }

    /// The digits
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TaxId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TaxId> for String {
    fn from(id: TaxId) -> Self {
        id.0
    }
}

impl fmt::Display for TaxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// IBGE code of the state (UF) acting as the request author (`cUFAutor`)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct AuthorityCode(u8);

impl AuthorityCode {
    const KNOWN: [u8; 27] = [
        11, 12, 13, 14, 15, 16, 17, 21, 22, 23, 24, 25, 26, 27, 28, 29, 31, 32, 33, 35, 41, 42,
        43, 50, 51, 52, 53,
    ];

    /// Validate an IBGE state code
    pub fn new(code: u8) -> Result<Self> {
        if Self::KNOWN.contains(&code) {
            Ok(Self(code))
        } else {
            Err(Error::invalid(
                "authority_code",
                format!("{code} is not an IBGE state code"),
            ))
        }
    }

    /// Numeric code
    pub fn get(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for AuthorityCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<AuthorityCode> for u8 {
    fn from(code: AuthorityCode) -> Self {
        code.0
    }
}

impl FromStr for AuthorityCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let code = s
            .trim()
            .parse::<u8>()
            .map_err(|_| Error::invalid("authority_code", format!("{s:?} is not a number")))?;
        Self::new(code)
    }
}

impl fmt::Display for AuthorityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// The (tax-id, authority) pair that scopes every query: the tenant key of
/// the remote service
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// CNPJ or CPF of the interested party
    pub tax_id: TaxId,
    /// State code of the request author
    pub authority: AuthorityCode,
}

impl Identity {
    /// Create an identity from already-validated parts
    pub fn new(tax_id: TaxId, authority: AuthorityCode) -> Self {
        Self { tax_id, authority }
    }

    /// Parse both parts from caller input
    pub fn parse(tax_id: &str, authority: &str) -> Result<Self> {
        Ok(Self {
            tax_id: TaxId::parse(tax_id)?,
            authority: authority.parse()?,
        })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.tax_id, self.authority)
    }
}

/// 44-digit NF-e access key (`chNFe`), globally unique per fiscal document
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccessKey(String);

impl AccessKey {
    /// Validate a 44-digit access key
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.len() != ACCESS_KEY_DIGITS || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::invalid(
                "access_key",
                format!("expected {ACCESS_KEY_DIGITS} digits, got {raw:?}"),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    /// The digits
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// State code of the issuer (positions 1-2)
    pub fn state_code(&self) -> &str {
        &self.0[0..2]
    }

    /// Issuer CNPJ embedded in the key (positions 7-20)
    pub fn issuer_cnpj(&self) -> &str {
        &self.0[6..20]
    }

    /// Fiscal model, `55` for NF-e and `65` for NFC-e (positions 21-22)
    pub fn model(&self) -> &str {
        &self.0[20..22]
    }

    /// Whether the last digit matches the modulo-11 check digit of the first 43
    pub fn has_valid_check_digit(&self) -> bool {
        let digits = self.0.as_bytes();
        let mut weight = 2;
        let mut sum = 0u32;
        for b in digits[..ACCESS_KEY_DIGITS - 1].iter().rev() {
            sum += u32::from(b - b'0') * weight;
            weight = if weight == 9 { 2 } else { weight + 1 };
        }
        let expected = match sum % 11 {
            0 | 1 => 0,
            r => 11 - r,
        };
        u32::from(digits[ACCESS_KEY_DIGITS - 1] - b'0') == expected
    }
}

impl TryFrom<String> for AccessKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<AccessKey> for String {
    fn from(key: AccessKey) -> Self {
        key.0
    }
}

impl FromStr for AccessKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monetary amount in centavos
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    /// Zero reais
    pub const ZERO: Amount = Amount(0);

    /// Create an amount from centavos
    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Value in centavos
    pub fn cents(&self) -> i64 {
        self.0
    }

    /// `self - rhs`, or `None` on overflow
    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    /// Parse a decimal amount as written in NF-e XML (`"1234.56"`)
    ///
    /// More than two fractional digits are rounded half-up to the centavo.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (negative, unsigned) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));

        let valid = !int_part.is_empty()
            && int_part.bytes().all(|b| b.is_ascii_digit())
            && frac_part.bytes().all(|b| b.is_ascii_digit());
        if !valid {
            return Err(Error::invalid("amount", format!("{raw:?} is not a decimal")));
        }

        let reais: i64 = int_part
            .parse()
            .map_err(|_| Error::invalid("amount", format!("{raw:?} is out of range")))?;
        let frac = frac_part.as_bytes();
        let digit = |i: usize| frac.get(i).map_or(0, |b| i64::from(b - b'0'));
        let mut cents = digit(0) * 10 + digit(1);
        if digit(2) >= 5 {
            cents += 1;
        }

        let total = reais
            .checked_mul(100)
            .and_then(|v| v.checked_add(cents))
            .ok_or_else(|| Error::invalid("amount", format!("{raw:?} is out of range")))?;
        Ok(Self(if negative { -total } else { total }))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

/// Whether a decoded document is the abbreviated or the complete form
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    /// Abbreviated record (`resNFe`, `resEvento`); may be upgraded by key
    Summary,
    /// Complete document (`nfeProc`, `NFe`)
    Full,
}

impl DocumentKind {
    /// Stable lowercase name, as stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Summary => "summary",
            DocumentKind::Full => "full",
        }
    }
}

impl FromStr for DocumentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "summary" => Ok(DocumentKind::Summary),
            "full" => Ok(DocumentKind::Full),
            other => Err(Error::invalid(
                "document_kind",
                format!("unknown kind {other:?}"),
            )),
        }
    }
}

/// A fiscal document decoded from one `docZip` entry
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FiscalDocument {
    /// Globally unique access key; the natural dedup key
    pub access_key: AccessKey,
    /// Summary or full document
    pub kind: DocumentKind,
    /// Issuer CNPJ/CPF digits, empty when absent
    pub issuer_tax_id: String,
    /// Issuer legal name, empty when absent
    pub issuer_name: String,
    /// Document number (`nNF`), empty for summaries
    pub number: String,
    /// Document series, empty for summaries
    pub series: String,
    /// Issue timestamp (`dhEmi`)
    pub issued_at: Option<DateTime<FixedOffset>>,
    /// Gross amount (`vNF`)
    pub gross_amount: Amount,
    /// Discount amount (`vDesc`)
    pub discount_amount: Amount,
    /// Always `gross_amount - discount_amount`
    pub net_amount: Amount,
    /// Cursor position at which the document was retrieved
    pub nsu: Option<Nsu>,
    /// Schema name reported by the feed (e.g. `procNFe_v4.00.xsd`)
    pub schema: Option<String>,
    /// The decompressed XML payload
    #[serde(skip)]
    pub raw_xml: Vec<u8>,
}

impl FiscalDocument {
    /// Whether the document was issued between `start` and `end`, inclusive
    ///
    /// Documents without an issue date never match.
    pub fn issued_within(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.issued_at
            .map(|at| at.date_naive())
            .is_some_and(|date| start <= date && date <= end)
    }
}

/// Client-certificate identity for one [`Identity`]
///
/// The passphrase is only exposed by the transport while building the TLS
/// identity. `Debug` never prints either field.
pub struct Credential {
    certificate: Zeroizing<Vec<u8>>,
    passphrase: SecretString,
}

impl Credential {
    /// Wrap a PKCS#12 bundle and its (already decrypted) passphrase
    pub fn new(certificate: Vec<u8>, passphrase: SecretString) -> Self {
        Self {
            certificate: Zeroizing::new(certificate),
            passphrase,
        }
    }

    /// The PKCS#12 bundle
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    pub(crate) fn passphrase(&self) -> &SecretString {
        &self.passphrase
    }

    /// Short SHA-256 fingerprint of the bundle, safe to log
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.certificate.as_slice());
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("fingerprint", &self.fingerprint())
            .field("passphrase", &"[REDACTED]")
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn nsu_renders_fifteen_zero_padded_digits() {
        assert_eq!(Nsu::ZERO.to_string(), "000000000000000");
        assert_eq!(Nsu::new(42).unwrap().to_string(), "000000000000042");
        assert_eq!("42".parse::<Nsu>().unwrap(), Nsu::new(42).unwrap());
    }

    #[test]
    fn nsu_rejects_non_digits_and_overflow() {
        assert!("".parse::<Nsu>().is_err());
        assert!("12a".parse::<Nsu>().is_err());
        assert!("1234567890123456".parse::<Nsu>().is_err());
        assert!(Nsu::new(1_000_000_000_000_000).is_err());
    }

    #[test]
    fn nsu_serializes_as_padded_string() {
        let json = serde_json::to_string(&Nsu::new(7).unwrap()).unwrap();
        assert_eq!(json, "\"000000000000007\"");
        let back: Nsu = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(), 7);
    }

    #[test]
    fn tax_id_strips_punctuation() {
        let id = TaxId::parse("49.091.246/0001-05").unwrap();
        assert_eq!(id.as_str(), "49091246000105");
        assert_eq!(id.kind(), TaxIdKind::Cnpj);

        let cpf = TaxId::parse("123.456.789-09").unwrap();
        assert_eq!(cpf.kind(), TaxIdKind::Cpf);
    }

    #[test]
    fn tax_id_rejects_letters_and_bad_lengths() {
        assert!(TaxId::parse("49.091.246/0001-0X").is_err());
        assert!(TaxId::parse("1234567890").is_err());
        assert!(TaxId::parse("123456789012345").is_err());
    }

    #[test]
    fn authority_code_accepts_only_ibge_states() {
        assert_eq!(AuthorityCode::new(42).unwrap().to_string(), "42");
        assert!(AuthorityCode::new(10).is_err());
        assert!("99".parse::<AuthorityCode>().is_err());
        assert!("SC".parse::<AuthorityCode>().is_err());
    }

    #[test]
    fn identity_display_is_stable() {
        let identity = Identity::parse("49.091.246/0001-05", "42").unwrap();
        assert_eq!(identity.to_string(), "49091246000105@42");
    }

    #[test]
    fn access_key_parts_and_check_digit() {
        let key = AccessKey::parse("42241012345678000195550010000012341123456789").unwrap();
        assert_eq!(key.state_code(), "42");
        assert_eq!(key.issuer_cnpj(), "12345678000195");
        assert_eq!(key.model(), "55");
        assert!(key.has_valid_check_digit());

        let tampered = AccessKey::parse("42241012345678000195550010000012341123456788").unwrap();
        assert!(!tampered.has_valid_check_digit());
    }

    #[test]
    fn access_key_requires_44_digits() {
        assert!(AccessKey::parse("4224101234567800019555001000001234112345678").is_err());
        assert!(AccessKey::parse("NFe42241012345678000195550010000012341123456789").is_err());
    }

    #[test]
    fn amount_parses_nfe_decimals() {
        assert_eq!(Amount::parse("1234.56").unwrap().cents(), 123_456);
        assert_eq!(Amount::parse("10").unwrap().cents(), 1_000);
        assert_eq!(Amount::parse("0.5").unwrap().cents(), 50);
        assert_eq!(Amount::parse("1.005").unwrap().cents(), 101);
        assert_eq!(Amount::parse("-2.10").unwrap().cents(), -210);
        assert!(Amount::parse("1,50").is_err());
        assert!(Amount::parse("").is_err());
    }

    #[test]
    fn amount_display_and_subtraction() {
        let net = Amount::from_cents(150_000).checked_sub(Amount::from_cents(2_550)).unwrap();
        assert_eq!(net.to_string(), "1474.50");
        let negative = Amount::ZERO.checked_sub(Amount::from_cents(5)).unwrap();
        assert_eq!(negative.to_string(), "-0.05");
        assert_eq!(Amount::from_cents(i64::MAX).checked_sub(Amount::from_cents(-1)), None);
    }

    #[test]
    fn credential_debug_is_redacted() {
        let credential = Credential::new(b"pkcs12-bytes".to_vec(), SecretString::from("hunter2".to_string()));
        let debug = format!("{credential:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
        assert_eq!(credential.fingerprint().len(), 16);
    }

    proptest! {
        #[test]
        fn nsu_display_parse_is_identity(value in 0u64..=999_999_999_999_999) {
            let nsu = Nsu::new(value).unwrap();
            let text = nsu.to_string();
            prop_assert_eq!(text.len(), NSU_DIGITS);
            prop_assert_eq!(text.parse::<Nsu>().unwrap(), nsu);
        }

        #[test]
        fn nsu_order_matches_numeric_order(a in 0u64..1_000_000, b in 0u64..1_000_000) {
            let (na, nb) = (Nsu::new(a).unwrap(), Nsu::new(b).unwrap());
            prop_assert_eq!(na.cmp(&nb), a.cmp(&b));
            prop_assert_eq!(na.to_string().cmp(&nb.to_string()), a.cmp(&b));
        }

        #[test]
        fn amount_display_parses_back(cents in -10_000_000i64..10_000_000) {
            let amount = Amount::from_cents(cents);
            prop_assert_eq!(Amount::parse(&amount.to_string()).unwrap(), amount);
        }
    }
}
