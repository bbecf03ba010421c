//! Document codec: Base64 → gzip → XML → [`FiscalDocument`]
//!
//! Each `docZip` entry of a distribution response carries one fiscal document
//! as Base64 text. The payload is normally gzip-compressed, but the service is
//! inconsistent about compressing small payloads, so decompression falls back
//! to the decoded bytes when they are not a gzip stream.
//!
//! Metadata is extracted through a fallback chain: every field has an ordered
//! list of candidate paths (full-document layout first, summary layout
//! second), and every path is tried with a namespaced lookup before a bare
//! one, since some payloads omit the NF-e namespace.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, FixedOffset, NaiveDate};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, trace};

use crate::error::DecodeError;
use crate::types::{AccessKey, Amount, DocumentKind, FiscalDocument, Nsu};
use crate::xml::{self, Element, Lookup};

/// Namespace of NF-e documents and of the distribution response body
pub const NFE_NAMESPACE: &str = "http://www.portalfiscal.inf.br/nfe";

/// Lookup strategies, tried in order for every candidate path
const STRATEGIES: [Lookup<'static>; 2] = [Lookup::Namespaced(NFE_NAMESPACE), Lookup::AnyNamespace];

type Paths = &'static [&'static [&'static str]];

const ACCESS_KEY: Paths = &[&["protNFe", "infProt", "chNFe"], &["chNFe"]];
const ISSUER_TAX_ID: Paths = &[&["emit", "CNPJ"], &["emit", "CPF"], &["CNPJ"], &["CPF"]];
const ISSUER_NAME: Paths = &[&["emit", "xNome"], &["xNome"]];
const NUMBER: Paths = &[&["ide", "nNF"]];
const SERIES: Paths = &[&["ide", "serie"]];
const ISSUED_AT: Paths = &[&["ide", "dhEmi"], &["dhEmi"], &["ide", "dEmi"]];
const GROSS: Paths = &[&["total", "ICMSTot", "vNF"], &["vNF"]];
const DISCOUNT: Paths = &[&["total", "ICMSTot", "vDesc"]];

/// One raw `docZip` entry of a distribution response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocZip {
    /// Cursor position of the entry (`NSU` attribute)
    pub nsu: Option<Nsu>,
    /// Schema of the embedded document (`schema` attribute)
    pub schema: Option<String>,
    /// Base64 text content
    pub content: String,
}

/// Decode a `docZip` entry, stamping its NSU and schema on the document
pub fn decode_entry(entry: &DocZip) -> Result<FiscalDocument, DecodeError> {
    let mut document = decode(&entry.content)?;
    document.nsu = entry.nsu;
    document.schema = entry.schema.clone();
    Ok(document)
}

/// Decode one Base64 document entry
pub fn decode(entry_base64: &str) -> Result<FiscalDocument, DecodeError> {
    let compact: String = entry_base64
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if compact.is_empty() {
        return Err(DecodeError::EmptyEntry);
    }

    let payload = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| DecodeError::Base64(e.to_string()))?;

    decode_xml(gunzip_or_raw(payload))
}

/// Build a [`FiscalDocument`] from an already-decompressed XML payload
pub fn decode_xml(raw_xml: Vec<u8>) -> Result<FiscalDocument, DecodeError> {
    let root = xml::parse(&raw_xml).map_err(DecodeError::Xml)?;
    let kind = classify(&root);

    let access_key = extract(&root, ACCESS_KEY)
        .and_then(|text| AccessKey::parse(text).ok())
        .or_else(|| access_key_from_id(&root))
        .ok_or(DecodeError::MissingAccessKey)?;

    let gross_amount = amount(&root, GROSS);
    let discount_amount = amount(&root, DISCOUNT);
    let net_amount = gross_amount
        .checked_sub(discount_amount)
        .ok_or(DecodeError::AmountOutOfRange)?;

    Ok(FiscalDocument {
        access_key,
        kind,
        issuer_tax_id: extract(&root, ISSUER_TAX_ID).unwrap_or_default().to_string(),
        issuer_name: extract(&root, ISSUER_NAME).unwrap_or_default().to_string(),
        number: extract(&root, NUMBER).unwrap_or_default().to_string(),
        series: extract(&root, SERIES).unwrap_or_default().to_string(),
        issued_at: extract(&root, ISSUED_AT).and_then(parse_issue_time),
        gross_amount,
        discount_amount,
        net_amount,
        nsu: None,
        schema: None,
        raw_xml,
    })
}

/// Encode an XML payload the way the service ships it: optionally gzip, then Base64
pub fn encode(xml: &[u8], compress: bool) -> std::io::Result<String> {
    if !compress {
        return Ok(STANDARD.encode(xml));
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(xml)?;
    Ok(STANDARD.encode(encoder.finish()?))
}

/// Summary when the root is an abbreviated record (`resNFe`, `resEvento`);
/// anything else (`nfeProc`, `NFe`, `procEventoNFe`) is complete as shipped
fn classify(root: &Element) -> DocumentKind {
    if root.name.starts_with("res") {
        DocumentKind::Summary
    } else {
        DocumentKind::Full
    }
}

fn gunzip_or_raw(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::new();
    let result = GzDecoder::new(payload.as_slice()).read_to_end(&mut out);
    match result {
        Ok(_) => out,
        Err(e) => {
            trace!(error = %e, "entry is not gzip-compressed, using raw payload");
            payload
        }
    }
}

fn extract<'a>(root: &'a Element, paths: Paths) -> Option<&'a str> {
    paths.iter().find_map(|path| {
        STRATEGIES
            .iter()
            .find_map(|lookup| root.find_text(path, *lookup))
    })
}

fn access_key_from_id(root: &Element) -> Option<AccessKey> {
    let id = STRATEGIES.iter().find_map(|lookup| {
        std::iter::once(root)
            .chain(root.descendants())
            .find(|el| el.matches("infNFe", *lookup))
            .and_then(|el| el.attribute("Id"))
    })?;
    AccessKey::parse(id.strip_prefix("NFe").unwrap_or(id)).ok()
}

fn amount(root: &Element, paths: Paths) -> Amount {
    match extract(root, paths) {
        Some(text) => Amount::parse(text).unwrap_or_else(|e| {
            debug!(value = text, error = %e, "unparseable amount, defaulting to zero");
            Amount::ZERO
        }),
        None => Amount::ZERO,
    }
}

fn parse_issue_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw).ok().or_else(|| {
        let date = NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()?;
        Some(date.and_hms_opt(0, 0, 0)?.and_utc().fixed_offset())
    })
}
