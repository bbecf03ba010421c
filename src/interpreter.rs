//! Response interpreter: classifies a raw distribution response
//!
//! The service answers every query with a `retDistDFeInt` element carrying a
//! status code (`cStat`), a message (`xMotivo`), the two cursor values and
//! up to 50 `docZip` entries. Status `138` is success; `656` is overloaded
//! by the service to mean either "no documents" or "rate limited"
//! ("Consumo Indevido"), and only the free-text message tells them apart.

use tracing::{debug, error, warn};

use crate::codec::{self, DocZip};
use crate::error::{DecodeError, Error};
use crate::types::{FiscalDocument, Nsu};
use crate::xml::{self, Element, Lookup};

/// Success status code
pub const STATUS_SUCCESS: &str = "138";

/// Overloaded "no documents" / "rate limited" status code
pub const STATUS_NO_DOCUMENTS_OR_RATE_LIMITED: &str = "656";

/// Wording of the 656 message that indicates rate limiting
pub const RATE_LIMIT_MARKER: &str = "consumo indevido";

/// Result of interpreting one response
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// Status 138; entries keep per-document decode results in feed order
    Success {
        /// Decoded documents and per-entry decode failures
        entries: Vec<Result<FiscalDocument, DecodeError>>,
        /// Cursor to resume from
        last_nsu: Nsu,
        /// Highest cursor currently available
        max_nsu: Nsu,
    },
    /// Status 656 without rate-limit wording: nothing new to fetch
    Empty {
        /// Reported resume cursor, if any
        last_nsu: Option<Nsu>,
        /// Reported highest cursor, if any
        max_nsu: Option<Nsu>,
        /// Raw status message
        message: String,
    },
    /// Status 656 with "Consumo Indevido": back off, but persist the cursors
    RateLimited {
        /// Reported resume cursor, if any
        last_nsu: Option<Nsu>,
        /// Reported highest cursor, if any
        max_nsu: Option<Nsu>,
        /// Raw status message
        message: String,
    },
    /// Anything else
    Failure(QueryFailure),
}

impl QueryOutcome {
    /// Cursor values the caller must persist, if the outcome carries any
    pub fn cursors(&self) -> (Option<Nsu>, Option<Nsu>) {
        match self {
            QueryOutcome::Success {
                last_nsu, max_nsu, ..
            } => (Some(*last_nsu), Some(*max_nsu)),
            QueryOutcome::Empty {
                last_nsu, max_nsu, ..
            }
            | QueryOutcome::RateLimited {
                last_nsu, max_nsu, ..
            } => (*last_nsu, *max_nsu),
            QueryOutcome::Failure(_) => (None, None),
        }
    }

    /// Successfully decoded documents of a `Success` outcome
    pub fn documents(&self) -> impl Iterator<Item = &FiscalDocument> {
        let entries: &[Result<FiscalDocument, DecodeError>] = match self {
            QueryOutcome::Success { entries, .. } => entries,
            _ => &[],
        };
        entries.iter().filter_map(|entry| entry.as_ref().ok())
    }
}

/// A response that could not be turned into documents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryFailure {
    /// The service rejected the request with a status code
    Remote {
        /// `cStat`
        status_code: String,
        /// `xMotivo`, verbatim
        message: String,
    },
    /// The response was not a recognizable distribution envelope
    Parse {
        /// What was wrong with it
        message: String,
    },
}

impl From<QueryFailure> for Error {
    fn from(failure: QueryFailure) -> Self {
        match failure {
            QueryFailure::Remote {
                status_code,
                message,
            } => Error::RemoteStatus {
                code: status_code,
                message,
            },
            QueryFailure::Parse { message } => Error::EnvelopeParse(message),
        }
    }
}

/// Interpret a raw response body
pub fn interpret(raw: &[u8]) -> QueryOutcome {
    let root = match xml::parse(raw) {
        Ok(root) => root,
        Err(e) => return parse_failure(format!("response is not well-formed XML: {e}")),
    };

    let ret = if root.name == "retDistDFeInt" {
        &root
    } else {
        match root.find(&["retDistDFeInt"], Lookup::AnyNamespace) {
            Some(ret) => ret,
            None => return parse_failure("response has no retDistDFeInt element".to_string()),
        }
    };

    let Some(status) = child_text(ret, "cStat") else {
        return parse_failure("response has no cStat".to_string());
    };
    let message = child_text(ret, "xMotivo").unwrap_or_default().to_string();
    let last_nsu = cursor(ret, "ultNSU");
    let max_nsu = cursor(ret, "maxNSU");

    debug!(
        status,
        message = %message,
        ult_nsu = ?last_nsu,
        max_nsu = ?max_nsu,
        "distribution response"
    );

    match status {
        STATUS_SUCCESS => {
            let (Some(Ok(last_nsu)), Some(Ok(max_nsu))) = (last_nsu, max_nsu) else {
                return parse_failure(format!(
                    "success response without valid cursors (ultNSU={:?}, maxNSU={:?})",
                    child_text(ret, "ultNSU"),
                    child_text(ret, "maxNSU"),
                ));
            };
            let entries = doc_zips(ret)
                .iter()
                .map(|entry| {
                    codec::decode_entry(entry).inspect_err(|e| {
                        warn!(nsu = ?entry.nsu, schema = ?entry.schema, error = %e, "skipping undecodable entry");
                    })
                })
                .collect();
            QueryOutcome::Success {
                entries,
                last_nsu,
                max_nsu,
            }
        }
        STATUS_NO_DOCUMENTS_OR_RATE_LIMITED => {
            let last_nsu = last_nsu.and_then(Result::ok);
            let max_nsu = max_nsu.and_then(Result::ok);
            if message.to_lowercase().contains(RATE_LIMIT_MARKER) {
                warn!(status, message = %message, "rate limited by SEFAZ");
                QueryOutcome::RateLimited {
                    last_nsu,
                    max_nsu,
                    message,
                }
            } else {
                debug!(status, message = %message, "no documents available");
                QueryOutcome::Empty {
                    last_nsu,
                    max_nsu,
                    message,
                }
            }
        }
        other => {
            error!(status = other, message = %message, "SEFAZ rejected the request");
            QueryOutcome::Failure(QueryFailure::Remote {
                status_code: other.to_string(),
                message,
            })
        }
    }
}

fn parse_failure(message: String) -> QueryOutcome {
    error!(%message, "malformed distribution response");
    QueryOutcome::Failure(QueryFailure::Parse { message })
}

fn child_text<'a>(ret: &'a Element, name: &str) -> Option<&'a str> {
    ret.find_text(&[name], Lookup::AnyNamespace)
}

fn cursor(ret: &Element, name: &str) -> Option<Result<Nsu, Error>> {
    child_text(ret, name).map(str::parse)
}

fn doc_zips(ret: &Element) -> Vec<DocZip> {
    ret.find_all("docZip", Lookup::AnyNamespace)
        .into_iter()
        .map(|el| DocZip {
            nsu: el.attribute("NSU").and_then(|n| n.parse().ok()),
            schema: el.attribute("schema").map(str::to_string),
            content: el.text().to_string(),
        })
        .collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::types::DocumentKind;

    pub(crate) const KEY_A: &str = "42241012345678000195550010000012341123456789";
    pub(crate) const KEY_B: &str = "35241055555555000130550020000000421876543219";

    pub(crate) fn summary_xml(key: &str) -> String {
        format!(
            r#"<resNFe xmlns="http://www.portalfiscal.inf.br/nfe" versao="1.01"><chNFe>{key}</chNFe><CNPJ>12345678000195</CNPJ><xNome>Fornecedor</xNome><dhEmi>2024-10-01T09:30:00-03:00</dhEmi><vNF>100.00</vNF></resNFe>"#
        )
    }

    pub(crate) fn full_xml(key: &str) -> String {
        format!(
            r#"<nfeProc xmlns="http://www.portalfiscal.inf.br/nfe" versao="4.00"><NFe><infNFe Id="NFe{key}"><ide><serie>1</serie><nNF>77</nNF><dhEmi>2024-10-02T10:00:00-03:00</dhEmi></ide><emit><CNPJ>12345678000195</CNPJ><xNome>Fornecedor</xNome></emit><total><ICMSTot><vDesc>5.00</vDesc><vNF>105.00</vNF></ICMSTot></total></infNFe></NFe><protNFe><infProt><chNFe>{key}</chNFe></infProt></protNFe></nfeProc>"#
        )
    }

    pub(crate) fn doc_zip(nsu: u64, xml: &str) -> String {
        format!(
            r#"<docZip NSU="{:015}" schema="resNFe_v1.01.xsd">{}</docZip>"#,
            nsu,
            encode(xml.as_bytes(), true).unwrap()
        )
    }

    /// A complete SOAP response around `retDistDFeInt`
    pub(crate) fn response(status: &str, motive: &str, cursors: Option<(u64, u64)>, docs: &str) -> Vec<u8> {
        let cursors = cursors
            .map(|(ult, max)| format!("<ultNSU>{ult:015}</ultNSU><maxNSU>{max:015}</maxNSU>"))
            .unwrap_or_default();
        let lote = if docs.is_empty() {
            String::new()
        } else {
            format!("<loteDistDFeInt>{docs}</loteDistDFeInt>")
        };
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
  <soap:Body>
    <nfeDistDFeInteresseResponse xmlns="http://www.portalfiscal.inf.br/nfe/wsdl/NFeDistribuicaoDFe">
      <nfeDistDFeInteresseResult>
        <retDistDFeInt xmlns="http://www.portalfiscal.inf.br/nfe" versao="1.01">
          <tpAmb>1</tpAmb><verAplic>1.7.6</verAplic>
          <cStat>{status}</cStat><xMotivo>{motive}</xMotivo>
          <dhResp>2024-10-05T12:00:00-03:00</dhResp>
          {cursors}{lote}
        </retDistDFeInt>
      </nfeDistDFeInteresseResult>
    </nfeDistDFeInteresseResponse>
  </soap:Body>
</soap:Envelope>"#
        )
        .into_bytes()
    }

    #[test]
    fn success_decodes_every_entry_in_order() {
        let docs = format!("{}{}", doc_zip(41, &summary_xml(KEY_A)), doc_zip(42, &full_xml(KEY_B)));
        let outcome = interpret(&response("138", "Documento(s) localizado(s)", Some((42, 42)), &docs));

        let QueryOutcome::Success {
            entries,
            last_nsu,
            max_nsu,
        } = outcome
        else {
            panic!("expected success");
        };
        assert_eq!(last_nsu.to_string(), "000000000000042");
        assert_eq!(max_nsu.to_string(), "000000000000042");
        assert_eq!(entries.len(), 2);

        let first = entries[0].as_ref().unwrap();
        assert_eq!(first.access_key.as_str(), KEY_A);
        assert_eq!(first.kind, DocumentKind::Summary);
        assert_eq!(first.nsu, Some(Nsu::new(41).unwrap()));

        let second = entries[1].as_ref().unwrap();
        assert_eq!(second.access_key.as_str(), KEY_B);
        assert_eq!(second.kind, DocumentKind::Full);
    }

    #[test]
    fn undecodable_entry_is_kept_as_error_without_aborting() {
        let docs = format!(
            "{}<docZip NSU=\"000000000000002\" schema=\"resNFe_v1.01.xsd\">!!!</docZip>",
            doc_zip(1, &summary_xml(KEY_A))
        );
        let outcome = interpret(&response("138", "ok", Some((2, 9)), &docs));

        let QueryOutcome::Success { entries, .. } = &outcome else {
            panic!("expected success");
        };
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_ok());
        assert!(matches!(entries[1], Err(DecodeError::Base64(_))));
        assert_eq!(outcome.documents().count(), 1);
    }

    #[test]
    fn consumo_indevido_is_rate_limited_with_cursors() {
        let outcome = interpret(&response(
            "656",
            "Rejeicao: Consumo Indevido (Deve ser aguardado 1 hora para efetuar nova solicitacao)",
            Some((123, 456)),
            "",
        ));

        match &outcome {
            QueryOutcome::RateLimited {
                last_nsu, max_nsu, ..
            } => {
                assert_eq!(*last_nsu, Some(Nsu::new(123).unwrap()));
                assert_eq!(*max_nsu, Some(Nsu::new(456).unwrap()));
            }
            other => panic!("expected rate limited, got {other:?}"),
        }
        assert_eq!(
            outcome.cursors(),
            (Some(Nsu::new(123).unwrap()), Some(Nsu::new(456).unwrap()))
        );
    }

    #[test]
    fn rate_limit_marker_is_case_insensitive_and_cursors_optional() {
        let outcome = interpret(&response("656", "CONSUMO INDEVIDO", None, ""));
        assert_eq!(
            outcome,
            QueryOutcome::RateLimited {
                last_nsu: None,
                max_nsu: None,
                message: "CONSUMO INDEVIDO".to_string(),
            }
        );
    }

    #[test]
    fn other_656_messages_are_empty() {
        let outcome = interpret(&response("656", "Nenhum documento localizado", Some((7, 7)), ""));
        assert!(matches!(
            outcome,
            QueryOutcome::Empty { last_nsu: Some(n), .. } if n.get() == 7
        ));
    }

    #[test]
    fn unknown_status_is_a_remote_failure() {
        let outcome = interpret(&response("200", "whatever", None, ""));
        assert_eq!(
            outcome,
            QueryOutcome::Failure(QueryFailure::Remote {
                status_code: "200".to_string(),
                message: "whatever".to_string(),
            })
        );

        let error: Error = QueryFailure::Remote {
            status_code: "589".to_string(),
            message: "Rejeicao: NSU superior".to_string(),
        }
        .into();
        assert!(matches!(error, Error::RemoteStatus { .. }));
    }

    #[test]
    fn malformed_responses_are_parse_failures() {
        for raw in [
            b"<html><body>Service Unavailable</body></html>".to_vec(),
            b"not xml".to_vec(),
            response("", "no status", None, ""),
        ] {
            assert!(
                matches!(interpret(&raw), QueryOutcome::Failure(QueryFailure::Parse { .. })),
                "raw: {}",
                String::from_utf8_lossy(&raw)
            );
        }
    }

    #[test]
    fn success_without_cursors_is_a_parse_failure() {
        let outcome = interpret(&response("138", "ok", None, ""));
        assert!(matches!(outcome, QueryOutcome::Failure(QueryFailure::Parse { .. })));
    }

    #[test]
    fn bare_ret_element_is_accepted() {
        let raw = b"<retDistDFeInt><cStat>656</cStat><xMotivo>Nenhum documento</xMotivo></retDistDFeInt>";
        assert!(matches!(interpret(raw), QueryOutcome::Empty { .. }));
    }

    #[test]
    fn success_with_zero_entries_is_still_success() {
        let outcome = interpret(&response("138", "ok", Some((5, 5)), ""));
        assert!(matches!(outcome, QueryOutcome::Success { ref entries, .. } if entries.is_empty()));
    }
}
