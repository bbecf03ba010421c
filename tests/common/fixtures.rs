//! Canned distribution responses and a replaying transport

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sefaz_dfe::codec::encode;
use sefaz_dfe::error::TransportError;
use sefaz_dfe::transport::Transport;
use sefaz_dfe::{Credential, Identity};

/// Identity used by the offline tests
pub fn identity() -> Identity {
    Identity::parse("49.091.246/0001-05", "42").expect("valid identity")
}

/// Syntactically valid 44-digit access key numbered `n`
pub fn key(n: u64) -> String {
    format!("4224101234567800019555001{n:019}")
}

/// `resNFe` summary issued on 2024-10-01
pub fn summary_xml(key: &str) -> String {
    format!(
        r#"<resNFe xmlns="http://www.portalfiscal.inf.br/nfe" versao="1.01"><chNFe>{key}</chNFe><CNPJ>12345678000195</CNPJ><xNome>Fornecedor</xNome><dhEmi>2024-10-01T09:30:00-03:00</dhEmi><vNF>100.00</vNF></resNFe>"#
    )
}

/// Full `nfeProc` issued on 2024-10-02
pub fn full_xml(key: &str) -> String {
    format!(
        r#"<nfeProc xmlns="http://www.portalfiscal.inf.br/nfe" versao="4.00"><NFe><infNFe Id="NFe{key}"><ide><serie>1</serie><nNF>77</nNF><dhEmi>2024-10-02T10:00:00-03:00</dhEmi></ide><emit><CNPJ>12345678000195</CNPJ><xNome>Fornecedor</xNome></emit><total><ICMSTot><vDesc>5.00</vDesc><vNF>105.00</vNF></ICMSTot></total></infNFe></NFe><protNFe><infProt><chNFe>{key}</chNFe></infProt></protNFe></nfeProc>"#
    )
}

/// One `docZip` entry, gzip-compressed
pub fn doc_zip(nsu: u64, xml: &str) -> String {
    format!(
        r#"<docZip NSU="{:015}" schema="resNFe_v1.01.xsd">{}</docZip>"#,
        nsu,
        encode(xml.as_bytes(), true).expect("gzip into memory")
    )
}

/// A complete SOAP 1.2 response around `retDistDFeInt`
pub fn response(status: &str, motive: &str, cursors: Option<(u64, u64)>, docs: &str) -> Vec<u8> {
    let cursors = cursors
        .map(|(ult, max)| format!("<ultNSU>{ult:015}</ultNSU><maxNSU>{max:015}</maxNSU>"))
        .unwrap_or_default();
    let lote = if docs.is_empty() {
        String::new()
    } else {
        format!("<loteDistDFeInt>{docs}</loteDistDFeInt>")
    };
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?><soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"><soap:Body><nfeDistDFeInteresseResponse xmlns="http://www.portalfiscal.inf.br/nfe/wsdl/NFeDistribuicaoDFe"><nfeDistDFeInteresseResult><retDistDFeInt xmlns="http://www.portalfiscal.inf.br/nfe" versao="1.01"><tpAmb>1</tpAmb><verAplic>1.7.6</verAplic><cStat>{status}</cStat><xMotivo>{motive}</xMotivo><dhResp>2024-10-03T10:00:00-03:00</dhResp>{cursors}{lote}</retDistDFeInt></nfeDistDFeInteresseResult></nfeDistDFeInteresseResponse></soap:Body></soap:Envelope>"#
    )
    .into_bytes()
}

/// A 138 response with summaries for NSUs `first..=last`
pub fn batch(first: u64, last: u64, max: u64) -> Vec<u8> {
    let docs: String = (first..=last)
        .map(|n| doc_zip(n, &summary_xml(&key(n))))
        .collect();
    response("138", "Documento(s) localizado(s)", Some((last, max)), &docs)
}

/// Transport that replays canned bodies in order and records requests
#[derive(Default)]
pub struct ReplayTransport {
    responses: Mutex<VecDeque<Vec<u8>>>,
    requests: Mutex<Vec<String>>,
}

impl ReplayTransport {
    /// Replay `responses`, then fail every further request
    pub fn new(responses: impl IntoIterator<Item = Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Request bodies sent so far
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn send(
        &self,
        _url: &str,
        body: String,
        _credential: &Credential,
    ) -> Result<Vec<u8>, TransportError> {
        self.requests.lock().expect("requests lock").push(body);
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .ok_or_else(|| TransportError::Request("no more canned responses".into()))
    }
}
