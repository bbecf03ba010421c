//! SOAP 1.2 request envelopes for `nfeDistDFeInteresse`

use crate::config::Environment;
use crate::types::{AccessKey, Identity, Nsu, TaxIdKind};

/// Namespace of the distribution WSDL operation wrapper
pub const WSDL_NAMESPACE: &str = "http://www.portalfiscal.inf.br/nfe/wsdl/NFeDistribuicaoDFe";

/// Schema version of `distDFeInt`
pub const DIST_VERSION: &str = "1.01";

/// What a single request asks for
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryMode {
    /// Next batch of documents after the given cursor
    ByCursor(Nsu),
    /// One specific document, by access key
    ByAccessKey(AccessKey),
}

/// Build the request envelope for one query
///
/// All inputs are validated newtypes, so every value interpolated here is
/// digits-only and needs no escaping.
pub fn build_request(environment: Environment, identity: &Identity, mode: &QueryMode) -> String {
    let party = match identity.tax_id.kind() {
        TaxIdKind::Cnpj => format!("<CNPJ>{}</CNPJ>", identity.tax_id),
        TaxIdKind::Cpf => format!("<CPF>{}</CPF>", identity.tax_id),
    };
    let query = match mode {
        QueryMode::ByCursor(nsu) => format!("<distNSU><ultNSU>{nsu}</ultNSU></distNSU>"),
        QueryMode::ByAccessKey(key) => format!("<consChNFe><chNFe>{key}</chNFe></consChNFe>"),
    };

    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap12:Envelope xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:soap12="http://www.w3.org/2003/05/soap-envelope">
  <soap12:Body>
    <nfeDistDFeInteresse xmlns="{WSDL_NAMESPACE}">
      <nfeDadosMsg>
        <distDFeInt xmlns="{nfe_ns}" versao="{DIST_VERSION}">
          <tpAmb>{tp_amb}</tpAmb>
          <cUFAutor>{authority}</cUFAutor>
          {party}
          {query}
        </distDFeInt>
      </nfeDadosMsg>
    </nfeDistDFeInteresse>
  </soap12:Body>
</soap12:Envelope>"#,
        nfe_ns = crate::codec::NFE_NAMESPACE,
        tp_amb = environment.tp_amb(),
        authority = identity.authority,
    )
}
