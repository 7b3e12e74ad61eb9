//! Builders for access keys, document payloads and distribution responses.

use anyhow::Result;
use dfe_client::{DistStatus, DistributionResponse};
use dfe_schemas::{
    check_digit, AccessKey, Account, AccountId, AuthorityCode, DocumentEnvelope, DocumentFamily,
    Environment, Nsu, ParseError, TaxId,
};

pub const TEST_TAX_ID: &str = "12345678000195";

/// An NF-e + CT-e account on the homologation environment of authority 35.
pub fn test_account(id: &str) -> Result<Account> {
    Ok(Account {
        id: AccountId::new(id)?,
        tax_id: TaxId::parse(TEST_TAX_ID)?,
        authority_code: AuthorityCode::parse("35")?,
        environment: Environment::Homologation,
        families: vec![DocumentFamily::Nfe, DocumentFamily::Cte],
    })
}

/// Field-by-field access key construction with a computed check digit.
#[derive(Debug, Clone)]
pub struct AccessKeyBuilder {
    authority_code: String,
    year_month: String,
    issuer_tax_id: String,
    model: String,
    series: u32,
    number: u64,
    emission_type: u8,
    numeric_code: u32,
}

impl Default for AccessKeyBuilder {
    fn default() -> Self {
        Self {
            authority_code: "35".to_string(),
            year_month: "2401".to_string(),
            issuer_tax_id: "33009911002506".to_string(),
            model: "55".to_string(),
            series: 1,
            number: 1,
            emission_type: 1,
            numeric_code: 10_000_001,
        }
    }
}

impl AccessKeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authority_code(mut self, code: &str) -> Self {
        self.authority_code = code.to_string();
        self
    }

    pub fn year_month(mut self, yymm: &str) -> Self {
        self.year_month = yymm.to_string();
        self
    }

    pub fn issuer(mut self, tax_id: &str) -> Self {
        self.issuer_tax_id = tax_id.to_string();
        self
    }

    pub fn model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn series(mut self, series: u32) -> Self {
        self.series = series;
        self
    }

    pub fn number(mut self, number: u64) -> Self {
        self.number = number;
        self
    }

    /// The first 43 digits (everything but the check digit).
    pub fn body(&self) -> String {
        format!(
            "{}{}{}{}{:03}{:09}{}{:08}",
            self.authority_code,
            self.year_month,
            self.issuer_tax_id,
            self.model,
            self.series,
            self.number,
            self.emission_type,
            self.numeric_code
        )
    }

    pub fn build(&self) -> Result<AccessKey, ParseError> {
        let body = self.body();
        let dv = check_digit(&body)?;
        AccessKey::parse(&format!("{body}{dv}"))
    }
}

/// gzip + base64, the framing used by `docZip`.
pub fn encode_payload(xml: &str) -> String {
    dfe_classify::encode(xml.as_bytes())
}

pub fn summary_xml(key: &AccessKey) -> String {
    format!(
        r#"<resNFe xmlns="http://www.portalfiscal.inf.br/nfe" versao="1.01"><chNFe>{key}</chNFe><CNPJ>{issuer}</CNPJ><xNome>Fornecedor Teste</xNome><IE>111111111111</IE><dhEmi>2024-01-02T10:00:00-03:00</dhEmi><tpNF>1</tpNF><vNF>150.00</vNF><digVal>AAAA</digVal><dhRecbto>2024-01-02T10:00:05-03:00</dhRecbto><nProt>135240000000001</nProt><cSitNFe>1</cSitNFe></resNFe>"#,
        issuer = key.issuer_tax_id()
    )
}

pub fn full_nfe_xml(key: &AccessKey) -> String {
    format!(
        r#"<nfeProc xmlns="http://www.portalfiscal.inf.br/nfe" versao="4.00"><NFe><infNFe Id="NFe{key}" versao="4.00"><ide><cUF>{uf}</cUF><mod>55</mod></ide></infNFe></NFe><protNFe versao="4.00"><infProt><chNFe>{key}</chNFe><cStat>100</cStat></infProt></protNFe></nfeProc>"#,
        uf = key.authority_code()
    )
}

pub fn event_xml(key: &AccessKey, code: &str, seq: u32) -> String {
    format!(
        r#"<resEvento xmlns="http://www.portalfiscal.inf.br/nfe" versao="1.01"><cOrgao>91</cOrgao><CNPJ>{TEST_TAX_ID}</CNPJ><chNFe>{key}</chNFe><dhEvento>2024-01-02T11:00:00-03:00</dhEvento><tpEvento>{code}</tpEvento><nSeqEvento>{seq}</nSeqEvento><xEvento>Evento</xEvento><dhRecbto>2024-01-02T11:00:01-03:00</dhRecbto><nProt>891240000000002</nProt></resEvento>"#
    )
}

pub fn entry(nsu: u64, schema: &str, xml: &str) -> Result<DocumentEnvelope> {
    Ok(DocumentEnvelope {
        nsu: Nsu::new(nsu)?,
        schema: Some(schema.to_string()),
        payload: encode_payload(xml),
    })
}

/// `count` summary entries numbered `first_nsu..first_nsu + count`, each for
/// a distinct key.
pub fn summary_entries(first_nsu: u64, count: u64) -> Result<Vec<DocumentEnvelope>> {
    (0..count)
        .map(|i| {
            let key = AccessKeyBuilder::new().number(first_nsu + i).build()?;
            entry(first_nsu + i, "resNFe_v1.01", &summary_xml(&key))
        })
        .collect()
}

/// A `138` response.
pub fn documents_found(
    last: u64,
    max: u64,
    documents: Vec<DocumentEnvelope>,
) -> Result<DistributionResponse> {
    Ok(DistributionResponse {
        status: DistStatus::DocumentsFound,
        status_code: DistStatus::DOCUMENTS_FOUND,
        reason: "Documento(s) localizado(s)".to_string(),
        last_nsu: Some(Nsu::new(last)?),
        max_nsu: Some(Nsu::new(max)?),
        documents,
        malformed_entries: Vec::new(),
    })
}
