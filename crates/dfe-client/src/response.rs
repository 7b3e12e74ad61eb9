//! `retDistDFeInt` parsing.

use dfe_schemas::{DocumentEnvelope, Nsu};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::ClientError;

/// Abstract meaning of the authority's status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistStatus {
    /// 137: nothing new for this watermark.
    NoDocuments,
    /// 138: `documents` carries at least one entry.
    DocumentsFound,
    /// 656: the identity exceeded its query ceiling.
    QuotaExceeded,
    /// Anything else.
    Unexpected,
}

impl DistStatus {
    pub const NO_DOCUMENTS: u16 = 137;
    pub const DOCUMENTS_FOUND: u16 = 138;
    pub const QUOTA_EXCEEDED: u16 = 656;

    pub fn from_code(code: u16) -> Self {
        match code {
            Self::NO_DOCUMENTS => DistStatus::NoDocuments,
            Self::DOCUMENTS_FOUND => DistStatus::DocumentsFound,
            Self::QUOTA_EXCEEDED => DistStatus::QuotaExceeded,
            _ => DistStatus::Unexpected,
        }
    }
}

/// One distribution round trip, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionResponse {
    pub status: DistStatus,
    pub status_code: u16,
    pub reason: String,
    /// `ultNSU`: last sequence number covered by this response.
    pub last_nsu: Option<Nsu>,
    /// `maxNSU`: highest sequence number currently available.
    pub max_nsu: Option<Nsu>,
    pub documents: Vec<DocumentEnvelope>,
    /// Entries whose attributes could not be read, with the reason.
    pub malformed_entries: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    None,
    Stat,
    Reason,
    Last,
    Max,
    Doc,
    FaultText,
}

struct PendingDoc {
    nsu: Result<Nsu, String>,
    schema: Option<String>,
    payload: String,
}

fn doc_attrs(e: &BytesStart<'_>) -> PendingDoc {
    let mut nsu = Err("docZip without NSU attribute".to_string());
    let mut schema = None;
    for a in e.attributes().flatten() {
        let value = match a.unescape_value() {
            Ok(v) => v.trim().to_string(),
            Err(_) => continue,
        };
        match a.key.local_name().as_ref() {
            b"NSU" => nsu = Nsu::parse(&value).map_err(|err| err.to_string()),
            b"schema" => schema = Some(value),
            _ => {}
        }
    }
    PendingDoc {
        nsu,
        schema,
        payload: String::new(),
    }
}

/// Parse a SOAP response body carrying `retDistDFeInt`.
pub fn parse_response(xml: &str) -> Result<DistributionResponse, ClientError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stat: Option<String> = None;
    let mut reason: Option<String> = None;
    let mut last: Option<String> = None;
    let mut max: Option<String> = None;
    let mut fault: Option<String> = None;
    let mut documents = Vec::new();
    let mut malformed = Vec::new();

    let mut field = Field::None;
    let mut pending: Option<PendingDoc> = None;
    let mut in_fault = false;

    loop {
        let ev = reader
            .read_event()
            .map_err(|e| ClientError::Envelope(e.to_string()))?;
        match ev {
            Event::Start(ref e) => {
                field = match e.local_name().as_ref() {
                    b"cStat" if stat.is_none() => Field::Stat,
                    b"xMotivo" if reason.is_none() => Field::Reason,
                    b"ultNSU" if last.is_none() => Field::Last,
                    b"maxNSU" if max.is_none() => Field::Max,
                    b"docZip" => {
                        pending = Some(doc_attrs(e));
                        Field::Doc
                    }
                    b"Fault" => {
                        in_fault = true;
                        Field::None
                    }
                    b"Text" if in_fault => Field::FaultText,
                    _ => Field::None,
                };
            }
            Event::Empty(ref e) if e.local_name().as_ref() == b"docZip" => {
                malformed.push("docZip with empty payload".to_string());
            }
            Event::Text(t) => {
                let v = t
                    .unescape()
                    .map_err(|e| ClientError::Envelope(e.to_string()))?
                    .trim()
                    .to_string();
                match field {
                    Field::Stat => stat = Some(v),
                    Field::Reason => reason = Some(v),
                    Field::Last => last = Some(v),
                    Field::Max => max = Some(v),
                    Field::Doc => {
                        if let Some(p) = pending.as_mut() {
                            p.payload.push_str(&v);
                        }
                    }
                    Field::FaultText => fault = Some(v),
                    Field::None => {}
                }
            }
            Event::End(ref e) => {
                if e.local_name().as_ref() == b"docZip" {
                    if let Some(p) = pending.take() {
                        match p.nsu {
                            Ok(nsu) => documents.push(DocumentEnvelope {
                                nsu,
                                schema: p.schema,
                                payload: p.payload,
                            }),
                            Err(reason) => malformed.push(reason),
                        }
                    }
                }
                field = Field::None;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let stat = match (stat, fault) {
        (Some(s), _) => s,
        (None, Some(f)) => return Err(ClientError::Envelope(format!("SOAP fault: {f}"))),
        (None, None) => {
            return Err(ClientError::Envelope(
                "response carries no cStat".to_string(),
            ))
        }
    };
    let status_code = stat
        .parse::<u16>()
        .map_err(|_| ClientError::Envelope(format!("non-numeric cStat '{stat}'")))?;

    let parse_nsu = |what: &str, v: Option<String>| -> Result<Option<Nsu>, ClientError> {
        match v {
            Some(s) if !s.is_empty() => Nsu::parse(&s)
                .map(Some)
                .map_err(|e| ClientError::Envelope(format!("{what}: {e}"))),
            _ => Ok(None),
        }
    };

    Ok(DistributionResponse {
        status: DistStatus::from_code(status_code),
        status_code,
        reason: reason.unwrap_or_default(),
        last_nsu: parse_nsu("ultNSU", last)?,
        max_nsu: parse_nsu("maxNSU", max)?,
        documents,
        malformed_entries: malformed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn soap(inner: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?><soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"><soap:Body><nfeDistDFeInteresseResponse xmlns="http://www.portalfiscal.inf.br/nfe/wsdl/NFeDistribuicaoDFe"><nfeDistDFeInteresseResult>{inner}</nfeDistDFeInteresseResult></nfeDistDFeInteresseResponse></soap:Body></soap:Envelope>"#
        )
    }

    #[test]
    fn documents_found_with_entries() {
        let xml = soap(
            r#"<retDistDFeInt versao="1.01" xmlns="http://www.portalfiscal.inf.br/nfe"><tpAmb>1</tpAmb><verAplic>1.4.0</verAplic><cStat>138</cStat><xMotivo>Documento(s) localizado(s)</xMotivo><dhResp>2024-01-02T10:00:00-03:00</dhResp><ultNSU>000000000130000</ultNSU><maxNSU>000000000130000</maxNSU><loteDistDFeInt><docZip NSU="000000000129999" schema="resNFe_v1.01">H4sIAAAA</docZip><docZip NSU="000000000130000" schema="procNFe_v4.00">H4sIBBBB</docZip></loteDistDFeInt></retDistDFeInt>"#,
        );
        let r = parse_response(&xml).unwrap();
        assert_eq!(r.status, DistStatus::DocumentsFound);
        assert_eq!(r.status_code, 138);
        assert_eq!(r.last_nsu, Some(Nsu::new(130_000).unwrap()));
        assert_eq!(r.max_nsu, Some(Nsu::new(130_000).unwrap()));
        assert_eq!(r.documents.len(), 2);
        assert_eq!(r.documents[0].nsu, Nsu::new(129_999).unwrap());
        assert_eq!(r.documents[0].schema.as_deref(), Some("resNFe_v1.01"));
        assert_eq!(r.documents[1].payload, "H4sIBBBB");
        assert!(r.malformed_entries.is_empty());
    }

    #[test]
    fn status_codes_map_to_abstract_meaning() {
        for (code, status) in [
            (137, DistStatus::NoDocuments),
            (138, DistStatus::DocumentsFound),
            (656, DistStatus::QuotaExceeded),
            (215, DistStatus::Unexpected),
        ] {
            let xml = soap(&format!(
                "<retDistDFeInt><cStat>{code}</cStat><xMotivo>x</xMotivo><ultNSU>000000000000010</ultNSU><maxNSU>000000000000010</maxNSU></retDistDFeInt>"
            ));
            assert_eq!(parse_response(&xml).unwrap().status, status);
        }
    }

    #[test]
    fn bad_entry_attribute_is_isolated() {
        let xml = soap(
            r#"<retDistDFeInt><cStat>138</cStat><ultNSU>000000000000002</ultNSU><maxNSU>000000000000002</maxNSU><loteDistDFeInt><docZip NSU="abc" schema="resNFe_v1.01">AAAA</docZip><docZip NSU="000000000000002" schema="resNFe_v1.01">BBBB</docZip></loteDistDFeInt></retDistDFeInt>"#,
        );
        let r = parse_response(&xml).unwrap();
        assert_eq!(r.documents.len(), 1);
        assert_eq!(r.malformed_entries.len(), 1);
    }

    #[test]
    fn fault_and_missing_status_are_envelope_errors() {
        let fault = r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"><soap:Body><soap:Fault><soap:Reason><soap:Text xml:lang="en">Certificate not accepted</soap:Text></soap:Reason></soap:Fault></soap:Body></soap:Envelope>"#;
        assert!(matches!(parse_response(fault), Err(ClientError::Envelope(m)) if m.contains("Certificate")));
        assert!(matches!(
            parse_response("<retDistDFeInt><xMotivo>?</xMotivo></retDistDFeInt>"),
            Err(ClientError::Envelope(_))
        ));
        assert!(matches!(parse_response("<a><b></a>"), Err(ClientError::Envelope(_))));
    }
}
