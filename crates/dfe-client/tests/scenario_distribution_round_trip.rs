use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dfe_client::{
    ClientError, DistStatus, DistributionClient, DistributionEndpoints, SoapDistributionClient,
};
use dfe_schemas::{
    AccessKey, Account, AccountId, AuthorityCode, DocumentFamily, DocumentKind, Environment, Nsu,
    TaxId,
};
use dfe_signer::PlainClientPool;
use httpmock::prelude::*;

fn account() -> Account {
    Account {
        id: AccountId::new("acme").unwrap(),
        tax_id: TaxId::parse("12345678000195").unwrap(),
        authority_code: AuthorityCode::parse("35").unwrap(),
        environment: Environment::Homologation,
        families: vec![DocumentFamily::Nfe],
    }
}

fn client(server: &MockServer, family: &str, timeout: Duration) -> SoapDistributionClient {
    let mut overrides = BTreeMap::new();
    overrides.insert(family.to_string(), server.url("/dist"));
    SoapDistributionClient::new(
        DistributionEndpoints::new(overrides),
        Arc::new(PlainClientPool::new(timeout).unwrap()),
    )
}

fn soap(inner: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?><soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"><soap:Body><nfeDistDFeInteresseResponse xmlns="http://www.portalfiscal.inf.br/nfe/wsdl/NFeDistribuicaoDFe"><nfeDistDFeInteresseResult>{inner}</nfeDistDFeInteresseResult></nfeDistDFeInteresseResponse></soap:Body></soap:Envelope>"#
    )
}

const SUMMARY_XML: &str = r#"<resNFe xmlns="http://www.portalfiscal.inf.br/nfe" versao="1.01"><chNFe>52060433009911002506550120000007800267301615</chNFe><CNPJ>33009911002506</CNPJ><xNome>Fornecedor</xNome><vNF>100.00</vNF><cSitNFe>1</cSitNFe></resNFe>"#;

#[tokio::test]
async fn documents_found_are_returned_and_decodable() {
    let server = MockServer::start_async().await;
    let payload = dfe_classify::encode(SUMMARY_XML.as_bytes());
    let body = soap(&format!(
        r#"<retDistDFeInt versao="1.01" xmlns="http://www.portalfiscal.inf.br/nfe"><tpAmb>2</tpAmb><cStat>138</cStat><xMotivo>Documento(s) localizado(s)</xMotivo><ultNSU>000000000100001</ultNSU><maxNSU>000000000100001</maxNSU><loteDistDFeInt><docZip NSU="000000000100001" schema="resNFe_v1.01">{payload}</docZip></loteDistDFeInt></retDistDFeInt>"#
    ));

    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/dist")
                .header("content-type", "application/soap+xml; charset=utf-8")
                .body_contains("<nfeDistDFeInteresse")
                .body_contains("<CNPJ>12345678000195</CNPJ>")
                .body_contains("<ultNSU>000000000100000</ultNSU>");
            then.status(200).body(body);
        })
        .await;

    let c = client(&server, "nfe", Duration::from_secs(5));
    let resp = c
        .fetch(&account(), DocumentFamily::Nfe, Nsu::new(100_000).unwrap())
        .await
        .unwrap();
    mock.assert_async().await;

    assert_eq!(resp.status, DistStatus::DocumentsFound);
    assert_eq!(resp.last_nsu, Some(Nsu::new(100_001).unwrap()));
    assert_eq!(resp.documents.len(), 1);

    let doc = dfe_classify::classify_entry(&resp.documents[0]).unwrap();
    assert_eq!(doc.kind, DocumentKind::Summary);
    assert_eq!(doc.access_key.as_str(), "52060433009911002506550120000007800267301615");
}

#[tokio::test]
async fn no_documents_and_quota_statuses_are_values() {
    let server = MockServer::start_async().await;
    let empty = soap("<retDistDFeInt><cStat>137</cStat><xMotivo>Nenhum documento localizado</xMotivo><ultNSU>000000000000500</ultNSU><maxNSU>000000000000500</maxNSU></retDistDFeInt>");
    let quota = soap("<retDistDFeInt><cStat>656</cStat><xMotivo>Consumo Indevido</xMotivo><ultNSU>000000000000500</ultNSU><maxNSU>000000000000500</maxNSU></retDistDFeInt>");

    server
        .mock_async(|when, then| {
            when.method(POST).path("/dist").body_contains("<ultNSU>000000000000500</ultNSU>");
            then.status(200).body(empty);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/dist").body_contains("<ultNSU>000000000000501</ultNSU>");
            then.status(200).body(quota);
        })
        .await;

    let c = client(&server, "nfe", Duration::from_secs(5));
    let r = c
        .fetch(&account(), DocumentFamily::Nfe, Nsu::new(500).unwrap())
        .await
        .unwrap();
    assert_eq!(r.status, DistStatus::NoDocuments);
    assert!(r.documents.is_empty());

    let r = c
        .fetch(&account(), DocumentFamily::Nfe, Nsu::new(501).unwrap())
        .await
        .unwrap();
    assert_eq!(r.status, DistStatus::QuotaExceeded);
    assert_eq!(r.status_code, 656);
}

#[tokio::test]
async fn key_query_goes_to_the_family_of_the_key() {
    let server = MockServer::start_async().await;
    let key = AccessKey::parse("52060433009911002506550120000007800267301615").unwrap();
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/dist")
                .body_contains("<consChNFe><chNFe>52060433009911002506550120000007800267301615</chNFe></consChNFe>");
            then.status(200).body(soap(
                "<retDistDFeInt><cStat>137</cStat><xMotivo>x</xMotivo></retDistDFeInt>",
            ));
        })
        .await;

    let c = client(&server, "nfe", Duration::from_secs(5));
    let r = c.fetch_by_access_key(&account(), &key).await.unwrap();
    mock.assert_async().await;
    assert_eq!(r.status, DistStatus::NoDocuments);
    assert!(r.last_nsu.is_none());
}

#[tokio::test]
async fn slow_server_is_a_timeout_and_5xx_is_http_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/dist").body_contains("<ultNSU>000000000000001</ultNSU>");
            then.status(200)
                .delay(Duration::from_millis(1500))
                .body(soap("<retDistDFeInt><cStat>137</cStat></retDistDFeInt>"));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/dist").body_contains("<ultNSU>000000000000002</ultNSU>");
            then.status(503).body("unavailable");
        })
        .await;

    let c = client(&server, "nfe", Duration::from_millis(200));
    let err = c
        .fetch(&account(), DocumentFamily::Nfe, Nsu::new(1).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::Timeout);

    let err = c
        .fetch(&account(), DocumentFamily::Nfe, Nsu::new(2).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::Http { status: 503 });
}
