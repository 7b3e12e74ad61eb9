//! Scenario: a signed event travels to the event endpoint as a SOAP 1.2
//! batch and the per-event verdict comes back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dfe_schemas::EventType;
use dfe_signer::{
    CredentialMap, EventEndpoints, EventTransport, ManifestOutcome, ManifestRequest, Manifestor,
    PlainClientPool, SoapEventTransport, SubmitError,
};
use dfe_testkit::{test_account, test_identity, AccessKeyBuilder, MemoryRepository};
use httpmock::prelude::*;

fn soap(inner: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?><soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"><soap:Body><nfeRecepcaoEventoNFResult xmlns="http://www.portalfiscal.inf.br/nfe/wsdl/NFeRecepcaoEvento4">{inner}</nfeRecepcaoEventoNFResult></soap:Body></soap:Envelope>"#
    )
}

fn transport(server: &MockServer) -> anyhow::Result<SoapEventTransport> {
    // Authority 35 routes to the national environment for recipient events
    // unless overridden.
    let mut overrides = BTreeMap::new();
    overrides.insert("35".to_string(), server.url("/evento"));
    Ok(SoapEventTransport::new(
        EventEndpoints::new(overrides),
        Arc::new(PlainClientPool::new(Duration::from_secs(5))?),
    ))
}

#[tokio::test]
async fn manifest_over_soap_registers_and_records() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    let key = AccessKeyBuilder::new().number(9001).build()?;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/evento")
                .header("content-type", "application/soap+xml; charset=utf-8")
                .body_contains("<envEvento")
                .body_contains("<idLote>")
                .body_contains("<tpEvento>210210</tpEvento>")
                .body_contains("<SignatureValue>");
            then.status(200).body(soap(
                r#"<retEnvEvento versao="1.00" xmlns="http://www.portalfiscal.inf.br/nfe"><cStat>128</cStat><xMotivo>Lote de evento processado</xMotivo><retEvento versao="1.00"><infEvento><cStat>135</cStat><xMotivo>Evento registrado e vinculado a NF-e</xMotivo><nProt>891240000000077</nProt></infEvento></retEvento></retEnvEvento>"#,
            ));
        })
        .await;

    let account = test_account("matriz")?;
    let repo = Arc::new(MemoryRepository::new());
    let mut creds = CredentialMap::new();
    creds.insert(account.id.clone(), test_identity()?);
    let manifestor = Manifestor::new(repo.clone(), Arc::new(creds), Arc::new(transport(&server)?));

    let req = ManifestRequest::new(account, key, EventType::Awareness);
    let outcome = manifestor.manifest(&req, Utc::now()).await;

    match &outcome {
        ManifestOutcome::Registered(v) => {
            assert_eq!(v.status_code, 135);
            assert_eq!(v.protocol.as_deref(), Some("891240000000077"));
        }
        other => panic!("expected registration, got {other}"),
    }
    mock.assert_async().await;
    assert_eq!(repo.manifestation_count(), 1);
    Ok(())
}

#[tokio::test]
async fn http_error_without_soap_body_is_reported() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/evento");
            then.status(502).body("<html>bad gateway</html>");
        })
        .await;

    let account = test_account("matriz")?;
    let key = AccessKeyBuilder::new().number(9002).build()?;
    let envelope = dfe_signer::build(
        &account,
        &key,
        EventType::Awareness,
        1,
        Utc::now().fixed_offset(),
        None,
    )?;
    let signed = dfe_signer::sign(&envelope, &test_identity()?)?;

    let err = transport(&server)?
        .submit(&account, &signed)
        .await
        .expect_err("502 must be an error");
    assert!(matches!(err, SubmitError::Http { status: 502, .. }));
    Ok(())
}

#[tokio::test]
async fn soap_fault_with_verdict_body_is_still_a_verdict() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/evento");
            then.status(500).body(soap(
                r#"<retEnvEvento><cStat>215</cStat><xMotivo>Rejeicao: Falha no schema XML</xMotivo></retEnvEvento>"#,
            ));
        })
        .await;

    let account = test_account("matriz")?;
    let key = AccessKeyBuilder::new().number(9003).build()?;
    let envelope = dfe_signer::build(
        &account,
        &key,
        EventType::Awareness,
        1,
        Utc::now().fixed_offset(),
        None,
    )?;
    let signed = dfe_signer::sign(&envelope, &test_identity()?)?;

    let verdict = transport(&server)?.submit(&account, &signed).await?;
    assert_eq!(verdict.status_code, 215);
    assert!(!verdict.is_registered());
    Ok(())
}
