//! Typed, validated recipient-acknowledgement events.
//!
//! An [`EventEnvelope`] can only be obtained from [`build`], which checks every
//! field the authority's schema validator checks. Rendering emits the children
//! of `infEvento` in the one order the schema accepts.

use chrono::{DateTime, FixedOffset};
use dfe_schemas::{AccessKey, Account, AuthorityCode, DocumentFamily, Environment, EventType, TaxId};

use crate::c14n::{escape_attr, escape_text};
use crate::SignError;

pub const NFE_NS: &str = "http://www.portalfiscal.inf.br/nfe";
pub const EVENT_VERSION: &str = "1.00";
pub const EVENT_ID_PREFIX: &str = "ID";
pub const EVENT_ID_LEN: usize = 54;
pub const MAX_SEQUENCE: u8 = 20;
pub const JUSTIFICATION_CHARS: std::ops::RangeInclusive<usize> = 15..=255;

/// `ID` + event code + access key + 2-digit sequence.
pub fn event_id(event_type: EventType, key: &AccessKey, sequence: u8) -> Result<String, SignError> {
    if sequence == 0 || sequence > MAX_SEQUENCE {
        return Err(SignError::Build(format!(
            "sequence {sequence} outside 1..={MAX_SEQUENCE}"
        )));
    }
    let id = format!(
        "{EVENT_ID_PREFIX}{}{}{:02}",
        event_type.code(),
        key.as_str(),
        sequence
    );
    let digits_ok = id[EVENT_ID_PREFIX.len()..].bytes().all(|b| b.is_ascii_digit());
    if id.len() != EVENT_ID_LEN || !digits_ok {
        return Err(SignError::Build(format!(
            "event id '{id}' is not {EVENT_ID_LEN} characters of the form ID+code+key+seq"
        )));
    }
    Ok(id)
}

/// `dhEvento` format: local time with explicit UTC offset, no fraction.
pub fn format_timestamp(ts: &DateTime<FixedOffset>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

/// Unsigned event. Fields are private: the only way in is [`build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    id: String,
    authority: AuthorityCode,
    environment: Environment,
    tax_id: TaxId,
    access_key: AccessKey,
    timestamp: String,
    event_type: EventType,
    sequence: u8,
    justification: Option<String>,
}

/// Assemble and validate an event for `account`.
pub fn build(
    account: &Account,
    access_key: &AccessKey,
    event_type: EventType,
    sequence: u8,
    timestamp: DateTime<FixedOffset>,
    justification: Option<&str>,
) -> Result<EventEnvelope, SignError> {
    if access_key.family() != Some(DocumentFamily::Nfe) {
        return Err(SignError::Build(format!(
            "recipient acknowledgement applies to NF-e keys only (model {})",
            access_key.model()
        )));
    }

    let justification = match (event_type.requires_justification(), justification.map(str::trim)) {
        (true, Some(j)) => {
            let n = j.chars().count();
            if !JUSTIFICATION_CHARS.contains(&n) {
                return Err(SignError::Build(format!(
                    "justification must have {}..={} characters, got {n}",
                    JUSTIFICATION_CHARS.start(),
                    JUSTIFICATION_CHARS.end()
                )));
            }
            Some(j.to_string())
        }
        (true, None) => {
            return Err(SignError::Build(format!(
                "event {} requires a justification",
                event_type.code()
            )))
        }
        (false, Some(j)) if !j.is_empty() => {
            return Err(SignError::Build(format!(
                "event {} does not take a justification",
                event_type.code()
            )))
        }
        (false, _) => None,
    };

    let id = event_id(event_type, access_key, sequence)?;

    Ok(EventEnvelope {
        id,
        authority: account.authority_code.clone(),
        environment: account.environment,
        tax_id: account.tax_id.clone(),
        access_key: access_key.clone(),
        timestamp: format_timestamp(&timestamp),
        event_type,
        sequence,
        justification,
    })
}

impl EventEnvelope {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn authority(&self) -> &AuthorityCode {
        &self.authority
    }

    /// `<infEvento>` with its children in schema order.
    pub fn inf_evento_xml(&self) -> String {
        let tax = self.tax_id.element_name();
        let mut x = String::with_capacity(512);
        x.push_str(&format!("<infEvento Id=\"{}\">", escape_attr(&self.id)));
        x.push_str(&format!("<cOrgao>{}</cOrgao>", self.authority));
        x.push_str(&format!("<tpAmb>{}</tpAmb>", self.environment.code()));
        x.push_str(&format!("<{tax}>{}</{tax}>", self.tax_id.digits()));
        x.push_str(&format!("<chNFe>{}</chNFe>", self.access_key));
        x.push_str(&format!("<dhEvento>{}</dhEvento>", self.timestamp));
        x.push_str(&format!("<tpEvento>{}</tpEvento>", self.event_type.code()));
        x.push_str(&format!("<nSeqEvento>{}</nSeqEvento>", self.sequence));
        x.push_str(&format!("<verEvento>{EVENT_VERSION}</verEvento>"));
        x.push_str(&format!("<detEvento versao=\"{EVENT_VERSION}\">"));
        x.push_str(&format!(
            "<descEvento>{}</descEvento>",
            escape_text(self.event_type.description())
        ));
        if let Some(j) = &self.justification {
            x.push_str(&format!("<xJust>{}</xJust>", escape_text(j)));
        }
        x.push_str("</detEvento></infEvento>");
        x
    }

    /// `<evento>` wrapping `infEvento` and, once signed, the signature.
    pub fn evento_xml(&self, signature: Option<&str>) -> String {
        format!(
            "<evento xmlns=\"{NFE_NS}\" versao=\"{EVENT_VERSION}\">{}{}</evento>",
            self.inf_evento_xml(),
            signature.unwrap_or("")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const KEY: &str = "52060433009911002506550120000007800267301615";

    fn account() -> Account {
        Account {
            id: dfe_schemas::AccountId::new("acme").unwrap(),
            tax_id: TaxId::parse("12345678000195").unwrap(),
            authority_code: AuthorityCode::parse("91").unwrap(),
            environment: Environment::Homologation,
            families: vec![DocumentFamily::Nfe],
        }
    }

    fn ts() -> DateTime<FixedOffset> {
        FixedOffset::west_opt(3 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 2, 10, 0, 0)
            .unwrap()
    }

    #[test]
    fn event_id_is_prefix_code_key_sequence() {
        let key = AccessKey::parse(KEY).unwrap();
        let id = event_id(EventType::Confirmation, &key, 1).unwrap();
        assert_eq!(id, format!("ID210200{KEY}01"));
        assert_eq!(id.len(), 54);

        assert!(event_id(EventType::Confirmation, &key, 0).is_err());
        assert!(event_id(EventType::Confirmation, &key, 21).is_err());
        assert_eq!(
            event_id(EventType::Awareness, &key, 12).unwrap(),
            format!("ID210210{KEY}12")
        );
    }

    #[test]
    fn children_render_in_schema_order() {
        let key = AccessKey::parse(KEY).unwrap();
        let env = build(&account(), &key, EventType::Awareness, 1, ts(), None).unwrap();
        let xml = env.inf_evento_xml();

        let order = [
            "<cOrgao>91</cOrgao>",
            "<tpAmb>2</tpAmb>",
            "<CNPJ>12345678000195</CNPJ>",
            "<chNFe>",
            "<dhEvento>2024-01-02T10:00:00-03:00</dhEvento>",
            "<tpEvento>210210</tpEvento>",
            "<nSeqEvento>1</nSeqEvento>",
            "<verEvento>1.00</verEvento>",
            "<detEvento versao=\"1.00\"><descEvento>Ciencia da Operacao</descEvento></detEvento>",
        ];
        let mut at = 0;
        for part in order {
            let pos = xml[at..].find(part).unwrap_or_else(|| panic!("missing or out of order: {part}"));
            at += pos + part.len();
        }
        assert!(xml.starts_with(&format!("<infEvento Id=\"ID210210{KEY}01\">")));
    }

    #[test]
    fn justification_rules() {
        let key = AccessKey::parse(KEY).unwrap();
        let a = account();

        assert!(build(&a, &key, EventType::OperationNotPerformed, 1, ts(), None).is_err());
        assert!(build(&a, &key, EventType::OperationNotPerformed, 1, ts(), Some("too short")).is_err());
        let ok = build(
            &a,
            &key,
            EventType::OperationNotPerformed,
            1,
            ts(),
            Some("Mercadoria devolvida <sem> entrega"),
        )
        .unwrap();
        assert!(ok
            .inf_evento_xml()
            .contains("<xJust>Mercadoria devolvida &lt;sem&gt; entrega</xJust>"));

        assert!(build(&a, &key, EventType::Confirmation, 1, ts(), Some("nao se aplica aqui")).is_err());
    }

    #[test]
    fn waybill_keys_are_rejected() {
        // Model 57 (CT-e).
        let first = "3524011234567800019557001000000001100000001";
        let dv = dfe_schemas::check_digit(first).unwrap();
        let key = AccessKey::parse(&format!("{first}{dv}")).unwrap();
        assert!(matches!(
            build(&account(), &key, EventType::Awareness, 1, ts(), None),
            Err(SignError::Build(_))
        ));
    }

    #[test]
    fn individual_tax_id_uses_cpf_element() {
        let mut a = account();
        a.tax_id = TaxId::parse("12345678909").unwrap();
        let key = AccessKey::parse(KEY).unwrap();
        let xml = build(&a, &key, EventType::Awareness, 1, ts(), None)
            .unwrap()
            .inf_evento_xml();
        assert!(xml.contains("<CPF>12345678909</CPF>"));
        assert!(!xml.contains("<CNPJ>"));
    }
}
