//! `distDFeInt` request bodies.

use dfe_schemas::{AccessKey, Account, DocumentFamily, Nsu};

use crate::family::profile;

/// What the request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Everything after the given watermark.
    SinceWatermark(Nsu),
    /// One document by access key.
    ByAccessKey(AccessKey),
}

/// Render `distDFeInt` for `account`. The tax id element name follows the
/// identifier length (CNPJ for 14 digits, CPF for 11).
pub fn dist_request(account: &Account, family: DocumentFamily, query: &Query) -> String {
    let p = profile(family);
    let tax = account.tax_id.element_name();
    let selector = match query {
        Query::SinceWatermark(nsu) => format!("<distNSU><ultNSU>{nsu}</ultNSU></distNSU>"),
        Query::ByAccessKey(key) => format!(
            "<{wrap}><{el}>{key}</{el}></{wrap}>",
            wrap = p.by_key_element,
            el = p.key_element
        ),
    };
    format!(
        "<distDFeInt xmlns=\"{ns}\" versao=\"{ver}\"><tpAmb>{amb}</tpAmb><cUFAutor>{uf}</cUFAutor>\
         <{tax}>{id}</{tax}>{selector}</distDFeInt>",
        ns = p.schema_ns,
        ver = p.schema_version,
        amb = account.environment.code(),
        uf = account.authority_code,
        id = account.tax_id.digits(),
    )
}
