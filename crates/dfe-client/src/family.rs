//! Per-family service constants and endpoint resolution.

use std::collections::BTreeMap;

use dfe_schemas::{DocumentFamily, Environment};

/// Everything that differs between the NF-e and CT-e distribution services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceProfile {
    pub production_url: &'static str,
    pub homologation_url: &'static str,
    pub schema_ns: &'static str,
    pub schema_version: &'static str,
    pub wsdl_ns: &'static str,
    pub operation: &'static str,
    pub message_element: &'static str,
    /// Targeted query wrapper and its key element.
    pub by_key_element: &'static str,
    pub key_element: &'static str,
}

pub const NFE: ServiceProfile = ServiceProfile {
    production_url: "https://www1.nfe.fazenda.gov.br/NFeDistribuicaoDFe/NFeDistribuicaoDFe.asmx",
    homologation_url: "https://hom1.nfe.fazenda.gov.br/NFeDistribuicaoDFe/NFeDistribuicaoDFe.asmx",
    schema_ns: "http://www.portalfiscal.inf.br/nfe",
    schema_version: "1.01",
    wsdl_ns: "http://www.portalfiscal.inf.br/nfe/wsdl/NFeDistribuicaoDFe",
    operation: "nfeDistDFeInteresse",
    message_element: "nfeDadosMsg",
    by_key_element: "consChNFe",
    key_element: "chNFe",
};

pub const CTE: ServiceProfile = ServiceProfile {
    production_url: "https://www1.cte.fazenda.gov.br/CTeDistribuicaoDFe/CTeDistribuicaoDFe.asmx",
    homologation_url: "https://hom1.cte.fazenda.gov.br/CTeDistribuicaoDFe/CTeDistribuicaoDFe.asmx",
    schema_ns: "http://www.portalfiscal.inf.br/cte",
    schema_version: "1.00",
    wsdl_ns: "http://www.portalfiscal.inf.br/cte/wsdl/CTeDistribuicaoDFe",
    operation: "cteDistDFeInteresse",
    message_element: "cteDadosMsg",
    by_key_element: "consChCTe",
    key_element: "chCTe",
};

pub fn profile(family: DocumentFamily) -> &'static ServiceProfile {
    match family {
        DocumentFamily::Nfe => &NFE,
        DocumentFamily::Cte => &CTE,
    }
}

/// Built-in URLs plus per-family overrides (`nfe` / `cte` keys, any case).
#[derive(Debug, Clone, Default)]
pub struct DistributionEndpoints {
    overrides: BTreeMap<String, String>,
}

impl DistributionEndpoints {
    pub fn new(overrides: BTreeMap<String, String>) -> Self {
        let overrides = overrides
            .into_iter()
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v))
            .collect();
        Self { overrides }
    }

    pub fn resolve(&self, family: DocumentFamily, env: Environment) -> String {
        let key = family.as_str().to_ascii_lowercase();
        if let Some(url) = self.overrides.get(&key) {
            return url.clone();
        }
        let p = profile(family);
        match env {
            Environment::Production => p.production_url.to_string(),
            Environment::Homologation => p.homologation_url.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_are_case_insensitive() {
        let mut o = BTreeMap::new();
        o.insert("NFE".to_string(), "http://127.0.0.1:1/dist".to_string());
        let e = DistributionEndpoints::new(o);
        assert_eq!(
            e.resolve(DocumentFamily::Nfe, Environment::Production),
            "http://127.0.0.1:1/dist"
        );
        assert_eq!(
            e.resolve(DocumentFamily::Cte, Environment::Homologation),
            CTE.homologation_url
        );
    }
}
