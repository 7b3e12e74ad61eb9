//! Event-reception endpoints keyed by 2-digit authority code.
//!
//! Ten states run their own authorizer; two are served by the SVAN virtual
//! authorizer; every other state goes to SVRS. Code 91 is the national
//! environment.

use std::collections::BTreeMap;

use dfe_schemas::{AuthorityCode, Environment};

/// Production / homologation pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPair {
    pub production: &'static str,
    pub homologation: &'static str,
}

impl EndpointPair {
    pub fn for_env(&self, env: Environment) -> &'static str {
        match env {
            Environment::Production => self.production,
            Environment::Homologation => self.homologation,
        }
    }
}

pub const NATIONAL: EndpointPair = EndpointPair {
    production: "https://www.nfe.fazenda.gov.br/NFeRecepcaoEvento4/NFeRecepcaoEvento4.asmx",
    homologation: "https://hom1.nfe.fazenda.gov.br/NFeRecepcaoEvento4/NFeRecepcaoEvento4.asmx",
};

pub const SVRS: EndpointPair = EndpointPair {
    production: "https://nfe.svrs.rs.gov.br/ws/recepcaoevento/recepcaoevento4.asmx",
    homologation: "https://nfe-homologacao.svrs.rs.gov.br/ws/recepcaoevento/recepcaoevento4.asmx",
};

pub const SVAN: EndpointPair = EndpointPair {
    production: "https://www.sefazvirtual.fazenda.gov.br/NFeRecepcaoEvento4/NFeRecepcaoEvento4.asmx",
    homologation: "https://hom.sefazvirtual.fazenda.gov.br/NFeRecepcaoEvento4/NFeRecepcaoEvento4.asmx",
};

const OWN_AUTHORIZERS: [(&str, EndpointPair); 10] = [
    (
        "13",
        EndpointPair {
            production: "https://nfe.sefaz.am.gov.br/services2/services/RecepcaoEvento4",
            homologation: "https://homnfe.sefaz.am.gov.br/services2/services/RecepcaoEvento4",
        },
    ),
    (
        "29",
        EndpointPair {
            production: "https://nfe.sefaz.ba.gov.br/webservices/NFeRecepcaoEvento4/NFeRecepcaoEvento4.asmx",
            homologation: "https://hnfe.sefaz.ba.gov.br/webservices/NFeRecepcaoEvento4/NFeRecepcaoEvento4.asmx",
        },
    ),
    (
        "52",
        EndpointPair {
            production: "https://nfe.sefaz.go.gov.br/nfe/services/NFeRecepcaoEvento4",
            homologation: "https://homolog.sefaz.go.gov.br/nfe/services/NFeRecepcaoEvento4",
        },
    ),
    (
        "31",
        EndpointPair {
            production: "https://nfe.fazenda.mg.gov.br/nfe2/services/NFeRecepcaoEvento4",
            homologation: "https://hnfe.fazenda.mg.gov.br/nfe2/services/NFeRecepcaoEvento4",
        },
    ),
    (
        "50",
        EndpointPair {
            production: "https://nfe.sefaz.ms.gov.br/ws/NFeRecepcaoEvento4",
            homologation: "https://hom.nfe.sefaz.ms.gov.br/ws/NFeRecepcaoEvento4",
        },
    ),
    (
        "51",
        EndpointPair {
            production: "https://nfe.sefaz.mt.gov.br/nfews/v2/services/RecepcaoEvento4",
            homologation: "https://homologacao.sefaz.mt.gov.br/nfews/v2/services/RecepcaoEvento4",
        },
    ),
    (
        "26",
        EndpointPair {
            production: "https://nfe.sefaz.pe.gov.br/nfe-service/services/NFeRecepcaoEvento4",
            homologation: "https://nfehomolog.sefaz.pe.gov.br/nfe-service/services/NFeRecepcaoEvento4",
        },
    ),
    (
        "41",
        EndpointPair {
            production: "https://nfe.sefa.pr.gov.br/nfe/NFeRecepcaoEvento4",
            homologation: "https://homologacao.nfe.sefa.pr.gov.br/nfe/NFeRecepcaoEvento4",
        },
    ),
    (
        "43",
        EndpointPair {
            production: "https://nfe.sefazrs.rs.gov.br/ws/recepcaoevento/recepcaoevento4.asmx",
            homologation: "https://nfe-homologacao.sefazrs.rs.gov.br/ws/recepcaoevento/recepcaoevento4.asmx",
        },
    ),
    (
        "35",
        EndpointPair {
            production: "https://nfe.fazenda.sp.gov.br/ws/nferecepcaoevento4.asmx",
            homologation: "https://homologacao.nfe.fazenda.sp.gov.br/ws/nferecepcaoevento4.asmx",
        },
    ),
];

const SVAN_STATES: [&str; 2] = ["21", "15"];

/// Every IBGE state code the authority recognizes.
const STATES: [&str; 27] = [
    "11", "12", "13", "14", "15", "16", "17", "21", "22", "23", "24", "25", "26", "27", "28",
    "29", "31", "32", "33", "35", "41", "42", "43", "50", "51", "52", "53",
];

/// Built-in table entry for `code`, if the code is known.
pub fn builtin(code: &str) -> Option<EndpointPair> {
    if code == AuthorityCode::NATIONAL {
        return Some(NATIONAL);
    }
    if let Some((_, pair)) = OWN_AUTHORIZERS.iter().find(|(c, _)| *c == code) {
        return Some(*pair);
    }
    if SVAN_STATES.contains(&code) {
        return Some(SVAN);
    }
    if STATES.contains(&code) {
        return Some(SVRS);
    }
    None
}

/// Table plus operator overrides (authority code -> URL).
#[derive(Debug, Clone, Default)]
pub struct EventEndpoints {
    overrides: BTreeMap<String, String>,
}

impl EventEndpoints {
    pub fn new(overrides: BTreeMap<String, String>) -> Self {
        Self { overrides }
    }

    pub fn resolve(&self, code: &AuthorityCode, env: Environment) -> Option<String> {
        if let Some(url) = self.overrides.get(code.as_str()) {
            return Some(url.clone());
        }
        builtin(code.as_str()).map(|p| p.for_env(env).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> AuthorityCode {
        AuthorityCode::parse(s).unwrap()
    }

    #[test]
    fn routes_by_authority_kind() {
        let t = EventEndpoints::default();
        let prod = Environment::Production;

        assert_eq!(
            t.resolve(&code("35"), prod).unwrap(),
            "https://nfe.fazenda.sp.gov.br/ws/nferecepcaoevento4.asmx"
        );
        assert_eq!(t.resolve(&code("21"), prod).unwrap(), SVAN.production);
        assert_eq!(t.resolve(&code("15"), prod).unwrap(), SVAN.production);
        assert_eq!(t.resolve(&code("33"), prod).unwrap(), SVRS.production);
        assert_eq!(t.resolve(&code("91"), prod).unwrap(), NATIONAL.production);
        assert_eq!(
            t.resolve(&code("91"), Environment::Homologation).unwrap(),
            NATIONAL.homologation
        );
        assert!(t.resolve(&code("99"), prod).is_none());
    }

    #[test]
    fn overrides_win() {
        let mut o = BTreeMap::new();
        o.insert("35".to_string(), "http://127.0.0.1:9/events".to_string());
        let t = EventEndpoints::new(o);
        assert_eq!(
            t.resolve(&code("35"), Environment::Production).unwrap(),
            "http://127.0.0.1:9/events"
        );
        assert_eq!(
            t.resolve(&code("33"), Environment::Production).unwrap(),
            SVRS.production
        );
    }

    #[test]
    fn every_state_has_an_endpoint() {
        for s in STATES {
            assert!(builtin(s).is_some(), "state {s} unrouted");
        }
    }
}
