//! Canonical XML 1.0 (without comments) over a quick-xml event stream.
//!
//! Covers what enveloped signatures over fiscal documents need:
//! - selecting a sub-tree by `Id` attribute (or by element name, or the root);
//! - rendering every in-scope namespace declaration on the apex element;
//! - namespace declarations before attributes, attributes sorted by
//!   (namespace URI, local name);
//! - empty elements expanded to start/end pairs;
//! - comments, XML declaration and DOCTYPE dropped;
//! - the enveloped-signature transform (drop `ds:Signature` descendants).

use std::collections::BTreeMap;
use std::fmt;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Reference transforms, applied in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    EnvelopedSignature,
    C14n,
}

impl Transform {
    pub fn algorithm(&self) -> &'static str {
        match self {
            Transform::EnvelopedSignature => "http://www.w3.org/2000/09/xmldsig#enveloped-signature",
            Transform::C14n => C14N_ALGORITHM,
        }
    }
}

pub const C14N_ALGORITHM: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";

/// The only chain the authority accepts for event references.
pub const REFERENCE_TRANSFORMS: [Transform; 2] = [Transform::EnvelopedSignature, Transform::C14n];

/// Which sub-tree to canonicalize.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// The document element.
    Root,
    /// First element carrying `Id="..."`.
    Id(&'a str),
    /// First element with this local name.
    Element(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum C14nError {
    Xml(String),
    TargetNotFound(String),
    UnsupportedChain,
    UnboundPrefix(String),
}

impl fmt::Display for C14nError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            C14nError::Xml(e) => write!(f, "malformed XML: {e}"),
            C14nError::TargetNotFound(t) => write!(f, "target {t} not found"),
            C14nError::UnsupportedChain => {
                write!(f, "transform chain must end with canonicalization")
            }
            C14nError::UnboundPrefix(p) => write!(f, "namespace prefix '{p}' is not bound"),
        }
    }
}

impl std::error::Error for C14nError {}

type NsMap = BTreeMap<String, String>;

/// Canonicalize the selected sub-tree of `xml` under `transforms`.
pub fn canonicalize(xml: &str, target: Target<'_>, transforms: &[Transform]) -> Result<String, C14nError> {
    if transforms.last() != Some(&Transform::C14n) {
        return Err(C14nError::UnsupportedChain);
    }
    let enveloped = transforms.contains(&Transform::EnvelopedSignature);

    let mut reader = Reader::from_str(xml);
    reader.expand_empty_elements(true);

    // In-scope namespaces per open element (document order).
    let mut scopes: Vec<NsMap> = vec![NsMap::new()];
    // Namespaces already rendered by each open output element.
    let mut rendered: Vec<NsMap> = Vec::new();
    let mut depth = 0usize;
    let mut apex_depth: Option<usize> = None;
    let mut skip_depth: Option<usize> = None;
    let mut out = String::new();
    let mut done = false;

    while !done {
        let ev = reader.read_event().map_err(|e| C14nError::Xml(e.to_string()))?;
        match ev {
            Event::Start(ref e) => {
                depth += 1;
                let parent = scopes.last().cloned().unwrap_or_default();
                let (decls, attrs) = split_attributes(e)?;
                let mut scope = parent;
                for (p, u) in &decls {
                    scope.insert(p.clone(), u.clone());
                }

                if skip_depth.is_some() {
                    scopes.push(scope);
                    continue;
                }

                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();

                if apex_depth.is_none() && matches_target(target, &local, &attrs, depth) {
                    apex_depth = Some(depth);
                } else if apex_depth.is_some() && enveloped && local == "Signature" {
                    let ns = resolve_element_ns(&name, &scope);
                    if ns.as_deref() == Some(DSIG_NS) {
                        skip_depth = Some(depth);
                        scopes.push(scope);
                        continue;
                    }
                }

                if apex_depth.is_some() {
                    let base = rendered.last().cloned().unwrap_or_default();
                    let (line, now_rendered) = render_start(&name, &scope, &base, &attrs)?;
                    out.push_str(&line);
                    rendered.push(now_rendered);
                }
                scopes.push(scope);
            }
            Event::End(ref e) => {
                scopes.pop();
                if let Some(sd) = skip_depth {
                    if sd == depth {
                        skip_depth = None;
                    }
                } else if let Some(ad) = apex_depth {
                    out.push_str("</");
                    out.push_str(&String::from_utf8_lossy(e.name().as_ref()));
                    out.push('>');
                    rendered.pop();
                    if ad == depth {
                        done = true;
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Text(ref t) => {
                if emitting(apex_depth, skip_depth) {
                    let v = t.unescape().map_err(|e| C14nError::Xml(e.to_string()))?;
                    out.push_str(&escape_text(&v));
                }
            }
            Event::CData(ref c) => {
                if emitting(apex_depth, skip_depth) {
                    out.push_str(&escape_text(&String::from_utf8_lossy(c.as_ref())));
                }
            }
            Event::PI(ref p) => {
                if emitting(apex_depth, skip_depth) {
                    out.push_str("<?");
                    out.push_str(&String::from_utf8_lossy(p.as_ref()));
                    out.push_str("?>");
                }
            }
            Event::Eof => break,
            // Comments, declaration, DOCTYPE.
            _ => {}
        }
    }

    if apex_depth.is_none() {
        let what = match target {
            Target::Root => "root element".to_string(),
            Target::Id(id) => format!("Id=\"{id}\""),
            Target::Element(n) => format!("element <{n}>"),
        };
        return Err(C14nError::TargetNotFound(what));
    }
    Ok(out)
}

fn emitting(apex: Option<usize>, skip: Option<usize>) -> bool {
    apex.is_some() && skip.is_none()
}

fn matches_target(target: Target<'_>, local: &str, attrs: &[(String, String)], depth: usize) -> bool {
    match target {
        Target::Root => depth == 1,
        Target::Element(n) => local == n,
        Target::Id(id) => attrs
            .iter()
            .any(|(k, v)| matches!(k.as_str(), "Id" | "ID" | "id") && v == id),
    }
}

/// Namespace declarations (prefix -> uri, "" for default) and plain
/// attributes (qualified name -> unescaped value).
fn split_attributes(e: &BytesStart<'_>) -> Result<(Vec<(String, String)>, Vec<(String, String)>), C14nError> {
    let mut decls = Vec::new();
    let mut attrs = Vec::new();
    for a in e.attributes() {
        let a = a.map_err(|err| C14nError::Xml(err.to_string()))?;
        let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
        let value = a
            .unescape_value()
            .map_err(|err| C14nError::Xml(err.to_string()))?
            .into_owned();
        if key == "xmlns" {
            decls.push((String::new(), value));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            decls.push((prefix.to_string(), value));
        } else {
            attrs.push((key, value));
        }
    }
    Ok((decls, attrs))
}

fn resolve_element_ns(qname: &str, scope: &NsMap) -> Option<String> {
    match qname.split_once(':') {
        Some((prefix, _)) => scope.get(prefix).cloned(),
        None => scope.get("").cloned().filter(|u| !u.is_empty()),
    }
}

fn render_start(
    name: &str,
    scope: &NsMap,
    base: &NsMap,
    attrs: &[(String, String)],
) -> Result<(String, NsMap), C14nError> {
    let mut line = String::with_capacity(64);
    line.push('<');
    line.push_str(name);

    let mut now_rendered = base.clone();
    // BTreeMap order: default namespace ("") first, then by prefix.
    for (prefix, uri) in scope {
        let already = base.get(prefix);
        let needed = if prefix.is_empty() && uri.is_empty() {
            // xmlns="" only undoes a rendered non-empty default.
            matches!(already, Some(u) if !u.is_empty())
        } else {
            already != Some(uri)
        };
        if !needed {
            continue;
        }
        if prefix.is_empty() {
            line.push_str(" xmlns=\"");
        } else {
            line.push_str(" xmlns:");
            line.push_str(prefix);
            line.push_str("=\"");
        }
        line.push_str(&escape_attr(uri));
        line.push('"');
        now_rendered.insert(prefix.clone(), uri.clone());
    }

    let mut sorted: Vec<(String, &str, &str, &str)> = Vec::with_capacity(attrs.len());
    for (qname, value) in attrs {
        let (ns, local) = match qname.split_once(':') {
            Some(("xml", local)) => (XML_NS.to_string(), local),
            Some((prefix, local)) => (
                scope
                    .get(prefix)
                    .cloned()
                    .ok_or_else(|| C14nError::UnboundPrefix(prefix.to_string()))?,
                local,
            ),
            None => (String::new(), qname.as_str()),
        };
        sorted.push((ns, local, qname.as_str(), value.as_str()));
    }
    sorted.sort_by(|a, b| (a.0.as_str(), a.1).cmp(&(b.0.as_str(), b.1)));
    for (_, _, qname, value) in sorted {
        line.push(' ');
        line.push_str(qname);
        line.push_str("=\"");
        line.push_str(&escape_attr(value));
        line.push('"');
    }

    line.push('>');
    Ok((line, now_rendered))
}

pub(crate) fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
    out
}

pub(crate) fn escape_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c14n_root(xml: &str) -> String {
        canonicalize(xml, Target::Root, &[Transform::C14n]).unwrap()
    }

    #[test]
    fn expands_empty_elements_and_sorts_attributes() {
        assert_eq!(
            c14n_root(r#"<a xmlns="urn:x" b="2" a="1"><c/></a>"#),
            r#"<a xmlns="urn:x" a="1" b="2"><c></c></a>"#
        );
    }

    #[test]
    fn qualified_attributes_sort_after_unqualified() {
        assert_eq!(
            c14n_root(r#"<a xmlns:p="urn:p" p:z="1" y="2"></a>"#),
            r#"<a xmlns:p="urn:p" y="2" p:z="1"></a>"#
        );
    }

    #[test]
    fn apex_inherits_default_namespace() {
        let xml = r#"<evento xmlns="urn:nfe" versao="1.00"><infEvento Id="ID1"><x>1</x></infEvento></evento>"#;
        assert_eq!(
            canonicalize(xml, Target::Id("ID1"), &REFERENCE_TRANSFORMS).unwrap(),
            r#"<infEvento xmlns="urn:nfe" Id="ID1"><x>1</x></infEvento>"#
        );
    }

    #[test]
    fn redundant_declarations_are_not_repeated() {
        assert_eq!(
            c14n_root(r#"<a xmlns="urn:x"><b xmlns="urn:x"/></a>"#),
            r#"<a xmlns="urn:x"><b></b></a>"#
        );
    }

    #[test]
    fn drops_comments_and_declaration_keeps_whitespace() {
        assert_eq!(
            c14n_root("<?xml version=\"1.0\"?>\n<a>x &amp; y &gt; z<!-- note --> </a>"),
            "<a>x &amp; y &gt; z </a>"
        );
        assert_eq!(
            c14n_root(r#"<a t="say &quot;hi&quot; &lt;now&gt;"></a>"#),
            r#"<a t="say &quot;hi&quot; &lt;now>"></a>"#
        );
    }

    #[test]
    fn enveloped_signature_is_removed() {
        let xml = format!(
            r#"<r Id="R"><d>1</d><Signature xmlns="{DSIG_NS}"><SignedInfo/></Signature></r>"#
        );
        assert_eq!(
            canonicalize(&xml, Target::Id("R"), &REFERENCE_TRANSFORMS).unwrap(),
            r#"<r Id="R"><d>1</d></r>"#
        );
        // Without the transform the signature stays.
        assert!(canonicalize(&xml, Target::Id("R"), &[Transform::C14n])
            .unwrap()
            .contains("<SignedInfo></SignedInfo>"));
    }

    #[test]
    fn element_target_and_errors() {
        let xml = format!(r#"<e xmlns="urn:n"><Signature xmlns="{DSIG_NS}"><SignedInfo><X/></SignedInfo></Signature></e>"#);
        assert_eq!(
            canonicalize(&xml, Target::Element("SignedInfo"), &[Transform::C14n]).unwrap(),
            format!(r#"<SignedInfo xmlns="{DSIG_NS}"><X></X></SignedInfo>"#)
        );
        assert_eq!(
            canonicalize("<a/>", Target::Id("nope"), &[Transform::C14n]),
            Err(C14nError::TargetNotFound("Id=\"nope\"".to_string()))
        );
        assert_eq!(
            canonicalize("<a/>", Target::Root, &[Transform::EnvelopedSignature]),
            Err(C14nError::UnsupportedChain)
        );
    }
}
