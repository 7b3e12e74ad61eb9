//! Layered YAML configuration for the distribution sync service.
//!
//! Documents are merged in order (base -> environment -> site), converted to
//! canonical JSON and hashed, so two processes running with the same layers
//! can prove they run with the same effective configuration. The typed view
//! used by the rest of the workspace is [`DfeConfig`], deserialised from the
//! merged JSON.

pub mod secrets;
mod settings;

pub use secrets::{resolve_certificate_passwords, CertificatePassword, ResolvedPasswords};
pub use settings::{AccountConfig, DfeConfig, EndpointOverrides, SyncSettings, TlsSettings};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;

/// Known secret-like prefixes. If any leaf string value in the effective
/// config starts with one of these, loading aborts with CONFIG_SECRET_DETECTED.
/// Certificate passwords must be referenced by env var NAME only.
const SECRET_PREFIXES: &[&str] = &[
    "-----BEGIN", // PEM keys / certificates pasted inline
    "sk-",
    "sk_live",
    "AKIA",
    "ghp_",
    "glpat-",
];

/// Base64 DER blobs (PKCS#12, PKCS#8, X.509) start with this. Too common a
/// prefix for ordinary values, so it only counts under a credential-ish key.
const DER_PREFIX: &str = "MII";

/// Substrings of a leaf's own key name that mark it as credential material.
const CREDENTIAL_KEY_HINTS: &[&str] = &["password", "secret", "token", "key", "cert", "pfx", "p12"];

/// JSON-pointer prefixes read by [`DfeConfig`]. Any leaf outside these is
/// reported by [`report_unused_keys`].
pub const CONSUMED_POINTERS: &[&str] = &["/environment", "/accounts", "/sync", "/endpoints", "/tls"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedKeyPolicy {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnusedKeyReport {
    /// Consumed JSON-pointer prefixes used for this analysis (sorted, unique)
    pub consumed_prefixes: Vec<String>,
    /// Unused leaf pointers (sorted)
    pub unused_leaf_pointers: Vec<String>,
}

impl UnusedKeyReport {
    pub fn is_clean(&self) -> bool {
        self.unused_leaf_pointers.is_empty()
    }
}

/// Walk the merged document and list every leaf outside [`CONSUMED_POINTERS`].
/// With `UnusedKeyPolicy::Fail` a non-empty list is an error.
pub fn report_unused_keys(config_json: &Value, policy: UnusedKeyPolicy) -> Result<UnusedKeyReport> {
    let mut consumed_prefixes: Vec<String> =
        CONSUMED_POINTERS.iter().map(|p| p.trim_end_matches('/').to_string()).collect();
    consumed_prefixes.sort();
    consumed_prefixes.dedup();

    let mut unused = BTreeSet::new();
    for_each_leaf(config_json, &mut String::new(), &mut |pointer, _| {
        if !consumed_prefixes.iter().any(|c| covers(c, pointer)) {
            unused.insert(pointer.to_string());
        }
        Ok(())
    })?;

    let report = UnusedKeyReport {
        consumed_prefixes,
        unused_leaf_pointers: unused.into_iter().collect(),
    };

    if policy == UnusedKeyPolicy::Fail && !report.is_clean() {
        let shown: Vec<&String> = report.unused_leaf_pointers.iter().take(12).collect();
        bail!(
            "CONFIG_UNUSED_KEYS: {} unused config leaf key(s) detected. First few: {:?}",
            report.unused_leaf_pointers.len(),
            shown
        );
    }

    Ok(report)
}

/// `/sync` covers `/sync` and `/sync/quota_limit`, never `/syncer`.
fn covers(prefix: &str, pointer: &str) -> bool {
    match pointer.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Depth-first visit of every scalar leaf with its JSON pointer. Array
/// elements are addressed by index; `~` and `/` in keys are escaped.
fn for_each_leaf<F>(v: &Value, pointer: &mut String, visit: &mut F) -> Result<()>
where
    F: FnMut(&str, &Value) -> Result<()>,
{
    let base = pointer.len();
    match v {
        Value::Object(map) => {
            for (k, child) in map {
                pointer.push('/');
                pointer.push_str(&k.replace('~', "~0").replace('/', "~1"));
                for_each_leaf(child, pointer, visit)?;
                pointer.truncate(base);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                pointer.push('/');
                pointer.push_str(&i.to_string());
                for_each_leaf(child, pointer, visit)?;
                pointer.truncate(base);
            }
        }
        leaf if pointer.is_empty() => visit("/", leaf)?,
        leaf => visit(pointer, leaf)?,
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

impl LoadedConfig {
    /// Typed, validated view of the merged document.
    pub fn typed(&self) -> Result<DfeConfig> {
        DfeConfig::from_json(&self.config_json)
    }
}

pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut docs: Vec<String> = Vec::new();
    for p in paths {
        let raw =
            fs::read_to_string(p).with_context(|| format!("failed to read yaml path: {p}"))?;
        docs.push(raw);
    }

    let doc_refs: Vec<&str> = docs.iter().map(|s| s.as_str()).collect();
    load_layered_yaml_from_strings(&doc_refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    // Earlier docs are base, later docs override.
    let mut merged = serde_json::json!({});
    for raw in yaml_docs {
        let v_yaml: serde_yaml::Value = serde_yaml::from_str(raw).context("invalid yaml")?;
        let v_json = serde_json::to_value(v_yaml).context("yaml->json conversion failed")?;
        merged = deep_merge(merged, v_json);
    }

    enforce_no_secret_literals(&merged)?;

    let canonical_json = serde_json::to_string(&merged).context("canonical json serialize failed")?;
    let config_hash = sha256_hex(canonical_json.as_bytes());
    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
    })
}

fn deep_merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(mut a_map), Value::Object(b_map)) => {
            for (k, b_val) in b_map {
                let a_val = a_map.remove(&k).unwrap_or(Value::Null);
                a_map.insert(k, deep_merge(a_val, b_val));
            }
            Value::Object(a_map)
        }
        (_, b_other) => b_other,
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn enforce_no_secret_literals(v: &Value) -> Result<()> {
    for_each_leaf(v, &mut String::new(), &mut |pointer, leaf| match leaf.as_str() {
        Some(text) if looks_like_secret(pointer, text) => {
            bail!("CONFIG_SECRET_DETECTED leaf={pointer} value=REDACTED")
        }
        _ => Ok(()),
    })
}

fn looks_like_secret(pointer: &str, s: &str) -> bool {
    let t = s.trim();
    if t.len() < 8 {
        return false;
    }
    if SECRET_PREFIXES.iter().any(|p| t.starts_with(p)) {
        return true;
    }
    t.starts_with(DER_PREFIX) && is_credential_key(pointer)
}

fn is_credential_key(pointer: &str) -> bool {
    let leaf = pointer.rsplit('/').next().unwrap_or_default().to_ascii_lowercase();
    CREDENTIAL_KEY_HINTS.iter().any(|h| leaf.contains(h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn der_prefix_only_counts_under_credential_keys() {
        let blob = "MIIKYQIBAzCCCicGCSqGSIb3DQEHAaCCChgE";
        assert!(looks_like_secret("/accounts/0/certificate_password_env", blob));
        assert!(looks_like_secret("/tls/client_key", blob));
        assert!(!looks_like_secret("/accounts/0/label", blob));
        assert!(!looks_like_secret("/accounts/0/id", "MIINAS-FILIAL-02"));
        // Unconditional prefixes ignore the key name.
        assert!(looks_like_secret("/accounts/0/label", "-----BEGIN CERTIFICATE-----"));
        // A bare array index carries no key name.
        assert!(!looks_like_secret("/accounts/3", blob));
    }

    #[test]
    fn prefix_pointer_respects_token_boundary() {
        assert!(covers("/sync", "/sync/quota_limit"));
        assert!(covers("/sync", "/sync"));
        assert!(!covers("/sync", "/syncer/x"));
    }

    #[test]
    fn leaf_pointers_escape_and_index() {
        let v = serde_json::json!({"a/b": [1, {"c~d": true}], "sync": {"x": null}});
        let mut seen = Vec::new();
        for_each_leaf(&v, &mut String::new(), &mut |p, _| {
            seen.push(p.to_string());
            Ok(())
        })
        .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["/a~1b/0", "/a~1b/1/c~0d", "/sync/x"]);
    }

    #[test]
    fn later_layers_override_earlier() {
        let loaded = load_layered_yaml_from_strings(&[
            "sync:\n  quota_limit: 20\n  long_sleep_secs: 3600\n",
            "sync:\n  quota_limit: 10\n",
        ])
        .unwrap();
        assert_eq!(loaded.config_json.pointer("/sync/quota_limit").unwrap(), 10);
        assert_eq!(loaded.config_json.pointer("/sync/long_sleep_secs").unwrap(), 3600);
    }
}
