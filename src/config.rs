//! Configuration schema for the asset list.
//!
//! Three JSON shapes are accepted and normalized to the same list: the full
//! `{"secrets":[...]}` wrapper, a bare array of secret declarations, and a
//! single bare declaration object.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Configuration assumed when stdin carries a JWE rather than a JSON config.
pub const IMPLICIT_CONFIG: &str =
    r#"{"secrets":[{"iMethod":"STDIN", "lockingMethod":"CLEVIS", "eMethod":"STDOUT"}]}"#;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum IngressMethod {
    #[default]
    #[serde(rename = "STDIN")]
    Stdin,
    #[serde(rename = "IFILE")]
    File,
    #[serde(rename = "IPIPE")]
    Pipe,
    /// Reserved; rejected with `Unimplemented` when selected.
    #[serde(rename = "IENVVAR")]
    EnvVar,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum LockingMethod {
    #[default]
    #[serde(rename = "CLEVIS")]
    Clevis,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum EgressMethod {
    #[serde(rename = "STDOUT")]
    Stdout,
    #[default]
    #[serde(rename = "FILE")]
    File,
    #[serde(rename = "PIPE")]
    Pipe,
}

/// One secret declaration: where the JWE comes from and where the unsealed
/// plaintext goes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretConfig {
    #[serde(rename = "iMethod")]
    pub ingress: IngressMethod,
    #[serde(rename = "lockingMethod")]
    pub locking: LockingMethod,
    /// Input JWE path; ignored for stdin ingress.
    #[serde(rename = "in")]
    pub input: Option<PathBuf>,
    #[serde(rename = "eMethod")]
    pub egress: EgressMethod,
    /// Egress sink path; required for file and pipe egress.
    pub out: Option<PathBuf>,
    /// Number of reads a file sink survives; 0 means 1.
    #[serde(rename = "outCount")]
    pub out_count: u64,
}

impl SecretConfig {
    pub fn print_info(&self) {
        log::debug!("a secret declaration");
        log::debug!("  ingestion: {:?} locking {:?} in {:?}", self.ingress, self.locking, self.input);
        log::debug!(
            "  egress:    {:?} out {:?} read count {}",
            self.egress,
            self.out,
            self.out_count
        );
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SecretList {
    #[serde(default)]
    pub secrets: Vec<SecretConfig>,
}

/// A leading `{` or `[` on stdin marks a configuration rather than a JWE.
pub fn looks_like_config(first_byte: u8) -> bool {
    first_byte == b'{' || first_byte == b'['
}

pub fn parse(input: &str) -> Result<SecretList> {
    let value: Value = serde_json::from_str(input.trim())
        .map_err(|err| Error::ConfigInvalid(format!("not valid JSON - {err}")))?;

    let list = match value {
        Value::Array(_) => SecretList {
            secrets: from_value(value)?,
        },
        Value::Object(ref map) if map.contains_key("secrets") => from_value(value)?,
        Value::Object(_) => SecretList {
            secrets: vec![from_value(value)?],
        },
        _ => {
            return Err(Error::ConfigInvalid(
                "expected a JSON object or array".into(),
            ))
        }
    };

    Ok(list)
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|err| Error::ConfigInvalid(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{"secrets":[{"iMethod":"IFILE","in":"/tmp/t.jwe","eMethod":"FILE","out":"/tmp/p","outCount":2}]}"#;
    const BARE_ARRAY: &str = r#"[{"iMethod":"IFILE","in":"/tmp/t.jwe","eMethod":"FILE","out":"/tmp/p","outCount":2}]"#;
    const BARE_OBJECT: &str = r#"{"iMethod":"IFILE","in":"/tmp/t.jwe","eMethod":"FILE","out":"/tmp/p","outCount":2}"#;

    #[test]
    fn all_shapes_yield_the_same_list() {
        for shape in [FULL, BARE_ARRAY, BARE_OBJECT] {
            let list = parse(shape).unwrap();
            assert_eq!(list.secrets.len(), 1);
            let secret = &list.secrets[0];
            assert_eq!(secret.ingress, IngressMethod::File);
            assert_eq!(secret.input.as_deref(), Some(std::path::Path::new("/tmp/t.jwe")));
            assert_eq!(secret.egress, EgressMethod::File);
            assert_eq!(secret.out.as_deref(), Some(std::path::Path::new("/tmp/p")));
            assert_eq!(secret.out_count, 2);
        }
    }

    #[test]
    fn implicit_config_parses() {
        let list = parse(IMPLICIT_CONFIG).unwrap();
        assert_eq!(list.secrets.len(), 1);
        assert_eq!(list.secrets[0].ingress, IngressMethod::Stdin);
        assert_eq!(list.secrets[0].locking, LockingMethod::Clevis);
        assert_eq!(list.secrets[0].egress, EgressMethod::Stdout);
    }

    #[test]
    fn defaults_apply_to_sparse_entries() {
        let list = parse(r#"{"in":"/tmp/x.jwe","out":"/tmp/y"}"#).unwrap();
        let secret = &list.secrets[0];
        assert_eq!(secret.locking, LockingMethod::Clevis);
        assert_eq!(secret.egress, EgressMethod::File);
        assert_eq!(secret.out_count, 0);
    }

    #[test]
    fn unknown_method_is_rejected() {
        assert!(matches!(
            parse(r#"{"eMethod":"SOCKET"}"#),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn config_detection_by_first_byte() {
        assert!(looks_like_config(b'{'));
        assert!(looks_like_config(b'['));
        assert!(!looks_like_config(b'e')); // JWEs start with a base64url header
    }
}
