//! JWE decomposition and payload recovery.
//!
//! A Clevis JWE is compact-serialized: five base64url segments separated by
//! `.`. The protected header carries everything recovery needs: the AEAD
//! name, the provisioning-time EPK, the server key id, and the `clevis.tang`
//! claim with the server URL and its advertised key set.

use aes::Aes192;
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use josekit::jwk::Jwk;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::key_exchange;
use crate::util::b64url_decode;
use crate::{Error, Result};

type Aes192Gcm = AesGcm<Aes192, U12>;

/// The advertised key set carried in the `clevis.tang.adv` claim.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JwkSet {
    keys: Vec<Jwk>,
}

impl JwkSet {
    /// Find the advertised key whose RFC 7638 thumbprint matches `kid`.
    /// SHA-256 thumbprints are tried first, SHA-1 as a legacy fallback.
    pub fn get_key_by_id(&self, kid: &str) -> Result<&Jwk> {
        for key in &self.keys {
            if make_thumbprint(key, ThpHashAlg::Sha256)? == kid {
                return Ok(key);
            }
            if make_thumbprint(key, ThpHashAlg::Sha1)? == kid {
                return Ok(key);
            }
        }
        Err(Error::JweParse(format!(
            "no advertised key matches the kid {kid}"
        )))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ThpHashAlg {
    Sha1,
    Sha256,
}

/// Jwk thumbprint as described in RFC7638 section 3.1. Tang keys are EC, so
/// only the EC canonical form is produced here.
fn make_thumbprint(jwk: &Jwk, alg: ThpHashAlg) -> Result<String> {
    if jwk.key_type() != "EC" {
        return Err(Error::JweParse(format!(
            "unsupported key type {}",
            jwk.key_type()
        )));
    }

    let to_enc = serde_json::json! {{
        "crv": get_jwk_param(jwk, "crv")?,
        "kty": jwk.key_type(),
        "x": get_jwk_param(jwk, "x")?,
        "y": get_jwk_param(jwk, "y")?,
    }};
    let to_hash = to_enc.to_string();

    let digest = match alg {
        ThpHashAlg::Sha1 => {
            let mut hasher = sha1::Sha1::new();
            hasher.update(to_hash.as_bytes());
            hasher.finalize().to_vec()
        }
        ThpHashAlg::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(to_hash.as_bytes());
            hasher.finalize().to_vec()
        }
    };
    Ok(crate::util::b64url_encode(&digest))
}

/// SHA-256 thumbprint of an EC JWK.
pub fn thumbprint(jwk: &Jwk) -> Result<String> {
    make_thumbprint(jwk, ThpHashAlg::Sha256)
}

fn get_jwk_param<'a>(jwk: &'a Jwk, key: &str) -> Result<&'a Value> {
    jwk.parameter(key)
        .ok_or_else(|| Error::JweParse(format!("missing key {key}")))
}

/// A decomposed Clevis JWE, immutable once parsed.
#[derive(Debug)]
pub struct JweEnvelope {
    /// First compact segment as received; it is the AEAD associated data.
    protected_b64: String,
    header: Map<String, Value>,
    pub enc: String,
    pub epk: Jwk,
    pub epk_curve: String,
    pub kid: String,
    pub adv: JwkSet,
    pub active_server_key: Jwk,
    pub url: String,
    iv: Vec<u8>,
    ciphertext: Vec<u8>,
    tag: Vec<u8>,
}

pub fn parse_jwe(input: &[u8]) -> Result<JweEnvelope> {
    let text = std::str::from_utf8(input)
        .map_err(|_| Error::JweParse("input is not valid UTF-8".into()))?
        .trim();

    let segments: Vec<&str> = text.split('.').collect();
    if segments.len() != 5 {
        return Err(Error::JweParse(format!(
            "expected 5 compact segments, found {}",
            segments.len()
        )));
    }

    let header_bytes = b64url_decode(segments[0])
        .map_err(|_| Error::JweParse("protected header is not base64url".into()))?;
    let header: Map<String, Value> = serde_json::from_slice(&header_bytes)
        .map_err(|err| Error::JweParse(format!("protected header is not JSON - {err}")))?;

    let alg = string_claim(&header, "alg")?;
    if alg != "ECDH-ES" {
        return Err(Error::JweParse(format!("unsupported alg {alg}")));
    }
    if !segments[1].is_empty() {
        return Err(Error::JweParse(
            "ECDH-ES direct agreement leaves the encrypted key segment empty".into(),
        ));
    }

    let iv =
        b64url_decode(segments[2]).map_err(|_| Error::JweParse("iv is not base64url".into()))?;
    let ciphertext = b64url_decode(segments[3])
        .map_err(|_| Error::JweParse("ciphertext is not base64url".into()))?;
    let tag =
        b64url_decode(segments[4]).map_err(|_| Error::JweParse("tag is not base64url".into()))?;

    let enc = string_claim(&header, "enc")?.to_owned();
    let kid = string_claim(&header, "kid")?.to_owned();
    let epk: Jwk = serde_json::from_value(claim(&header, "epk")?.clone())
        .map_err(|err| Error::JweParse(format!("epk is not a JWK - {err}")))?;
    let epk_curve = key_exchange::curve_of(&epk)
        .map_err(|_| Error::JweParse("epk has no curve".into()))?
        .to_owned();
    key_exchange::curve_from_name(&epk_curve)
        .map_err(|_| Error::JweParse(format!("unsupported epk curve {epk_curve}")))?;

    let clevis = claim(&header, "clevis")?;
    let pin = clevis
        .get("pin")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::JweParse("missing clevis.pin".into()))?;
    if pin != "tang" {
        return Err(Error::JweParse(format!("unsupported clevis pin {pin}")));
    }
    let tang = clevis
        .get("tang")
        .ok_or_else(|| Error::JweParse("missing clevis.tang".into()))?;
    let url = tang
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::JweParse("missing clevis.tang.url".into()))?
        .to_owned();
    let adv: JwkSet = serde_json::from_value(
        tang.get("adv")
            .ok_or_else(|| Error::JweParse("missing clevis.tang.adv".into()))?
            .clone(),
    )
    .map_err(|err| Error::JweParse(format!("clevis.tang.adv is not a key set - {err}")))?;

    let active_server_key = adv.get_key_by_id(&kid)?.clone();
    let server_curve = key_exchange::curve_of(&active_server_key)
        .map_err(|_| Error::JweParse("advertised key has no curve".into()))?;
    if server_curve != epk_curve {
        return Err(Error::JweParse(
            "epk and advertised key live on different curves".into(),
        ));
    }

    Ok(JweEnvelope {
        protected_b64: segments[0].to_owned(),
        header,
        enc,
        epk,
        epk_curve,
        kid,
        adv,
        active_server_key,
        url,
        iv,
        ciphertext,
        tag,
    })
}

impl JweEnvelope {
    pub fn protected_header(&self) -> &Map<String, Value> {
        &self.header
    }

    /// Human readable protected header; the header only holds public data.
    pub fn pretty_header(&self) -> String {
        serde_json::to_string_pretty(&Value::Object(self.header.clone()))
            .unwrap_or_else(|_| "{}".into())
    }
}

/// Human-readable JWK for debug output. Private fields are elided.
pub fn pretty_print(jwk: &Jwk) -> String {
    let mut map: Map<String, Value> = jwk.clone().into();
    map.remove("d");
    serde_json::to_string_pretty(&Value::Object(map)).unwrap_or_else(|_| "{}".into())
}

/// Remove the private scalar from a key, in place.
pub fn strip_private(jwk: &mut Jwk) -> Result<()> {
    jwk.set_parameter("d", None)?;
    Ok(())
}

/// The `/rec` response body is a JWK, normally as raw JSON. Compatible mode
/// additionally accepts a base64url-wrapped JWK, which older servers emit.
pub fn parse_recovered_key(body: &[u8], compatible: bool) -> Result<Jwk> {
    let text = std::str::from_utf8(body)
        .map_err(|_| Error::Crypto("tang response is not valid UTF-8".into()))?
        .trim();

    match serde_json::from_str::<Jwk>(text) {
        Ok(jwk) => Ok(jwk),
        Err(_) if compatible => {
            let raw = b64url_decode(text).map_err(|_| {
                Error::Crypto("tang response is neither a JWK nor base64url".into())
            })?;
            serde_json::from_slice(&raw)
                .map_err(|err| Error::Crypto(format!("decoded tang response is not a JWK - {err}")))
        }
        Err(err) => Err(Error::Crypto(format!("tang response is not a JWK - {err}"))),
    }
}

fn enc_key_len(enc: &str) -> Option<usize> {
    match enc {
        "A128GCM" => Some(16),
        "A192GCM" => Some(24),
        "A256GCM" => Some(32),
        _ => None,
    }
}

/// The Concat KDF of RFC 7518 section 4.6. For direct ECDH-ES agreement the
/// AlgorithmID is the `enc` name and the derived key is the CEK itself.
pub(crate) fn concat_kdf(z: &[u8], alg: &str, apu: &[u8], apv: &[u8], key_len: usize) -> Vec<u8> {
    let mut other_info = Vec::new();
    for field in [alg.as_bytes(), apu, apv] {
        other_info.extend_from_slice(&(field.len() as u32).to_be_bytes());
        other_info.extend_from_slice(field);
    }
    other_info.extend_from_slice(&((key_len as u32) * 8).to_be_bytes());

    let mut derived = Vec::with_capacity(key_len.div_ceil(32) * 32);
    let mut round = 1u32;
    while derived.len() < key_len {
        let mut hasher = Sha256::new();
        hasher.update(round.to_be_bytes());
        hasher.update(z);
        hasher.update(&other_info);
        derived.extend_from_slice(&hasher.finalize());
        round += 1;
    }
    derived.truncate(key_len);
    derived
}

/// Standard JWE CEK derivation (ECDH-ES + Concat KDF) followed by AEAD
/// decryption of the payload. `unwrapping` is the recovered exchange point.
pub fn decrypt_payload(unwrapping: &Jwk, envelope: &JweEnvelope) -> Result<Vec<u8>> {
    let key_len = enc_key_len(&envelope.enc)
        .ok_or_else(|| Error::Crypto(format!("unsupported enc {}", envelope.enc)))?;
    if envelope.iv.len() != 12 {
        return Err(Error::Crypto("GCM requires a 96-bit IV".into()));
    }

    let mut z = key_exchange::shared_secret_x(unwrapping)?;
    let apu = optional_b64_claim(&envelope.header, "apu")?;
    let apv = optional_b64_claim(&envelope.header, "apv")?;
    let mut cek = concat_kdf(&z, &envelope.enc, &apu, &apv, key_len);
    z.zeroize();

    let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + envelope.tag.len());
    sealed.extend_from_slice(&envelope.ciphertext);
    sealed.extend_from_slice(&envelope.tag);
    let payload = Payload {
        msg: &sealed,
        aad: envelope.protected_b64.as_bytes(),
    };
    let nonce = Nonce::<U12>::from_slice(&envelope.iv);

    let plaintext = match key_len {
        16 => Aes128Gcm::new_from_slice(&cek)
            .map_err(|_| Error::Crypto("bad CEK length".into()))?
            .decrypt(nonce, payload),
        24 => Aes192Gcm::new_from_slice(&cek)
            .map_err(|_| Error::Crypto("bad CEK length".into()))?
            .decrypt(nonce, payload),
        _ => Aes256Gcm::new_from_slice(&cek)
            .map_err(|_| Error::Crypto("bad CEK length".into()))?
            .decrypt(nonce, payload),
    };
    cek.zeroize();

    plaintext.map_err(|_| Error::Crypto("payload authentication failed".into()))
}

fn string_claim<'a>(header: &'a Map<String, Value>, name: &str) -> Result<&'a str> {
    claim(header, name)?
        .as_str()
        .ok_or_else(|| Error::JweParse(format!("{name} is not a string")))
}

fn claim<'a>(header: &'a Map<String, Value>, name: &str) -> Result<&'a Value> {
    header
        .get(name)
        .ok_or_else(|| Error::JweParse(format!("missing {name} in protected header")))
}

fn optional_b64_claim(header: &Map<String, Value>, name: &str) -> Result<Vec<u8>> {
    match header.get(name) {
        Some(Value::String(encoded)) => {
            b64url_decode(encoded).map_err(|_| Error::JweParse(format!("{name} is not base64url")))
        }
        Some(_) => Err(Error::JweParse(format!("{name} is not a string"))),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
#[path = "jose_tests.rs"]
mod tests;
