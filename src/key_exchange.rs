//! Tang key exchange primitives.
//!
//! Rough description, capitals are public:
//!
//! - The JWE header carries the server derive key `S` (internally the server
//!   has `S = [s]G`) and the provisioning-time client public key `C`.
//! - Recovery creates an ephemeral keypair `e` / `E`, sends `X = C + E` to
//!   the server and receives `Y = [s]X` back.
//! - The unwrapping key is `Y - [e]S = [s]C`, the point the payload key was
//!   originally derived from. The server never learns `C`.
//!
//! The `jose jwk exc` ECMR modes map onto three operations here: plain ECDH
//! when a private scalar is in hand, point addition, and point subtraction.

use base64ct::{Base64UrlUnpadded, Encoding};
use josekit::jwk::{alg::ec::EcCurve, Jwk};
use serde_json::Value;
use zeroize::Zeroize;

use crate::{Error, Result};

pub fn curve_from_name(name: &str) -> Result<EcCurve> {
    match name {
        "P-256" => Ok(EcCurve::P256),
        "P-384" => Ok(EcCurve::P384),
        "P-521" => Ok(EcCurve::P521),
        other => Err(Error::Crypto(format!("unsupported curve {other}"))),
    }
}

/// Full keypair on the named curve, private part included.
pub fn generate_ephemeral(curve_name: &str) -> Result<Jwk> {
    Jwk::generate_ec_key(curve_from_name(curve_name)?).map_err(Into::into)
}

/// Elliptic curve point addition of two public keys.
pub fn ecmr_add(a: &Jwk, b: &Jwk) -> Result<Jwk> {
    match same_curve(a, b)? {
        "P-256" => nist_p256::add(a, b),
        "P-384" => nist_p384::add(a, b),
        "P-521" => nist_p521::add(a, b),
        other => Err(Error::Crypto(format!("unsupported curve {other}"))),
    }
}

/// Elliptic curve point subtraction, `a - b`. The Tang unblinding step.
pub fn ecmr_sub(a: &Jwk, b: &Jwk) -> Result<Jwk> {
    match same_curve(a, b)? {
        "P-256" => nist_p256::sub(a, b),
        "P-384" => nist_p384::sub(a, b),
        "P-521" => nist_p521::sub(a, b),
        other => Err(Error::Crypto(format!("unsupported curve {other}"))),
    }
}

/// Scalar multiplication of `public` by the private scalar of `private`.
/// The result is a full point, serialized as a public JWK, matching
/// `jose jwk exc` rather than the x-only ECDH convention.
pub fn diffie_hellman(private: &Jwk, public: &Jwk) -> Result<Jwk> {
    match same_curve(private, public)? {
        "P-256" => nist_p256::dh(private, public),
        "P-384" => nist_p384::dh(private, public),
        "P-521" => nist_p521::dh(private, public),
        other => Err(Error::Crypto(format!("unsupported curve {other}"))),
    }
}

/// The x coordinate of a point JWK, left-padded to the field size. This is
/// the `Z` input of the JWE key derivation.
pub fn shared_secret_x(jwk: &Jwk) -> Result<Vec<u8>> {
    match curve_of(jwk)? {
        "P-256" => nist_p256::x_coordinate(jwk),
        "P-384" => nist_p384::x_coordinate(jwk),
        "P-521" => nist_p521::x_coordinate(jwk),
        other => Err(Error::Crypto(format!("unsupported curve {other}"))),
    }
}

pub(crate) fn curve_of(jwk: &Jwk) -> Result<&str> {
    match jwk.parameter("crv") {
        Some(Value::String(curve)) => Ok(curve),
        _ => Err(Error::Crypto("missing crv on EC key".into())),
    }
}

fn same_curve<'a>(a: &'a Jwk, b: &Jwk) -> Result<&'a str> {
    let curve = curve_of(a)?;
    if curve != curve_of(b)? {
        return Err(Error::Crypto("key exchange across curves".into()));
    }
    Ok(curve)
}

/// Base64url JWK parameter, left-padded to the curve's field size. JWK
/// encoders may drop leading zero octets.
fn param_bytes(jwk: &Jwk, name: &str, field_size: usize) -> Result<Vec<u8>> {
    let raw = match jwk.parameter(name) {
        Some(Value::String(encoded)) => Base64UrlUnpadded::decode_vec(encoded)
            .map_err(|_| Error::Crypto(format!("{name} is not base64url")))?,
        _ => return Err(Error::Crypto(format!("missing {name} on EC key"))),
    };
    if raw.len() > field_size {
        return Err(Error::Crypto(format!("{name} is too long for the curve")));
    }
    let mut padded = vec![0u8; field_size - raw.len()];
    padded.extend_from_slice(&raw);
    Ok(padded)
}

fn public_jwk(curve: &str, x: &[u8], y: &[u8]) -> Result<Jwk> {
    let mut jwk = Jwk::new("EC");
    jwk.set_parameter("crv", Some(Value::String(curve.into())))?;
    jwk.set_parameter("x", Some(Value::String(Base64UrlUnpadded::encode_string(x))))?;
    jwk.set_parameter("y", Some(Value::String(Base64UrlUnpadded::encode_string(y))))?;
    Ok(jwk)
}

macro_rules! curve_backend {
    ($name:ident, $curve:ident, $crv:literal, $field_size:expr) => {
        mod $name {
            use elliptic_curve::generic_array::GenericArray;
            use elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
            use josekit::jwk::Jwk;
            use zeroize::Zeroize;
            use $curve::{EncodedPoint, ProjectivePoint, PublicKey, SecretKey};

            use crate::{Error, Result};

            const FIELD_SIZE: usize = $field_size;

            fn to_public(jwk: &Jwk) -> Result<PublicKey> {
                let x = super::param_bytes(jwk, "x", FIELD_SIZE)?;
                let y = super::param_bytes(jwk, "y", FIELD_SIZE)?;
                let point = EncodedPoint::from_affine_coordinates(
                    GenericArray::from_slice(&x),
                    GenericArray::from_slice(&y),
                    false,
                );
                Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
                    .ok_or_else(|| Error::Crypto("point is not on the curve".into()))
            }

            fn to_secret(jwk: &Jwk) -> Result<SecretKey> {
                let mut d = super::param_bytes(jwk, "d", FIELD_SIZE)?;
                let key = SecretKey::from_slice(&d)
                    .map_err(|_| Error::Crypto("invalid private scalar".into()));
                d.zeroize();
                key
            }

            fn from_point(point: ProjectivePoint) -> Result<Jwk> {
                let encoded = point.to_affine().to_encoded_point(false);
                match (encoded.x(), encoded.y()) {
                    (Some(x), Some(y)) => super::public_jwk($crv, x, y),
                    _ => Err(Error::Crypto(
                        "key exchange produced the point at infinity".into(),
                    )),
                }
            }

            pub(super) fn add(a: &Jwk, b: &Jwk) -> Result<Jwk> {
                let pa = ProjectivePoint::from(*to_public(a)?.as_affine());
                let pb = ProjectivePoint::from(*to_public(b)?.as_affine());
                from_point(pa + pb)
            }

            pub(super) fn sub(a: &Jwk, b: &Jwk) -> Result<Jwk> {
                let pa = ProjectivePoint::from(*to_public(a)?.as_affine());
                let pb = ProjectivePoint::from(*to_public(b)?.as_affine());
                from_point(pa - pb)
            }

            pub(super) fn dh(private: &Jwk, public: &Jwk) -> Result<Jwk> {
                let secret = to_secret(private)?;
                let point = ProjectivePoint::from(*to_public(public)?.as_affine());
                from_point(point * *secret.to_nonzero_scalar())
            }

            pub(super) fn x_coordinate(jwk: &Jwk) -> Result<Vec<u8>> {
                super::param_bytes(jwk, "x", FIELD_SIZE)
            }
        }
    };
}

curve_backend!(nist_p256, p256, "P-256", 32);
curve_backend!(nist_p384, p384, "P-384", 48);
curve_backend!(nist_p521, p521, "P-521", 66);

/// Scrub a serialized key that is no longer needed.
pub(crate) fn scrub_string(secret: &mut String) {
    secret.zeroize();
}

#[cfg(test)]
#[path = "key_exchange_tests.rs"]
mod tests;
