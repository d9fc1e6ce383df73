use base64ct::{Base64UrlUnpadded, Encoding};

use crate::Result;

pub fn b64url_decode(input: &str) -> Result<Vec<u8>> {
    Base64UrlUnpadded::decode_vec(input.trim()).map_err(Into::into)
}

pub fn b64url_encode(input: &[u8]) -> String {
    Base64UrlUnpadded::encode_string(input)
}
