/// Encode a (salt, digest) pair as an HTTP Basic Authorization value.
pub fn to_basic_auth(salt: &str, digest: &str) -> String {
    format!("Basic {}", base64::encode(format!("{salt}:{digest}")))
}

/// Decode an HTTP Basic Authorization value into its (salt, digest) pair.
pub fn decode_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (salt, digest) = decoded.split_once(':')?;
    Some((salt.to_string(), digest.to_string()))
}
