use std::fmt::Write as _;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::coordinate::{Address, Coordinate, COORDINATE_SCHEMA_VERSION};
use crate::Stat7Error;

/// Decimal places kept for every float in the canonical form.
pub const CANONICAL_FLOAT_PRECISION: usize = 8;

type HmacSha256 = Hmac<Sha256>;

fn canonical_float(value: f64) -> String {
    let rendered = format!("{value:.CANONICAL_FLOAT_PRECISION$}");
    // -0 and values that round to it share one rendering.
    match rendered.strip_prefix('-') {
        Some(magnitude) if magnitude.bytes().all(|byte| byte == b'0' || byte == b'.') => {
            magnitude.to_string()
        }
        _ => rendered,
    }
}

/// Renders a coordinate as compact JSON with lexicographically sorted keys,
/// fixed-precision floats, and the adjacency set in ascending order.
#[must_use]
pub fn canonical_coordinate(coordinate: &Coordinate) -> String {
    let mut out = String::with_capacity(256);
    out.push_str("{\"adjacency\":[");
    for (index, address) in coordinate.adjacency.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        let _ = write!(out, "\"{address}\"");
    }
    let _ = write!(
        out,
        "],\"dimensionality\":{},\"horizon\":\"{}\",\"lineage\":{},\"luminosity\":{},\"polarity\":[",
        coordinate.dimensionality,
        coordinate.horizon.as_str(),
        coordinate.lineage,
        canonical_float(coordinate.luminosity),
    );
    for (index, component) in coordinate.polarity.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push_str(&canonical_float(*component));
    }
    let _ = write!(
        out,
        "],\"realm\":\"{}\",\"schema\":\"{COORDINATE_SCHEMA_VERSION}\"}}",
        coordinate.realm.as_str()
    );
    out
}

/// SHA-256 over the canonical coordinate bytes followed by the raw payload.
#[must_use]
pub fn compute_address(coordinate: &Coordinate, payload: &[u8]) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(canonical_coordinate(coordinate).as_bytes());
    hasher.update(payload);
    Address::from_digest_hex(format!("{:x}", hasher.finalize()))
}

/// HMAC-SHA256 of the address text, hex encoded.
///
/// # Errors
/// Returns `Stat7Error::Validation` when the key is rejected by the MAC.
pub fn sign_address(key: &[u8], address: &Address) -> Result<String, Stat7Error> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| Stat7Error::Validation(format!("invalid signing key: {err}")))?;
    mac.update(address.as_str().as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// # Errors
/// Returns `Stat7Error::Integrity` when the signature is malformed or does not match.
pub fn verify_signature(key: &[u8], address: &Address, signature: &str) -> Result<(), Stat7Error> {
    let expected = hex::decode(signature)
        .map_err(|err| Stat7Error::Integrity(format!("signature is not valid hex: {err}")))?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| Stat7Error::Validation(format!("invalid signing key: {err}")))?;
    mac.update(address.as_str().as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| Stat7Error::Integrity(format!("signature does not match address {address}")))
}
