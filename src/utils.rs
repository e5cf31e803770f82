//! Utility functions for identifiers and hashing

use bech32::Bech32m;
use uuid7::uuid7;

pub const TRADE_HRP: &str = "trade_";
pub const USER_HRP: &str = "user_";
pub const ITEM_HRP: &str = "item_";
pub const HOLD_HRP: &str = "hold_";
pub const RATING_HRP: &str = "rating_";
pub const DISPUTE_HRP: &str = "dispute_";

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Same as [`new_uuid_to_bech32`] for the fixed prefixes above, which always parse.
pub(crate) fn new_id(hrp: &'static str) -> String {
    match new_uuid_to_bech32(hrp) {
        Ok(id) => id,
        // the prefixes are constants, so a parse failure is a programming error
        Err(e) => unreachable!("invalid built-in id prefix {hrp}: {e}"),
    }
}

/// Encodes a value with minicbor and returns `(sha256 hex digest, cbor bytes)`.
pub fn hash_cbor<T: minicbor::Encode<()>>(value: &T) -> anyhow::Result<(String, Vec<u8>)> {
    let cbor = minicbor::to_vec(value)?;
    let hash = sha256::digest(&cbor);
    Ok((hash, cbor))
}
