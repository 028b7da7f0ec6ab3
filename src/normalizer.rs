use ethers::types::U256;

use crate::error::{Error, Result};
use crate::models::{identity_of, CanonicalEvent, RawEvent};

/// Turn a raw feed entry into its canonical form.
///
/// Hash and addresses are lowercased; the token id must be a non-negative
/// integer in decimal or `0x` hex. Anything else is a `MalformedEvent`.
pub fn normalize(raw: &RawEvent) -> Result<CanonicalEvent> {
    let identity = identity_of(&raw.tx_hash)?;
    let token_id = parse_token_id(&raw.token_id).map_err(|reason| Error::MalformedEvent {
        tx_hash: raw.tx_hash.clone(),
        reason,
    })?;

    Ok(CanonicalEvent {
        identity,
        from: raw.from.to_lowercase(),
        to: raw.to.to_lowercase(),
        token_id,
    })
}

fn parse_token_id(value: &str) -> std::result::Result<U256, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("missing token id".to_string());
    }

    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) if !hex.is_empty() => U256::from_str_radix(hex, 16).map_err(|e| e.to_string()),
        Some(_) => Err("empty hex token id".to_string()),
        None => U256::from_dec_str(value).map_err(|e| format!("{:?}", e)),
    };

    parsed.map_err(|e| format!("token id '{}' is not a non-negative integer ({})", value, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(tx: &str, token_id: &str) -> RawEvent {
        RawEvent {
            tx_hash: tx.to_string(),
            from: "0xDEFdef0000000000000000000000000000000001".to_string(),
            to: "0xAbC0000000000000000000000000000000000002".to_string(),
            token_id: token_id.to_string(),
            block_number: 10,
            log_index: 0,
        }
    }

    #[test]
    fn lowercases_hash_and_addresses() {
        let event = normalize(&raw("0xABC123", "42")).unwrap();
        assert_eq!(event.identity, "0xabc123");
        assert_eq!(event.from, "0xdefdef0000000000000000000000000000000001");
        assert_eq!(event.to, "0xabc0000000000000000000000000000000000002");
        assert_eq!(event.token_id, U256::from(42u64));
    }

    #[test]
    fn differently_cased_sightings_are_equal() {
        let upper = normalize(&raw("0xAB", "7")).unwrap();
        let mut lower_raw = raw("0xab", "7");
        lower_raw.from = lower_raw.from.to_lowercase();
        lower_raw.block_number = 99;
        assert_eq!(upper, normalize(&lower_raw).unwrap());
    }

    #[test]
    fn accepts_hex_and_full_width_token_ids() {
        assert_eq!(normalize(&raw("0x1", "0xff")).unwrap().token_id, U256::from(255u64));
        assert_eq!(normalize(&raw("0x1", "0X1F")).unwrap().token_id, U256::from(31u64));
        let max = U256::MAX.to_string();
        assert_eq!(normalize(&raw("0x1", &max)).unwrap().token_id, U256::MAX);
    }

    #[test]
    fn rejects_negative_and_non_numeric_token_ids() {
        for bad in ["-1", "abc", "", "1.5", "0x", "0X"] {
            let err = normalize(&raw("0x1", bad)).unwrap_err();
            assert!(
                matches!(err, Error::MalformedEvent { ref tx_hash, .. } if tx_hash == "0x1"),
                "unexpected error for {:?}: {:?}",
                bad,
                err
            );
        }
    }

    #[test]
    fn rejects_missing_hash() {
        assert!(matches!(
            normalize(&raw("", "1")),
            Err(Error::InvalidIdentity(_))
        ));
    }
}
