//! CRDT byte operations over Loro encodings.
//!
//! Storages treat document bytes as opaque; these helpers are the only place
//! that decodes them. Every function builds a throwaway `LoroDoc`, so nothing
//! here mutates stored state.

use crate::error::{Result, StoreError};
use loro::{ExportMode, LoroDoc, LoroValue, VersionVector};

/// Build a document from an update or snapshot. Empty input is an empty doc.
pub fn load(bin: &[u8]) -> Result<LoroDoc> {
    let doc = LoroDoc::new();
    if !bin.is_empty() {
        doc.import(bin)
            .map_err(|e| StoreError::Integrity(format!("unparsable update: {}", e)))?;
    }
    Ok(doc)
}

/// Reject bytes that do not decode as a Loro update or snapshot.
pub fn validate_update(bin: &[u8]) -> Result<()> {
    if bin.is_empty() {
        return Err(StoreError::Integrity("empty update".into()));
    }
    load(bin).map(|_| ())
}

/// Fold updates (and at most one leading snapshot) into a single snapshot.
pub fn merge_updates(updates: &[Vec<u8>]) -> Result<Vec<u8>> {
    let non_empty: Vec<Vec<u8>> = updates.iter().filter(|u| !u.is_empty()).cloned().collect();
    if non_empty.len() == 1 {
        return Ok(non_empty.into_iter().next().unwrap_or_default());
    }

    let doc = LoroDoc::new();
    if !non_empty.is_empty() {
        doc.import_batch(&non_empty)
            .map_err(|e| StoreError::Integrity(format!("merge failed: {}", e)))?;
    }
    export_snapshot(&doc)
}

fn export_snapshot(doc: &LoroDoc) -> Result<Vec<u8>> {
    doc.export(ExportMode::Snapshot)
        .map_err(|e| StoreError::Integrity(format!("export failed: {}", e)))
}

/// Encoded version vector of a document.
pub fn encode_state_vector(bin: &[u8]) -> Result<Vec<u8>> {
    Ok(load(bin)?.oplog_vv().encode())
}

fn decode_state_vector(state: &[u8]) -> Result<VersionVector> {
    VersionVector::decode(state)
        .map_err(|e| StoreError::Integrity(format!("invalid state vector: {}", e)))
}

/// Compute what a peer with `state_vector` is missing from `bin`.
///
/// Returns `(missing, state)`: the update bytes to send and the encoded
/// version vector of `bin`. Without a state vector the whole document is
/// missing.
pub fn diff_update(bin: &[u8], state_vector: Option<&[u8]>) -> Result<(Vec<u8>, Vec<u8>)> {
    let doc = load(bin)?;
    let state = doc.oplog_vv().encode();

    let missing = match state_vector {
        Some(sv) if !sv.is_empty() => {
            let from = decode_state_vector(sv)?;
            doc.export(ExportMode::updates(&from))
                .map_err(|e| StoreError::Integrity(format!("export failed: {}", e)))?
        }
        _ => export_snapshot(&doc)?,
    };

    Ok((missing, state))
}

/// Whether state vector `current` has seen everything `other` has.
pub fn state_includes(current: &[u8], other: &[u8]) -> Result<bool> {
    if other.is_empty() {
        return Ok(true);
    }
    let other = decode_state_vector(other)?;
    let current = if current.is_empty() {
        VersionVector::default()
    } else {
        decode_state_vector(current)?
    };
    Ok(current.includes_vv(&other))
}

/// Whether two encoded state vectors describe the same version. Encodings
/// are not canonical, so compare decoded vectors.
pub fn state_equals(a: &[u8], b: &[u8]) -> Result<bool> {
    Ok(state_includes(a, b)? && state_includes(b, a)?)
}

/// Materialized JSON view of the document state.
pub fn to_json(bin: &[u8]) -> Result<serde_json::Value> {
    let doc = load(bin)?;
    Ok(loro_value_to_json(&doc.get_deep_value()))
}

fn loro_value_to_json(value: &LoroValue) -> serde_json::Value {
    match value {
        LoroValue::Null => serde_json::Value::Null,
        LoroValue::Bool(b) => serde_json::Value::Bool(*b),
        LoroValue::I64(n) => serde_json::json!(*n),
        LoroValue::Double(n) => serde_json::json!(*n),
        LoroValue::String(s) => serde_json::Value::String(s.to_string()),
        LoroValue::List(list) => {
            serde_json::Value::Array(list.iter().map(loro_value_to_json).collect())
        }
        LoroValue::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), loro_value_to_json(v)))
                .collect(),
        ),
        _ => serde_json::Value::Null,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_merge_is_order_independent() {
        let a = text_update(1, "hello");
        let b = text_update(2, "world");

        let ab = merge_updates(&[a.clone(), b.clone()]).unwrap();
        let ba = merge_updates(&[b, a]).unwrap();

        assert_eq!(to_json(&ab).unwrap(), to_json(&ba).unwrap());
        assert!(state_equals(
            &encode_state_vector(&ab).unwrap(),
            &encode_state_vector(&ba).unwrap()
        )
        .unwrap());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let a = text_update(1, "hello");
        let once = merge_updates(&[a.clone()]).unwrap();
        let twice = merge_updates(&[a.clone(), a]).unwrap();

        assert_eq!(body_text(&once), body_text(&twice));
        assert!(state_equals(
            &encode_state_vector(&once).unwrap(),
            &encode_state_vector(&twice).unwrap()
        )
        .unwrap());
    }

    #[test]
    fn test_diff_against_state_vector_carries_only_missing_ops() {
        let a = text_update(1, "hello");
        let b = text_update(2, "world");
        let both = merge_updates(&[a.clone(), b]).unwrap();

        let sv_a = encode_state_vector(&a).unwrap();
        let (missing, state) = diff_update(&both, Some(&sv_a)).unwrap();

        let rebuilt = merge_updates(&[a, missing]).unwrap();
        assert_eq!(to_json(&rebuilt).unwrap(), to_json(&both).unwrap());
        assert!(state_includes(&state, &sv_a).unwrap());
        assert!(!state_includes(&sv_a, &state).unwrap());
    }

    #[test]
    fn test_corrupt_bytes_are_integrity_errors() {
        let err = validate_update(&[0xde, 0xad, 0xbe, 0xef]).unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
        assert!(validate_update(&[]).is_err());
    }

    #[test]
    fn test_empty_state_is_included_everywhere() {
        let a = text_update(1, "x");
        let sv = encode_state_vector(&a).unwrap();
        assert!(state_includes(&sv, &[]).unwrap());
        assert!(!state_includes(&[], &sv).unwrap());
    }

    #[test]
    fn test_state_equals_ignores_encoding_order() {
        let a = text_update(1, "x");
        let b = text_update(2, "y");
        let sv_a = encode_state_vector(&a).unwrap();
        let sv_ab = encode_state_vector(&merge_updates(&[a.clone(), b.clone()]).unwrap()).unwrap();
        let sv_ba = encode_state_vector(&merge_updates(&[b, a]).unwrap()).unwrap();

        assert!(state_equals(&sv_ab, &sv_ba).unwrap());
        assert!(!state_equals(&sv_a, &sv_ab).unwrap());
        assert!(state_equals(&[], &[]).unwrap());
    }
}
