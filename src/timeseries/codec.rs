//! Fast-cache wire format.
//!
//! A cache entry is a stream of MessagePack `[timestamp, value]` pairs
//! appended one after another, so writers can extend an entry without
//! re-encoding it.

use std::io::Cursor;

use super::FetchError;
use crate::types::Sample;

/// Encode samples as concatenated MessagePack pairs.
pub fn pack(series: &[Sample]) -> Result<Vec<u8>, FetchError> {
    let mut buf = Vec::with_capacity(series.len() * 18);
    for s in series {
        rmp_serde::encode::write(&mut buf, &(s.timestamp, s.value))
            .map_err(|e| FetchError::Encode(e.to_string()))?;
    }
    Ok(buf)
}

/// Decode a stream of MessagePack pairs.
pub fn unpack(bytes: &[u8]) -> Result<Vec<Sample>, FetchError> {
    let mut cursor = Cursor::new(bytes);
    let mut out = Vec::new();
    while usize::try_from(cursor.position()).unwrap_or(usize::MAX) < bytes.len() {
        let pair: (i64, f64) = rmp_serde::decode::from_read(&mut cursor)
            .map_err(|e| FetchError::Decode(e.to_string()))?;
        out.push(Sample::from(pair));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appended_entries_decode_as_one_series() {
        let mut bytes = pack(&[Sample::new(60, 1.5), Sample::new(120, 2.0)]).unwrap();
        bytes.extend(pack(&[Sample::new(180, -3.25)]).unwrap());
        let series = unpack(&bytes).unwrap();
        assert_eq!(
            series,
            vec![
                Sample::new(60, 1.5),
                Sample::new(120, 2.0),
                Sample::new(180, -3.25)
            ]
        );
    }

    #[test]
    fn test_empty_and_corrupt_input() {
        assert!(unpack(&[]).unwrap().is_empty());
        assert!(matches!(unpack(&[0xc1]), Err(FetchError::Decode(_))));
    }
}
