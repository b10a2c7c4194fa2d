//! Selection token codec.
//!
//! A selection is an ordered list of [`StreamKey`]s. It travels through work
//! requests as a single string: the components of one key are joined by `,`
//! and keys are joined by `|`, e.g. `0,1,2|0,1,3`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Separator between keys in a selection token.
pub const KEY_SEPARATOR: char = '|';

/// Separator between the components of one key.
pub const COMPONENT_SEPARATOR: char = ',';

/// Coordinate of one elementary stream inside a manifest's track hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub period_index: u32,
    pub group_index: u32,
    pub track_index: u32,
}

impl StreamKey {
    pub const fn new(period_index: u32, group_index: u32, track_index: u32) -> Self {
        Self {
            period_index,
            group_index,
            track_index,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.period_index,
            self.group_index,
            self.track_index,
            sep = COMPONENT_SEPARATOR
        )
    }
}

impl FromStr for StreamKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(COMPONENT_SEPARATOR).collect();
        let [period, group, track] = parts.as_slice() else {
            return Err(Error::decode(
                s,
                format!("expected 3 components, found {}", parts.len()),
            ));
        };

        Ok(Self::new(
            parse_component(s, period)?,
            parse_component(s, group)?,
            parse_component(s, track)?,
        ))
    }
}

/// Parse one component strictly: plain ASCII digits only.
///
/// `u32::from_str` accepts a leading `+`, which would break the
/// encode/decode round trip, so the digits are checked first.
fn parse_component(segment: &str, component: &str) -> Result<u32> {
    if component.is_empty() || !component.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::decode(
            segment,
            format!("`{component}` is not a non-negative integer"),
        ));
    }
    component
        .parse::<u32>()
        .map_err(|e| Error::decode(segment, format!("`{component}`: {e}")))
}

/// Encode an ordered selection into a token.
///
/// Components are unsigned, so the only malformed input is an empty selection.
pub fn encode(keys: &[StreamKey]) -> Result<String> {
    if keys.is_empty() {
        return Err(Error::Encoding(
            "cannot encode an empty stream key selection".to_string(),
        ));
    }

    let token = keys
        .iter()
        .map(StreamKey::to_string)
        .collect::<Vec<_>>()
        .join(&KEY_SEPARATOR.to_string());
    Ok(token)
}

/// Decode a token produced by [`encode`].
pub fn decode(token: &str) -> Result<Vec<StreamKey>> {
    if token.is_empty() {
        return Err(Error::decode(token, "token is empty"));
    }

    token
        .split(KEY_SEPARATOR)
        .map(|segment| {
            segment
                .parse::<StreamKey>()
                .map_err(|e| match e {
                    Error::Decode { reason, .. } => Error::decode(token, reason),
                    other => other,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_single_key() {
        let token = encode(&[StreamKey::new(0, 1, 2)]).unwrap();
        assert_eq!(token, "0,1,2");
    }

    #[test]
    fn test_encode_multiple_keys() {
        let token = encode(&[StreamKey::new(0, 1, 2), StreamKey::new(0, 1, 3)]).unwrap();
        assert_eq!(token, "0,1,2|0,1,3");
    }

    #[test]
    fn test_encode_empty_fails() {
        assert!(matches!(encode(&[]), Err(Error::Encoding(_))));
    }

    #[test]
    fn test_round_trip_preserves_order() {
        let keys = vec![
            StreamKey::new(3, 0, 7),
            StreamKey::new(0, 0, 0),
            StreamKey::new(1, u32::MAX, 12),
            StreamKey::new(0, 0, 0),
        ];
        let decoded = decode(&encode(&keys).unwrap()).unwrap();
        assert_eq!(decoded, keys);
    }

    #[test]
    fn test_decode_rejects_malformed_tokens() {
        for token in ["", "a,b", "1,2", "1,2,3,4", "0,1,2|", "|0,1,2", "0,-1,2", "0, 1,2", "+1,2,3", "1,,2"] {
            assert!(
                matches!(decode(token), Err(Error::Decode { .. })),
                "token {token:?} should fail"
            );
        }
    }

    #[test]
    fn test_decode_error_reports_whole_token() {
        let err = decode("0,1,2|9,9").unwrap_err();
        match err {
            Error::Decode { token, reason } => {
                assert_eq!(token, "0,1,2|9,9");
                assert!(reason.contains("found 2"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_rejects_overflow() {
        assert!(decode("0,0,4294967296").is_err());
    }

    #[test]
    fn test_stream_key_display_and_parse() {
        let key = StreamKey::new(2, 5, 9);
        assert_eq!(key.to_string(), "2,5,9");
        assert_eq!("2,5,9".parse::<StreamKey>().unwrap(), key);
    }
}
