//! Voice identity: a (language, type) pair addressed by the engine agent.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TtsError};

/// `type` field of the engine plugin ABI: `Male=1, Female=2, Child=3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum VoiceType {
    Male = 1,
    Female = 2,
    Child = 3,
}

impl VoiceType {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(VoiceType::Male),
            2 => Some(VoiceType::Female),
            3 => Some(VoiceType::Child),
            _ => None,
        }
    }
}

/// A voice: a locale-tagged language plus a voice type.
///
/// `language` is formatted as two-letter language + underscore + two-letter
/// country, e.g. `"en_US"`, `"ko_KR"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Voice {
    pub language: String,
    pub voice_type: VoiceType,
}

impl Voice {
    pub fn new(language: impl Into<String>, voice_type: VoiceType) -> Result<Self> {
        let language = language.into();
        validate_locale(&language)?;
        Ok(Self {
            language,
            voice_type,
        })
    }
}

/// Validates the `xx_XX` locale tag shape used throughout the engine ABI.
pub fn validate_locale(tag: &str) -> Result<()> {
    let bytes = tag.as_bytes();
    let ok = bytes.len() == 5
        && bytes[0].is_ascii_lowercase()
        && bytes[1].is_ascii_lowercase()
        && bytes[2] == b'_'
        && bytes[3].is_ascii_uppercase()
        && bytes[4].is_ascii_uppercase();
    if ok {
        Ok(())
    } else {
        Err(TtsError::InvalidParameter(format!(
            "malformed locale tag: {tag:?}"
        )))
    }
}

/// Default/"auto" speed sentinel understood by the client.
pub const SPEED_AUTO: u32 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_locales() {
        assert!(validate_locale("en_US").is_ok());
        assert!(validate_locale("ko_KR").is_ok());
    }

    #[test]
    fn rejects_malformed_locales() {
        assert!(validate_locale("english").is_err());
        assert!(validate_locale("EN_us").is_err());
        assert!(validate_locale("en-US").is_err());
        assert!(validate_locale("").is_err());
    }

    #[test]
    fn voice_type_round_trips_through_i32() {
        assert_eq!(VoiceType::from_i32(1), Some(VoiceType::Male));
        assert_eq!(VoiceType::from_i32(2), Some(VoiceType::Female));
        assert_eq!(VoiceType::from_i32(3), Some(VoiceType::Child));
        assert_eq!(VoiceType::from_i32(4), None);
    }
}
