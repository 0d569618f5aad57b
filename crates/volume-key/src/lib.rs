//! Wire codec for the compound `<id>-<label>` volume identifier shared by
//! the controller and node sides, plus the label-derivation rules used by
//! `CreateVolume`.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("malformed volume id `{0}`: expected `<numeric-id>-<label>`")]
    Malformed(String),

    #[error("volume id `{0}` has a non-numeric id component")]
    BadId(String),

    #[error("volume id `{0}` has an empty label component")]
    EmptyLabel(String),
}

/// A parsed `<id>-<label>` volume identifier.
///
/// `format(parse(s)) == s` holds for every well-formed `s`: round-tripping
/// is the whole point of this type existing as a value rather than a raw
/// `String`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeKey {
    pub id: u64,
    pub label: String,
}

impl VolumeKey {
    pub fn new(id: u64, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        let (id_part, label_part) = s
            .split_once('-')
            .ok_or_else(|| Error::Malformed(s.to_string()))?;

        let id: u64 = id_part
            .parse()
            .map_err(|_| Error::BadId(s.to_string()))?;

        if label_part.is_empty() {
            return Err(Error::EmptyLabel(s.to_string()));
        }

        Ok(Self {
            id,
            label: label_part.to_string(),
        })
    }
}

impl fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.id, self.label)
    }
}

/// Maximum label length the provider accepts, after the prefix is applied.
pub const MAX_LABEL_LEN: usize = 32;

/// Derive a provider-safe label from a requested volume name and the
/// driver's configured prefix.
///
/// Strips everything outside `[A-Za-z0-9]` from `name`, prepends `prefix`
/// (assumed already validated against `[A-Za-z0-9_-]`, see
/// [`validate_prefix`]), and truncates to [`MAX_LABEL_LEN`].
pub fn derive_label(prefix: &str, name: &str) -> String {
    let stripped: String = name.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    let mut label = format!("{prefix}{stripped}");
    label.truncate(MAX_LABEL_LEN);
    label
}

/// Maximum length of a configured label prefix.
pub const MAX_PREFIX_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrefixError {
    #[error("label prefix `{0}` is longer than {MAX_PREFIX_LEN} characters")]
    TooLong(String),

    #[error("label prefix `{0}` contains characters outside [A-Za-z0-9_-]")]
    InvalidChars(String),
}

/// Validate a driver-configured label prefix. Called once at startup;
/// an invalid prefix is a fatal configuration error.
pub fn validate_prefix(prefix: &str) -> Result<(), PrefixError> {
    if prefix.len() > MAX_PREFIX_LEN {
        return Err(PrefixError::TooLong(prefix.to_string()));
    }

    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(PrefixError::InvalidChars(prefix.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_well_formed_ids() {
        for s in ["123-foo", "0-a", "99999999-My_Label-1"] {
            let parsed = VolumeKey::parse(s).expect("should parse");
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn rejects_malformed_ids() {
        assert_eq!(
            VolumeKey::parse("no-dash-missing-actually-has-one"),
            VolumeKey::parse("no-dash-missing-actually-has-one")
        ); // sanity: parse is deterministic
        assert!(matches!(VolumeKey::parse("nodash"), Err(Error::Malformed(_))));
        assert!(matches!(VolumeKey::parse("abc-label"), Err(Error::BadId(_))));
        assert!(matches!(VolumeKey::parse("123-"), Err(Error::EmptyLabel(_))));
    }

    #[test]
    fn derives_label_stripping_and_truncating() {
        let label = derive_label("pfx-", "My Volume! #1 (primary)");
        assert!(label.starts_with("pfx-"));
        assert!(label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(label.len() <= MAX_LABEL_LEN);
    }

    #[test]
    fn validates_prefix() {
        assert!(validate_prefix("csi-").is_ok());
        assert!(validate_prefix("this-prefix-is-too-long").is_err());
        assert!(validate_prefix("bad prefix").is_err());
    }
}
