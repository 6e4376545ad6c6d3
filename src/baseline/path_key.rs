//! JSON-safe encoding of arbitrary path bytes.
//!
//! Paths are written as strings. `%` and every byte that is not part of valid
//! UTF-8 are escaped as `%xx`, so any Linux file name survives a round trip.
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};
use std::{
    collections::BTreeMap,
    ffi::OsString,
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
};

pub fn encode(path: &Path) -> String {
    let bytes = path.as_os_str().as_bytes();
    let mut out = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        for c in chunk.valid().chars() {
            if c == '%' {
                out.push_str("%25");
            } else {
                out.push(c);
            }
        }
        for byte in chunk.invalid() {
            out.push('%');
            out.push_str(&hex::encode([*byte]));
        }
    }
    out
}

pub fn decode(key: &str) -> Result<PathBuf, String> {
    let bytes = key.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let escaped = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| format!("truncated escape in {key:?}"))?;
            let decoded =
                hex::decode(escaped).map_err(|e| format!("bad escape in {key:?}: {e}"))?;
            out.extend_from_slice(&decoded);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(PathBuf::from(OsString::from_vec(out)))
}

pub mod map {
    use super::*;

    pub fn serialize<S: Serializer, V: Serialize>(
        entries: &BTreeMap<PathBuf, V>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(entries.iter().map(|(path, value)| (encode(path), value)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, V: Deserialize<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<PathBuf, V>, D::Error> {
        BTreeMap::<String, V>::deserialize(deserializer)?
            .into_iter()
            .map(|(key, value)| Ok((decode(&key).map_err(D::Error::custom)?, value)))
            .collect()
    }
}

pub mod option {
    use super::*;

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(path: &Option<PathBuf>, serializer: S) -> Result<S::Ok, S::Error> {
        path.as_deref().map(encode).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<PathBuf>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|key| decode(&key).map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_round_trip_arbitrary_bytes() {
        let cases: [&[u8]; 6] = [
            b"/etc/passwd",
            b"/bad\xffname",
            b"/new\xfe",
            b"/50%off",
            b"/%ff",
            "/caf\u{e9}".as_bytes(),
        ];
        for raw in cases {
            let path = PathBuf::from(OsStr::from_bytes(raw));
            assert_eq!(decode(&encode(&path)).unwrap(), path);
        }
        assert_eq!(encode(Path::new("/50%off")), "/50%25off");
        assert_eq!(encode(Path::new(OsStr::from_bytes(b"/a\xff"))), "/a%ff");
    }

    #[test]
    fn test_distinct_invalid_names_stay_distinct() {
        let a = PathBuf::from(OsStr::from_bytes(b"/x\xfe"));
        let b = PathBuf::from(OsStr::from_bytes(b"/x\xff"));
        assert_ne!(encode(&a), encode(&b));
    }

    #[test]
    fn test_rejects_bad_escapes() {
        assert!(decode("/a%f").is_err());
        assert!(decode("/a%zz").is_err());
    }
}
