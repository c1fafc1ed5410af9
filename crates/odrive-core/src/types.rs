use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// 128-bit object identifier, rendered as 32 lowercase hex characters.
///
/// The hex form is also the file stem inside a cache partition.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId([u8; 16]);

impl ObjectId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        ObjectId(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        ObjectId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(CoreError::InvalidId(format!(
                "expected 32 hex characters, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| CoreError::InvalidId(e.to_string()))?;
        Ok(ObjectId(bytes))
    }
}

impl TryFrom<String> for ObjectId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.to_hex()
    }
}

/// CRUDS permission flags: create, read, update, delete, share.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Flags {
    pub c: bool,
    pub r: bool,
    pub u: bool,
    pub d: bool,
    pub s: bool,
}

impl Flags {
    pub const NONE: Flags = Flags {
        c: false,
        r: false,
        u: false,
        d: false,
        s: false,
    };
    pub const ALL: Flags = Flags {
        c: true,
        r: true,
        u: true,
        d: true,
        s: true,
    };
    pub const READ: Flags = Flags {
        r: true,
        ..Flags::NONE
    };
    pub const UPDATE: Flags = Flags {
        u: true,
        ..Flags::NONE
    };
    pub const DELETE: Flags = Flags {
        d: true,
        ..Flags::NONE
    };
    pub const SHARE: Flags = Flags {
        s: true,
        ..Flags::NONE
    };

    /// Parse a subset of `"cruds"`, e.g. `"rs"`. `"-"` is accepted as a no-op.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let mut flags = Flags::NONE;
        for ch in s.chars() {
            match ch.to_ascii_lowercase() {
                'c' => flags.c = true,
                'r' => flags.r = true,
                'u' => flags.u = true,
                'd' => flags.d = true,
                's' => flags.s = true,
                '-' => {}
                other => {
                    return Err(CoreError::InvalidFlags(format!(
                        "unknown flag {other:?} in {s:?}"
                    )))
                }
            }
        }
        Ok(flags)
    }

    /// Comma-separated form bound into the permission MAC.
    ///
    /// Always five booleans in c,r,u,d,s order so verifiers can rebuild the
    /// exact string.
    pub fn csv(&self) -> String {
        format!("{},{},{},{},{}", self.c, self.r, self.u, self.d, self.s)
    }

    /// True if every flag set in `need` is also set here.
    pub fn covers(&self, need: Flags) -> bool {
        (!need.c || self.c)
            && (!need.r || self.r)
            && (!need.u || self.u)
            && (!need.d || self.d)
            && (!need.s || self.s)
    }

    pub fn is_empty(&self) -> bool {
        *self == Flags::NONE
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pick = |on: bool, ch: char| if on { ch } else { '-' };
        write!(
            f,
            "{}{}{}{}{}",
            pick(self.c, 'c'),
            pick(self.r, 'r'),
            pick(self.u, 'u'),
            pick(self.d, 'd'),
            pick(self.s, 's')
        )
    }
}

/// Persisted permission row.
///
/// `wrapped_key` is the object key masked for this row; `mac` binds grantee,
/// flags and wrapped key under the process master key. Rows whose MAC does
/// not verify are treated as absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRow {
    pub object_id: ObjectId,
    pub grantee: String,
    pub flags: Flags,
    #[serde(rename = "permissionIV", with = "hex_bytes")]
    pub permission_iv: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub wrapped_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub mac: Vec<u8>,
}

/// Inclusive byte range. `stop == None` reads to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    pub start: u64,
    pub stop: Option<u64>,
}

impl ByteRange {
    pub fn full() -> Self {
        ByteRange {
            start: 0,
            stop: None,
        }
    }

    pub fn new(start: u64, stop: Option<u64>) -> Self {
        ByteRange { start, stop }
    }

    /// Resolve against an object of `size` bytes into a half-open `[start, end)`.
    ///
    /// Returns `None` when the range falls outside `[0, size)`. The full range
    /// of an empty object resolves to `(0, 0)`.
    pub fn resolve(&self, size: u64) -> Option<(u64, u64)> {
        if size == 0 {
            return (self.start == 0 && self.stop.is_none()).then_some((0, 0));
        }
        if self.start >= size {
            return None;
        }
        match self.stop {
            None => Some((self.start, size)),
            Some(stop) if stop >= self.start && stop < size => Some((self.start, stop + 1)),
            Some(_) => None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.start == 0 && self.stop.is_none()
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stop {
            Some(stop) => write!(f, "bytes={}-{}", self.start, stop),
            None => write!(f, "bytes={}-", self.start),
        }
    }
}

/// An authenticated caller. Authentication itself happens upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    dn: String,
    groups: Vec<String>,
}

impl Identity {
    pub fn new(dn: &str) -> Self {
        Identity {
            dn: canonical_dn(dn),
            groups: Vec::new(),
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.groups = groups.into_iter().map(|g| g.as_ref().to_string()).collect();
        self
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// The DN first, then group names, in the order permission rows match.
    pub fn principals(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.dn.as_str()).chain(self.groups.iter().map(String::as_str))
    }
}

/// Canonical DN form: lowercase, no whitespace around `,` or `=`.
pub fn canonical_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| {
            rdn.split('=')
                .map(str::trim)
                .collect::<Vec<_>>()
                .join("=")
        })
        .filter(|rdn| !rdn.is_empty())
        .collect::<Vec<_>>()
        .join(",")
        .to_lowercase()
}

/// Access-control marking. Opaque beyond its flattened parts; evaluation is
/// delegated to an external policy decision point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acm {
    raw: serde_json::Value,
}

/// One flattened `(name, value)` pair of an ACM.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AcmPart {
    pub name: String,
    pub value: String,
}

impl Acm {
    pub fn parse(json: &str) -> Result<Self, CoreError> {
        let raw: serde_json::Value =
            serde_json::from_str(json).map_err(|e| CoreError::InvalidAcm(e.to_string()))?;
        Self::from_value(raw)
    }

    pub fn from_value(raw: serde_json::Value) -> Result<Self, CoreError> {
        if !raw.is_object() {
            return Err(CoreError::InvalidAcm("ACM must be a JSON object".into()));
        }
        Ok(Acm { raw })
    }

    pub fn raw(&self) -> &serde_json::Value {
        &self.raw
    }

    /// Flatten top-level string and string-array fields into sorted parts.
    pub fn parts(&self) -> Vec<AcmPart> {
        let mut parts = Vec::new();
        if let Some(map) = self.raw.as_object() {
            for (name, value) in map {
                match value {
                    serde_json::Value::String(s) => parts.push(AcmPart {
                        name: name.clone(),
                        value: s.clone(),
                    }),
                    serde_json::Value::Array(items) => {
                        parts.extend(items.iter().filter_map(|v| v.as_str()).map(|s| AcmPart {
                            name: name.clone(),
                            value: s.to_string(),
                        }))
                    }
                    _ => {}
                }
            }
        }
        parts.sort();
        parts
    }
}

/// Serde helper: `Vec<u8>` as lowercase hex.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
