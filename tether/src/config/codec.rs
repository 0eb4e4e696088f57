//! Flat key/value codec for the configuration channel.
//!
//! A structured value is walked field by field and written as
//! `prefix.field = value` pairs. Lists store their length under the field key
//! and each element under `field.<index>`. Maps use the escaped map key as a
//! path segment, so `session.<id>.cmd` addresses one session's command.
//!
//! Decoding only ever looks up the keys it knows about, which is what makes
//! unknown keys harmless.

use crate::error::ConfigError;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

pub type KeyValues = BTreeMap<String, String>;

const SEPARATOR: char = '.';

pub trait Encode {
    fn encode(&self, enc: &mut Encoder<'_>);
}

pub trait Decode: Sized {
    fn decode(dec: &Decoder<'_>) -> Result<Self, ConfigError>;
}

/// A value stored as a single string.
pub trait Scalar: Sized {
    fn to_value(&self) -> String;

    fn from_value(value: &str) -> Result<Self, String>;
}

pub fn encode<T: Encode>(value: &T) -> KeyValues {
    let mut out = KeyValues::new();
    value.encode(&mut Encoder {
        out: &mut out,
        prefix: String::new(),
    });
    out
}

pub fn decode<T: Decode>(kv: &KeyValues) -> Result<T, ConfigError> {
    T::decode(&Decoder::root(kv))
}

fn join(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{}{}{}", prefix, SEPARATOR, field)
    }
}

/// Escape a map key so it occupies exactly one path segment.
pub fn escape_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '.' => out.push_str("%2E"),
            c => out.push(c),
        }
    }
    out
}

pub fn unescape_segment(segment: &str) -> Result<String, String> {
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let code: String = chars.by_ref().take(2).collect();
        match code.as_str() {
            "25" => out.push('%'),
            "2E" | "2e" => out.push('.'),
            other => return Err(format!("bad escape %{}", other)),
        }
    }
    Ok(out)
}

pub struct Encoder<'a> {
    out: &'a mut KeyValues,
    prefix: String,
}

impl Encoder<'_> {
    pub fn nested(&mut self, field: &str) -> Encoder<'_> {
        Encoder {
            prefix: join(&self.prefix, field),
            out: &mut *self.out,
        }
    }

    pub fn scalar<S: Scalar>(&mut self, field: &str, value: &S) {
        self.out.insert(join(&self.prefix, field), value.to_value());
    }

    pub fn optional<S: Scalar>(&mut self, field: &str, value: &Option<S>) {
        if let Some(value) = value {
            self.scalar(field, value);
        }
    }

    pub fn list<S: Scalar>(&mut self, field: &str, values: &[S]) {
        let key = join(&self.prefix, field);
        for (i, value) in values.iter().enumerate() {
            self.out.insert(join(&key, &i.to_string()), value.to_value());
        }
        self.out.insert(key, values.len().to_string());
    }

    pub fn map<T: Encode>(&mut self, field: &str, entries: &BTreeMap<String, T>) {
        let base = join(&self.prefix, field);
        for (name, entry) in entries {
            entry.encode(&mut Encoder {
                prefix: join(&base, &escape_segment(name)),
                out: &mut *self.out,
            });
        }
    }
}

pub struct Decoder<'a> {
    kv: &'a KeyValues,
    prefix: String,
    entry: String,
}

impl<'a> Decoder<'a> {
    pub fn root(kv: &'a KeyValues) -> Self {
        Self {
            kv,
            prefix: String::new(),
            entry: String::new(),
        }
    }
}

impl Decoder<'_> {
    pub fn nested(&self, field: &str) -> Decoder<'_> {
        Decoder {
            kv: self.kv,
            prefix: join(&self.prefix, field),
            entry: self.entry.clone(),
        }
    }

    /// The map key this value was stored under, empty outside of a map.
    pub fn entry_key(&self) -> &str {
        &self.entry
    }

    fn parse<S: Scalar>(key: String, value: &str) -> Result<S, ConfigError> {
        S::from_value(value).map_err(|reason| ConfigError::Malformed {
            key,
            value: value.to_string(),
            reason,
        })
    }

    pub fn required<S: Scalar>(&self, field: &str) -> Result<S, ConfigError> {
        let key = join(&self.prefix, field);
        match self.kv.get(&key) {
            Some(value) => Self::parse(key, value),
            None => Err(ConfigError::MissingKey(key)),
        }
    }

    pub fn optional<S: Scalar>(&self, field: &str) -> Result<Option<S>, ConfigError> {
        let key = join(&self.prefix, field);
        match self.kv.get(&key) {
            Some(value) => Self::parse(key, value).map(Some),
            None => Ok(None),
        }
    }

    pub fn flag(&self, field: &str) -> Result<bool, ConfigError> {
        Ok(self.optional(field)?.unwrap_or(false))
    }

    pub fn list<S: Scalar>(&self, field: &str) -> Result<Vec<S>, ConfigError> {
        let key = join(&self.prefix, field);
        let Some(len) = self.kv.get(&key) else {
            return Ok(Vec::new());
        };
        let len: usize = Self::parse(key.clone(), len)?;

        (0..len)
            .map(|i| {
                let item = join(&key, &i.to_string());
                match self.kv.get(&item) {
                    Some(value) => Self::parse(item, value),
                    None => Err(ConfigError::MissingKey(item)),
                }
            })
            .collect()
    }

    pub fn map<T: Decode>(&self, field: &str) -> Result<BTreeMap<String, T>, ConfigError> {
        let (entries, rejected) = self.map_lenient(field);
        match rejected.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(entries),
        }
    }

    /// Decode every entry of a map on its own. Entries that fail come back
    /// with their error instead of failing the whole map.
    pub fn map_lenient<T: Decode>(
        &self,
        field: &str,
    ) -> (BTreeMap<String, T>, Vec<(String, ConfigError)>) {
        let base = join(&self.prefix, field);
        let lead = format!("{}{}", base, SEPARATOR);

        let segments: BTreeSet<&str> = self
            .kv
            .range(lead.clone()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(&lead))
            .filter_map(|k| k[lead.len()..].split(SEPARATOR).next())
            .filter(|s| !s.is_empty())
            .collect();

        let mut entries = BTreeMap::new();
        let mut rejected = Vec::new();
        for segment in segments {
            let prefix = join(&base, segment);
            let name = match unescape_segment(segment) {
                Ok(name) => name,
                Err(reason) => {
                    rejected.push((
                        segment.to_string(),
                        ConfigError::Malformed {
                            key: prefix,
                            value: segment.to_string(),
                            reason,
                        },
                    ));
                    continue;
                }
            };
            let decoded = T::decode(&Decoder {
                kv: self.kv,
                prefix,
                entry: name.clone(),
            });
            match decoded {
                Ok(value) => {
                    entries.insert(name, value);
                }
                Err(err) => rejected.push((name, err)),
            }
        }
        (entries, rejected)
    }
}

impl Scalar for String {
    fn to_value(&self) -> String {
        self.clone()
    }

    fn from_value(value: &str) -> Result<Self, String> {
        Ok(value.to_string())
    }
}

impl Scalar for bool {
    fn to_value(&self) -> String {
        self.to_string()
    }

    fn from_value(value: &str) -> Result<Self, String> {
        match value {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err("expected true or false".to_string()),
        }
    }
}

macro_rules! parsed_scalar {
    ($($ty:ty),*) => {
        $(
            impl Scalar for $ty {
                fn to_value(&self) -> String {
                    self.to_string()
                }

                fn from_value(value: &str) -> Result<Self, String> {
                    value.parse().map_err(|e| format!("{}", e))
                }
            }
        )*
    };
}

parsed_scalar!(i32, i64, u16, u32, usize, IpAddr);
