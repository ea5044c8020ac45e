//! Wire representation rules shared by everything that talks to the broker
//!
//! Structures use `snake_case` field names on the wire which matches the field naming of Rust itself,
//! thus a plain `#[derive(Serialize, Deserialize)]` (optionally with `#[serde(rename_all = "snake_case")]`
//! for clarity) is sufficient. Enumerations, however, are written lowercase and read case-insensitively.
//! Unknown values are rejected with an error listing every accepted value. Implement [`WireEnum`] and
//! invoke [`wire_enum!`](crate::wire_enum) to derive `Serialize`, `Deserialize`, `Display` and `FromStr`.

use std::fmt;
use thiserror::Error;

/// Value that did not match any variant of a [`WireEnum`]
#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[error("illegal enum value: '{value}'. Possible values: [{}]", .accepted.join(", "))]
pub struct UnknownVariant {
    /// Raw value that was received
    pub value: String,
    /// Every value that would have been accepted
    pub accepted: Vec<&'static str>,
}

/// Enumeration with a fixed set of lowercase wire names
pub trait WireEnum: Sized + Copy + PartialEq + 'static {
    /// Every variant paired with its wire name
    const VARIANTS: &'static [(&'static str, Self)];

    /// Lowercase name used when writing the value
    fn wire_name(&self) -> &'static str {
        Self::VARIANTS
            .iter()
            .find(|(_, variant)| variant == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    /// Case-insensitive lookup of a variant by its wire name
    fn from_wire(value: &str) -> Result<Self, UnknownVariant> {
        Self::VARIANTS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(value))
            .map(|(_, variant)| *variant)
            .ok_or_else(|| UnknownVariant {
                value: value.to_owned(),
                accepted: Self::VARIANTS.iter().map(|(name, _)| *name).collect(),
            })
    }
}

/// Writes the wire name of a [`WireEnum`] into a formatter
pub fn fmt_wire<E: WireEnum>(value: &E, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(value.wire_name())
}

/// Derives `Serialize`, `Deserialize`, `Display` and `FromStr` for a type implementing [`WireEnum`]
#[macro_export]
macro_rules! wire_enum {
    ($type:ty) => {
        impl ::serde::Serialize for $type {
            fn serialize<S: ::serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str($crate::library::codec::WireEnum::wire_name(self))
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $type {
            fn deserialize<D: ::serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = <String as ::serde::Deserialize>::deserialize(deserializer)?;
                <$type as $crate::library::codec::WireEnum>::from_wire(&raw)
                    .map_err(::serde::de::Error::custom)
            }
        }

        impl ::std::fmt::Display for $type {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                $crate::library::codec::fmt_wire(self, f)
            }
        }

        impl ::std::str::FromStr for $type {
            type Err = $crate::library::codec::UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                <$type as $crate::library::codec::WireEnum>::from_wire(s)
            }
        }
    };
}
