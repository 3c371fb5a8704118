//! serde-xml-rs decoding for the gateway documents.
//!
//! Plugwise documents mix differently named siblings (`point_log` next to
//! `cumulative_log`, `relay` next to `electricity_point_meter`). Such lists are
//! read through a `$value` field into an enum whose variant is chosen by tag
//! name; tags without a variant keep only their name.

use crate::error::AppError;
use serde::de::{DeserializeOwned, Deserializer, EnumAccess, IgnoredAny, VariantAccess, Visitor};
use std::fmt;
use std::marker::PhantomData;

/// Decode a whole document into `T`.
pub fn decode<T: DeserializeOwned>(xml: &str) -> Result<T, AppError> {
    Ok(serde_xml_rs::from_str(xml)?)
}

/// One element of a list of mixed siblings.
pub trait Tagged: Sized {
    const EXPECTING: &'static str;

    /// Build the value for an element called `tag`. `body` must be consumed,
    /// either by decoding it or with [`skip`].
    fn from_tag<'de, V: VariantAccess<'de>>(tag: String, body: V) -> Result<Self, V::Error>;
}

/// Consume an element body without decoding it.
pub fn skip<'de, V: VariantAccess<'de>>(body: V) -> Result<(), V::Error> {
    body.newtype_variant::<IgnoredAny>().map(|_| ())
}

/// `Deserialize` body for a [`Tagged`] type.
pub fn deserialize_tagged<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Tagged,
{
    deserializer.deserialize_enum(T::EXPECTING, &[], TagVisitor(PhantomData))
}

struct TagVisitor<T>(PhantomData<T>);

impl<'de, T: Tagged> Visitor<'de> for TagVisitor<T> {
    type Value = T;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(T::EXPECTING)
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> Result<T, A::Error> {
        let (tag, body) = data.variant::<String>()?;
        T::from_tag(tag, body)
    }
}
