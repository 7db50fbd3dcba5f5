//! Agent responses sometimes produce a single generated asset and
//! sometimes a batch (e.g. one prompt fanning out into several candidate
//! frames); `createVersionedAssets` accepts either shape under one type
//! rather than forcing every caller to wrap a single value in a one-element
//! array (§4.3).

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::Deserialize;
use std::fmt;
use std::marker::PhantomData;

#[derive(Debug, Clone)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    /// Flattens into a `Vec`, preserving order. An empty `Many` yields an
    /// empty vec; callers that require at least one version should reject
    /// that case explicitly rather than relying on this to error.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }

    /// Per §4.3: when a caller unexpectedly supplies more than one value
    /// where only one was requested, the first element wins and the rest
    /// are dropped with a warning rather than silently picked at random.
    pub fn first_with_warning(self, context: &str) -> Option<T> {
        match self {
            OneOrMany::One(item) => Some(item),
            OneOrMany::Many(mut items) => {
                if items.is_empty() {
                    return None;
                }
                if items.len() > 1 {
                    tracing::warn!(
                        context,
                        count = items.len(),
                        "expected a single value, received multiple; using the first"
                    );
                }
                Some(items.remove(0))
            }
        }
    }
}

impl<'de, T> Deserialize<'de> for OneOrMany<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OneOrManyVisitor<T>(PhantomData<T>);

        impl<'de, T> Visitor<'de> for OneOrManyVisitor<T>
        where
            T: Deserialize<'de>,
        {
            type Value = OneOrMany<T>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a single value or an array of values")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(OneOrMany::Many(items))
            }

            fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let value = T::deserialize(de::value::MapAccessDeserializer::new(map))?;
                Ok(OneOrMany::One(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let value =
                    T::deserialize(de::value::StrDeserializer::new(value)).map_err(E::custom)?;
                Ok(OneOrMany::One(value))
            }
        }

        deserializer.deserialize_any(OneOrManyVisitor(PhantomData))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_with_warning_picks_head_of_many() {
        let value: OneOrMany<i32> = OneOrMany::Many(vec![1, 2, 3]);
        assert_eq!(value.first_with_warning("test"), Some(1));
    }

    #[test]
    fn first_with_warning_none_on_empty() {
        let value: OneOrMany<i32> = OneOrMany::Many(vec![]);
        assert_eq!(value.first_with_warning("test"), None);
    }

    #[test]
    fn into_vec_wraps_single_value() {
        let value = OneOrMany::One(42);
        assert_eq!(value.into_vec(), vec![42]);
    }
}
