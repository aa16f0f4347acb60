//! Carrier for request-scoped key/value entries.
//!
//! [`Baggage`] is an ordered set of name/value pairs describing user-defined
//! properties that travel with a request. It is stored in a [`Context`] via
//! [`BaggageExt`]; contexts are immutable, so extending the carrier always
//! produces a new context and never mutates one visible to another scope.

use crate::{Context, Key, KeyValue, StringValue};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt;
use std::sync::OnceLock;

static DEFAULT_BAGGAGE: OnceLock<Baggage> = OnceLock::new();

const MAX_KEY_VALUE_PAIRS: usize = 64;
const MAX_LEN_OF_ALL_PAIRS: usize = 8192;

// https://datatracker.ietf.org/doc/html/rfc7230#section-3.2.6
const INVALID_ASCII_KEY_CHARS: [u8; 17] = [
    b'(', b')', b',', b'/', b':', b';', b'<', b'=', b'>', b'?', b'@', b'[', b'\\', b']', b'{',
    b'}', b'"',
];

/// Characters percent-encoded in baggage header values: controls, space,
/// the list/pair delimiters, and `%` itself so encoded text survives a
/// decode round trip. Non-ASCII bytes are always encoded.
pub(crate) const BAGGAGE_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b';')
    .add(b',')
    .add(b'=')
    .add(b'%');

/// Returns the default baggage, ensuring it is initialized only once.
#[inline]
fn get_default_baggage() -> &'static Baggage {
    DEFAULT_BAGGAGE.get_or_init(Baggage::default)
}

/// An ordered set of name/value pairs describing user-defined properties.
///
/// ### Names
///
/// * ASCII strings according to the token format, defined in [RFC 7230].
///
/// ### Values
///
/// * UTF-8 strings, percent-encoded on the wire.
///
/// ### Ordering
///
/// Entries iterate in the order their name was first inserted; updating an
/// existing name keeps its position. This makes annotation output and header
/// encoding deterministic.
///
/// ### Limits
///
/// * Maximum number of name/value pairs: `64`.
/// * Maximum total length of all name/value pairs: `8192` bytes.
///
/// Inserting beyond either limit evicts the oldest entries to make room and
/// logs a warning; it never fails.
///
/// [RFC 7230]: https://datatracker.ietf.org/doc/html/rfc7230#section-3.2.6
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Baggage {
    inner: Vec<(Key, StringValue)>,
    kv_content_len: usize, // total key+value byte length of `inner`
}

impl Baggage {
    /// Creates an empty `Baggage`.
    pub fn new() -> Self {
        Baggage {
            inner: Vec::new(),
            kv_content_len: 0,
        }
    }

    /// Returns a reference to the value associated with a given name.
    ///
    /// # Examples
    ///
    /// ```
    /// use carryon::{baggage::Baggage, StringValue};
    ///
    /// let mut baggage = Baggage::new();
    /// let _ = baggage.insert("my-name", "my-value");
    ///
    /// assert_eq!(baggage.get("my-name"), Some(&StringValue::from("my-value")))
    /// ```
    pub fn get<K: AsRef<str>>(&self, key: K) -> Option<&StringValue> {
        let key = key.as_ref();
        self.inner
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, value)| value)
    }

    /// Inserts a name/value pair into the baggage.
    ///
    /// If the name was not present, [`None`] is returned. If the name was
    /// present, the value is updated in place (the entry keeps its original
    /// position) and the old value is returned.
    ///
    /// Names must be non-empty RFC 7230 tokens; entries with invalid names
    /// are dropped with a warning. When the pair count or total content
    /// length would exceed the [W3C limits], the oldest entries are evicted
    /// first, with a warning.
    ///
    /// [W3C limits]: https://www.w3.org/TR/baggage/#limits
    pub fn insert<K, V>(&mut self, key: K, value: V) -> Option<StringValue>
    where
        K: Into<Key>,
        V: Into<StringValue>,
    {
        let (key, value) = (key.into(), value.into());

        if let Some(index) = self.inner.iter().position(|(k, _)| k == &key) {
            let entry_content_len = key_value_bytes_size(key.as_str(), value.as_str());
            let prev_content_len =
                key_value_bytes_size(key.as_str(), self.inner[index].1.as_str());
            self.kv_content_len = self.kv_content_len + entry_content_len - prev_content_len;
            let previous = std::mem::replace(&mut self.inner[index].1, value);
            self.evict_to_limits();
            return Some(previous);
        }

        if !Self::is_key_valid(key.as_str().as_bytes()) {
            tracing::warn!(
                name: "Baggage.Insert.InvalidKey",
                key = key.as_str(),
                "baggage entry dropped, name is not a valid RFC 7230 token"
            );
            return None;
        }

        self.kv_content_len += key_value_bytes_size(key.as_str(), value.as_str());
        self.inner.push((key, value));
        self.evict_to_limits();
        None
    }

    /// Removes a name from the baggage, returning the value corresponding to
    /// the name if the pair was previously present.
    pub fn remove<K: AsRef<str>>(&mut self, key: K) -> Option<StringValue> {
        let key = key.as_ref();
        let index = self.inner.iter().position(|(k, _)| k.as_str() == key)?;
        let (key, value) = self.inner.remove(index);
        self.kv_content_len -= key_value_bytes_size(key.as_str(), value.as_str());
        Some(value)
    }

    /// Returns the number of entries in this baggage.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the baggage contains no items.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Gets an iterator over the baggage items, oldest first.
    pub fn iter(&self) -> Iter<'_> {
        self.into_iter()
    }

    fn is_key_valid(key: &[u8]) -> bool {
        !key.is_empty()
            && key
                .iter()
                .all(|b| b.is_ascii_graphic() && !INVALID_ASCII_KEY_CHARS.contains(b))
    }

    /// Drops oldest entries until the pair-count and byte limits hold.
    fn evict_to_limits(&mut self) {
        while self.inner.len() > MAX_KEY_VALUE_PAIRS
            || self.kv_content_len > MAX_LEN_OF_ALL_PAIRS
        {
            let (key, value) = self.inner.remove(0);
            self.kv_content_len -= key_value_bytes_size(key.as_str(), value.as_str());
            tracing::warn!(
                name: "Baggage.Insert.Evicted",
                key = key.as_str(),
                "oldest baggage entry evicted to stay within limits"
            );
        }
    }
}

/// Get the number of bytes for one key-value pair
fn key_value_bytes_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

/// An iterator over the entries of a [`Baggage`], oldest first.
#[derive(Debug)]
pub struct Iter<'a>(std::slice::Iter<'a, (Key, StringValue)>);

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a Key, &'a StringValue);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(k, v)| (k, v))
    }
}

impl<'a> IntoIterator for &'a Baggage {
    type Item = (&'a Key, &'a StringValue);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        Iter(self.inner.iter())
    }
}

impl FromIterator<(Key, StringValue)> for Baggage {
    fn from_iter<I: IntoIterator<Item = (Key, StringValue)>>(iter: I) -> Self {
        let mut baggage = Baggage::default();
        for (key, value) in iter.into_iter() {
            baggage.insert(key, value);
        }
        baggage
    }
}

impl FromIterator<KeyValue> for Baggage {
    fn from_iter<I: IntoIterator<Item = KeyValue>>(iter: I) -> Self {
        iter.into_iter().map(<(Key, StringValue)>::from).collect()
    }
}

impl<I> From<I> for Baggage
where
    I: IntoIterator,
    I::Item: Into<(Key, StringValue)>,
{
    fn from(value: I) -> Self {
        value.into_iter().map(Into::into).collect()
    }
}

impl fmt::Display for Baggage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (k, v)) in self.into_iter().enumerate() {
            write!(f, "{}={}", k, utf8_percent_encode(v.as_str(), BAGGAGE_ENCODE_SET))?;

            if i < self.len() - 1 {
                write!(f, ",")?;
            }
        }

        Ok(())
    }
}

/// Methods for storing and retrieving baggage data in a context.
pub trait BaggageExt {
    /// Returns a clone of the given context with the included name/value pairs.
    ///
    /// # Examples
    ///
    /// ```
    /// use carryon::{baggage::{Baggage, BaggageExt}, Context, KeyValue, StringValue};
    ///
    /// // Explicit `Baggage` creation
    /// let mut baggage = Baggage::new();
    /// let _ = baggage.insert("my-name", "my-value");
    ///
    /// let cx = Context::map_current(|cx| {
    ///     cx.with_baggage(baggage)
    /// });
    ///
    /// // Passing an iterator
    /// let cx = Context::map_current(|cx| {
    ///     cx.with_baggage([KeyValue::new("my-name", "my-value")])
    /// });
    ///
    /// assert_eq!(
    ///     cx.baggage().get("my-name"),
    ///     Some(&StringValue::from("my-value")),
    /// )
    /// ```
    fn with_baggage<T: Into<Baggage>>(&self, baggage: T) -> Self;

    /// Returns a clone of the given context whose baggage additionally
    /// contains the given entry, keeping every existing entry.
    ///
    /// # Examples
    ///
    /// ```
    /// use carryon::{baggage::BaggageExt, Context, StringValue};
    ///
    /// let cx = Context::new()
    ///     .with_baggage_entry("user.id", "user123")
    ///     .with_baggage_entry("tenant.id", "acme");
    ///
    /// assert_eq!(cx.baggage().get("user.id"), Some(&StringValue::from("user123")));
    /// assert_eq!(cx.baggage().len(), 2);
    /// ```
    fn with_baggage_entry<K: Into<Key>, V: Into<StringValue>>(&self, key: K, value: V) -> Self;

    /// Returns a clone of the current context with the included name/value pairs.
    fn current_with_baggage<T: Into<Baggage>>(baggage: T) -> Self;

    /// Returns a clone of the given context with no baggage.
    fn with_cleared_baggage(&self) -> Self;

    /// Returns a reference to this context's baggage, or the default
    /// empty baggage if none has been set.
    fn baggage(&self) -> &Baggage;
}

/// Solely used to store `Baggage` in the `Context` without allowing direct access
#[derive(Debug)]
struct BaggageContextValue(Baggage);

impl BaggageExt for Context {
    fn with_baggage<T: Into<Baggage>>(&self, baggage: T) -> Self {
        self.with_value(BaggageContextValue(baggage.into()))
    }

    fn with_baggage_entry<K: Into<Key>, V: Into<StringValue>>(&self, key: K, value: V) -> Self {
        let mut baggage = self.baggage().clone();
        let _ = baggage.insert(key, value);
        self.with_baggage(baggage)
    }

    fn current_with_baggage<T: Into<Baggage>>(baggage: T) -> Self {
        Context::map_current(|cx| cx.with_baggage(baggage))
    }

    fn with_cleared_baggage(&self) -> Self {
        self.with_baggage(Baggage::new())
    }

    fn baggage(&self) -> &Baggage {
        self.get::<BaggageContextValue>()
            .map_or(get_default_baggage(), |b| &b.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_preserves_first_insertion_order() {
        let mut baggage = Baggage::new();
        let _ = baggage.insert("b", "1");
        let _ = baggage.insert("a", "2");
        let _ = baggage.insert("c", "3");
        // updating `b` keeps its position
        let prev = baggage.insert("b", "updated");
        assert_eq!(prev, Some(StringValue::from("1")));

        let keys = baggage.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["b", "a", "c"]);
        assert_eq!(baggage.get("b"), Some(&StringValue::from("updated")));
    }

    #[test]
    fn insert_too_many_pairs_evicts_oldest() {
        let mut baggage = Baggage::new();
        for i in 0..MAX_KEY_VALUE_PAIRS + 2 {
            let _ = baggage.insert(format!("key{i}"), format!("value{i}"));
        }
        assert_eq!(baggage.len(), MAX_KEY_VALUE_PAIRS);
        assert_eq!(baggage.get("key0"), None);
        assert_eq!(baggage.get("key1"), None);
        assert_eq!(
            baggage.get("key2"),
            Some(&StringValue::from("value2"))
        );
    }

    #[test]
    fn insert_pairs_length_exceed_limit_evicts_oldest() {
        let mut baggage = Baggage::new();
        let halfish: String = "x".repeat(MAX_LEN_OF_ALL_PAIRS / 2 - 10);
        let _ = baggage.insert("a", halfish.clone());
        let _ = baggage.insert("b", halfish.clone());
        assert_eq!(baggage.len(), 2);
        // pushes total over the byte budget, so `a` goes
        let tail: String = "y".repeat(40);
        let _ = baggage.insert("c", tail.clone());
        assert_eq!(baggage.get("a"), None);
        assert!(baggage.get("b").is_some());
        assert_eq!(baggage.get("c"), Some(&StringValue::from(tail)));
    }

    #[test]
    fn insert_invalid_key_is_dropped() {
        let mut baggage = Baggage::new();
        assert_eq!(baggage.insert("", "empty"), None);
        assert_eq!(baggage.insert("a=b", "delimiter"), None);
        assert_eq!(baggage.insert("grüß", "non-ascii"), None);
        assert!(baggage.is_empty());
    }

    #[test]
    fn remove_updates_content_length() {
        let mut baggage = Baggage::new();
        let _ = baggage.insert("a", "1");
        let _ = baggage.insert("b", "2");
        assert_eq!(baggage.remove("a"), Some(StringValue::from("1")));
        assert_eq!(baggage.remove("a"), None);
        assert_eq!(baggage.kv_content_len, 2);
    }

    #[test]
    fn display_percent_encodes_values() {
        let mut baggage = Baggage::new();
        let _ = baggage.insert("k1", "v1,v2");
        let _ = baggage.insert("k2", "hällo");
        assert_eq!(baggage.to_string(), "k1=v1%2Cv2,k2=h%C3%A4llo");
    }

    #[test]
    fn with_baggage_entry_does_not_mutate_source() {
        let base = Context::new().with_baggage_entry("user.id", "a");
        let extended = base.with_baggage_entry("tenant.id", "t");

        assert_eq!(base.baggage().len(), 1);
        assert_eq!(extended.baggage().len(), 2);
        assert_eq!(
            extended.baggage().get("user.id"),
            Some(&StringValue::from("a"))
        );
    }

    #[test]
    fn with_cleared_baggage_empties_the_carrier() {
        let cx = Context::new()
            .with_baggage_entry("user.id", "a")
            .with_baggage_entry("tenant.id", "t");
        let cleared = cx.with_cleared_baggage();

        assert!(cleared.baggage().is_empty());
        assert_eq!(cx.baggage().len(), 2, "source context is untouched");
    }

    #[test]
    fn current_with_baggage_replaces_the_active_carrier() {
        const USER_ID: Key = Key::from_static_str("user.id");

        let _guard = Context::new().with_baggage_entry(USER_ID, "a").attach();

        let cx = Context::current_with_baggage([(Key::new("tenant.id"), StringValue::from("t"))]);
        assert_eq!(cx.baggage().get("tenant.id"), Some(&StringValue::from("t")));
        assert_eq!(cx.baggage().len(), 1, "the whole carrier is replaced");
    }
}
