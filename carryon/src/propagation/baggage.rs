use crate::baggage::{Baggage, BaggageExt, BAGGAGE_ENCODE_SET};
use crate::propagation::{Extractor, FieldIter, Injector, TextMapPropagator};
use crate::Context;
use percent_encoding::{percent_decode_str, utf8_percent_encode};
use std::iter;
use std::sync::OnceLock;

static BAGGAGE_HEADER: &str = "baggage";

// TODO Replace this with LazyLock once MSRV reaches 1.80.
static BAGGAGE_FIELDS: OnceLock<[String; 1]> = OnceLock::new();
#[inline]
fn baggage_fields() -> &'static [String; 1] {
    BAGGAGE_FIELDS.get_or_init(|| [BAGGAGE_HEADER.to_owned()])
}

/// Propagates name/value pairs in [W3C Baggage] format.
///
/// The header value is a comma-separated list of `key=value` pairs, with
/// delimiters, spaces, and non-ASCII bytes percent-encoded. Extraction is
/// fail-soft: each list segment is decoded independently, an unparsable
/// segment is skipped with a warning, and a fully malformed header yields an
/// empty carrier. Extraction never fails the request.
///
/// # Examples
///
/// ```
/// use carryon::baggage::{Baggage, BaggageExt};
/// use carryon::propagation::{BaggagePropagator, TextMapPropagator};
/// use std::collections::HashMap;
///
/// // Example baggage value passed in externally via http headers
/// let mut headers = HashMap::new();
/// headers.insert("baggage".to_string(), "user_id=1".to_string());
///
/// let propagator = BaggagePropagator::new();
/// // can extract from any type that impls `Extractor`, usually an HTTP header map
/// let cx = propagator.extract(&headers);
///
/// // Iterate over extracted name-value pairs
/// for (name, value) in cx.baggage() {
///     // ...
/// }
///
/// // Add new baggage
/// let cx_with_additions = cx.with_baggage_entry("server_id", "42");
///
/// // Inject baggage into http request
/// propagator.inject_context(&cx_with_additions, &mut headers);
///
/// let header_value = headers.get("baggage").expect("header is injected");
/// assert!(header_value.contains("user_id=1"));
/// assert!(header_value.contains("server_id=42"));
/// ```
///
/// [W3C Baggage]: https://w3c.github.io/baggage
#[derive(Debug, Default)]
pub struct BaggagePropagator {
    _private: (),
}

impl BaggagePropagator {
    /// Construct a new baggage propagator.
    pub fn new() -> Self {
        BaggagePropagator { _private: () }
    }
}

impl TextMapPropagator for BaggagePropagator {
    /// Encodes the baggage of the `Context` and injects it into the provided
    /// `Injector`.
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        let baggage = cx.baggage();
        if !baggage.is_empty() {
            let header_value = baggage
                .iter()
                .map(|(name, value)| {
                    utf8_percent_encode(name.as_str().trim(), BAGGAGE_ENCODE_SET)
                        .chain(iter::once("="))
                        .chain(utf8_percent_encode(value.as_str().trim(), BAGGAGE_ENCODE_SET))
                        .collect()
                })
                .collect::<Vec<String>>()
                .join(",");
            injector.set(BAGGAGE_HEADER, header_value);
        }
    }

    /// Extracts a `Context` with baggage values from an `Extractor`.
    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        if let Some(header_value) = extractor.get(BAGGAGE_HEADER) {
            let baggage: Baggage = header_value
                .split(',')
                .filter_map(|segment| {
                    // value properties (`;k=v`) are not carried; strip them
                    let name_and_value = segment.split(';').next().unwrap_or(segment);
                    let mut iter = name_and_value.split('=');
                    match (iter.next(), iter.next()) {
                        (Some(name), Some(value)) => {
                            let decode_name = percent_decode_str(name.trim()).decode_utf8();
                            let decode_value = percent_decode_str(value.trim()).decode_utf8();

                            if let (Ok(name), Ok(value)) = (decode_name, decode_value) {
                                Some((
                                    crate::Key::from(name.trim().to_owned()),
                                    crate::StringValue::from(value.trim().to_owned()),
                                ))
                            } else {
                                tracing::warn!(
                                    name: "BaggagePropagator.Extract.InvalidUTF8",
                                    baggage_header = header_value,
                                    "invalid UTF-8 in baggage segment, skipping"
                                );
                                None
                            }
                        }
                        _ => {
                            tracing::warn!(
                                name: "BaggagePropagator.Extract.InvalidKeyValueFormat",
                                baggage_header = header_value,
                                "invalid baggage key-value format, skipping segment"
                            );
                            None
                        }
                    }
                })
                .collect();
            cx.with_baggage(baggage)
        } else {
            cx.clone()
        }
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(baggage_fields())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Key, StringValue};
    use std::collections::HashMap;

    #[rustfmt::skip]
    fn valid_extract_data() -> Vec<(&'static str, Vec<(Key, StringValue)>)> {
        vec![
            // "valid w3cHeader"
            ("key1=val1,key2=val2", vec![(Key::new("key1"), StringValue::from("val1")), (Key::new("key2"), StringValue::from("val2"))]),
            // "valid w3cHeader with spaces"
            ("key1 =   val1,  key2 =val2   ", vec![(Key::new("key1"), StringValue::from("val1")), (Key::new("key2"), StringValue::from("val2"))]),
            // "valid header with url-escaped comma"
            ("key1=val1,key2=val2%2Cval3", vec![(Key::new("key1"), StringValue::from("val1")), (Key::new("key2"), StringValue::from("val2,val3"))]),
            // "valid header with an invalid segment"
            ("key1=val1,key2=val2,a,val3", vec![(Key::new("key1"), StringValue::from("val1")), (Key::new("key2"), StringValue::from("val2"))]),
            // "valid header with no value"
            ("key1=,key2=val2", vec![(Key::new("key1"), StringValue::from("")), (Key::new("key2"), StringValue::from("val2"))]),
            // "properties are stripped"
            ("key1=val1;prop=1,key2=val2", vec![(Key::new("key1"), StringValue::from("val1")), (Key::new("key2"), StringValue::from("val2"))]),
        ]
    }

    #[test]
    fn extract_baggage() {
        let propagator = BaggagePropagator::new();

        for (header_value, kvs) in valid_extract_data() {
            let mut extractor: HashMap<String, String> = HashMap::new();
            extractor.insert(BAGGAGE_HEADER.to_string(), header_value.to_string());
            let context = propagator.extract(&extractor);
            let baggage = context.baggage();

            assert_eq!(kvs.len(), baggage.len(), "{header_value}");
            for (key, value) in kvs {
                assert_eq!(baggage.get(key.as_str()), Some(&value), "{header_value}");
            }
        }
    }

    #[test]
    fn extract_fully_malformed_header_yields_empty_baggage() {
        let propagator = BaggagePropagator::new();
        let mut extractor: HashMap<String, String> = HashMap::new();
        extractor.insert(
            BAGGAGE_HEADER.to_string(),
            "not-a-pair,also no good,still;bad".to_string(),
        );

        let context = propagator.extract(&extractor);
        assert!(context.baggage().is_empty());
    }

    #[test]
    fn extract_without_header_keeps_context() {
        let propagator = BaggagePropagator::new();
        let extractor: HashMap<String, String> = HashMap::new();
        let context = propagator.extract(&extractor);
        assert!(context.baggage().is_empty());
    }

    #[test]
    fn inject_and_extract_round_trip() {
        let propagator = BaggagePropagator::new();
        let cx = Context::new()
            .with_baggage_entry("user.id", "user123")
            .with_baggage_entry("note", "contains,comma and=equals")
            .with_baggage_entry("emoji", "nön-äscii");

        let mut carrier: HashMap<String, String> = HashMap::new();
        propagator.inject_context(&cx, &mut carrier);
        let extracted = propagator.extract_with_context(&Context::new(), &carrier);

        let original = cx.baggage();
        let round_tripped = extracted.baggage();
        assert_eq!(original.len(), round_tripped.len());
        for (key, value) in original.iter() {
            assert_eq!(round_tripped.get(key.as_str()), Some(value));
        }
        // insertion order also survives
        let keys = |b: &Baggage| b.iter().map(|(k, _)| k.to_string()).collect::<Vec<_>>();
        assert_eq!(keys(original), keys(round_tripped));
    }

    #[test]
    fn inject_empty_baggage_sets_no_header() {
        let propagator = BaggagePropagator::new();
        let mut carrier: HashMap<String, String> = HashMap::new();
        propagator.inject_context(&Context::new(), &mut carrier);
        assert!(carrier.is_empty());
    }
}
