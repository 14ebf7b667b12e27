//! Encoding and decoding of the `x-cloud-trace-context` header.
//!
//! The wire format is `<trace-id>/<span-id>;o=<options>`, where the span id and the options
//! bitmask are decimal integers. Decoding is best-effort: a header from a foreign or broken
//! peer degrades to default identifiers instead of failing the call that carried it.

use std::fmt;

/// Metadata key carrying the trace context on every traced call.
pub const TRACE_HEADER: &str = "x-cloud-trace-context";

/// Headers longer than this are ignored outright.
const MAX_HEADER_LEN: usize = 200;

/// Trace options bitmask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TraceOptions(pub u32);

impl TraceOptions {
    /// Bit 0: the trace is sampled and its spans are reported.
    pub const SAMPLED: TraceOptions = TraceOptions(1);

    /// No option bits set.
    pub const NONE: TraceOptions = TraceOptions(0);

    /// Returns `true` when the sampled bit is set.
    pub fn is_sampled(self) -> bool {
        self.0 & Self::SAMPLED.0 != 0
    }

    /// Returns a copy with the sampled bit set or cleared.
    pub fn with_sampled(self, sampled: bool) -> Self {
        if sampled {
            TraceOptions(self.0 | Self::SAMPLED.0)
        } else {
            TraceOptions(self.0 & !Self::SAMPLED.0)
        }
    }
}

impl fmt::Display for TraceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifiers carried by a trace header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceContext {
    /// 128-bit trace identifier in its textual form.
    pub trace_id: String,
    /// Span id of the caller's span.
    pub span_id: u64,
    /// Parent of `span_id`. The wire format does not carry it, so decoding leaves it zero.
    pub parent_span_id: u64,
    /// Options bitmask.
    pub options: TraceOptions,
}

impl TraceContext {
    /// Encodes this context as a header value.
    pub fn encode(&self) -> String {
        encode(&self.trace_id, self.span_id, self.options)
    }

    /// Returns `true` if the context names a trace.
    pub fn has_trace_id(&self) -> bool {
        !self.trace_id.is_empty()
    }
}

/// Formats `trace_id`, `span_id` and `options` as a header value.
pub fn encode(trace_id: &str, span_id: u64, options: TraceOptions) -> String {
    format!("{trace_id}/{span_id};o={options}")
}

/// Parses a header value.
///
/// Never fails. Fields that are missing or unparseable come back as their default value;
/// a header without a `/` separator, an empty header, or one longer than 200 bytes yields
/// [`TraceContext::default`].
pub fn decode(header: &str) -> TraceContext {
    if header.is_empty() || header.len() > MAX_HEADER_LEN {
        return TraceContext::default();
    }

    let Some((trace_id, rest)) = header.split_once('/') else {
        return TraceContext::default();
    };

    let (span_id, options) = match rest.split_once(';') {
        Some((span_id, options)) => (span_id, Some(options)),
        None => (rest, None),
    };

    let options = options
        .and_then(|options| options.trim().strip_prefix("o="))
        .and_then(|options| options.trim().parse().ok())
        .map(TraceOptions)
        .unwrap_or_default();

    TraceContext {
        trace_id: trace_id.trim().to_owned(),
        span_id: span_id.trim().parse().unwrap_or_default(),
        parent_span_id: 0,
        options,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_formats_decimal_fields() {
        assert_eq!(
            encode("105445aa7843bc8bf206b12000100000", 1, TraceOptions::SAMPLED),
            "105445aa7843bc8bf206b12000100000/1;o=1"
        );
        assert_eq!(encode("abc", u64::MAX, TraceOptions(6)), format!("abc/{};o=6", u64::MAX));
    }

    #[test]
    fn decode_reverses_encode() {
        let cases = [
            ("0af7651916cd43dd8448eb211c80319c", 0, TraceOptions::NONE),
            ("abc", 42, TraceOptions::SAMPLED),
            ("4bf92f3577b34da6a3ce929d0e0e4736", u64::MAX, TraceOptions(u32::MAX)),
        ];

        for (trace_id, span_id, options) in cases {
            let decoded = decode(&encode(trace_id, span_id, options));
            assert_eq!(decoded.trace_id, trace_id);
            assert_eq!(decoded.span_id, span_id);
            assert_eq!(decoded.options, options);
            assert_eq!(decoded.parent_span_id, 0);
        }
    }

    #[test]
    fn decode_without_options() {
        let ctx = decode("abc/42");
        assert_eq!(ctx.trace_id, "abc");
        assert_eq!(ctx.span_id, 42);
        assert_eq!(ctx.options, TraceOptions::NONE);
    }

    #[test]
    fn decode_degrades_bad_fields_to_zero() {
        let ctx = decode("abc/not-a-number;o=1");
        assert_eq!(ctx.trace_id, "abc");
        assert_eq!(ctx.span_id, 0);
        assert!(ctx.options.is_sampled());

        let ctx = decode("abc/7;o=yes");
        assert_eq!(ctx.span_id, 7);
        assert_eq!(ctx.options, TraceOptions::NONE);

        let ctx = decode("abc/7;sampled");
        assert_eq!(ctx.span_id, 7);
        assert_eq!(ctx.options, TraceOptions::NONE);
    }

    #[test]
    fn decode_rejects_garbage_headers() {
        assert_eq!(decode(""), TraceContext::default());
        assert_eq!(decode("no-separator-here"), TraceContext::default());
        assert_eq!(decode(&"a".repeat(201)), TraceContext::default());
        assert!(!decode("/12;o=1").has_trace_id());
    }

    #[test]
    fn options_sampled_bit() {
        assert!(TraceOptions(3).is_sampled());
        assert!(!TraceOptions(2).is_sampled());
        assert_eq!(TraceOptions(2).with_sampled(true), TraceOptions(3));
        assert_eq!(TraceOptions(3).with_sampled(false), TraceOptions(2));
    }
}
