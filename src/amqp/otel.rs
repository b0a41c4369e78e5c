// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for AMQP
//!
//! Propagates the trace context through AMQP message headers and opens a
//! consumer span per delivery.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

pub const TRACER_NAME: &str = "reliable-queue";

type Headers = BTreeMap<ShortString, AMQPValue>;

/// Writes trace headers into an outgoing header table. Keys are lowercased.
pub(crate) struct HeaderInjector<'a>(pub(crate) &'a mut Headers);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        let key = ShortString::from(key.to_ascii_lowercase());
        self.0.insert(key, AMQPValue::LongString(value.into()));
    }
}

/// Reads trace headers from a delivery. Only long string values are trace
/// headers; anything else is ignored.
pub(crate) struct HeaderExtractor<'a>(pub(crate) &'a Headers);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            AMQPValue::LongString(value) => match std::str::from_utf8(value.as_bytes()) {
                Ok(value) => Some(value),
                Err(err) => {
                    error!(error = err.to_string(), key, "invalid trace header");
                    None
                }
            },
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(ShortString::as_str).collect()
    }
}

/// Writes the trace context of `ctx` into `headers`.
pub(crate) fn inject(ctx: &Context, headers: &mut Headers) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector(headers))
    });
}

/// Starts a consumer span that continues the trace carried by `props`.
pub(crate) fn new_span(props: &AMQPProperties, name: &str) -> (Context, BoxedSpan) {
    let empty = Headers::new();
    let headers = props.headers().as_ref().map_or(&empty, |table| table.inner());

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(headers))
    });

    let tracer = global::tracer(TRACER_NAME);
    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(&tracer, &ctx);

    (ctx, span)
}
