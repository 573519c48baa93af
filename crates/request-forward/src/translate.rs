//! Body translation: maps the parsed inbound body onto one outbound body channel.

use axum::http::header::{self, HeaderName};
use axum::http::Method;

use crate::inbound::{ContentKind, ParsedBody};
use crate::options::{ForwardOptions, FormPart, OutboundBody};

/// HEAD, GET and DELETE never carry an outbound body.
fn is_bodyless(method: &Method) -> bool {
    matches!(*method, Method::HEAD | Method::GET | Method::DELETE)
}

/// Populate `options.body` from the inbound body.
///
/// The inbound `content-length` is always removed; the transport computes the
/// length of whatever is sent. A body already set on `options` is left
/// untouched. Otherwise at most one channel is chosen by `kind`.
pub fn translate(options: &mut ForwardOptions, kind: ContentKind, body: &ParsedBody) {
    strip_headers(options, &[header::CONTENT_LENGTH]);
    if options.body.is_some() {
        return;
    }
    let bodyless = options.method.as_ref().is_some_and(is_bodyless);

    match kind {
        ContentKind::Json => {
            if let (ParsedBody::Json(value), false) = (body, bodyless) {
                options.body = Some(OutboundBody::Json(value.clone()));
            }
        }
        ContentKind::Multipart => {
            // The transport writes a new boundary, so the inbound content-type is stale too.
            strip_headers(options, &[header::CONTENT_TYPE]);
            if let (ParsedBody::Multipart(multipart), false) = (body, bodyless) {
                let mut parts = Vec::new();
                for (name, entry) in &multipart.files {
                    for file in entry.iter() {
                        parts.push((name.clone(), FormPart::File(file.clone())));
                    }
                }
                for (name, value) in &multipart.fields {
                    parts.push((name.clone(), FormPart::Text(value.clone())));
                }
                options.body = Some(OutboundBody::Multipart(parts));
            }
        }
        ContentKind::UrlEncoded => {
            if let (ParsedBody::UrlEncoded(fields), false) = (body, bodyless) {
                options.body = Some(OutboundBody::Form(fields.clone()));
            }
        }
        ContentKind::Other => {
            if let (ParsedBody::Raw(bytes), false) = (body, bodyless) {
                options.body = Some(OutboundBody::Raw(bytes.clone()));
            }
        }
    }
}

fn strip_headers(options: &mut ForwardOptions, names: &[HeaderName]) {
    if let Some(headers) = options.headers.as_mut() {
        for name in names {
            headers.remove(name);
        }
    }
}
