//! Read-only snapshot of the inbound request and its parsed body.
//!
//! The body is parsed exactly once, according to the declared content type,
//! into a [`ParsedBody`] variant. Multipart file parts are spooled to
//! temporary files that live as long as the snapshot does.

use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Method, Uri};
use bytes::Bytes;
use futures_util::StreamExt;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tower::{Layer, ServiceExt};

use crate::error::ForwardError;

/// Content-type classification used to pick the outbound body channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Json,
    Multipart,
    UrlEncoded,
    Other,
}

impl ContentKind {
    /// Classify a `content-type` header value. Missing or unparsable values are `Other`.
    pub fn classify(content_type: Option<&str>) -> Self {
        let Some(mime) = content_type.and_then(|ct| ct.parse::<mime::Mime>().ok()) else {
            return ContentKind::Other;
        };
        if mime.type_() == mime::MULTIPART && mime.subtype() == mime::FORM_DATA {
            ContentKind::Multipart
        } else if mime.type_() != mime::APPLICATION {
            ContentKind::Other
        } else if mime.subtype() == mime::JSON || mime.suffix() == Some(mime::JSON) {
            ContentKind::Json
        } else if mime.subtype() == mime::WWW_FORM_URLENCODED {
            ContentKind::UrlEncoded
        } else {
            ContentKind::Other
        }
    }
}

/// An uploaded file received in a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Where the upload was spooled on disk.
    pub path: PathBuf,
    /// Filename supplied by the client, if any.
    pub filename: Option<String>,
    /// Media type declared for the part, if any.
    pub content_type: Option<String>,
}

/// One or several files uploaded under the same field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEntry {
    Single(FileDescriptor),
    Many(Vec<FileDescriptor>),
}

impl FileEntry {
    fn push(&mut self, file: FileDescriptor) {
        match self {
            FileEntry::Single(first) => {
                let first = first.clone();
                *self = FileEntry::Many(vec![first, file]);
            }
            FileEntry::Many(files) => files.push(file),
        }
    }

    /// Files in upload order.
    pub fn iter(&self) -> impl Iterator<Item = &FileDescriptor> {
        match self {
            FileEntry::Single(file) => std::slice::from_ref(file).iter(),
            FileEntry::Many(files) => files.iter(),
        }
    }
}

/// A parsed `multipart/form-data` body.
#[derive(Debug, Default)]
pub struct MultipartBody {
    /// Plain text fields, in arrival order.
    pub fields: Vec<(String, String)>,
    /// File fields, in order of first appearance of each name.
    pub files: Vec<(String, FileEntry)>,
    /// Deletes the spooled files when the body is dropped.
    spool: Vec<TempPath>,
}

impl MultipartBody {
    /// Build a body from files already on disk. The files are not owned and are
    /// left in place when the body is dropped.
    pub fn new(fields: Vec<(String, String)>, files: Vec<(String, FileEntry)>) -> Self {
        Self {
            fields,
            files,
            spool: Vec::new(),
        }
    }

    fn add_file(&mut self, name: String, file: FileDescriptor) {
        match self.files.iter_mut().find(|(n, _)| *n == name) {
            Some((_, entry)) => entry.push(file),
            None => self.files.push((name, FileEntry::Single(file))),
        }
    }
}

/// The inbound body, parsed once according to its content type.
#[derive(Debug)]
pub enum ParsedBody {
    Json(serde_json::Value),
    UrlEncoded(Vec<(String, String)>),
    Multipart(MultipartBody),
    Raw(Bytes),
    Absent,
}

/// Method, URI and headers of an inbound request, detached from its body.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn from_parts(parts: &Parts) -> Self {
        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
        }
    }
}

/// Read-only view of the inbound request handed to the option resolver.
#[derive(Debug)]
pub struct InboundRequest {
    pub method: Method,
    pub protocol: String,
    pub host: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub content_kind: ContentKind,
    pub body: ParsedBody,
}

impl InboundRequest {
    /// Buffer the request body (up to `limit` bytes) and parse it.
    pub async fn from_request(req: Request, limit: usize) -> Result<Self, ForwardError> {
        let (parts, body) = req.into_parts();
        let bytes = match buffer_body(body, limit).await? {
            Buffered::Complete(bytes) => bytes,
            Buffered::Overflow(_) => return Err(ForwardError::PayloadTooLarge { limit }),
        };
        Self::parse(RequestHead::from_parts(&parts), bytes).await
    }

    /// Build the snapshot from an already buffered body.
    pub async fn parse(head: RequestHead, bytes: Bytes) -> Result<Self, ForwardError> {
        let content_type = head
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_kind = ContentKind::classify(content_type.as_deref());

        let body = if bytes.is_empty() {
            ParsedBody::Absent
        } else {
            match content_kind {
                ContentKind::Json => ParsedBody::Json(
                    serde_json::from_slice(&bytes).map_err(|e| ForwardError::Body(e.to_string()))?,
                ),
                ContentKind::UrlEncoded => ParsedBody::UrlEncoded(
                    serde_urlencoded::from_bytes(&bytes)
                        .map_err(|e| ForwardError::Body(e.to_string()))?,
                ),
                ContentKind::Multipart => ParsedBody::Multipart(
                    parse_multipart(content_type.as_deref().unwrap_or_default(), bytes).await?,
                ),
                ContentKind::Other => ParsedBody::Raw(bytes),
            }
        };

        let protocol = head.uri.scheme_str().unwrap_or("http").to_string();
        let host = head
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| head.uri.authority().map(|a| a.to_string()))
            .unwrap_or_else(|| "localhost".to_string());
        let query = head
            .uri
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        Ok(Self {
            path: head.uri.path().to_string(),
            method: head.method,
            protocol,
            host,
            query,
            headers: head.headers,
            content_kind,
            body,
        })
    }
}

/// Outcome of reading a body up to a size limit.
pub(crate) enum Buffered {
    /// The whole body fit within the limit.
    Complete(Bytes),
    /// The limit was crossed. The body still yields every byte, including
    /// the chunks already read.
    Overflow(Body),
}

/// Read `body` into memory unless it grows past `limit` bytes.
pub(crate) async fn buffer_body(body: Body, limit: usize) -> Result<Buffered, ForwardError> {
    let mut stream = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut len = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ForwardError::Body(e.to_string()))?;
        len += chunk.len();
        chunks.push(chunk);
        if len > limit {
            let read = futures_util::stream::iter(chunks.into_iter().map(Ok::<_, axum::Error>));
            return Ok(Buffered::Overflow(Body::from_stream(read.chain(stream))));
        }
    }

    Ok(Buffered::Complete(match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.swap_remove(0),
        _ => Bytes::from(chunks.concat()),
    }))
}

/// Parse an already buffered multipart body.
async fn parse_multipart(content_type: &str, bytes: Bytes) -> Result<MultipartBody, ForwardError> {
    let req = axum::http::Request::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(bytes))
        .map_err(|e| ForwardError::Body(e.to_string()))?;

    // The body was already read within the configured limit; lift axum's default cap.
    DefaultBodyLimit::disable()
        .layer(tower::service_fn(spool_multipart))
        .oneshot(req)
        .await
}

/// Stream every part of a multipart body: text parts become fields, file
/// parts are written to temporary files.
async fn spool_multipart(req: Request) -> Result<MultipartBody, ForwardError> {
    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| ForwardError::Body(e.body_text()))?;

    let mut parsed = MultipartBody::default();
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ForwardError::Body(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let Some(filename) = field.file_name().map(str::to_string) else {
            let value = field
                .text()
                .await
                .map_err(|e| ForwardError::Body(e.body_text()))?;
            parsed.fields.push((name, value));
            continue;
        };
        let content_type = field.content_type().map(str::to_string);

        let (file, path) = tempfile::NamedTempFile::new()?.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| ForwardError::Body(e.body_text()))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        tracing::debug!(field = %name, filename = %filename, path = ?path, "Spooled multipart upload");
        parsed.add_file(
            name,
            FileDescriptor {
                path: path.to_path_buf(),
                filename: Some(filename),
                content_type,
            },
        );
        parsed.spool.push(path);
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(method: Method, uri: &str, content_type: Option<&str>) -> RequestHead {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "localhost:3000".parse().unwrap());
        if let Some(ct) = content_type {
            headers.insert(header::CONTENT_TYPE, ct.parse().unwrap());
        }
        RequestHead {
            method,
            uri: uri.parse().unwrap(),
            headers,
        }
    }

    #[test]
    fn test_classify_content_types() {
        assert_eq!(ContentKind::classify(Some("application/json")), ContentKind::Json);
        assert_eq!(
            ContentKind::classify(Some("application/json; charset=utf-8")),
            ContentKind::Json
        );
        assert_eq!(ContentKind::classify(Some("application/vnd.api+json")), ContentKind::Json);
        assert_eq!(
            ContentKind::classify(Some("application/x-www-form-urlencoded")),
            ContentKind::UrlEncoded
        );
        assert_eq!(
            ContentKind::classify(Some("multipart/form-data; boundary=abc")),
            ContentKind::Multipart
        );
        assert_eq!(ContentKind::classify(Some("text/plain")), ContentKind::Other);
        assert_eq!(ContentKind::classify(Some("not a mime")), ContentKind::Other);
        assert_eq!(ContentKind::classify(None), ContentKind::Other);
    }

    #[tokio::test]
    async fn test_parse_json_body_and_query() {
        let inbound = InboundRequest::parse(
            head(Method::POST, "/items?a=1&a=2&b=x%20y", Some("application/json")),
            Bytes::from_static(br#"{"name":"x"}"#),
        )
        .await
        .unwrap();

        assert_eq!(inbound.protocol, "http");
        assert_eq!(inbound.host, "localhost:3000");
        assert_eq!(inbound.path, "/items");
        assert_eq!(
            inbound.query,
            vec![
                ("a".to_string(), "1".to_string()),
                ("a".to_string(), "2".to_string()),
                ("b".to_string(), "x y".to_string()),
            ]
        );
        assert_eq!(inbound.content_kind, ContentKind::Json);
        match inbound.body {
            ParsedBody::Json(v) => assert_eq!(v, serde_json::json!({"name": "x"})),
            other => panic!("expected json body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_parse_urlencoded_body() {
        let inbound = InboundRequest::parse(
            head(Method::POST, "/", Some("application/x-www-form-urlencoded")),
            Bytes::from_static(b"name=a&city=new+york"),
        )
        .await
        .unwrap();

        match inbound.body {
            ParsedBody::UrlEncoded(fields) => assert_eq!(
                fields,
                vec![
                    ("name".to_string(), "a".to_string()),
                    ("city".to_string(), "new york".to_string()),
                ]
            ),
            other => panic!("expected urlencoded body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_body_is_absent() {
        let inbound = InboundRequest::parse(head(Method::GET, "/", Some("application/json")), Bytes::new())
            .await
            .unwrap();
        assert!(matches!(inbound.body, ParsedBody::Absent));
    }

    #[tokio::test]
    async fn test_oversized_body_is_payload_too_large() {
        let req = axum::http::Request::post("/upload")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(vec![b'a'; 64]))
            .unwrap();

        let err = InboundRequest::from_request(req, 16).await.unwrap_err();
        assert!(matches!(err, ForwardError::PayloadTooLarge { limit: 16 }));
    }

    #[tokio::test]
    async fn test_overflowing_body_still_yields_every_byte() {
        let chunks = ["first-", "second-", "third"].map(|c| Ok::<_, std::io::Error>(Bytes::from(c)));
        let body = Body::from_stream(futures_util::stream::iter(chunks));

        let Buffered::Overflow(body) = buffer_body(body, 8).await.unwrap() else {
            panic!("expected the limit to be crossed");
        };
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"first-second-third");
    }

    #[tokio::test]
    async fn test_body_within_limit_is_buffered() {
        let Buffered::Complete(bytes) = buffer_body(Body::from("hello"), 5).await.unwrap() else {
            panic!("expected the body to fit");
        };
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn test_malformed_json_is_rejected() {
        let err = InboundRequest::parse(
            head(Method::POST, "/", Some("application/json")),
            Bytes::from_static(b"{not json"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ForwardError::Body(_)));
    }

    #[tokio::test]
    async fn test_parse_multipart_spools_files_until_drop() {
        let payload = "--XYZ\r\n\
            Content-Disposition: form-data; name=\"name\"\r\n\r\n\
            a\r\n\
            --XYZ\r\n\
            Content-Disposition: form-data; name=\"docs\"; filename=\"one.txt\"\r\n\
            Content-Type: text/plain\r\n\r\n\
            first\r\n\
            --XYZ\r\n\
            Content-Disposition: form-data; name=\"docs\"; filename=\"two.txt\"\r\n\
            Content-Type: text/plain\r\n\r\n\
            second\r\n\
            --XYZ--\r\n";

        let inbound = InboundRequest::parse(
            head(Method::POST, "/upload", Some("multipart/form-data; boundary=XYZ")),
            Bytes::from(payload),
        )
        .await
        .unwrap();

        let ParsedBody::Multipart(body) = inbound.body else {
            panic!("expected multipart body");
        };
        assert_eq!(body.fields, vec![("name".to_string(), "a".to_string())]);
        assert_eq!(body.files.len(), 1);

        let (name, entry) = &body.files[0];
        assert_eq!(name, "docs");
        let files: Vec<_> = entry.iter().collect();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].filename.as_deref(), Some("one.txt"));
        assert_eq!(files[1].filename.as_deref(), Some("two.txt"));
        assert_eq!(files[0].content_type.as_deref(), Some("text/plain"));
        assert_eq!(std::fs::read_to_string(&files[0].path).unwrap(), "first");
        assert_eq!(std::fs::read_to_string(&files[1].path).unwrap(), "second");

        let paths: Vec<PathBuf> = entry.iter().map(|f| f.path.clone()).collect();
        drop(body);
        assert!(paths.iter().all(|p| !p.exists()));
    }
}
