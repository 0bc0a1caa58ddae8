//! An in-process registry for unit tests

use crate::errors::Result;
use crate::transport::Transport;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName};
use bytes::Bytes;
use futures_util::stream;
use reqwest::{Body, Method, Request, Response, Url};
use std::sync::{Arc, Mutex};

/// What a fake registry answers with.
pub(crate) type FakeResponse = http::Response<Body>;

#[derive(Clone, Debug)]
pub(crate) struct RecordedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

/// Answers every request with `handler` and remembers what it was asked.
pub(crate) struct FakeRegistry<F> {
    handler: F,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl<F> FakeRegistry<F>
where
    F: Fn(&RecordedRequest) -> FakeResponse + Send + Sync,
{
    pub fn new(handler: F) -> Arc<Self> {
        Arc::new(FakeRegistry {
            handler,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl<F> Transport for FakeRegistry<F>
where
    F: Fn(&RecordedRequest) -> FakeResponse + Send + Sync,
{
    async fn round_trip(&self, request: Request) -> Result<Response> {
        let recorded = RecordedRequest {
            method: request.method().clone(),
            url: request.url().clone(),
            headers: request.headers().clone(),
        };
        let res = (self.handler)(&recorded);
        self.requests.lock().unwrap().push(recorded);
        Ok(Response::from(res))
    }
}

pub(crate) fn respond(status: u16, body: impl Into<Vec<u8>>) -> FakeResponse {
    http::Response::builder()
        .status(status)
        .body(Body::from(body.into()))
        .unwrap()
}

/// A response whose body breaks off with an I/O error.
pub(crate) fn respond_with_broken_body(status: u16) -> FakeResponse {
    let chunks: Vec<std::io::Result<Bytes>> = vec![
        Ok(Bytes::from_static(b"{\"tok")),
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset",
        )),
    ];
    http::Response::builder()
        .status(status)
        .body(Body::wrap_stream(stream::iter(chunks)))
        .unwrap()
}

pub(crate) fn respond_with_header(
    status: u16,
    name: HeaderName,
    value: &str,
) -> FakeResponse {
    http::Response::builder()
        .status(status)
        .header(name, value)
        .body(Body::from(Vec::new()))
        .unwrap()
}
