use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use url::Url;

use super::{require_content_type, Client, HttpClient, RequestOptions, Response};
use crate::{BoxError, Error};

/// A caller-supplied HTTP implementation.
///
/// Only `GET` and `POST` are supported.
#[async_trait]
pub trait ExternalTransport: fmt::Debug + Send + Sync {
    /// `GET url`.
    async fn get(&self, url: &Url, headers: &HeaderMap) -> Result<http::Response<Bytes>, BoxError>;

    /// `POST body` to `url`.
    async fn post(
        &self,
        url: &Url,
        body: Bytes,
        headers: &HeaderMap,
    ) -> Result<http::Response<Bytes>, BoxError>;
}

/// An [`HttpClient`] delegating to an [`ExternalTransport`].
///
/// Operations other than `get` and `post` fail with
/// [`Error::NotImplemented`]. Closing is a no-op.
#[derive(Debug, Clone)]
pub struct ExternalClient {
    transport: Arc<dyn ExternalTransport>,
}

impl ExternalClient {
    /// Delegate requests to `transport`.
    pub fn new<T: ExternalTransport + 'static>(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }
}

fn transport_error(url: &Url, error: BoxError) -> Error {
    Error::http(format!("Request to {url} failed: {error}"), Some(error))
}

#[async_trait]
impl HttpClient for ExternalClient {
    async fn get(&self, url: &Url, options: RequestOptions) -> Result<Response, Error> {
        let url = Client::encode_query(url, &options.params);
        let response = self
            .transport
            .get(&url, &options.headers)
            .await
            .map_err(|error| transport_error(&url, error))?;
        Ok(Response::new(url, response))
    }

    async fn head(&self, _url: &Url, _options: RequestOptions) -> Result<Response, Error> {
        Err(Error::NotImplemented("head"))
    }

    async fn put(&self, _url: &Url, _body: Bytes, _options: RequestOptions) -> Result<Response, Error> {
        Err(Error::NotImplemented("put"))
    }

    async fn post(&self, url: &Url, body: Bytes, options: RequestOptions) -> Result<Response, Error> {
        require_content_type("post", &options)?;
        let url = Client::encode_query(url, &options.params);
        let response = self
            .transport
            .post(&url, body, &options.headers)
            .await
            .map_err(|error| transport_error(&url, error))?;
        Ok(Response::new(url, response))
    }

    async fn delete(&self, _url: &Url, _options: RequestOptions) -> Result<Response, Error> {
        Err(Error::NotImplemented("delete"))
    }

    async fn connect(&self, _url: &Url, _options: RequestOptions) -> Result<(), Error> {
        Err(Error::NotImplemented("connect"))
    }

    fn close(&self) {}
}
