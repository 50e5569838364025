//! Servicedriver
//!
//! The outbound HTTP transport of a configuration management agent: pooled
//! persistent connections, DNS SRV service discovery, per-run service routing
//! and the redirect and `Retry-After` policies that wrap every request.
//!
//! The usual entry point is a [`Client`], built from [`Settings`], and a
//! [`Session`] created from it:
//!
//! ```no_run
//! # use servicedriver::{Client, Settings, service::ServiceName};
//! # async fn run() -> Result<(), servicedriver::Error> {
//! let client = Client::builder().with_settings(Settings::default()).build();
//! let mut session = client.create_session();
//! let service = session.route_to(ServiceName::Puppet, None, None).await?;
//! let response = client.get(&service.url().join("node/agent")?, Default::default()).await?;
//! session.process_response(&response);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod client;
pub mod dns;
mod error;
pub mod service;
pub mod session;
mod settings;
pub mod tls;

pub use client::{Client, HttpClient, RequestOptions};
pub use error::Error;
pub use session::Session;
pub use settings::Settings;

/// Boxed error type used for opaque error sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
