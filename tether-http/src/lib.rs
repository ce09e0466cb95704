//! # Tether HTTP
//!
//! reqwest transport for `tether-core`.
//!
//! - [`RemoteApi`]: JSON requests returning classified [`tether_core::Error`]s
//! - [`HttpProbe`]: `HEAD` ping used by the connectivity monitor
//! - [`from_reqwest`] / [`check_response`]: error classification
//!
//! ## Example
//!
//! ```rust,no_run
//! use tether_core::{ReadRequest, ResilientClient, TetherConfig, keys};
//! use tether_http::{RemoteApi, RemoteApiConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tether_core::Error> {
//!     let config = TetherConfig::default();
//!     let api = RemoteApi::new(RemoteApiConfig::builder("https://fhir.example.com").build())?;
//!
//!     let client = ResilientClient::builder(config.clone())
//!         .probe(Arc::new(api.probe(&config.connectivity)?))
//!         .build()?;
//!     client.start();
//!
//!     let patient = client
//!         .read(ReadRequest::new(keys::patient("42")).class(keys::PATIENT), || {
//!             api.get_json::<serde_json::Value>("Patient/42")
//!         })
//!         .await?;
//!     println!("{}", patient.data);
//!     Ok(())
//! }
//! ```

mod api;
mod classify;
mod probe;

pub use api::{RemoteApi, RemoteApiConfig, RemoteApiConfigBuilder};
pub use classify::{check_response, from_reqwest};
pub use probe::HttpProbe;
