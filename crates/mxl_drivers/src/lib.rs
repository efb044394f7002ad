//! Driver-side counterpart to the `mxl_link` hub.
//!
//! A driver process hosts a model implementing the same capability surface
//! as an embedded driver, and speaks the hub's wire protocol on its behalf:
//! connect, INIT/ASSIGN handshake, then one AMP per received FIELD until
//! the hub says goodbye.
//!
//! ```rust,no_run
//! use mxl_drivers::{DriverClient, Endpoint, ScaledEcho};
//!
//! # async fn example() -> Result<(), mxl_link::LinkError> {
//! let mut model = ScaledEcho::new(-1.0);
//! let mut client =
//!     DriverClient::connect(&Endpoint::tcp("127.0.0.1:31415"), None, "echo").await?;
//! client.serve(&mut model).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod models;

pub use client::{DriverClient, Endpoint};
pub use models::{builtin_registry, NullModel, ScaledEcho, StagedModel};
