#![deny(missing_docs)]

//! # MAGIC SDK
//!
//! Reference client for the MAGIC gateway control protocol.
//!
//! The SDK provides:
//!
//! * [`MagicClient`] — a connected control-protocol participant with
//!   typed request/answer methods and a push inbox for server-initiated
//!   notifications (MNTR) and status broadcasts (MSCR).
//! * [`SdkError`] — unified error type for all SDK operations.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use magic_models::SessionId;
//! use magic_sdk::MagicClient;
//!
//! # async fn run() -> Result<(), magic_sdk::SdkError> {
//! let mut client = MagicClient::connect(
//!     "127.0.0.1:3868",
//!     "ife.cabin.aircraft",
//!     "aircraft",
//! )
//! .await?;
//!
//! let session = SessionId::new("ife.cabin;1;1");
//! let answer = client
//!     .authenticate(&session, "ife", "cabin-secret", None)
//!     .await?;
//! println!("authenticated: {:?}", answer.status.result_code);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;

pub use client::MagicClient;
pub use error::SdkError;
