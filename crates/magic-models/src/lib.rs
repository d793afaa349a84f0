#![deny(missing_docs)]

//! # MAGIC Models
//!
//! Core data types for the MAGIC (Multi-link Aggregation Gateway for
//! In-flight Connectivity) control plane, modelled on ARINC 839-2014.
//!
//! ## Message hierarchy
//!
//! ```text
//! MagicEnvelope
//! └── MagicMessage
//!     ├── AuthenticationRequest / AuthenticationAnswer        (CAR / CAA)
//!     ├── CommunicationChangeRequest / ...Answer              (CCR / CCA)
//!     ├── SessionTerminationRequest / ...Answer               (STR / STA)
//!     ├── StatusRequest / StatusAnswer                        (SXR / SXA)
//!     ├── AccountingDataRequest / ...Answer                   (ADR / ADA)
//!     ├── AccountingControlRequest / ...Answer                (ACR / ACA)
//!     ├── NotificationReport / NotificationAck                (MNTR / NTR)
//!     └── StatusChangeReport / StatusChangeAck                (MSCR / SCR)
//! ```
//!
//! ## Module layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`ids`] | Newtype identifiers (`SessionId`, `ClientId`, `DlmId`, …) |
//! | [`bandwidth`] | Kilobit/s bookkeeping unit and bit/s wire conversions |
//! | [`codes`] | Protocol result codes and detailed MAGIC status codes |
//! | [`aircraft`] | Flight phases and the published aircraft state |
//! | [`conditions`] | Altitude / airport session-activation expressions |
//! | [`datalink`] | Per-DLM configuration (type, capacity, coverage) |
//! | [`policy`] | Central policy profile: traffic classes, path rules |
//! | [`profile`] | Per-client profiles (auth, quota, QoS, link, traffic) |
//! | [`message`] | `MagicEnvelope` and every request/answer payload |

pub mod aircraft;
pub mod bandwidth;
pub mod codes;
pub mod conditions;
pub mod datalink;
pub mod error;
pub mod ids;
pub mod message;
pub mod policy;
pub mod profile;

// Re-export all public types at crate root for convenience.
// Downstream crates can use `magic_models::SessionId` directly.
pub use aircraft::*;
pub use bandwidth::*;
pub use codes::*;
pub use conditions::*;
pub use datalink::*;
pub use error::*;
pub use ids::*;
pub use message::*;
pub use policy::*;
pub use profile::*;
