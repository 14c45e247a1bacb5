//! BiPRO transfer client: fetches insurance delivery shipments from insurer
//! backends (VU) over SOAP 1.1/HTTPS and decodes their MTOM/XOP multipart
//! payloads.
//!
//! The crate is organised around five cooperating pieces:
//! - [`token::TokenStore`] — caches short-lived security tokens (norm 410)
//!   with a per-key single-flight guarantee, so racing workers never issue
//!   duplicate token requests.
//! - [`governor::RateGovernor`] — adaptive concurrency budget reacting to
//!   throttling signals (429/503) with capped exponential backoff.
//! - [`mime`] — multipart/related (MTOM/XOP) decoding with byte-level
//!   validation of binary attachments.
//! - [`protocol::ProtocolConnector`] — executes the norm 430 operations
//!   (list, get, acknowledge) over a pluggable [`protocol::SoapTransport`],
//!   shaped by a data-driven per-insurer policy table.
//! - [`transfer::DownloadOrchestrator`] — bounded worker pool downloading a
//!   batch of shipments concurrently, tolerant of per-shipment failure,
//!   producing a [`transfer::RunSummary`].
//!
//! External collaborators (credential store, document archive) are traits
//! implemented by the embedding application; see [`token::CredentialSource`]
//! and [`archive::ArchiveSink`].

pub mod archive;
pub mod config;
pub mod error;
pub mod governor;
pub mod mime;
pub mod protocol;
pub mod token;
pub mod transfer;
pub mod util;

pub use config::{GovernorConfig, InsurerConfig, InsurerDirectory};
pub use error::FetchError;
pub use governor::RateGovernor;
pub use protocol::{HttpTransport, ProtocolConnector};
pub use token::TokenStore;
pub use transfer::{DownloadOrchestrator, RunSummary};
pub use util::stop::StopSignal;
