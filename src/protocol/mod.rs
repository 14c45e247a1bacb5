//! Protocol layer: SOAP transport, request shaping, response decoding and
//! the connector executing the norm 410/430 operations.

pub mod connector;
pub mod envelope;
pub mod messages;
pub mod policy;
pub mod transport;

pub use connector::ProtocolConnector;
pub use messages::{ShipmentDescriptor, ShipmentFilters, ShipmentPayload, ShipmentStatus};
pub use policy::{CommitSignal, ConnectorPolicy};
pub use transport::{HttpTransport, SoapTransport, TransportFailure, WireResponse};

use crate::error::FetchError;
use crate::token::store::TokenIssuer;
use crate::token::token::SecurityToken;
use std::future::Future;

/// The shipment operations the orchestrator drives. Implemented by
/// [`ProtocolConnector`]; mocked in orchestrator tests.
pub trait ShipmentApi: TokenIssuer {
    fn list_shipments(
        &self,
        token: &SecurityToken,
        filters: &ShipmentFilters,
    ) -> impl Future<Output = Result<Vec<ShipmentDescriptor>, FetchError>> + Send;

    fn get_shipment(
        &self,
        token: &SecurityToken,
        descriptor: &ShipmentDescriptor,
    ) -> impl Future<Output = Result<ShipmentPayload, FetchError>> + Send;

    fn acknowledge_shipment(
        &self,
        token: &SecurityToken,
        descriptor: &ShipmentDescriptor,
    ) -> impl Future<Output = Result<(), FetchError>> + Send;
}
