//! Application Ports (Driven)
//!
//! Interfaces the pool uses to reach the outside world.
//! - `Transport` / `SessionHandle`: the lower protocol binding that opens a
//!   session socket and exchanges requests with the gateway
//! - `AllocationStore`: durable storage for the session id allocation table

mod allocation_store;
mod transport;

pub use allocation_store::{AllocationRecord, AllocationStore, AllocationTable, StoreError};
#[cfg(test)]
pub use allocation_store::MockAllocationStore;
pub use transport::{
    GatewayEndpoint, GatewayRequest, GatewayResponse, SendError, SessionHandle, Transport,
    TransportError, TransportSession,
};
