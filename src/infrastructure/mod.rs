//! Infrastructure layer - transports to downstream servers

pub mod transport;

pub use transport::{HttpInvoker, SimulatedInvoker, TransportConfig};
