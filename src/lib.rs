// Library exports for embedding the engine and for testing
pub mod backend;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invoice;
pub mod observability;
pub mod types;

pub use crate::backend::memory::InMemoryFederation;
pub use crate::backend::FederationBackend;
pub use crate::config::EngineConfig;
pub use crate::core::operations::{
    OutgoingPayment, PayType, PaymentState, ReceiveKind, ReceiveOperation, ReceiveState,
};
pub use crate::core::LightningEngine;
pub use crate::error::{EngineError, EngineResult, ErrorCategory};
pub use crate::invoice::CreateBolt11Response;
pub use crate::types::{ExtraMeta, MSats, OperationId};
