//! Delivery gateway over the external push provider.
//!
//! The engine never talks to the provider directly. It goes through
//! [`DeliveryGateway`], which builds provider messages, chunks batches to the
//! provider limit, and resolves every provider error into an [`ErrorClass`]
//! exactly once.

pub mod error;
pub mod fcm;
pub mod gateway;
pub mod message;
pub mod provider;

pub use error::{ErrorClass, GatewayError, ProviderError, ProviderErrorCode};
pub use gateway::{BatchReport, DeliveryGateway, SendOutcome};
pub use message::{PushMessage, build_message};
pub use provider::PushProvider;
