//! Transport Layer
//!
//! The broker moves bytes between publishers and subscribers:
//! - [`Broker`]: the collaborator interface the core is written against
//! - [`InProcessBroker`]: tokio-channel broker for single-process use
//! - [`TokenSigner`]: HMAC-signed, expiring subscription tokens
//!
//! # Guarantees relied on by the core
//!
//! - Messages on one channel are delivered in publish order
//! - Every message gets a per-channel sequence number at publish time
//! - A token never grants more than its channel and topic set

pub mod in_process;
pub mod signing;
pub mod traits;

pub use in_process::{InProcessBroker, InProcessBrokerConfig};
pub use signing::{TokenClaims, TokenSigner};
pub use traits::{Broker, BrokerSubscription, Delivery, TransportError};
