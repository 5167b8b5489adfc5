// ABOUTME: Signer side of Signet: relay plumbing and the NIP-46 backend
// ABOUTME: One backend per online key, multiplexed over a shared relay pool

pub mod backend;
pub mod error;
pub mod method;
pub mod relay_pool;
pub mod subscriptions;
pub mod supervisor;

pub use backend::{BackendContext, Nip46Backend, ResponsePublisher};
pub use error::{SignerError, SignerResult};
pub use relay_pool::{RelayHealth, RelayPool};
pub use subscriptions::{SubscriptionManager, SubscriptionTransport};
pub use supervisor::BackendSupervisor;
