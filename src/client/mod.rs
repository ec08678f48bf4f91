pub mod backup;
pub mod engine;
pub mod error;
pub mod health;
pub mod replicator;
pub mod transport;

pub use backup::BackupRegistry;
pub use engine::RegistryClient;
pub use error::ClientError;
pub use health::{HealthCheckHandler, NoopHealthCheckHandler};
pub use replicator::{InstanceInfoReplicator, RateLimiter};
pub use transport::{RegistryTransport, StatusCode, TransportError};
