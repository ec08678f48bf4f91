pub mod peer;
pub mod rate;
pub mod replication;
pub mod rule;
pub mod store;

pub use peer::{PeerNode, PeerNodes};
pub use rate::MeasuredRate;
pub use replication::{PeerAwareRegistry, ReplicationAction, SnapshotSource};
pub use rule::{
    DownOrStartingRule, FirstMatchWinsRule, LeaseExistsRule, OverrideExistsRule,
    StatusOverrideRule,
};
pub use store::RegistryStore;
