pub mod application;
pub mod applications;
pub mod instance;
pub mod lease;

pub use application::Application;
pub use applications::{Applications, VERSION_NOT_FETCHED};
pub use instance::{ActionType, InstanceRecord, InstanceStatus, LocalInstance};
pub use lease::{DEFAULT_LEASE_DURATION_SECS, Lease};

use std::time::{SystemTime, UNIX_EPOCH};

/// 当前Unix时间（毫秒）
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
