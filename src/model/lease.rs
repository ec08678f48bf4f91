use super::now_millis;

/// 默认租约时长（秒），超过该时长未续约的实例会被剔除
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 90;

/// 时间受限的存活声明，由注册表独占持有。
/// 只有续约会更新lastUpdateTimestamp，过期后整条租约被移除。
#[derive(Debug, Clone)]
pub struct Lease<T> {
    holder: T,
    registration_timestamp: u64,
    last_update_timestamp: u64,
    duration_ms: u64,
}

impl<T> Lease<T> {
    pub fn new(holder: T, duration_secs: u64) -> Self {
        let now = now_millis();
        Self {
            holder,
            registration_timestamp: now,
            last_update_timestamp: now,
            duration_ms: duration_secs * 1000,
        }
    }

    pub fn holder(&self) -> &T {
        &self.holder
    }

    pub fn holder_mut(&mut self) -> &mut T {
        &mut self.holder
    }

    pub fn set_holder(&mut self, holder: T) {
        self.holder = holder;
    }

    pub fn registration_timestamp(&self) -> u64 {
        self.registration_timestamp
    }

    /// 注册时保留原有注册时间（重复注册视为续约语义）
    pub fn set_registration_timestamp(&mut self, timestamp: u64) {
        self.registration_timestamp = timestamp;
    }

    pub fn last_update_timestamp(&self) -> u64 {
        self.last_update_timestamp
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// 续约：更新最后续约时间
    pub fn renew(&mut self) {
        self.last_update_timestamp = now_millis();
    }

    /// 判断租约是否过期（可附加宽限时间）
    pub fn is_expired(&self, grace_ms: u64) -> bool {
        now_millis() > self.last_update_timestamp + self.duration_ms + grace_ms
    }
}
