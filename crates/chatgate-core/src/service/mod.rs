pub mod usage;
pub mod vault;

pub use usage::{InMemoryUsageTracker, NoopUsageSink, UsageEvent, UsageRecord, UsageSink, UsageSummary};
pub use vault::{CredentialDecryptor, PlaintextDecryptor, VaultDecryptor};
