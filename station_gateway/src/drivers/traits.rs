use crate::error::GatewayResult;
use crate::tags::structures::{Tag, ValueVariant};
use async_trait::async_trait;
use std::collections::HashMap;

// Type alias for results from driver operations
pub type DriverResult<T> = GatewayResult<T>;

/// Per-tag read results keyed by tag name. `None` marks a tag whose read or
/// decode failed; the channel records it as Bad quality.
pub type ReadResults = HashMap<String, Option<ValueVariant>>;

/// Trait implemented by all protocol drivers.
///
/// A driver instance is owned by exactly one channel, which serializes all
/// calls against it; implementations still use interior mutability because
/// the trait is shared behind an `Arc`.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Short protocol name used in logs.
    fn kind(&self) -> &'static str;

    /// Connect to the underlying device. Idempotent when already connected.
    async fn connect(&self) -> DriverResult<()>;

    /// Disconnect from the underlying device.
    async fn disconnect(&self) -> DriverResult<()>;

    /// Whether a session is currently established.
    async fn is_connected(&self) -> bool;

    /// Read a batch of tags.
    ///
    /// A single bad tag never fails the call; it is reported as `None`.
    /// An `Err` means the session itself is unusable.
    async fn read_many(&self, tags: &[Tag]) -> DriverResult<ReadResults>;

    /// Write one tag, converting `value` to the tag's declared type.
    async fn write_one(&self, tag: &Tag, value: &ValueVariant) -> DriverResult<()>;
}
