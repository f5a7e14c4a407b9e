//! Boundary to whatever performs the actual Modbus reads

use crate::address::AddressClass;
use crate::error::CommunicationError;
use async_trait::async_trait;
use std::sync::Arc;

/// Register reader supplied by the application
///
/// Implementations own their timeout and reconnect policy; the update cycle
/// never retries a failed read.
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    /// Read `count` consecutive registers starting at physical address `start`
    async fn read(
        &self,
        class: AddressClass,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, CommunicationError>;

    /// How many reads may be in flight at the same time
    fn max_concurrent_requests(&self) -> usize {
        1
    }
}

#[async_trait]
impl<T: ModbusTransport + ?Sized> ModbusTransport for Arc<T> {
    async fn read(
        &self,
        class: AddressClass,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, CommunicationError> {
        (**self).read(class, start, count).await
    }

    fn max_concurrent_requests(&self) -> usize {
        (**self).max_concurrent_requests()
    }
}
