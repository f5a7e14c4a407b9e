//! In-memory Modbus device serving reads from register blocks
//!
//! Used by the scenario verifier and by tests that need a device which
//! rejects certain addresses or loses its link.

use crate::address::{Address, AddressClass, MODBUS_MAX_REGISTERS_PER_REQUEST};
use crate::error::CommunicationError;
use crate::register::{RegisterBlock, RegisterSource, RegisterStore};
use crate::transport::ModbusTransport;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

/// One read seen by the mock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockRequest {
    pub class: AddressClass,
    pub start: u16,
    pub count: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// The device answers with an illegal data address exception
    IllegalAddress,
    /// The request times out
    Timeout,
}

#[derive(Debug, Clone, Copy)]
struct FailureRange {
    class: AddressClass,
    start: u16,
    count: u16,
    mode: FailureMode,
}

impl FailureRange {
    fn overlaps(&self, class: AddressClass, start: u16, count: u16) -> bool {
        let a_start = u32::from(self.start);
        let a_end = a_start + u32::from(self.count);
        let (b_start, b_end) = (u32::from(start), u32::from(start) + u32::from(count));
        self.class == class && a_start < b_end && b_start < a_end
    }
}

#[derive(Debug, Default)]
pub struct MockedModbusDevice {
    registers: RegisterStore,
    failures: Vec<FailureRange>,
    max_concurrent_requests: usize,
    requests: Mutex<Vec<MockRequest>>,
}

impl MockedModbusDevice {
    pub fn new() -> Self {
        Self {
            max_concurrent_requests: 1,
            ..Default::default()
        }
    }

    /// Serve the registers of `block`
    pub fn with_block(mut self, block: &RegisterBlock) -> Self {
        self.registers.load(block);
        self
    }

    pub fn with_registers(mut self, first: Address, values: &[u16]) -> Self {
        for (offset, value) in values.iter().enumerate() {
            if let Some(address) = u16::try_from(offset)
                .ok()
                .and_then(|offset| first.increment(offset))
            {
                self.registers
                    .block_mut(first.class)
                    .set_value(address.physical, *value, 0);
            }
        }
        self
    }

    /// Fail every read touching `start .. start + count`
    pub fn with_failure(
        mut self,
        class: AddressClass,
        start: u16,
        count: u16,
        mode: FailureMode,
    ) -> Self {
        self.failures.push(FailureRange {
            class,
            start,
            count,
            mode,
        });
        self
    }

    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max.max(1);
        self
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }
}

#[async_trait]
impl ModbusTransport for MockedModbusDevice {
    async fn read(
        &self,
        class: AddressClass,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, CommunicationError> {
        self.requests.lock().push(MockRequest { class, start, count });
        trace!("Mock read {} # {}", Address::new(class, start), count);

        if count == 0 || usize::from(count) > MODBUS_MAX_REGISTERS_PER_REQUEST {
            return Err(CommunicationError::Exception {
                code: 3,
                message: format!("Illegal data value: {} registers", count),
            });
        }
        if let Some(failure) = self
            .failures
            .iter()
            .find(|f| f.overlaps(class, start, count))
        {
            return Err(match failure.mode {
                FailureMode::IllegalAddress => CommunicationError::illegal_address(format!(
                    "{} # {}",
                    Address::new(class, start),
                    count
                )),
                FailureMode::Timeout => CommunicationError::Timeout(1000),
            });
        }

        (0..count)
            .map(|offset| {
                let address = Address::new(class, start)
                    .increment(offset)
                    .ok_or_else(|| CommunicationError::illegal_address("Beyond the last address"))?;
                self.registers
                    .register(address)
                    .and_then(|r| if r.is_read_error() { None } else { r.value })
                    .ok_or_else(|| CommunicationError::illegal_address(address.to_string()))
            })
            .collect()
    }

    fn max_concurrent_requests(&self) -> usize {
        self.max_concurrent_requests
    }
}
