//! modbus-schema - Schema runtime for Modbus devices
//!
//! Turns a declarative device schema (blocks of named fields, each defined by a
//! small expression over Modbus registers) into a runtime that fetches only the
//! registers needed, in as few requests as possible, and decodes typed values.
//!
//! # Features
//!
//! - **Expressions**: `int32(hr:0#2) * 10^int16(hr:2)`, `utf8(hr:10 .. hr:15)`,
//!   enums, bitsets, strings, network addresses and "not implemented" patterns
//! - **Dependency-aware fetching**: needing a field needs everything it refers to
//! - **Freshness**: values younger than `max_age` are served from the cache,
//!   immutable fields are read once
//! - **Request batching**: adjacent registers share a request, bounded by the
//!   device's register limit and an allowed gap
//! - **Embedded tests**: register dumps with expected values, verified at load
//!
//! # Example
//!
//! ```rust
//! use modbus_schema::{loader, Address, AddressClass, MockedModbusDevice};
//!
//! # let rt = tokio::runtime::Builder::new_current_thread()
//! #     .enable_all()
//! #     .build()
//! #     .unwrap();
//! # rt.block_on(async {
//! let device = loader::load_str(r#"
//! description: 'Meter'
//! blocks:
//!   - id: Main
//!     fields:
//!       - id: Voltage
//!         unit: 'V'
//!         expression: 'uint16(hr:0) / 10'
//! "#).await.unwrap();
//!
//! let transport = MockedModbusDevice::new()
//!     .with_registers(Address::new(AddressClass::HoldingRegister, 0), &[2305]);
//!
//! let voltage = device.field("Main", "Voltage").unwrap();
//! voltage.need();
//! device.update(&transport, 1000).await;
//! assert_eq!(voltage.double_value(), Some(230.5));
//! # });
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `address` | Address classes and the address notations |
//! | `register` | Register values, blocks and the text dump format |
//! | `lexer`, `parser`, `expression` | Expression language and its typed tree |
//! | `evaluator`, `codec` | Decoding registers into values |
//! | `device` | Building a device from a schema, needs and value access |
//! | `scheduler`, `batcher`, `fetcher` | The update cycle |
//! | `transport`, `mock` | The register reader boundary and an in-memory device |
//! | `scenario`, `loader` | Embedded tests and YAML load/export |

pub mod address;
pub mod batcher;
pub mod codec;
pub mod definition;
pub mod device;
pub mod error;
pub mod evaluator;
pub mod expression;
pub mod fetcher;
pub mod field;
pub mod lexer;
pub mod loader;
pub mod mock;
pub mod parser;
pub mod register;
pub mod scenario;
pub mod scheduler;
pub mod time;
pub mod transport;
pub mod value;

// Re-exports for convenience
pub use address::{Address, AddressClass, MODBUS_MAX_REGISTERS_PER_REQUEST};
pub use batcher::{ModbusQuery, QueryStatus, RequestBatcher, DEFAULT_ALLOWED_GAP};
pub use definition::{SchemaDefinition, CURRENT_SCHEMA_FEATURE_LEVEL};
pub use device::{BlockRef, Device, FieldRef};
pub use error::{
    CommunicationError, CompileError, DecodeError, ProblemReport, Result, ScenarioMismatch,
    SchemaError,
};
pub use expression::Expression;
pub use fetcher::{FieldError, FieldFailure, UpdateReport};
pub use field::FieldState;
pub use mock::{FailureMode, MockedModbusDevice};
pub use register::{ReadErrorKind, RegisterBlock, RegisterStore, RegisterValue};
pub use scenario::{ScenarioReport, ScenarioResult, TestScenario};
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};
pub use transport::ModbusTransport;
pub use value::{ReturnType, Value};
