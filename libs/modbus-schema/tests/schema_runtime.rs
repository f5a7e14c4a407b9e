//! Schema runtime integration tests
//!
//! Loads complete schemas through the public API and checks:
//! - decoding of the documented fixtures (text, bitsets, 64-bit integers)
//! - embedded scenario verification
//! - request batching bounds and freshness against a mocked device
//! - YAML export and reload through a file

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use modbus_schema::{
    loader, Address, AddressClass, FieldState, ManualTimeProvider, MockedModbusDevice,
    SchemaError, Value,
};
use std::sync::Arc;

const SCHEMA: &str = r#"
description: 'Integration device'
schemaFeatureLevel: 2
maxRegistersPerModbusRequest: 125
blocks:
  - id: Device
    fields:
      - id: Name
        expression: 'utf8(hr:0 # 12)'
      - id: Flags
        expression: "bitset(hr:20 # 2 ; 0->'Zero' ; 1->'One' ; 2->'Two')"
      - id: Signed
        expression: 'int64(hr:30 # 4)'
      - id: Unsigned
        expression: 'uint64(hr:30 # 4)'
  - id: Power
    fields:
      - id: Raw
        system: true
        expression: 'int32(ir:0 # 2)'
      - id: Scale
        system: true
        immutable: true
        expression: 'int16(ir:2)'
      - id: Watts
        unit: 'W'
        expression: 'Raw * 10^Scale'
tests:
  - id: Identity
    input:
      - firstRegisterAddress: 'hr:0'
        registers: |
          4e69 656c 7320 4261 736a 6573 0000 0000 0000 0000
          0000 0000
      - firstRegisterAddress: 'hr:20'
        registers: '0000 100F'
      - firstRegisterAddress: 'hr:30'
        registers: 'EEDD EF0B 8216 7EEB'
    blocks:
      - id: Device
        expected:
          Name: 'Niels Basjes'
          Flags: ['Zero', 'One', 'Two', 'Bit 3', 'Bit 12']
          Signed: '-1234567890123456789'
          Unsigned: '17212176183586094827'
  - id: Metering
    input:
      - firstRegisterAddress: 'ir:0'
        registers: '0000 04D2 FFFF'
    blocks:
      - id: Power
        expected:
          Raw: 1234
          Scale: -1
          Watts: 123.4
"#;

fn hr(physical: u16) -> Address {
    Address::new(AddressClass::HoldingRegister, physical)
}

fn ir(physical: u16) -> Address {
    Address::new(AddressClass::InputRegister, physical)
}

// ============================================================================
// Fixture decoding
// ============================================================================

#[tokio::test]
async fn test_embedded_fixtures_pass() {
    let device = loader::load_str(SCHEMA).await.unwrap();
    let report = device.verify_provided_tests().await;
    assert!(report.all_passed(), "{}", report);
    assert_eq!(report.results.len(), 2);
    assert_eq!(
        report.render(),
        "[PASS] Schema test \"Identity\"\n[PASS] Schema test \"Metering\""
    );
}

#[tokio::test]
async fn test_decodes_against_a_live_device() {
    let device = loader::load_str(SCHEMA).await.unwrap();
    let transport = MockedModbusDevice::new()
        .with_registers(
            hr(0),
            &[0x4e69, 0x656c, 0x7320, 0x4261, 0x736a, 0x6573, 0, 0, 0, 0, 0, 0],
        )
        .with_registers(hr(12), &[0; 18])
        .with_registers(hr(20), &[0x0000, 0x100F])
        .with_registers(hr(30), &[0xEEDD, 0xEF0B, 0x8216, 0x7EEB])
        .with_registers(ir(0), &[0x0000, 0x04D2, 0xFFFF]);

    let report = device.update_all(&transport, 0).await;
    assert!(report.is_success());

    let field = |block: &str, id: &str| device.field(block, id).unwrap();
    assert_eq!(
        field("Device", "Name").string_value().as_deref(),
        Some("Niels Basjes")
    );
    assert_eq!(
        field("Device", "Flags").string_list_value(),
        Some(vec![
            "Zero".to_string(),
            "One".to_string(),
            "Two".to_string(),
            "Bit 3".to_string(),
            "Bit 12".to_string(),
        ])
    );
    assert_eq!(
        field("Device", "Signed").long_value(),
        Some(-1234567890123456789)
    );
    assert_eq!(
        field("Device", "Unsigned").unsigned_long_value(),
        Some(17212176183586094827)
    );
    assert_eq!(field("Power", "Watts").double_value(), Some(123.4));

    // One request per address class
    assert_eq!(report.request_count(), 2);
    assert!(report
        .queries
        .iter()
        .any(|q| q.class == AddressClass::InputRegister && q.count == 3));
}

// ============================================================================
// Scenario verification
// ============================================================================

#[tokio::test]
async fn test_one_wrong_expectation_fails_one_scenario() {
    let broken = SCHEMA.replace("Watts: 123.4", "Watts: 123.5");
    let device = loader::parse_str(&broken).unwrap();
    let report = device.verify_provided_tests().await;
    assert!(!report.all_passed());
    assert_eq!(report.failed_tests(), vec!["Metering"]);
    assert!(report.results[0].passed());

    let text = report.render();
    assert!(text.contains("[PASS] Schema test \"Identity\""));
    assert!(text.contains("[FAIL] Schema test \"Metering\":"));
    assert!(text.contains("Watts"));
    assert!(text.contains("123.5"));

    match loader::load_str(&broken).await {
        Err(SchemaError::ScenarioFailed(rendered)) => assert_eq!(rendered, text),
        other => panic!("Expected a scenario failure, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_small_double_differences_are_tolerated() {
    let close = SCHEMA.replace("Watts: 123.4", "Watts: 123.4004");
    let device = loader::parse_str(&close).unwrap();
    assert!(device.verify_provided_tests().await.all_passed());
}

// ============================================================================
// Batching and freshness
// ============================================================================

#[tokio::test]
async fn test_requests_respect_the_register_bound() {
    let yaml = r#"
description: 'Small requests'
maxRegistersPerModbusRequest: 4
blocks:
  - id: Registers
    fields:
      - id: A
        expression: 'uint16(hr:0)'
      - id: B
        expression: 'uint16(hr:1)'
      - id: C
        expression: 'uint16(hr:2)'
      - id: D
        expression: 'uint32(hr:3 # 2)'
      - id: E
        expression: 'uint16(hr:5)'
      - id: F
        expression: 'uint16(hr:9)'
      - id: G
        expression: 'utf8(hr:10 # 3)'
"#;
    let device = loader::load_str(yaml).await.unwrap();
    let values: Vec<u16> = (0..16).collect();
    let transport = MockedModbusDevice::new().with_registers(hr(0), &values);

    let report = device.update_all(&transport, 0).await;
    assert!(report.is_success());
    assert!(transport.requests().iter().all(|r| r.count <= 4));
    assert!(report.queries.len() >= 3);

    // D spans hr:3 and hr:4, which always travel together
    assert!(transport
        .requests()
        .iter()
        .any(|r| r.start <= 3 && r.start + r.count >= 5));
    assert_eq!(
        device.field("Registers", "D").unwrap().long_value(),
        Some((3 << 16) + 4)
    );
    assert_eq!(device.field("Registers", "F").unwrap().long_value(), Some(9));
}

#[tokio::test]
async fn test_freshness_and_immutable_fields() {
    let time = Arc::new(ManualTimeProvider::new(5_000_000));
    let device = loader::load_str(SCHEMA)
        .await
        .unwrap()
        .with_time_provider(time.clone());
    let transport =
        MockedModbusDevice::new().with_registers(ir(0), &[0x0000, 0x04D2, 0xFFFF]);

    let watts = device.field("Power", "Watts").unwrap();
    assert_eq!(watts.state(1000), FieldState::Unneeded);
    watts.need();
    watts.need();
    assert_eq!(device.needed_fields().len(), 3);
    assert_eq!(watts.state(1000), FieldState::NeededStale);

    let report = device.update(&transport, 1000).await;
    assert_eq!(report.request_count(), 1);
    assert_eq!(watts.state(1000), FieldState::NeededFresh);
    assert_eq!(watts.timestamp(), Some(5_000_000));

    // Still fresh: zero requests
    let report = device.update(&transport, 1000).await;
    assert_eq!(report.request_count(), 0);

    // Stale again, but the immutable scale is not fetched a second time
    time.advance(2000);
    transport.clear_requests();
    device.update(&transport, 0).await;
    assert!(transport
        .requests()
        .iter()
        .all(|r| r.start + r.count <= 2));
    assert_eq!(
        device.field("Power", "Scale").unwrap().value(),
        Some(Value::Long(-1))
    );
    assert_eq!(watts.timestamp(), Some(5_002_000));
}

// ============================================================================
// Export
// ============================================================================

#[tokio::test]
async fn test_export_and_reload_through_a_file() {
    let device = loader::load_str(SCHEMA).await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exported.yaml");
    loader::save_file(&device, &path).await.unwrap();

    let reloaded = loader::load_file(&path).await.unwrap();
    assert_eq!(reloaded.description(), "Integration device");
    assert_eq!(reloaded.tests().len(), 2);
    assert_eq!(
        loader::to_yaml(&reloaded).unwrap(),
        loader::to_yaml(&device).unwrap()
    );
    assert_eq!(
        reloaded.tests()[0].to_definition().input[0].registers,
        "4E69 656C 7320 4261 736A 6573 0000 0000 0000 0000\n0000 0000"
    );
}
