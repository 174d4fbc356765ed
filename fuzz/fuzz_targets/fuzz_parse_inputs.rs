#![no_main]
use gridshare::inputs::{ConnectorStatus, parse_timestamp};
use gridshare::model::UserMode;
use gridshare::registry::DatapointValue;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);

    // Registry values arrive as loosely-typed JSON scalars
    if let Ok(value) = serde_json::from_slice::<DatapointValue>(data) {
        let _ = value.as_f64();
        let _ = value.as_bool();
        let _ = ConnectorStatus::parse(&value);
        let _ = parse_timestamp(&value);
    }

    let as_text = DatapointValue::Text(text.to_string());
    let _ = ConnectorStatus::parse(&as_text);
    let _ = parse_timestamp(&as_text);
    let _ = UserMode::parse(&text);

    if data.len() >= 8 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[..8]);
        let n = DatapointValue::Number(f64::from_le_bytes(raw));
        let _ = parse_timestamp(&n);
        let _ = ConnectorStatus::parse(&n);
    }
});
