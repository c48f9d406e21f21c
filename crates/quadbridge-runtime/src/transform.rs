//! Telemetry Transform – raw state sample to [`WireRecord`].
//!
//! Pure and total: every [`TelemetryKind`] has a transform, nothing here
//! does I/O, and nothing here fails.  A sample missing the expected shape
//! degrades to zero-filled fields so a long-running stream never aborts on
//! one bad message.
//!
//! | Kind | Reads | Emits |
//! |---|---|---|
//! | `raw` | whole sample | the sample unchanged |
//! | `foot_force` | `foot_force[0..4]` | `front_left`, `front_right`, `rear_left`, `rear_right` |
//! | `bms_state` | `bms_state` | the sub-mapping unchanged (`{}` when absent) |
//! | `orientation` | `imu_state.rpy[0..3]` | `roll`, `pitch`, `yaw` |

use quadbridge_types::{Message, TelemetryKind, WireRecord};
use serde_json::{Map, Value};

pub const FOOT_FORCE_FIELDS: [&str; 4] = ["front_left", "front_right", "rear_left", "rear_right"];
pub const ORIENTATION_FIELDS: [&str; 3] = ["roll", "pitch", "yaw"];

/// Reshape `raw` according to `kind`.
pub fn transform(kind: TelemetryKind, raw: &Message) -> WireRecord {
    let value = match kind {
        TelemetryKind::Raw => raw.clone(),
        TelemetryKind::FootForce => name_elements(raw.get("foot_force"), &FOOT_FORCE_FIELDS),
        TelemetryKind::BmsState => raw
            .get("bms_state")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())),
        TelemetryKind::Orientation => name_elements(
            raw.get("imu_state").and_then(|imu| imu.get("rpy")),
            &ORIENTATION_FIELDS,
        ),
    };
    WireRecord::new(value)
}

/// `true` when `raw` carries the shape `kind` reads, so the caller can
/// report a degraded sample.  Never required for correctness.
pub fn has_expected_shape(kind: TelemetryKind, raw: &Message) -> bool {
    match kind {
        TelemetryKind::Raw => true,
        TelemetryKind::FootForce => raw.get("foot_force").is_some_and(Value::is_array),
        TelemetryKind::BmsState => raw.get("bms_state").is_some(),
        TelemetryKind::Orientation => raw
            .get("imu_state")
            .and_then(|imu| imu.get("rpy"))
            .is_some_and(Value::is_array),
    }
}

/// Map the leading elements of `sequence` onto `fields`, zero-filling short
/// or missing input.
fn name_elements(sequence: Option<&Value>, fields: &[&str]) -> Value {
    let elements = sequence.and_then(Value::as_array);
    let record: Map<String, Value> = fields
        .iter()
        .enumerate()
        .map(|(index, field)| {
            let element = elements
                .and_then(|items| items.get(index))
                .cloned()
                .unwrap_or_else(|| Value::from(0));
            (field.to_string(), element)
        })
        .collect();
    Value::Object(record)
}
