/// Names and fixed values shared across the bridge
/// These define the wire-level contract with the device firmware and the telemetry backend

// Terminal sequences the device firmware emits around highlighted output
pub const ANSI_HIGHLIGHT: &str = "\x1b[1;32m";
pub const ANSI_RESET: &str = "\x1b[0m";

// Markers the presentation layer renders as a highlighted run
pub const SPAN_START: &str = "<span style=\"color:green; font-weight:bold\">";
pub const SPAN_END: &str = "</span>";

/// Value the firmware prints in place of a sensor reading it could not take
pub const UNAVAILABLE_SENTINEL: &str = "N/A";

// Device record keys
pub const KEY_EVENT: &str = "event";
pub const KEY_ULTRASONIC: &str = "ultra_meas";
pub const KEY_MAGNETOMETER: &str = "mag_meas";
pub const KEY_USER: &str = "user";
pub const KEY_PREV_HASH: &str = "prev_hash";
pub const KEY_CURR_HASH: &str = "curr_hash";
pub const KEY_TIMESTAMP: &str = "timestamp";

// Canonical field names shown on the dashboard
pub const FIELD_EVENT_TYPE: &str = "Event_Type";
pub const FIELD_ULTRASONIC: &str = "Ultrasonic";
pub const FIELD_MAGNETOMETER: &str = "Magnetometer";
pub const FIELD_USER: &str = "User";
pub const FIELD_EVENT_ID: &str = "eventId";
pub const FIELD_IMAGE: &str = "image";

pub const UNIT_METERS: &str = "m";

// Backend endpoints
pub const DEFAULT_DATA_ENDPOINT: &str = "https://api.us-e1.tago.io/data";
pub const DEFAULT_FILES_ENDPOINT: &str = "https://api.tago.io/files";
pub const DEFAULT_FILE_BASE_URL: &str = "https://api.tago.io/file/6808dca1d2bacd000a4f1731/";

/// Header carrying the credential on every backend request
pub const AUTH_HEADER: &str = "device-token";

// Environment variables holding the two backend credentials
pub const DEVICE_TOKEN_ENV: &str = "DEVICE_TOKEN";
pub const ACCOUNT_TOKEN_ENV: &str = "ACCOUNT_TOKEN";

pub const METRICS_ADDR_ENV: &str = "SENSOR_BRIDGE_METRICS_ADDR";

// Default source locations
pub const DEFAULT_DEVICE_PATH: &str = "/dev/ttyACM0";
pub const DEFAULT_LOG_PATH: &str = "RTT.log";

/// Directory under which uploaded images are stored on the backend
pub const ASSET_DIR: &str = "img";

/// Content type used for an asset whose extension is not recognised
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Map a file extension to the content type sent with an asset upload
pub fn content_type_for_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => FALLBACK_CONTENT_TYPE,
    }
}
