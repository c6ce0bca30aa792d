use serde::Serialize;

use crate::util::env_flag;

const DEBUG_PAYLOAD_ENV: &str = "ADCHAT_DEBUG_PAYLOAD";

pub fn debug_payload_enabled() -> bool {
    env_flag(DEBUG_PAYLOAD_ENV).unwrap_or(false)
}

pub fn emit_debug_payload<T: Serialize + ?Sized>(method: &str, request_url: &str, payload: &T) {
    if !debug_payload_enabled() {
        return;
    }
    let formatted_payload = serde_json::to_string_pretty(payload)
        .unwrap_or_else(|_| "<payload serialization error>".to_string());
    tracing::debug!(
        target: "adchat::api::payload",
        method,
        url = request_url,
        "request payload:\n{formatted_payload}"
    );
}

pub fn emit_record_parse_error(payload: &str, parse_error: &serde_json::Error) {
    tracing::warn!(
        error = %parse_error,
        data = payload,
        "skipping malformed stream record"
    );
}
