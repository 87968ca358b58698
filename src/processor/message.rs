//! Small processor-body helpers for the common "emit what I was given,
//! maybe with a few fields added" and debug-logging shapes.

use crate::message::FrozenMessage;
use crate::response::ResponseHandler;
use crate::message::Message;

/// Emits `payload` to the configured next processor.
pub fn send(response: &ResponseHandler, payload: Message) {
    response.emit_message(payload, None, None);
}

/// Merges `fields` onto the accumulating output message rather than
/// replacing it outright.
pub fn extend(response: &ResponseHandler, fields: Message) {
    for (key, value) in fields.iter() {
        response.set(key.clone(), value.clone());
    }
}

/// Debug-processor helper: logs the arriving message at `debug` level.
pub fn log(message: &FrozenMessage) {
    tracing::debug!(?message, "processor invocation");
}
