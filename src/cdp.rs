use serde_json::Value;

/// First message ID in the range reserved for proxy-originated commands.
///
/// Client-originated command IDs are small integers chosen by the client;
/// allocating plugin command IDs from a disjoint high range lets the relay
/// recognize responses that belong to the plugin runtime without rewriting
/// any client IDs.
pub const PLUGIN_MESSAGE_ID_BASE: u64 = 1_000_000_000;

/// The shape of a CDP frame, discriminated by which fields are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `id` and `method` both present: a command sent to the browser.
    Request,
    /// `id` present without `method`: a reply to a previous command.
    Response,
    /// `method` present without `id`: an unsolicited notification.
    Event,
}

/// Classify a parsed CDP frame by its shape.
///
/// Returns `None` when neither `id` nor `method` is present; such frames
/// are not CDP traffic the proxy understands and are passed through
/// untouched.
#[must_use]
pub fn classify(message: &Value) -> Option<FrameKind> {
    let has_id = message.get("id").is_some_and(Value::is_u64);
    let has_method = message.get("method").is_some_and(Value::is_string);
    match (has_id, has_method) {
        (true, true) => Some(FrameKind::Request),
        (true, false) => Some(FrameKind::Response),
        (false, true) => Some(FrameKind::Event),
        (false, false) => None,
    }
}

/// The numeric `id` of a frame, if present.
#[must_use]
pub fn message_id(message: &Value) -> Option<u64> {
    message.get("id").and_then(Value::as_u64)
}

/// The `method` of a request or event frame, if present.
#[must_use]
pub fn method(message: &Value) -> Option<&str> {
    message.get("method").and_then(Value::as_str)
}

/// Whether a response frame carries a protocol-level `error` member.
#[must_use]
pub fn is_error_response(message: &Value) -> bool {
    message.get("error").is_some_and(Value::is_object)
}
