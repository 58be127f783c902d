use serde_json::Value;

/// Outcome of validating one CDP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Ok,
    /// The frame looks wrong but is forwarded anyway; the string explains
    /// what tripped.
    Warn(String),
}

/// Seam for CDP JSON-schema validation.
///
/// The proxy core does not validate against the protocol schema itself;
/// an external validator can be plugged in here. Warnings are logged and
/// counted but never block a frame.
pub trait MessageValidator: Send + Sync {
    fn validate(&self, message: &Value) -> Validation;
}

/// Default validator that accepts everything.
pub struct PermissiveValidator;

impl MessageValidator for PermissiveValidator {
    fn validate(&self, _message: &Value) -> Validation {
        Validation::Ok
    }
}
