//! Sandbox errors and thrown-value serialization

use rquickjs::{Coerced, Ctx, Exception, Object, Value};
use sandbox_core::domain::error::SerializedError;
use thiserror::Error;

use crate::util;

/// Name given to errors thrown when a script reaches for a denied API
pub const PERMISSION_DENIED: &str = "PermissionDenied";

/// Message used when even `String(value)` fails
pub const UNSERIALIZABLE: &str = "[unserializable value]";

/// Sandbox errors
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create runtime: {0}")]
    Runtime(#[source] rquickjs::Error),

    #[error("failed to create context: {0}")]
    Context(#[source] rquickjs::Error),

    #[error("capability '{id}' failed to install: {message}")]
    Install { id: &'static str, message: String },

    #[error("engine error: {0}")]
    Engine(#[from] rquickjs::Error),

    #[error("value is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where a thrown value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOrigin {
    /// Thrown synchronously and never caught
    Uncaught,
    /// A rejected promise nobody handled
    UnhandledRejection,
}

impl ErrorOrigin {
    pub fn prefix(&self) -> &'static str {
        match self {
            ErrorOrigin::Uncaught => "Uncaught",
            ErrorOrigin::UnhandledRejection => "Unhandled rejection",
        }
    }
}

/// Flattens a thrown value into a [`SerializedError`]
///
/// Never fails: getters that throw fall back to defaults, and values that
/// cannot even be converted to a string become [`UNSERIALIZABLE`].
pub fn serialize_error<'js>(
    ctx: &Ctx<'js>,
    value: &Value<'js>,
    origin: ErrorOrigin,
) -> SerializedError {
    if let Some(object) = value.as_object().filter(|_| value.is_error()) {
        let name = read_string(ctx, object, "name").unwrap_or_else(|| "Error".to_string());
        let message = read_string(ctx, object, "message").unwrap_or_default();
        let frames = read_string(ctx, object, "stack").unwrap_or_default();

        let mut stack = format!("{} {}: {}", origin.prefix(), name, message);
        let frames = frames.trim_end();
        if !frames.is_empty() {
            stack.push('\n');
            stack.push_str(frames);
        }
        return SerializedError::new(name, message).with_stack(stack);
    }

    let message = util::to_js_string(ctx, value).unwrap_or_else(|| UNSERIALIZABLE.to_string());
    match origin {
        ErrorOrigin::Uncaught => SerializedError::from_message(message),
        ErrorOrigin::UnhandledRejection => {
            let stack = format!("{} {}", origin.prefix(), message);
            SerializedError::from_message(message).with_stack(stack)
        }
    }
}

/// Takes the pending exception off the context and serializes it
pub fn take_exception(ctx: &Ctx<'_>, origin: ErrorOrigin) -> SerializedError {
    let thrown = ctx.catch();
    serialize_error(ctx, &thrown, origin)
}

/// Describes an engine error, consuming the pending exception if there is one
pub fn describe(ctx: &Ctx<'_>, error: rquickjs::Error) -> String {
    match error {
        rquickjs::Error::Exception => take_exception(ctx, ErrorOrigin::Uncaught).to_string(),
        other => other.to_string(),
    }
}

/// Throws a `PermissionDenied` error into the context
///
/// Returns the error to propagate from the native function.
pub fn permission_denied(ctx: &Ctx<'_>, message: &str) -> rquickjs::Error {
    let exception = match Exception::from_message(ctx.clone(), message) {
        Ok(exception) => exception,
        Err(err) => return err,
    };
    if let Err(err) = exception.set("name", PERMISSION_DENIED) {
        return err;
    }
    ctx.throw(exception.into_value())
}

fn read_string<'js>(ctx: &Ctx<'js>, object: &Object<'js>, key: &str) -> Option<String> {
    match object.get::<_, Option<Coerced<String>>>(key) {
        Ok(value) => value.map(|v| v.0),
        Err(_) => {
            ctx.catch();
            None
        }
    }
}
