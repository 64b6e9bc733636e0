//! Console capability
//!
//! Replaces `console` with an object whose methods format their arguments
//! and post them on the message channel. Nothing a script logs reaches the
//! worker's own stdout or stderr.

use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Value};
use sandbox_core::domain::message::MessageType;
use serde_json::Value as JsonValue;

use crate::capability::{Capability, CapabilityMetadata};
use crate::channel::Channel;
use crate::util;

pub struct ConsoleCapability {
    channel: Channel,
}

impl ConsoleCapability {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

const METHODS: [(&str, MessageType); 5] = [
    ("log", MessageType::Log),
    ("info", MessageType::Info),
    ("warn", MessageType::Warn),
    ("error", MessageType::Error),
    ("debug", MessageType::Debug),
];

impl Capability for ConsoleCapability {
    fn id(&self) -> &'static str {
        "console"
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let prototype = Object::new(ctx.clone())?;

        for (name, message_type) in METHODS {
            let channel = self.channel.clone();
            let method = Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<Value<'js>>| {
                let line = util::format_args(&ctx, &args.0);
                channel.post(message_type, JsonValue::String(line));
            })?;
            method.set_name(name)?;
            prototype.set(name, method)?;
        }
        prototype.set("clear", Function::new(ctx.clone(), || {})?)?;

        let console = Object::new(ctx.clone())?;
        console.set_prototype(Some(&prototype))?;

        util::freeze(ctx, &prototype)?;
        util::freeze(ctx, &console)?;
        util::define_locked(&ctx.globals(), self.id(), console)
    }

    fn declarations(&self) -> String {
        r#"/**
 * Console output is posted to the host as messages.
 * Arguments are formatted like util.format: %s %d %i %f %j %o %O %c %%.
 */
declare const console: {
  log(...args: unknown[]): void;
  info(...args: unknown[]): void;
  warn(...args: unknown[]): void;
  error(...args: unknown[]): void;
  debug(...args: unknown[]): void;
  /** Does nothing */
  clear(): void;
};
"#
        .to_string()
    }

    fn metadata(&self) -> CapabilityMetadata {
        CapabilityMetadata {
            id: self.id(),
            version: "1.0.0",
            description: "Console output posted as messages",
        }
    }
}
