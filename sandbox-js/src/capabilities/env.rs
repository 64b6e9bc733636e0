//! Read-only environment access for scripts
//!
//! Exposes the job's environment snapshot as the frozen `env` global. The
//! mutating methods exist so that scripts written against a writable
//! environment keep running, but they do nothing.

use rquickjs::function::Opt;
use rquickjs::{Coerced, Ctx, Function, Object, Value};
use sandbox_core::domain::env::EnvSnapshot;

use crate::capability::{Capability, CapabilityMetadata};
use crate::util;

pub struct EnvCapability {
    snapshot: EnvSnapshot,
}

impl EnvCapability {
    pub fn new(snapshot: EnvSnapshot) -> Self {
        Self { snapshot }
    }
}

/// Builds a plain object holding a copy of the snapshot
pub(crate) fn snapshot_object<'js>(
    ctx: &Ctx<'js>,
    snapshot: &EnvSnapshot,
) -> rquickjs::Result<Object<'js>> {
    let object = Object::new(ctx.clone())?;
    for (key, value) in snapshot.iter() {
        object.set(key, value)?;
    }
    Ok(object)
}

impl Capability for EnvCapability {
    fn id(&self) -> &'static str {
        "env"
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let env = Object::new(ctx.clone())?;

        {
            let snapshot = self.snapshot.clone();
            env.set(
                "get",
                Function::new(ctx.clone(), move |key: Opt<Coerced<String>>| {
                    key.0
                        .and_then(|Coerced(key)| snapshot.get(&key).map(str::to_string))
                })?,
            )?;
        }

        {
            let snapshot = self.snapshot.clone();
            env.set(
                "has",
                Function::new(ctx.clone(), move |key: Opt<Coerced<String>>| {
                    key.0.is_some_and(|Coerced(key)| snapshot.contains(&key))
                })?,
            )?;
        }

        {
            let snapshot = self.snapshot.clone();
            env.set(
                "toObject",
                Function::new(ctx.clone(), move |ctx: Ctx<'js>| {
                    snapshot_object(&ctx, &snapshot)
                })?,
            )?;
        }

        env.set("set", Function::new(ctx.clone(), |_key: Opt<Value<'js>>, _value: Opt<Value<'js>>| {})?)?;
        env.set("delete", Function::new(ctx.clone(), |_key: Opt<Value<'js>>| {})?)?;

        util::freeze(ctx, &env)?;
        util::define_locked(&ctx.globals(), self.id(), env)
    }

    fn declarations(&self) -> String {
        r#"/** Read-only view of the job's environment variables */
declare const env: {
  /** Returns the value of a variable, or undefined when it is not set */
  get(key: string): string | undefined;
  has(key: string): boolean;
  /** Returns a copy of every variable */
  toObject(): Record<string, string>;
  /** Accepted for compatibility; the environment never changes */
  set(key: string, value: string): void;
  /** Accepted for compatibility; the environment never changes */
  delete(key: string): void;
};
"#
        .to_string()
    }

    fn metadata(&self) -> CapabilityMetadata {
        CapabilityMetadata {
            id: self.id(),
            version: "1.0.0",
            description: "Read-only environment snapshot",
        }
    }
}
