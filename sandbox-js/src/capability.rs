use rquickjs::{Ctx, Runtime};

/// Trait for sandbox capabilities.
///
/// A capability is a restricted replacement for an ambient API that a script
/// expects to find (console, process, timers, ...). Capabilities are built in
/// Rust, installed into a fresh context before any user code runs, and frozen
/// once installed.
///
/// # Example
///
/// ```rust
/// use sandbox_js::Capability;
/// use rquickjs::{Ctx, Object};
///
/// struct Answer;
///
/// impl Capability for Answer {
///     fn id(&self) -> &'static str {
///         "answer"
///     }
///
///     fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
///         let answer = Object::new(ctx.clone())?;
///         answer.set("value", 42)?;
///         ctx.globals().set(self.id(), answer)
///     }
///
///     fn declarations(&self) -> String {
///         "declare const answer: { readonly value: number };\n".to_string()
///     }
/// }
/// ```
pub trait Capability {
    /// Returns the unique identifier for this capability.
    ///
    /// Usually the name of the global it installs.
    fn id(&self) -> &'static str;

    /// Hooks this capability into the runtime.
    ///
    /// Called once per sandbox, before `install`. Runtime-level handlers
    /// (rejection tracking, module loading) belong here.
    fn attach(&self, _runtime: &Runtime) -> rquickjs::Result<()> {
        Ok(())
    }

    /// Installs this capability's globals into the context.
    ///
    /// # Errors
    /// Returns the engine error if any global could not be defined. The
    /// sandbox skips a capability that fails to install.
    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()>;

    /// TypeScript declarations describing what this capability installs
    fn declarations(&self) -> String;

    fn metadata(&self) -> CapabilityMetadata {
        CapabilityMetadata {
            id: self.id(),
            version: "0.1.0",
            description: "",
        }
    }
}

/// Metadata about a capability
#[derive(Debug, Clone)]
pub struct CapabilityMetadata {
    pub id: &'static str,
    /// Capability version (semver)
    pub version: &'static str,
    pub description: &'static str,
}

/// Ordered set of capabilities installed into every sandbox
///
/// Installation order is registration order.
pub struct CapabilityRegistry {
    capabilities: Vec<Box<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: Vec::new(),
        }
    }

    /// Registers a capability
    ///
    /// # Panics
    /// Panics if a capability with the same ID is already registered
    pub fn register<C: Capability + 'static>(&mut self, capability: C) {
        let id = capability.id();
        if self.capabilities.iter().any(|c| c.id() == id) {
            panic!("Capability with id '{}' is already registered", id);
        }
        self.capabilities.push(Box::new(capability));
    }

    /// Gets a capability by its ID
    pub fn get(&self, id: &str) -> Option<&dyn Capability> {
        self.capabilities
            .iter()
            .find(|c| c.id() == id)
            .map(|c| c.as_ref())
    }

    pub fn capabilities(&self) -> &[Box<dyn Capability>] {
        &self.capabilities
    }

    /// Generates one declaration file for every registered capability
    pub fn generate_declarations(&self) -> String {
        let mut declarations = String::new();
        for capability in &self.capabilities {
            let metadata = capability.metadata();
            if !metadata.description.is_empty() {
                declarations.push_str(&format!("// {}: {}\n", metadata.id, metadata.description));
            }
            declarations.push_str(&capability.declarations());
            declarations.push('\n');
        }
        declarations
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
