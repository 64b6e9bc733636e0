//! Helpers shared by the capabilities: locking down objects and turning
//! script values into text or JSON.

use rquickjs::object::Property;
use rquickjs::{Coerced, Ctx, FromJs, Function, IntoJs, Object, Type, Value};
use serde_json::Value as JsonValue;

use crate::errors::SandboxError;

/// Calls `Object.freeze` on the value
pub fn freeze<'js>(ctx: &Ctx<'js>, object: &Object<'js>) -> rquickjs::Result<()> {
    let constructor: Object = ctx.globals().get("Object")?;
    let freeze: Function = constructor.get("freeze")?;
    freeze.call::<_, Value>((object.clone(),))?;
    Ok(())
}

/// Defines an enumerable property that can be neither reassigned nor deleted
pub fn define_locked<'js, V>(target: &Object<'js>, name: &str, value: V) -> rquickjs::Result<()>
where
    V: IntoJs<'js>,
{
    target.prop(name, Property::from(value).enumerable())
}

/// `String(value)`, or None if the conversion throws
pub fn to_js_string<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Option<String> {
    if let Some(string) = value.as_string() {
        return string.to_string().ok();
    }
    if let Some(symbol) = value.as_symbol() {
        let description = symbol
            .description()
            .ok()
            .and_then(|d| d.as_string().and_then(|s| s.to_string().ok()))
            .unwrap_or_default();
        return Some(format!("Symbol({})", description));
    }
    match Coerced::<String>::from_js(ctx, value.clone()) {
        Ok(Coerced(string)) => Some(string),
        Err(_) => {
            ctx.catch();
            None
        }
    }
}

/// Renders a value the way the console prints it
///
/// Strings are verbatim, errors print their stack, functions print as
/// `[Function: name]`, and objects print as JSON.
pub fn display<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    match value.type_of() {
        Type::String => to_js_string(ctx, value).unwrap_or_default(),
        Type::Uninitialized | Type::Undefined => "undefined".to_string(),
        Type::Null => "null".to_string(),
        Type::BigInt => format!("{}n", to_js_string(ctx, value).unwrap_or_default()),
        Type::Function | Type::Constructor => function_label(ctx, value),
        Type::Exception => error_text(ctx, value),
        Type::Array | Type::Object | Type::Promise => match stringify(ctx, value) {
            Some(json) => json,
            None => to_js_string(ctx, value).unwrap_or_else(|| "[object]".to_string()),
        },
        _ => to_js_string(ctx, value).unwrap_or_default(),
    }
}

/// util.format-style formatting of console arguments
///
/// A leading string argument is a template understanding `%s %d %i %f %j
/// %o %O %c %%`. Arguments left over are appended, separated by spaces.
pub fn format_args<'js>(ctx: &Ctx<'js>, args: &[Value<'js>]) -> String {
    let mut parts = Vec::with_capacity(args.len());
    let mut rest = args.iter();

    if let Some(template) = args.first().and_then(|v| v.as_string()) {
        rest.next();
        let template = template.to_string().unwrap_or_default();
        parts.push(apply_template(ctx, &template, &mut rest));
    }
    parts.extend(rest.map(|arg| display(ctx, arg)));
    parts.join(" ")
}

fn apply_template<'a, 'js: 'a>(
    ctx: &Ctx<'js>,
    template: &str,
    args: &mut std::slice::Iter<'a, Value<'js>>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some(spec @ ('s' | 'd' | 'i' | 'f' | 'j' | 'o' | 'O' | 'c')) => {
                chars.next();
                match args.next() {
                    Some(arg) => out.push_str(&directive(ctx, spec, arg)),
                    None => {
                        out.push('%');
                        out.push(spec);
                    }
                }
            }
            _ => out.push('%'),
        }
    }
    out
}

fn directive<'js>(ctx: &Ctx<'js>, spec: char, arg: &Value<'js>) -> String {
    match spec {
        's' => display(ctx, arg),
        'd' | 'i' | 'f' if arg.type_of() == Type::BigInt => display(ctx, arg),
        'd' | 'f' => format_number(to_number(ctx, arg)),
        'i' => format_number(to_number(ctx, arg).trunc()),
        'j' => stringify(ctx, arg).unwrap_or_else(|| "[Circular]".to_string()),
        'c' => String::new(),
        _ => display(ctx, arg),
    }
}

fn to_number<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> f64 {
    match Coerced::<f64>::from_js(ctx, value.clone()) {
        Ok(Coerced(n)) => n,
        Err(_) => {
            ctx.catch();
            f64::NAN
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        n.to_string()
    }
}

fn function_label<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    let name = value
        .as_object()
        .and_then(|f| match f.get::<_, Option<Coerced<String>>>("name") {
            Ok(name) => name.map(|n| n.0),
            Err(_) => {
                ctx.catch();
                None
            }
        })
        .filter(|name| !name.is_empty());

    match name {
        Some(name) => format!("[Function: {}]", name),
        None => "[Function (anonymous)]".to_string(),
    }
}

fn error_text<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    let error = crate::errors::serialize_error(ctx, value, crate::errors::ErrorOrigin::Uncaught);
    let header = error.to_string();
    match error.stack {
        Some(stack) => match stack.split_once('\n') {
            Some((_, frames)) => format!("{}\n{}", header, frames),
            None => header,
        },
        None => header,
    }
}

/// `JSON.stringify(value)`, or None if it throws or yields undefined
pub fn stringify<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Option<String> {
    match ctx.json_stringify(value.clone()) {
        Ok(Some(json)) => json.to_string().ok(),
        Ok(None) => None,
        Err(_) => {
            ctx.catch();
            None
        }
    }
}

/// Converts a value to JSON through `JSON.stringify`
///
/// Returns `Ok(None)` for values JSON cannot represent at the top level
/// (undefined, functions, symbols). BigInt and circular structures are
/// errors, with the exception left pending on the context.
pub fn to_json<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Result<Option<JsonValue>, SandboxError> {
    let Some(json) = ctx.json_stringify(value.clone())? else {
        return Ok(None);
    };
    let text = json.to_string()?;
    Ok(Some(serde_json::from_str(&text)?))
}

/// Converts JSON into a script value
pub fn from_json<'js>(ctx: &Ctx<'js>, value: &JsonValue) -> Result<Value<'js>, SandboxError> {
    let text = serde_json::to_string(value)?;
    Ok(ctx.json_parse(text)?)
}
