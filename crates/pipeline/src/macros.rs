//! `{{macro}}` expansion.
//!
//! Macros nest and expand innermost first, left to right, so
//! `{{setvar::a::{{getvar::b}}}}` reads `b` before writing `a`. Names are
//! case-insensitive. Anything unrecognised is left exactly as written.

use loomweave_variables::{VariableScope, VariableState};
use serde_json::Value;
use tracing::warn;

/// Deepest `{{` that still opens a macro.
pub const MAX_NESTING: usize = 64;

/// Read-only facts macros can refer to.
#[derive(Debug, Clone, Default)]
pub struct MacroContext {
    pub user: String,
    pub char: String,
    /// Character description
    pub description: String,
    /// Persona description
    pub persona: String,
    pub last_message: String,
    pub last_user_message: String,
    pub last_char_message: String,
}

pub struct MacroProcessor<'a> {
    ctx: &'a MacroContext,
    variables: &'a mut VariableState,
    trim: bool,
}

impl<'a> MacroProcessor<'a> {
    pub fn new(ctx: &'a MacroContext, variables: &'a mut VariableState) -> Self {
        Self {
            ctx,
            variables,
            trim: false,
        }
    }

    /// Expand every macro in `text`.
    pub fn expand(&mut self, text: &str) -> String {
        self.trim = false;
        let out = self.expand_all(text);
        if self.trim { out.trim().to_string() } else { out }
    }

    /// Single pass over `text` with an explicit stack of open `{{`.
    ///
    /// Each open macro is recorded as the offset in `out` just past its
    /// `{{`; a `}}` evaluates everything written since. Opens deeper than
    /// [`MAX_NESTING`] are plain text, and unclosed opens stay as written.
    fn expand_all(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut open: Vec<usize> = Vec::new();
        let mut pos = 0;
        while pos < text.len() {
            let rest = &text[pos..];
            if rest.starts_with("{{") {
                pos += 2;
                out.push_str("{{");
                if open.len() < MAX_NESTING {
                    open.push(out.len());
                }
            } else if rest.starts_with("}}") && !open.is_empty() {
                pos += 2;
                let start = open.pop().unwrap_or_default();
                let inner = out.split_off(start);
                if let Some(value) = self.evaluate(&inner) {
                    out.truncate(start - 2);
                    out.push_str(&value);
                } else {
                    out.push_str(&inner);
                    out.push_str("}}");
                }
            } else {
                let ch = rest.chars().next().unwrap_or_default();
                out.push(ch);
                pos += ch.len_utf8().max(1);
            }
        }
        out
    }

    /// `None` leaves the macro untouched.
    fn evaluate(&mut self, body: &str) -> Option<String> {
        if body.trim_start().starts_with("//") {
            return Some(String::new());
        }
        let (name, args) = match body.split_once("::") {
            Some((name, args)) => (name.trim().to_ascii_lowercase(), Some(args)),
            None => (body.trim().to_ascii_lowercase(), None),
        };
        let ctx = self.ctx;
        let value = match (name.as_str(), args) {
            ("user", None) => ctx.user.clone(),
            ("char", None) => ctx.char.clone(),
            ("description", None) => ctx.description.clone(),
            ("persona", None) => ctx.persona.clone(),
            ("newline", None) => "\n".into(),
            ("trim", None) => {
                self.trim = true;
                String::new()
            }
            ("lastmessage", None) => ctx.last_message.clone(),
            ("lastusermessage", None) => ctx.last_user_message.clone(),
            ("lastcharmessage", None) => ctx.last_char_message.clone(),
            ("upper", Some(text)) => text.to_uppercase(),
            ("lower", Some(text)) => text.to_lowercase(),
            ("getvar", Some(path)) => self.get(VariableScope::Local, path),
            ("getglobalvar", Some(path)) => self.get(VariableScope::Global, path),
            ("setvar", Some(args)) => self.set(VariableScope::Local, args)?,
            ("setglobalvar", Some(args)) => self.set(VariableScope::Global, args)?,
            ("addvar", Some(args)) => self.add(VariableScope::Local, args)?,
            ("addglobalvar", Some(args)) => self.add(VariableScope::Global, args)?,
            ("incvar", Some(path)) => self.step(VariableScope::Local, path, 1.0),
            ("decvar", Some(path)) => self.step(VariableScope::Local, path, -1.0),
            ("incglobalvar", Some(path)) => self.step(VariableScope::Global, path, 1.0),
            ("decglobalvar", Some(path)) => self.step(VariableScope::Global, path, -1.0),
            _ => return None,
        };
        Some(value)
    }

    fn get(&self, scope: VariableScope, path: &str) -> String {
        self.variables
            .get(scope, path.trim())
            .map(display)
            .unwrap_or_default()
    }

    fn write(&mut self, scope: VariableScope, path: &str, value: Value) {
        if let Err(e) = self.variables.set(scope, path, value) {
            warn!(path, error = %e, "Macro variable write failed");
        }
    }

    /// `path::value`; `None` when the value part is missing.
    fn set(&mut self, scope: VariableScope, args: &str) -> Option<String> {
        let (path, value) = args.split_once("::")?;
        self.write(scope, path.trim(), parse_scalar(value));
        Some(String::new())
    }

    /// Numbers add, arrays push, anything else concatenates as text.
    fn add(&mut self, scope: VariableScope, args: &str) -> Option<String> {
        let (path, delta) = args.split_once("::")?;
        let path = path.trim();
        let current = self.variables.get(scope, path).cloned().unwrap_or(Value::Null);
        let next = match (&current, parse_scalar(delta)) {
            (Value::Array(items), value) => {
                let mut items = items.clone();
                items.push(value);
                Value::Array(items)
            }
            (Value::Null, value) => value,
            (current, Value::Number(n)) if as_number(current).is_some() => {
                number(as_number(current).unwrap_or_default() + n.as_f64().unwrap_or_default())
            }
            (current, value) => Value::String(format!("{}{}", display(current), display(&value))),
        };
        self.write(scope, path, next);
        Some(String::new())
    }

    /// Add `delta` to a numeric variable (missing counts as 0) and return
    /// the new value.
    fn step(&mut self, scope: VariableScope, path: &str, delta: f64) -> String {
        let path = path.trim();
        let current = self
            .variables
            .get(scope, path)
            .and_then(as_number)
            .unwrap_or_default();
        let next = number(current + delta);
        let shown = display(&next);
        self.write(scope, path, next);
        shown
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Integral results stay integers.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

/// Numbers are stored as numbers, everything else as the literal text.
fn parse_scalar(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed.parse::<i64>() {
        Ok(i) => Value::from(i),
        Err(_) => match trimmed.parse::<f64>() {
            Ok(f) if f.is_finite() => number(f),
            _ => Value::String(raw.to_string()),
        },
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> MacroContext {
        MacroContext {
            user: "Ada".into(),
            char: "Mira".into(),
            description: "A cartographer.".into(),
            persona: "A traveller.".into(),
            last_message: "see you".into(),
            last_user_message: "bye".into(),
            last_char_message: "see you".into(),
        }
    }

    fn expand(text: &str, vars: &mut VariableState) -> String {
        let ctx = ctx();
        MacroProcessor::new(&ctx, vars).expand(text)
    }

    #[test]
    fn names_and_context() {
        let mut vars = VariableState::default();
        assert_eq!(
            expand("{{char}} greets {{USER}}.{{newline}}{{lastUserMessage}}", &mut vars),
            "Mira greets Ada.\nbye"
        );
        assert_eq!(expand("{{description}} / {{persona}}", &mut vars), "A cartographer. / A traveller.");
    }

    #[test]
    fn variables_are_written_and_read_in_order() {
        let mut vars = VariableState::default();
        let out = expand(
            "{{setvar::hp::10}}{{addvar::hp::5}}HP={{getvar::hp}} {{incvar::turn}} {{decvar::hp}}",
            &mut vars,
        );
        assert_eq!(out, "HP=15 1 14");
        assert_eq!(vars.local, json!({"hp": 14, "turn": 1}));
    }

    #[test]
    fn nested_macros_expand_innermost_first() {
        let mut vars = VariableState::new(json!({"src": "gold"}), json!({}));
        let out = expand("{{setvar::dst::{{upper::{{getvar::src}}}}}}{{getvar::dst}}", &mut vars);
        assert_eq!(out, "GOLD");
    }

    #[test]
    fn globals_and_paths() {
        let mut vars = VariableState::default();
        expand("{{setglobalvar::world.weather::rain}}", &mut vars);
        assert_eq!(vars.global, json!({"world": {"weather": "rain"}}));
        assert_eq!(expand("{{getglobalvar::world.weather}}", &mut vars), "rain");
    }

    #[test]
    fn addvar_appends_to_arrays_and_strings() {
        let mut vars = VariableState::new(json!({"bag": ["key"], "name": "Mi"}), json!({}));
        expand("{{addvar::bag::map}}{{addvar::name::ra}}", &mut vars);
        assert_eq!(vars.local, json!({"bag": ["key", "map"], "name": "Mira"}));
    }

    #[test]
    fn unknown_and_unterminated_macros_stay_verbatim() {
        let mut vars = VariableState::default();
        assert_eq!(expand("{{random::a::b}} {{user}}", &mut vars), "{{random::a::b}} Ada");
        assert_eq!(expand("{{user", &mut vars), "{{user");
        assert_eq!(expand("{{setvar::only_path}}", &mut vars), "{{setvar::only_path}}");
        assert_eq!(expand("a }} b", &mut vars), "a }} b");
    }

    #[test]
    fn failed_writes_do_not_create_containers() {
        let mut vars = VariableState::new(json!({"kept": 1}), json!({}));
        assert_eq!(expand("{{setvar::fresh[3]::x}}ok", &mut vars), "ok");
        assert_eq!(vars.local, json!({"kept": 1}));
    }

    #[test]
    fn trim_and_comments() {
        let mut vars = VariableState::default();
        assert_eq!(expand("  {{trim}} hi {{// note to self}} ", &mut vars), "hi");
        assert_eq!(expand("x{{// gone}}y", &mut vars), "xy");
    }

    #[test]
    fn multibyte_text_passes_through() {
        let mut vars = VariableState::default();
        assert_eq!(expand("héllo {{user}} ✓", &mut vars), "héllo Ada ✓");
    }

    #[test]
    fn pathological_nesting_is_left_as_text() {
        let mut vars = VariableState::default();
        let opens = "{{".repeat(200_000);
        assert_eq!(expand(&opens, &mut vars), opens);

        let balanced = format!("{}user{}", "{{".repeat(100_000), "}}".repeat(100_000));
        assert_eq!(expand(&balanced, &mut vars), balanced);
    }

    #[test]
    fn nesting_up_to_the_limit_still_expands() {
        let mut vars = VariableState::default();
        let mut text = "{{user}}".to_string();
        for _ in 1..MAX_NESTING {
            text = format!("{{{{upper::{text}}}}}");
        }
        assert_eq!(expand(&text, &mut vars), "ADA");
    }
}
