//! Path expressions into JSON trees.
//!
//! Accepted syntax:
//!
//! ```text
//! stats.hp            dot segments
//! inventory[0].name   bracket numeric index
//! flags["odd.key"]    bracket double-quoted key
//! flags['odd key']    bracket single-quoted key
//! ```
//!
//! A purely numeric dot segment (`inventory.0`) also indexes arrays.

use serde_json::{Map, Value};

use crate::VariableError;

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parse a path expression into segments.
pub fn parse_path(input: &str) -> Result<Vec<PathSegment>, VariableError> {
    let invalid = |reason: &str| VariableError::InvalidPath {
        path: input.to_string(),
        reason: reason.to_string(),
    };

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut just_closed = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if current.is_empty() && !just_closed {
                    return Err(invalid("empty segment"));
                }
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                just_closed = false;
                if chars.peek().is_none() {
                    return Err(invalid("trailing '.'"));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                match chars.peek().copied() {
                    Some(quote @ ('"' | '\'')) => {
                        chars.next();
                        let mut key = String::new();
                        loop {
                            match chars.next() {
                                Some('\\') => {
                                    if let Some(escaped) = chars.next() {
                                        key.push(escaped);
                                    }
                                }
                                Some(ch) if ch == quote => break,
                                Some(ch) => key.push(ch),
                                None => return Err(invalid("unterminated quoted key")),
                            }
                        }
                        if chars.next() != Some(']') {
                            return Err(invalid("expected ']' after quoted key"));
                        }
                        segments.push(PathSegment::Key(key));
                    }
                    _ => {
                        let mut digits = String::new();
                        loop {
                            match chars.next() {
                                Some(']') => break,
                                Some(d) if d.is_ascii_digit() => digits.push(d),
                                Some(_) => return Err(invalid("bracket index must be numeric")),
                                None => return Err(invalid("unterminated '['")),
                            }
                        }
                        let index = digits
                            .parse::<usize>()
                            .map_err(|_| invalid("empty bracket index"))?;
                        segments.push(PathSegment::Index(index));
                    }
                }
                just_closed = true;
            }
            ']' => return Err(invalid("unexpected ']'")),
            _ => {
                if just_closed {
                    return Err(invalid("expected '.' or '[' after ']'"));
                }
                current.push(c);
            }
        }
    }

    if !current.is_empty() {
        segments.push(PathSegment::Key(current));
    }
    if segments.is_empty() {
        return Err(invalid("empty path"));
    }
    Ok(segments)
}

/// Read the value at `segments`, if present.
pub fn get_path<'a>(value: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    segments.iter().try_fold(value, |current, segment| match (segment, current) {
        (PathSegment::Key(key), Value::Object(map)) => map.get(key),
        (PathSegment::Key(key), Value::Array(items)) => {
            key.parse::<usize>().ok().and_then(|i| items.get(i))
        }
        (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
        (PathSegment::Index(i), Value::Object(map)) => map.get(&i.to_string()),
        _ => None,
    })
}

/// Write `new` at `segments`, creating intermediate objects as needed.
///
/// Array indices may address an existing element or append exactly one
/// past the end; anything further is rejected rather than padded. A
/// rejected write leaves `value` untouched.
pub fn set_path(value: &mut Value, segments: &[PathSegment], new: Value) -> Result<(), VariableError> {
    check_writable(value, segments)?;
    write_path(value, segments, new)
}

/// Walk `segments` without creating anything and report the first step
/// [`write_path`] would fail on.
fn check_writable(value: &Value, segments: &[PathSegment]) -> Result<(), VariableError> {
    let mut current = Some(value);
    for segment in segments {
        current = match (segment, current) {
            (_, None | Some(Value::Null)) => match segment {
                PathSegment::Index(i) if *i > 0 => return Err(beyond_end(*i)),
                _ => None,
            },
            (PathSegment::Key(key), Some(Value::Object(map))) => map.get(key),
            (PathSegment::Index(i), Some(Value::Object(map))) => map.get(&i.to_string()),
            (PathSegment::Index(i), Some(Value::Array(items))) => array_step(items, *i)?,
            (PathSegment::Key(key), Some(Value::Array(items))) => match key.parse::<usize>() {
                Ok(i) => array_step(items, i)?,
                Err(_) => return Err(VariableError::NotAContainer(key.clone())),
            },
            (segment, Some(_)) => return Err(VariableError::NotAContainer(describe(segment))),
        };
    }
    Ok(())
}

fn array_step(items: &[Value], index: usize) -> Result<Option<&Value>, VariableError> {
    match index.cmp(&items.len()) {
        std::cmp::Ordering::Greater => Err(beyond_end(index)),
        _ => Ok(items.get(index)),
    }
}

fn beyond_end(index: usize) -> VariableError {
    VariableError::NotAContainer(format!("[{index}] beyond end of array"))
}

fn write_path(value: &mut Value, segments: &[PathSegment], new: Value) -> Result<(), VariableError> {
    let Some((head, rest)) = segments.split_first() else {
        *value = new;
        return Ok(());
    };

    if value.is_null() {
        *value = match head {
            PathSegment::Index(_) => Value::Array(Vec::new()),
            PathSegment::Key(_) => Value::Object(Map::new()),
        };
    }

    let slot = match (head, value) {
        (PathSegment::Key(key), Value::Object(map)) => map.entry(key.clone()).or_insert(Value::Null),
        (PathSegment::Index(i), Value::Object(map)) => {
            map.entry(i.to_string()).or_insert(Value::Null)
        }
        (PathSegment::Index(i), Value::Array(items)) => array_slot(items, *i)?,
        (PathSegment::Key(key), Value::Array(items)) => match key.parse::<usize>() {
            Ok(i) => array_slot(items, i)?,
            Err(_) => return Err(VariableError::NotAContainer(key.clone())),
        },
        (segment, _) => return Err(VariableError::NotAContainer(describe(segment))),
    };
    write_path(slot, rest, new)
}

/// Delete the value at `segments`. Returns `false` when nothing was there.
pub fn remove_path(value: &mut Value, segments: &[PathSegment]) -> bool {
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    let mut current = value;
    for segment in parents {
        let next = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get_mut(key),
            (PathSegment::Key(key), Value::Array(items)) => {
                key.parse::<usize>().ok().and_then(|i| items.get_mut(i))
            }
            (PathSegment::Index(i), Value::Array(items)) => items.get_mut(*i),
            (PathSegment::Index(i), Value::Object(map)) => map.get_mut(&i.to_string()),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return false,
        }
    }

    match (last, current) {
        (PathSegment::Key(key), Value::Object(map)) => map.remove(key).is_some(),
        (PathSegment::Index(i), Value::Object(map)) => map.remove(&i.to_string()).is_some(),
        (PathSegment::Index(i), Value::Array(items)) => remove_index(items, *i),
        (PathSegment::Key(key), Value::Array(items)) => match key.parse::<usize>() {
            Ok(i) => remove_index(items, i),
            Err(_) => false,
        },
        _ => false,
    }
}

fn array_slot(items: &mut Vec<Value>, index: usize) -> Result<&mut Value, VariableError> {
    if index == items.len() {
        items.push(Value::Null);
    }
    items.get_mut(index).ok_or_else(|| beyond_end(index))
}

fn remove_index(items: &mut Vec<Value>, index: usize) -> bool {
    if index < items.len() {
        items.remove(index);
        true
    } else {
        false
    }
}

fn describe(segment: &PathSegment) -> String {
    match segment {
        PathSegment::Key(key) => key.clone(),
        PathSegment::Index(i) => format!("[{i}]"),
    }
}
