//! Encoding of calls and decoding of replies for the coqidetop XML protocol.
//!
//! A call is `<call val="Name">arg</call>`; the reply is
//! `<value val="good">result</value>` or `<value val="fail">detail</value>`.

use encoding_rs::Encoding;
use percent_encoding::percent_decode_str;

use crate::types::CoqError;
use crate::value::{Evar, Goal, Goals, OptionState, RouteId, Side, StateId, Status, Value};
use crate::xml::Element;

/// Outcome of a call as reported by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// The call succeeded. `annotation` holds the last diagnostic message
    /// the backend emitted while processing it.
    Ok {
        value: Value,
        annotation: Option<String>,
    },
    /// The backend rejected the call. `state_id` markers are stripped.
    Err { detail: Element },
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Response::Ok { value, .. } => Some(value),
            Response::Err { .. } => None,
        }
    }

    pub fn annotation(&self) -> Option<&str> {
        match self {
            Response::Ok { annotation, .. } => annotation.as_deref(),
            Response::Err { .. } => None,
        }
    }

    /// Human-readable text of a failure detail.
    pub fn error_message(&self) -> Option<String> {
        match self {
            Response::Ok { .. } => None,
            Response::Err { detail } => Some(decode_text(&detail.inner_xml())),
        }
    }
}

// --- Encoding ---

/// Build the `<call>` element for `name` applied to `arg`.
pub fn encode_call(name: &str, arg: &Value) -> Element {
    Element::new("call")
        .with_val(name)
        .with_child(encode_value(arg))
}

/// Serialize a call into the bytes written to the backend.
///
/// Characters `encoding` cannot represent become numeric character
/// references, which the backend's parser resolves.
pub fn call_bytes(name: &str, arg: &Value, encoding: &'static Encoding) -> Vec<u8> {
    let text = encode_call(name, arg).to_xml();
    let (bytes, _, _) = encoding.encode(&text);
    bytes.into_owned()
}

/// Lower a value to its element form.
pub fn encode_value(value: &Value) -> Element {
    match value {
        Value::Unit => Element::new("unit"),
        Value::Bool(b) => Element::new("bool").with_val(if *b { "true" } else { "false" }),
        Value::Str(s) | Value::RichText(s) => Element::new("string").with_text(s.as_str()),
        Value::Int(n) => Element::new("int").with_text(n.to_string()),
        Value::StateId(id) => Element::new("state_id").with_val(id.0.to_string()),
        Value::RouteId(id) => Element::new("route_id").with_val(id.0.to_string()),
        Value::List(items) => Element::new("list").with_children(items.iter().map(encode_value)),
        Value::Option(None) => Element::new("option").with_val("none"),
        Value::Option(Some(inner)) => Element::new("option")
            .with_val("some")
            .with_child(encode_value(inner)),
        Value::Pair(a, b) => Element::new("pair")
            .with_child(encode_value(a))
            .with_child(encode_value(b)),
        Value::Union(side, inner) => Element::new("union")
            .with_val(match side {
                Side::Left => "in_l",
                Side::Right => "in_r",
            })
            .with_child(encode_value(inner)),
        Value::OptionState(state) => Element::new("option_state")
            .with_child(encode_value(&Value::Bool(state.sync)))
            .with_child(encode_value(&Value::Bool(state.deprecated)))
            .with_child(encode_strings(&state.name))
            .with_child(encode_value(&state.value)),
        Value::OptionValue(inner) => {
            let mut element = Element::new("option_value").with_child(encode_value(inner));
            if let Some(kind) = option_value_kind(inner) {
                element.set_attr("val", kind);
            }
            element
        }
        Value::Status(status) => Element::new("status")
            .with_child(encode_strings(&status.path))
            .with_child(encode_value(&match &status.proof_name {
                Some(name) => Value::some(Value::str(name.as_str())),
                None => Value::none(),
            }))
            .with_child(encode_strings(&status.all_proofs))
            .with_child(encode_value(&Value::Int(status.proof_num))),
        Value::Goals(goals) => Element::new("goals")
            .with_child(encode_goal_list(&goals.fg))
            .with_child(encode_goal_list(&goals.bg))
            .with_child(encode_goal_list(&goals.shelved))
            .with_child(encode_goal_list(&goals.given_up)),
        Value::Goal(goal) => encode_goal(goal),
        Value::Evar(evar) => Element::new("evar").with_child(encode_value(&Value::str(evar.info.as_str()))),
    }
}

fn encode_strings(items: &[String]) -> Element {
    Element::new("list").with_children(items.iter().map(|s| Element::new("string").with_text(s.as_str())))
}

fn encode_goal(goal: &Goal) -> Element {
    // The backend sends goal ids as strings.
    Element::new("goal")
        .with_child(Element::new("string").with_text(goal.id.to_string()))
        .with_child(encode_strings(&goal.hypotheses))
        .with_child(Element::new("string").with_text(goal.conclusion.as_str()))
}

fn encode_goal_list(goals: &[Goal]) -> Element {
    Element::new("list").with_children(goals.iter().map(encode_goal))
}

fn option_value_kind(inner: &Value) -> Option<&'static str> {
    match inner {
        Value::Bool(_) => Some("boolvalue"),
        Value::Int(_) => Some("intvalue"),
        Value::Str(_) => Some("stringvalue"),
        Value::Option(Some(v)) if matches!(**v, Value::Int(_)) => Some("intvalue"),
        Value::Option(Some(v)) if matches!(**v, Value::Str(_)) => Some("stringoptvalue"),
        _ => None,
    }
}

// --- Decoding ---

/// Decode a `<value>` reply.
///
/// Anything but a `value` element carrying `good` or `fail` is a protocol
/// error.
pub fn decode_response(element: &Element, annotation: Option<String>) -> Result<Response, CoqError> {
    if element.name != "value" {
        return Err(CoqError::Protocol(format!(
            "expected <value>, got <{}>",
            element.name
        )));
    }
    match element.val() {
        Some("good") => {
            let payload = element
                .first_element()
                .ok_or_else(|| CoqError::Protocol("empty <value val=\"good\">".into()))?;
            Ok(Response::Ok {
                value: decode_value(payload)?,
                annotation,
            })
        }
        Some("fail") => {
            let mut detail = element.clone();
            detail.remove_descendants("state_id");
            Ok(Response::Err { detail })
        }
        other => Err(CoqError::Protocol(format!(
            "expected \"good\" or \"fail\" in <value>, got {other:?}"
        ))),
    }
}

/// Lift an element into a [`Value`].
pub fn decode_value(element: &Element) -> Result<Value, CoqError> {
    let value = match element.name.as_str() {
        "unit" => Value::Unit,
        "bool" => match element.val() {
            Some("true") => Value::Bool(true),
            Some("false") => Value::Bool(false),
            other => {
                return Err(CoqError::Protocol(format!(
                    "expected \"true\" or \"false\" in <bool>, got {other:?}"
                )))
            }
        },
        "string" => Value::Str(element.own_text()),
        "int" => Value::Int(parse_int(&element.own_text(), "int")?),
        "state_id" => Value::StateId(StateId(parse_int(attr_val(element)?, "state_id")?)),
        "route_id" => Value::RouteId(RouteId(parse_int(attr_val(element)?, "route_id")?)),
        "list" => Value::List(element.elements().map(decode_value).collect::<Result<_, _>>()?),
        "option" => match element.val() {
            Some("none") => Value::none(),
            Some("some") => Value::some(decode_value(nth(element, 0)?)?),
            other => {
                return Err(CoqError::Protocol(format!(
                    "expected \"none\" or \"some\" in <option>, got {other:?}"
                )))
            }
        },
        "pair" => Value::pair(decode_value(nth(element, 0)?)?, decode_value(nth(element, 1)?)?),
        "union" => {
            let side = match element.val() {
                Some("in_l") => Side::Left,
                Some("in_r") => Side::Right,
                other => {
                    return Err(CoqError::Protocol(format!(
                        "expected \"in_l\" or \"in_r\" in <union>, got {other:?}"
                    )))
                }
            };
            Value::Union(side, Box::new(decode_value(nth(element, 0)?)?))
        }
        "option_state" => Value::OptionState(OptionState {
            sync: expect_bool(nth(element, 0)?)?,
            deprecated: expect_bool(nth(element, 1)?)?,
            name: decode_name(nth(element, 2)?)?,
            value: Box::new(decode_value(nth(element, 3)?)?),
        }),
        "option_value" => Value::OptionValue(Box::new(decode_value(nth(element, 0)?)?)),
        "status" => Value::Status(Status {
            path: expect_strings(nth(element, 0)?)?,
            proof_name: match decode_value(nth(element, 1)?)? {
                Value::Option(None) => None,
                Value::Option(Some(inner)) => Some(expect_text(&inner, "status proof name")?),
                other => return Err(unexpected("option", &other)),
            },
            all_proofs: expect_strings(nth(element, 2)?)?,
            proof_num: match decode_value(nth(element, 3)?)? {
                Value::Int(n) => n,
                other => return Err(unexpected("int", &other)),
            },
        }),
        "goals" => Value::Goals(Goals {
            fg: decode_goal_list(nth(element, 0)?)?,
            bg: decode_goal_list(nth(element, 1)?)?,
            shelved: decode_goal_list(nth(element, 2)?)?,
            given_up: decode_goal_list(nth(element, 3)?)?,
        }),
        "goal" => Value::Goal(decode_goal(element)?),
        "evar" => Value::Evar(Evar {
            info: expect_text(&decode_value(nth(element, 0)?)?, "evar info")?,
        }),
        "richpp" | "xml" => Value::RichText(element.text()),
        other => return Err(CoqError::Protocol(format!("unknown value tag <{other}>"))),
    };
    Ok(value)
}

fn nth(element: &Element, index: usize) -> Result<&Element, CoqError> {
    element.elements().nth(index).ok_or_else(|| {
        CoqError::Protocol(format!(
            "<{}> is missing child #{}",
            element.name,
            index + 1
        ))
    })
}

fn attr_val(element: &Element) -> Result<&str, CoqError> {
    element
        .val()
        .ok_or_else(|| CoqError::Protocol(format!("<{}> has no val attribute", element.name)))
}

fn parse_int(text: &str, what: &str) -> Result<i64, CoqError> {
    text.trim()
        .parse()
        .map_err(|e| CoqError::Protocol(format!("invalid {what} {text:?}: {e}")))
}

fn unexpected(expected: &str, got: &Value) -> CoqError {
    CoqError::Protocol(format!("expected {expected}, got {}", got.kind()))
}

fn expect_bool(element: &Element) -> Result<bool, CoqError> {
    match decode_value(element)? {
        Value::Bool(b) => Ok(b),
        other => Err(unexpected("bool", &other)),
    }
}

fn expect_text(value: &Value, what: &str) -> Result<String, CoqError> {
    value
        .as_text()
        .map(str::to_string)
        .ok_or_else(|| unexpected(what, value))
}

fn expect_strings(element: &Element) -> Result<Vec<String>, CoqError> {
    match decode_value(element)? {
        Value::List(items) => items.iter().map(|v| expect_text(v, "string")).collect(),
        other => Err(unexpected("list", &other)),
    }
}

/// Option names come as a list of segments, or as one dotted string from
/// older backends.
fn decode_name(element: &Element) -> Result<Vec<String>, CoqError> {
    match decode_value(element)? {
        Value::Str(s) => Ok(vec![s]),
        Value::List(items) => items.iter().map(|v| expect_text(v, "string")).collect(),
        other => Err(unexpected("option name", &other)),
    }
}

fn decode_goal(element: &Element) -> Result<Goal, CoqError> {
    let id = match decode_value(nth(element, 0)?)? {
        Value::Int(n) => n,
        Value::Str(s) => parse_int(&s, "goal id")?,
        other => return Err(unexpected("goal id", &other)),
    };
    Ok(Goal {
        id,
        hypotheses: expect_strings(nth(element, 1)?)?,
        conclusion: expect_text(&decode_value(nth(element, 2)?)?, "goal conclusion")?,
    })
}

/// Decode a list of goals. Background lists nest goals in
/// `pair(list goal, list goal)` per focus level; those are flattened.
fn decode_goal_list(element: &Element) -> Result<Vec<Goal>, CoqError> {
    if element.name != "list" {
        return Err(CoqError::Protocol(format!(
            "expected <list> of goals, got <{}>",
            element.name
        )));
    }
    let mut goals = Vec::new();
    for entry in element.elements() {
        match entry.name.as_str() {
            "goal" => goals.push(decode_goal(entry)?),
            "pair" => {
                goals.extend(decode_goal_list(nth(entry, 0)?)?);
                goals.extend(decode_goal_list(nth(entry, 1)?)?);
            }
            other => {
                return Err(CoqError::Protocol(format!(
                    "unexpected <{other}> in goal list"
                )))
            }
        }
    }
    Ok(goals)
}

// --- Free-form text ---

/// Entities the backend emits for literal characters outside of standard XML.
const WIRE_ENTITIES: [(&[u8], u8); 4] = [
    (b"&nbsp;", b' '),
    (b"&apos;", b'\''),
    (b"&#40;", b'('),
    (b"&#41;", b')'),
];

/// Replace the backend's non-standard entities in raw wire bytes.
pub fn normalize_wire_entities(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    'scan: while i < bytes.len() {
        if bytes[i] == b'&' {
            for (entity, replacement) in WIRE_ENTITIES {
                if bytes[i..].starts_with(entity) {
                    out.push(replacement);
                    i += entity.len();
                    continue 'scan;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// Turn annotation or diagnostic markup into display text.
///
/// Paragraph markers become newlines, remaining tags are dropped, then the
/// text is percent-decoded (kept as-is if that does not yield UTF-8) and
/// HTML entities are resolved. Never fails.
pub fn decode_text(raw: &str) -> String {
    let text = raw.replace("</_>", "\n");
    let text = strip_tags(&text);
    let text = match percent_decode_str(&text).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => text,
    };
    html_escape::decode_html_entities(&text).into_owned()
}

/// Remove `<tag ...>` and `</tag ...>` runs. A `<` not followed by a word
/// character or `/` is kept, as is an unterminated tag.
fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('<') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let mut chars = after.chars();
        let opens_tag = match chars.next() {
            Some('/') => chars.next().is_some_and(is_word_char),
            Some(c) => is_word_char(c),
            None => false,
        };
        match (opens_tag, after.find('>')) {
            (true, Some(end)) => rest = &after[end + 1..],
            _ => {
                out.push('<');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
