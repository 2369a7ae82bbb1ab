use std::fmt;

/// Backend-assigned handle for a point in the document timeline.
///
/// Only equality is meaningful. Ids are unique within one backend process
/// and must never be carried over to a restarted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId(pub i64);

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a secondary feedback channel used by routed queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(pub i64);

/// Discriminant of a protocol `union` (`in_l` / `in_r`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// A value exchanged with the backend.
///
/// Every case except [`Value::RichText`] survives an encode/decode round
/// trip unchanged. Rich text only ever arrives from the backend and is
/// flattened to plain text when decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Unit,
    Bool(bool),
    Str(String),
    Int(i64),
    StateId(StateId),
    RouteId(RouteId),
    List(Vec<Value>),
    /// `None` is "no value", distinct from an absent field.
    Option(Option<Box<Value>>),
    Pair(Box<Value>, Box<Value>),
    Union(Side, Box<Value>),
    OptionState(OptionState),
    OptionValue(Box<Value>),
    Status(Status),
    Goals(Goals),
    Goal(Goal),
    Evar(Evar),
    RichText(String),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn pair(left: Value, right: Value) -> Self {
        Value::Pair(Box::new(left), Box::new(right))
    }

    pub fn some(inner: Value) -> Self {
        Value::Option(Some(Box::new(inner)))
    }

    pub fn none() -> Self {
        Value::Option(None)
    }

    pub fn left(inner: Value) -> Self {
        Value::Union(Side::Left, Box::new(inner))
    }

    pub fn right(inner: Value) -> Self {
        Value::Union(Side::Right, Box::new(inner))
    }

    /// The state id carried by this value, if it is one.
    pub fn as_state_id(&self) -> Option<StateId> {
        match self {
            Value::StateId(id) => Some(*id),
            _ => None,
        }
    }

    /// Plain text of a `Str` or `RichText` value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::RichText(s) => Some(s),
            _ => None,
        }
    }

    /// Short name of the case, used in protocol error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Int(_) => "int",
            Value::StateId(_) => "state_id",
            Value::RouteId(_) => "route_id",
            Value::List(_) => "list",
            Value::Option(_) => "option",
            Value::Pair(..) => "pair",
            Value::Union(..) => "union",
            Value::OptionState(_) => "option_state",
            Value::OptionValue(_) => "option_value",
            Value::Status(_) => "status",
            Value::Goals(_) => "goals",
            Value::Goal(_) => "goal",
            Value::Evar(_) => "evar",
            Value::RichText(_) => "richpp",
        }
    }
}

/// State of a backend option as reported by `GetOptions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionState {
    pub sync: bool,
    pub deprecated: bool,
    pub name: Vec<String>,
    pub value: Box<Value>,
}

/// Result of a `Status` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Current module path.
    pub path: Vec<String>,
    /// Name of the proof being edited, if any.
    pub proof_name: Option<String>,
    pub all_proofs: Vec<String>,
    pub proof_num: i64,
}

/// The goal lists of the current proof.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Goals {
    /// Focused goals.
    pub fg: Vec<Goal>,
    /// Unfocused goals, flattened across focus levels.
    pub bg: Vec<Goal>,
    pub shelved: Vec<Goal>,
    pub given_up: Vec<Goal>,
}

/// A single goal: hypotheses above the line, conclusion below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goal {
    pub id: i64,
    pub hypotheses: Vec<String>,
    pub conclusion: String,
}

/// An existential variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evar {
    pub info: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_none_is_not_unit() {
        assert_ne!(Value::none(), Value::Unit);
        assert_ne!(Value::none(), Value::some(Value::Unit));
    }

    #[test]
    fn text_accessor_covers_rich_text() {
        assert_eq!(Value::str("a").as_text(), Some("a"));
        assert_eq!(Value::RichText("b".into()).as_text(), Some("b"));
        assert_eq!(Value::Int(1).as_text(), None);
    }

    #[test]
    fn state_id_accessor() {
        assert_eq!(Value::StateId(StateId(4)).as_state_id(), Some(StateId(4)));
        assert_eq!(Value::Int(4).as_state_id(), None);
    }
}
