use crate::field::{FieldNode, FieldValue, StructTree};

const INDENT: &str = "    ";

pub(crate) fn pad(level: usize) -> String {
    INDENT.repeat(level)
}

/// Per-command sequence number. Every generated binding name carries it, so names
/// stay unique across the whole program without nested scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Seq(u32);

impl Seq {
    pub fn first() -> Seq {
        Seq(1)
    }

    #[must_use]
    pub fn next(self) -> Seq {
        Seq(self.0 + 1)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn request(self) -> String {
        format!("request_{}", self.0)
    }

    pub fn expected(self) -> String {
        format!("expected_{}", self.0)
    }

    pub fn actual(self) -> String {
        format!("actual_{}", self.0)
    }
}

/// A C expression naming a struct instance, and whether it is a pointer to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Place {
    expr: String,
    pointer: bool,
}

impl Place {
    pub fn value(expr: impl Into<String>) -> Place {
        Place {
            expr: expr.into(),
            pointer: false,
        }
    }

    pub fn pointer(expr: impl Into<String>) -> Place {
        Place {
            expr: expr.into(),
            pointer: true,
        }
    }

    /// Access expression for member `name`.
    pub fn member(&self, name: &str) -> String {
        if !self.pointer {
            return format!("{}.{name}", self.expr);
        }
        if self.expr.starts_with('&') {
            format!("({})->{name}", self.expr)
        } else {
            format!("{}->{name}", self.expr)
        }
    }

    /// Embedded sub-struct: always a plain value below this point.
    fn field(&self, name: &str) -> Place {
        Place::value(self.member(name))
    }

    fn value_element(&self, name: &str, idx: usize) -> Place {
        Place::value(format!("{}[{idx}]", self.member(name)))
    }

    fn address_of_element(&self, name: &str, idx: usize) -> Place {
        Place::pointer(format!("&{}[{idx}]", self.member(name)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub type_name: String,
    /// Brace-enclosed designated initializer, without a trailing `;`.
    pub initializer: String,
    pub assertions: Vec<Assertion>,
}

impl Rendered {
    /// `<type> <var> = { ... };` at `level`.
    pub fn declaration(&self, var: &str, level: usize) -> String {
        format!(
            "{}{} {var} = {};\n",
            pad(level),
            self.type_name,
            self.initializer
        )
    }
}

/// Renders `tree` as an initializer for `type_name`, plus one assertion per scalar
/// leaf comparing the `expected` value against the `actual` output, in declaration
/// order. The initializer's member lines are indented one level deeper than `level`.
///
/// Returns `None` for an empty tree; no instance should be declared for it.
pub fn render(
    tree: &StructTree,
    type_name: &str,
    expected: &Place,
    actual: &Place,
    level: usize,
) -> Option<Rendered> {
    if tree.is_empty() {
        return None;
    }
    let mut assertions = Vec::new();
    let initializer = render_members(&tree.members, expected, actual, level, &mut assertions);
    Some(Rendered {
        type_name: type_name.to_string(),
        initializer,
        assertions,
    })
}

fn render_members(
    members: &[FieldNode],
    expected: &Place,
    actual: &Place,
    level: usize,
    assertions: &mut Vec<Assertion>,
) -> String {
    let inner = pad(level + 1);
    let mut out = String::from("{\n");

    for m in members {
        let name = m.name.as_str();
        match &m.value {
            FieldValue::Scalar(lit) => {
                out.push_str(&format!("{inner}.{name} = {lit},\n"));
                assertions.push(Assertion {
                    expected: expected.member(name),
                    actual: actual.member(name),
                });
            }
            FieldValue::Composite(children) => {
                let body = render_members(
                    children,
                    &expected.field(name),
                    &actual.field(name),
                    level + 1,
                    assertions,
                );
                out.push_str(&format!("{inner}.{name} = {body},\n"));
            }
            FieldValue::Array(elements) => {
                let elem_pad = pad(level + 2);
                out.push_str(&format!("{inner}.{name} = {{\n"));
                for (idx, elem) in elements.iter().enumerate() {
                    let body = render_members(
                        elem,
                        &expected.value_element(name, idx),
                        &actual.address_of_element(name, idx),
                        level + 2,
                        assertions,
                    );
                    out.push_str(&format!("{elem_pad}{body},\n"));
                }
                out.push_str(&format!("{inner}}},\n"));
            }
        }
    }

    out.push_str(&pad(level));
    out.push('}');
    out
}
