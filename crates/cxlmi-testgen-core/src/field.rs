/// One named member of a declarative struct description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldNode {
    pub name: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Literal in C syntax (`0x1234`, `CXLMI_FOO`, `7`), emitted verbatim.
    Scalar(String),
    /// Embedded struct; members in declaration order.
    Composite(Vec<FieldNode>),
    /// Fixed-size array of embedded structs. Never empty.
    Array(Vec<Vec<FieldNode>>),
}

impl FieldNode {
    pub fn scalar(name: impl Into<String>, literal: impl Into<String>) -> Self {
        FieldNode {
            name: name.into(),
            value: FieldValue::Scalar(literal.into()),
        }
    }

    pub fn composite(name: impl Into<String>, members: Vec<FieldNode>) -> Self {
        FieldNode {
            name: name.into(),
            value: FieldValue::Composite(members),
        }
    }

    pub fn array(name: impl Into<String>, elements: Vec<Vec<FieldNode>>) -> Self {
        FieldNode {
            name: name.into(),
            value: FieldValue::Array(elements),
        }
    }

    /// Number of scalar leaves beneath (and including) this node.
    pub fn scalar_count(&self) -> usize {
        match &self.value {
            FieldValue::Scalar(_) => 1,
            FieldValue::Composite(members) => members.iter().map(FieldNode::scalar_count).sum(),
            FieldValue::Array(elements) => elements
                .iter()
                .flat_map(|e| e.iter())
                .map(FieldNode::scalar_count)
                .sum(),
        }
    }
}

/// Root of a request or response description: the members of the handler's struct.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructTree {
    pub members: Vec<FieldNode>,
}

impl StructTree {
    pub fn new(members: Vec<FieldNode>) -> Self {
        StructTree { members }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn scalar_count(&self) -> usize {
        self.members.iter().map(FieldNode::scalar_count).sum()
    }
}
