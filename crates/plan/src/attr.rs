use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// A stable numeric id for one attribute of a relational plan node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, From, Display, Serialize, Deserialize,
)]
pub struct AttributeId(pub u32);

/// Identity of a [`RowDescriptor`]. Row-context frames are keyed by this,
/// not by pointer identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, From, Display, Serialize, Deserialize,
)]
pub struct DescriptorId(pub u32);

/// Maps attribute ids to positional indices in the rows a relation
/// produces. Operators resolve column references through this at
/// emission time, so runtime row access is a plain index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowDescriptor {
    pub id: DescriptorId,
    /// Attribute ids in row position order.
    pub attrs: Vec<AttributeId>,
}

impl RowDescriptor {
    pub fn new(id: impl Into<DescriptorId>, attrs: impl IntoIterator<Item = u32>) -> Self {
        RowDescriptor { id: id.into(), attrs: attrs.into_iter().map(AttributeId).collect() }
    }

    pub fn arity(&self) -> usize {
        self.attrs.len()
    }

    /// Position of `attr` in this relation's rows.
    pub fn index_of(&self, attr: AttributeId) -> Option<usize> {
        self.attrs.iter().position(|a| *a == attr)
    }

    /// The descriptor of a join output: left attributes then right.
    pub fn concat(id: impl Into<DescriptorId>, left: &RowDescriptor, right: &RowDescriptor) -> Self {
        RowDescriptor {
            id: id.into(),
            attrs: left.attrs.iter().chain(&right.attrs).copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn position_lookup() {
        let d = RowDescriptor::new(1, [10, 11, 12]);
        assert_eq!(d.index_of(AttributeId(11)), Some(1));
        assert_eq!(d.index_of(AttributeId(99)), None);
        assert_eq!(d.arity(), 3);
    }

    #[test]
    fn join_descriptor_concatenates() {
        let l = RowDescriptor::new(1, [10, 11]);
        let r = RowDescriptor::new(2, [20]);
        let j = RowDescriptor::concat(3, &l, &r);
        assert_eq!(j.index_of(AttributeId(20)), Some(2));
    }
}
