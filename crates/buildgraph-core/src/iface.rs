//! Interface specifications: a serialized value paired with the medials it
//! references.

use crate::context::Context;
use crate::error::Result;
use crate::value::{BindSink, Direction, Resolved, Value};

/// The serialized form of a transform field, with the medials extracted at
/// construction so the graph can bind producers and consumers without
/// re-walking values.
#[derive(Debug, Clone, PartialEq)]
pub struct IfaceSpec {
    pub value: Value,
    pub medials: Vec<String>,
}

impl IfaceSpec {
    pub fn new(value: Value) -> Self {
        let mut medials = Vec::new();
        value.walk_medials(&mut medials);
        Self { value, medials }
    }

    /// Resolve against a sandbox, binding values in as required.
    pub fn resolve(
        &self,
        ctx: &Context,
        sink: &mut dyn BindSink,
        direction: Direction,
    ) -> Result<Resolved> {
        self.value.resolve(ctx, sink, direction)
    }

    /// The tokens contributing to this interface's input hash.
    pub fn hashable_tokens(&self) -> Vec<serde_json::Value> {
        let mut tokens = Vec::new();
        self.value.walk_hashable(&mut tokens);
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn medials_are_scanned_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let spec = IfaceSpec::new(Value::path(&path).unwrap());
        assert_eq!(spec.medials, vec![path.to_string_lossy().into_owned()]);

        let spec = IfaceSpec::new(Value::constant("just a string"));
        assert!(spec.medials.is_empty());
    }
}
