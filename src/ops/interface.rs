use crate::prelude::*;

use crate::base::value::Value;
use std::any::Any;

/// Scratchpad carried by a resource while it is being processed: a
/// pre-processor may deposit values here for the matching post-processor of
/// the same resource. Cleared when the resource is dropped at the end of a
/// phase.
#[derive(Default)]
pub struct Supplies {
    slots: HashMap<String, Box<dyn Any + Send>>,
}

impl Supplies {
    pub fn put(&mut self, key: impl Into<String>, value: impl Any + Send) {
        self.slots.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.slots.get(key)?.downcast_ref()
    }

    pub fn take<T: Any>(&mut self, key: &str) -> Option<T> {
        let boxed = self.slots.remove(key)?;
        match boxed.downcast::<T>() {
            Ok(v) => Some(*v),
            Err(boxed) => {
                self.slots.insert(key.to_string(), boxed);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A single typed record from the input stream.
///
/// The `entity_type` string selects which entity plan applies. Attribute
/// access is by string key; `get` returning `Ok(None)` means the key is
/// absent, which projects as a null value.
pub trait Resource: Send {
    fn entity_type(&self) -> &str;

    fn get(&self, key: &str) -> Result<Option<Value>>;

    fn set(&mut self, key: &str, value: Value) -> Result<()>;

    /// Held keys, for debugging and diagnostics.
    fn keys(&self) -> Vec<String>;

    fn supplies(&mut self) -> &mut Supplies;
}

/// A restartable, finite sequence of resources. The engine traverses it once
/// per phase and calls `reset` in between.
pub trait ResourceIterator: Send {
    fn next(&mut self) -> Result<Option<Box<dyn Resource>>>;

    /// Return to the first resource. Idempotent.
    fn reset(&mut self) -> Result<()>;

    /// Approximate number of resources, if known.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// A string-keyed in-memory record, the simplest `Resource` adapter.
#[derive(Default)]
pub struct SimpleResource {
    entity_type: String,
    values: IndexMap<String, Value>,
    supplies: Supplies,
}

impl SimpleResource {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            ..Default::default()
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl Resource for SimpleResource {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    fn supplies(&mut self) -> &mut Supplies {
        &mut self.supplies
    }
}

/// Iterator over a fixed set of rows, materializing a fresh `SimpleResource`
/// per traversal. Suitable for tests and small in-memory inputs.
pub struct VecResourceIterator {
    rows: Vec<(String, IndexMap<String, Value>)>,
    pos: usize,
}

impl VecResourceIterator {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            pos: 0,
        }
    }

    pub fn push(&mut self, resource: SimpleResource) {
        self.rows.push((resource.entity_type, resource.values));
    }

    pub fn with(mut self, resource: SimpleResource) -> Self {
        self.push(resource);
        self
    }
}

impl Default for VecResourceIterator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceIterator for VecResourceIterator {
    fn next(&mut self) -> Result<Option<Box<dyn Resource>>> {
        let Some((entity_type, values)) = self.rows.get(self.pos) else {
            return Ok(None);
        };
        self.pos += 1;
        Ok(Some(Box::new(SimpleResource {
            entity_type: entity_type.clone(),
            values: values.clone(),
            supplies: Supplies::default(),
        })))
    }

    fn reset(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_resource_round_trip() {
        let mut res = SimpleResource::new("Flower").with("species", "setosa");
        assert_eq!(res.entity_type(), "Flower");
        assert_eq!(res.get("species").unwrap(), Some(Value::Str("setosa".into())));
        assert_eq!(res.get("missing").unwrap(), None);
        res.set("species", Value::Str("virginica".into())).unwrap();
        assert_eq!(
            res.get("species").unwrap(),
            Some(Value::Str("virginica".into()))
        );
        assert_eq!(res.keys(), vec!["species".to_string()]);
    }

    #[test]
    fn supplies_typed_round_trip() {
        let mut res = SimpleResource::new("Flower");
        res.supplies().put("count", 3usize);
        assert_eq!(res.supplies().get::<usize>("count"), Some(&3));
        assert_eq!(res.supplies().get::<String>("count"), None);
        assert_eq!(res.supplies().take::<usize>("count"), Some(3));
        assert!(res.supplies().is_empty());
    }

    #[test]
    fn vec_iterator_resets_with_fresh_supplies() {
        let mut iter = VecResourceIterator::new()
            .with(SimpleResource::new("A").with("x", 1i64))
            .with(SimpleResource::new("A").with("x", 2i64));
        assert_eq!(iter.len_hint(), Some(2));

        let mut first = iter.next().unwrap().unwrap();
        first.supplies().put("marker", true);
        assert!(iter.next().unwrap().is_some());
        assert!(iter.next().unwrap().is_none());

        iter.reset().unwrap();
        iter.reset().unwrap();
        let mut replayed = iter.next().unwrap().unwrap();
        assert_eq!(replayed.get("x").unwrap(), Some(Value::Int(1)));
        assert!(replayed.supplies().is_empty());
    }
}
