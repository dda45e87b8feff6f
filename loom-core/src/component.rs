//! Component definitions, instances and the resolver that derives an
//! instance's effective properties.
//!
//! Resolution order for `(instance, layer, key)`:
//!
//! 1. the instance override, when the template layer has that property;
//! 2. the template value: a bound parameter's value, else the layer's own.
//!
//! Resolved values are cached per instance. Changing a definition drops the
//! cache of every instance that references it, immediately and without
//! batching.
//!
//! In a shared document, definitions and instances are ordinary nodes:
//! a `ComponentTemplate` subtree is a definition (`param.*` and
//! `options.*` on its root declare parameters, `bind.*` on its layers bind
//! them) and a `ComponentInstance` node references one through
//! `component`, with `override.<layer>.<key>` properties.
//! [`ComponentResolver::load_tree`] and [`ComponentResolver::apply_change`]
//! keep the resolver in step with the materialized tree.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use uuid::Uuid;

use crate::document::StateChange;
use crate::keys;
use crate::tree::{Node, NodeKind, ObjectTree, TreeError};
use crate::value::{PropertyValue, ValueKind};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolveError {
    #[error("component instance {0} not found")]
    UnknownInstance(Uuid),
    #[error("component definition {0} not found")]
    UnknownDefinition(Uuid),
    #[error("layer {layer} not found in definition {definition}")]
    LayerNotFound { definition: Uuid, layer: Uuid },
    #[error("layer {layer} has no property {key}")]
    PropertyNotFound { layer: Uuid, key: String },
    #[error("definition {definition} has no parameter {name}")]
    UnknownParameter { definition: Uuid, name: String },
    #[error("value {value:?} is not valid for parameter {name}")]
    ParameterType { name: String, value: PropertyValue },
    #[error("override for {key} expects {expected}, got {found}")]
    OverrideType { key: String, expected: ValueKind, found: ValueKind },
    #[error(transparent)]
    Tree(#[from] TreeError),
}

impl ResolveError {
    /// Missing layers and properties degrade gracefully during whole-instance
    /// resolution.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ResolveError::LayerNotFound { .. } | ResolveError::PropertyNotFound { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    Boolean,
    Text,
    Number,
    Choice(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub kind: ParameterKind,
    pub value: PropertyValue,
}

impl Parameter {
    pub fn new(name: impl Into<String>, kind: ParameterKind, value: PropertyValue) -> Self {
        Self { name: name.into(), kind, value }
    }

    pub fn accepts(&self, value: &PropertyValue) -> bool {
        match (&self.kind, value) {
            (ParameterKind::Boolean, PropertyValue::Bool(_)) => true,
            (ParameterKind::Text, PropertyValue::Text(_)) => true,
            (ParameterKind::Number, PropertyValue::Number(_)) => true,
            (ParameterKind::Choice(options), PropertyValue::Text(choice)) => options.contains(choice),
            _ => false,
        }
    }
}

pub struct ComponentDefinition {
    pub id: Uuid,
    pub name: String,
    parameters: BTreeMap<String, Parameter>,
    template: ObjectTree,
}

impl ComponentDefinition {
    pub fn new(name: impl Into<String>, template: ObjectTree) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            parameters: BTreeMap::new(),
            template,
        }
    }

    /// Add a parameter whose current value must match its kind.
    pub fn add_parameter(&mut self, parameter: Parameter) -> Result<(), ResolveError> {
        if !parameter.accepts(&parameter.value) {
            return Err(ResolveError::ParameterType {
                name: parameter.name.clone(),
                value: parameter.value.clone(),
            });
        }
        self.parameters.insert(parameter.name.clone(), parameter);
        Ok(())
    }

    /// Definition for the `ComponentTemplate` node `root` of a document
    /// tree. The definition takes the node's id; parameters come from the
    /// node's `param.*` properties.
    pub fn from_tree(tree: &ObjectTree, root: Uuid) -> Result<Self, ResolveError> {
        let node = tree.get(root).ok_or(TreeError::NodeNotFound(root))?;
        let mut definition = Self {
            id: root,
            name: node.name.clone(),
            parameters: BTreeMap::new(),
            template: tree.subtree(root)?,
        };
        for (key, value) in &node.extra {
            let Some(name) = key.strip_prefix(keys::PARAM_PREFIX) else { continue };
            let options = node
                .extra
                .get(&format!("{}{name}", keys::OPTIONS_PREFIX))
                .and_then(PropertyValue::as_text);
            let kind = match (options, value.kind()) {
                (Some(options), _) => {
                    ParameterKind::Choice(options.split(',').map(|o| o.trim().to_string()).collect())
                }
                (None, ValueKind::Bool) => ParameterKind::Boolean,
                (None, ValueKind::Text) => ParameterKind::Text,
                (None, ValueKind::Number) => ParameterKind::Number,
                (None, other) => {
                    warn!("Component {root}: parameter {name} has unsupported kind {other}");
                    continue;
                }
            };
            if let Err(e) = definition.add_parameter(Parameter::new(name, kind, value.clone())) {
                warn!("Component {root}: skipping parameter {name}: {e}");
            }
        }
        Ok(definition)
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }

    pub fn parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.values()
    }

    pub fn template(&self) -> &ObjectTree {
        &self.template
    }

    /// Template value of one layer property: a bound parameter wins over
    /// the layer's own value.
    pub fn template_value(&self, layer: Uuid, key: &str) -> Result<PropertyValue, ResolveError> {
        let node = self
            .template
            .get(layer)
            .ok_or(ResolveError::LayerNotFound { definition: self.id, layer })?;
        if let Some(parameter) = node.bindings.get(key).and_then(|p| self.parameters.get(p)) {
            return Ok(parameter.value.clone());
        }
        node.property(key)
            .ok_or_else(|| ResolveError::PropertyNotFound { layer, key: key.to_string() })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentInstance {
    pub id: Uuid,
    /// Looked up on every resolution; the definition may be gone.
    pub definition_id: Uuid,
    pub overrides: HashMap<Uuid, BTreeMap<String, PropertyValue>>,
}

impl ComponentInstance {
    /// Instance described by a `ComponentInstance` node, or `None` when the
    /// node references no definition.
    pub fn from_node(node: &Node) -> Option<Self> {
        let definition_id = node.component?;
        let mut overrides: HashMap<Uuid, BTreeMap<String, PropertyValue>> = HashMap::new();
        for (key, value) in &node.extra {
            let Some(rest) = key.strip_prefix(keys::OVERRIDE_PREFIX) else { continue };
            let Some((layer, property)) = rest.split_once('.') else { continue };
            match layer.parse::<Uuid>() {
                Ok(layer) => {
                    overrides.entry(layer).or_default().insert(property.to_string(), value.clone());
                }
                Err(_) => warn!("Instance {}: bad override key {}", node.id, key),
            }
        }
        Some(Self { id: node.id, definition_id, overrides })
    }

    pub fn override_value(&self, layer: Uuid, key: &str) -> Option<&PropertyValue> {
        self.overrides.get(&layer).and_then(|props| props.get(key))
    }
}

/// Every template layer of an instance with its resolved properties.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedInstance {
    pub instance_id: Uuid,
    pub layers: BTreeMap<Uuid, BTreeMap<String, PropertyValue>>,
}

impl ResolvedInstance {
    pub fn value(&self, layer: Uuid, key: &str) -> Option<&PropertyValue> {
        self.layers.get(&layer).and_then(|props| props.get(key))
    }
}

#[derive(Default)]
pub struct ComponentResolver {
    definitions: HashMap<Uuid, ComponentDefinition>,
    instances: HashMap<Uuid, ComponentInstance>,
    dependents: HashMap<Uuid, BTreeSet<Uuid>>,
    cache: HashMap<Uuid, HashMap<(Uuid, String), PropertyValue>>,
}

impl ComponentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_definition(&mut self, definition: ComponentDefinition) -> Uuid {
        let id = definition.id;
        self.definitions.insert(id, definition);
        self.invalidate_dependents(id);
        id
    }

    /// Instances keep their reference and fail with `UnknownDefinition`
    /// until a definition with the same id is registered again.
    pub fn remove_definition(&mut self, id: Uuid) -> Option<ComponentDefinition> {
        let removed = self.definitions.remove(&id);
        self.invalidate_dependents(id);
        removed
    }

    pub fn definition(&self, id: Uuid) -> Option<&ComponentDefinition> {
        self.definitions.get(&id)
    }

    pub fn create_instance(&mut self, definition_id: Uuid) -> Result<Uuid, ResolveError> {
        if !self.definitions.contains_key(&definition_id) {
            return Err(ResolveError::UnknownDefinition(definition_id));
        }
        let instance = ComponentInstance {
            id: Uuid::new_v4(),
            definition_id,
            overrides: HashMap::new(),
        };
        let id = instance.id;
        self.dependents.entry(definition_id).or_default().insert(id);
        self.instances.insert(id, instance);
        Ok(id)
    }

    pub fn remove_instance(&mut self, id: Uuid) -> Option<ComponentInstance> {
        let instance = self.instances.remove(&id)?;
        if let Some(set) = self.dependents.get_mut(&instance.definition_id) {
            set.remove(&id);
        }
        self.cache.remove(&id);
        Some(instance)
    }

    pub fn instance(&self, id: Uuid) -> Option<&ComponentInstance> {
        self.instances.get(&id)
    }

    pub fn instances_of(&self, definition_id: Uuid) -> Vec<Uuid> {
        self.dependents
            .get(&definition_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Override one layer property on an instance. The property must exist
    /// on the template layer and the value must keep its kind.
    pub fn set_override(
        &mut self,
        instance_id: Uuid,
        layer: Uuid,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), ResolveError> {
        let instance = self
            .instances
            .get(&instance_id)
            .ok_or(ResolveError::UnknownInstance(instance_id))?;
        let definition = self
            .definitions
            .get(&instance.definition_id)
            .ok_or(ResolveError::UnknownDefinition(instance.definition_id))?;
        let current = definition.template_value(layer, key)?;
        if current.kind() != value.kind() {
            return Err(ResolveError::OverrideType {
                key: key.to_string(),
                expected: current.kind(),
                found: value.kind(),
            });
        }

        if let Some(instance) = self.instances.get_mut(&instance_id) {
            instance.overrides.entry(layer).or_default().insert(key.to_string(), value);
        }
        self.cache.remove(&instance_id);
        Ok(())
    }

    /// Returns whether an override was present.
    pub fn clear_override(
        &mut self,
        instance_id: Uuid,
        layer: Uuid,
        key: &str,
    ) -> Result<bool, ResolveError> {
        let instance = self
            .instances
            .get_mut(&instance_id)
            .ok_or(ResolveError::UnknownInstance(instance_id))?;
        let removed = instance
            .overrides
            .get_mut(&layer)
            .and_then(|props| props.remove(key))
            .is_some();
        if removed {
            self.cache.remove(&instance_id);
        }
        Ok(removed)
    }

    /// Effective value of one property of one instance layer.
    pub fn resolve_value(
        &mut self,
        instance_id: Uuid,
        layer: Uuid,
        key: &str,
    ) -> Result<PropertyValue, ResolveError> {
        let cache_key = (layer, key.to_string());
        if let Some(hit) = self.cache.get(&instance_id).and_then(|c| c.get(&cache_key)) {
            return Ok(hit.clone());
        }
        let value = self.compute(instance_id, layer, key)?;
        self.cache
            .entry(instance_id)
            .or_default()
            .insert(cache_key, value.clone());
        Ok(value)
    }

    /// Resolve every property of every template layer. Properties that
    /// cannot be found are skipped.
    pub fn resolve_instance(&mut self, instance_id: Uuid) -> Result<ResolvedInstance, ResolveError> {
        let instance = self
            .instances
            .get(&instance_id)
            .ok_or(ResolveError::UnknownInstance(instance_id))?;
        let definition = self
            .definitions
            .get(&instance.definition_id)
            .ok_or(ResolveError::UnknownDefinition(instance.definition_id))?;

        let mut wanted: Vec<(Uuid, String)> = definition
            .template()
            .nodes()
            .flat_map(|node| node.property_keys().into_iter().map(move |k| (node.id, k)))
            .collect();
        wanted.sort();

        let mut resolved = ResolvedInstance { instance_id, layers: BTreeMap::new() };
        for (layer, key) in wanted {
            match self.resolve_value(instance_id, layer, &key) {
                Ok(value) => {
                    resolved.layers.entry(layer).or_default().insert(key, value);
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(resolved)
    }

    /// Change a definition parameter and invalidate every dependent
    /// instance. Returns the number of instances invalidated.
    pub fn update_component_property(
        &mut self,
        definition_id: Uuid,
        name: &str,
        value: PropertyValue,
    ) -> Result<usize, ResolveError> {
        let definition = self
            .definitions
            .get_mut(&definition_id)
            .ok_or(ResolveError::UnknownDefinition(definition_id))?;
        let parameter = definition.parameters.get_mut(name).ok_or_else(|| {
            ResolveError::UnknownParameter { definition: definition_id, name: name.to_string() }
        })?;
        if !parameter.accepts(&value) {
            return Err(ResolveError::ParameterType { name: name.to_string(), value });
        }
        parameter.value = value;
        Ok(self.invalidate_dependents(definition_id))
    }

    /// Change a property of one template layer and invalidate every
    /// dependent instance.
    pub fn update_template_layer(
        &mut self,
        definition_id: Uuid,
        layer: Uuid,
        key: &str,
        value: PropertyValue,
    ) -> Result<usize, ResolveError> {
        let definition = self
            .definitions
            .get_mut(&definition_id)
            .ok_or(ResolveError::UnknownDefinition(definition_id))?;
        if !definition.template.contains(layer) {
            return Err(ResolveError::LayerNotFound { definition: definition_id, layer });
        }
        definition.template.set_property(layer, key, value)?;
        Ok(self.invalidate_dependents(definition_id))
    }

    /// Replace every definition and instance with the components of a
    /// materialized document tree. Returns the number of instances loaded.
    pub fn load_tree(&mut self, tree: &ObjectTree) -> Result<usize, ResolveError> {
        self.definitions.clear();
        self.instances.clear();
        self.dependents.clear();
        self.cache.clear();

        for node in tree.nodes() {
            match node.kind {
                NodeKind::ComponentTemplate => {
                    let definition = ComponentDefinition::from_tree(tree, node.id)?;
                    self.definitions.insert(definition.id, definition);
                }
                NodeKind::ComponentInstance => {
                    if let Some(instance) = ComponentInstance::from_node(node) {
                        self.dependents.entry(instance.definition_id).or_default().insert(instance.id);
                        self.instances.insert(instance.id, instance);
                    }
                }
                _ => {}
            }
        }
        debug!(
            "Loaded {} component(s) and {} instance(s) from the document",
            self.definitions.len(),
            self.instances.len()
        );
        Ok(self.instances.len())
    }

    /// Follow one committed document change. `tree` must already reflect it.
    ///
    /// Edits inside a template rebuild that definition and invalidate all
    /// of its instances; edits on an instance node refresh that instance;
    /// structural edits reload everything. Returns the number of instances
    /// invalidated.
    pub fn apply_change(&mut self, tree: &ObjectTree, change: &StateChange) -> Result<usize, ResolveError> {
        if keys::STRUCTURAL.contains(&change.key.as_str()) {
            return self.load_tree(tree);
        }
        let Some(node) = tree.get(change.object_id) else {
            return Ok(0);
        };

        if node.kind == NodeKind::ComponentInstance {
            if let Some(old) = self.instances.remove(&node.id) {
                if let Some(set) = self.dependents.get_mut(&old.definition_id) {
                    set.remove(&node.id);
                }
            }
            self.cache.remove(&node.id);
            if let Some(instance) = ComponentInstance::from_node(node) {
                self.dependents.entry(instance.definition_id).or_default().insert(instance.id);
                self.instances.insert(instance.id, instance);
            }
            return Ok(1);
        }

        let owner = std::iter::once(node.id)
            .chain(tree.ancestors(node.id))
            .find(|id| tree.get(*id).is_some_and(|n| n.kind == NodeKind::ComponentTemplate));
        match owner {
            Some(template) => {
                let definition = ComponentDefinition::from_tree(tree, template)?;
                self.definitions.insert(template, definition);
                Ok(self.invalidate_dependents(template))
            }
            None => Ok(0),
        }
    }

    fn compute(&self, instance_id: Uuid, layer: Uuid, key: &str) -> Result<PropertyValue, ResolveError> {
        let instance = self
            .instances
            .get(&instance_id)
            .ok_or(ResolveError::UnknownInstance(instance_id))?;
        let definition = self
            .definitions
            .get(&instance.definition_id)
            .ok_or(ResolveError::UnknownDefinition(instance.definition_id))?;
        let template = definition.template_value(layer, key)?;
        Ok(instance.override_value(layer, key).cloned().unwrap_or(template))
    }

    fn invalidate_dependents(&mut self, definition_id: Uuid) -> usize {
        let Some(instances) = self.dependents.get(&definition_id) else {
            return 0;
        };
        for id in instances {
            self.cache.remove(id);
        }
        debug!("Invalidated {} instance(s) of component {}", instances.len(), definition_id);
        instances.len()
    }
}
