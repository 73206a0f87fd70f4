//! Step registry
//!
//! Maps step topics to their definitions. Built and validated once at
//! startup; read-only afterwards, so lookups need no locking.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{StepBuilder, StepCallback, StepDefaults, StepDefinition};

/// Registry construction failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A step was declared with an empty topic
    #[error("step topic must not be empty")]
    EmptyTopic,

    /// Two steps share a topic
    #[error("duplicate step topic: {0}")]
    DuplicateTopic(String),

    /// Two callbacks share a name
    #[error("duplicate callback name: {0}")]
    DuplicateCallback(String),

    /// A step references a callback that was never registered
    #[error("step {topic} references unknown callback {callback}")]
    UnknownCallback { topic: String, callback: String },
}

/// Immutable topic to step mapping
///
/// # Example
///
/// ```
/// use stepflow::workflow::{handler_fn, StepDefinition, StepOutcome, WorkflowRegistry};
///
/// let registry = WorkflowRegistry::builder()
///     .step(StepDefinition::builder(
///         "orders.charge",
///         handler_fn(|_| async { Ok(StepOutcome::success()) }),
///     ).next("orders.ship"))
///     .step(StepDefinition::builder(
///         "orders.ship",
///         handler_fn(|_| async { Ok(StepOutcome::success()) }),
///     ))
///     .build()
///     .unwrap();
///
/// assert!(registry.get("orders.charge").is_some());
/// ```
pub struct WorkflowRegistry {
    steps: HashMap<String, Arc<StepDefinition>>,
    callbacks: HashMap<String, Arc<dyn StepCallback>>,
}

impl WorkflowRegistry {
    /// Start declaring steps
    pub fn builder() -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder::default()
    }

    /// Look up the step bound to `topic`
    pub fn get(&self, topic: &str) -> Option<&Arc<StepDefinition>> {
        self.steps.get(topic)
    }

    /// Look up a callback by name
    pub fn callback(&self, name: &str) -> Option<&Arc<dyn StepCallback>> {
        self.callbacks.get(name)
    }

    /// Registered topics, sorted
    pub fn topics(&self) -> Vec<&str> {
        let mut topics: Vec<_> = self.steps.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.steps.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut callbacks: Vec<_> = self.callbacks.keys().collect();
        callbacks.sort_unstable();
        f.debug_struct("WorkflowRegistry")
            .field("topics", &self.topics())
            .field("callbacks", &callbacks)
            .finish()
    }
}

/// Collects step and callback declarations for [`WorkflowRegistry`]
#[derive(Default)]
pub struct WorkflowRegistryBuilder {
    defaults: StepDefaults,
    steps: Vec<StepBuilder>,
    callbacks: Vec<(String, Arc<dyn StepCallback>)>,
}

impl WorkflowRegistryBuilder {
    /// Policy for steps that do not set their own timeout, retries or backoff
    pub fn with_defaults(mut self, defaults: StepDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Declare a step
    pub fn step(mut self, step: StepBuilder) -> Self {
        self.steps.push(step);
        self
    }

    /// Register a named callback
    pub fn callback(mut self, name: impl Into<String>, callback: Arc<dyn StepCallback>) -> Self {
        self.callbacks.push((name.into(), callback));
        self
    }

    /// Validate every declaration and freeze the registry
    pub fn build(self) -> Result<WorkflowRegistry, ValidationError> {
        let mut callbacks = HashMap::with_capacity(self.callbacks.len());
        for (name, callback) in self.callbacks {
            if callbacks.contains_key(&name) {
                return Err(ValidationError::DuplicateCallback(name));
            }
            callbacks.insert(name, callback);
        }

        let mut steps = HashMap::with_capacity(self.steps.len());
        for step in self.steps {
            if step.topic.trim().is_empty() {
                return Err(ValidationError::EmptyTopic);
            }
            if steps.contains_key(&step.topic) {
                return Err(ValidationError::DuplicateTopic(step.topic));
            }
            for callback in [&step.on_success, &step.on_failure].into_iter().flatten() {
                if !callbacks.contains_key(callback) {
                    return Err(ValidationError::UnknownCallback {
                        topic: step.topic.clone(),
                        callback: callback.clone(),
                    });
                }
            }

            let definition = step.build(&self.defaults);
            steps.insert(definition.topic().to_string(), Arc::new(definition));
        }

        Ok(WorkflowRegistry { steps, callbacks })
    }
}
