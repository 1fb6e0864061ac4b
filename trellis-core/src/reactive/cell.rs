//! Cell Implementation
//!
//! A Cell is the externally mutable reactive value: the analogue of a user
//! input. It holds a value of a type fixed at creation, a version that is
//! bumped on every committed write, and the constraints every write must
//! satisfy.
//!
//! # How Cells Work
//!
//! 1. A cell is declared with a [`CellSpec`]: label, initial value and any
//!    constraints (enumerated choices, inclusive bounds, custom rules).
//!
//! 2. Reading a cell inside an evaluator registers the evaluator's node as a
//!    dependent.
//!
//! 3. Writing a cell validates the value first. A rejected write fails with
//!    [`ReactiveError::InvalidInput`] and changes nothing. An accepted write
//!    is staged in the current batch (or a one-write batch of its own) and
//!    becomes visible when that batch commits.

use std::any::{type_name, Any};
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, trace};

use super::runtime::{Graph, Source};
use crate::error::{ReactiveError, Result};
use crate::graph::{AnyValue, Node, NodeId, NodeKind, Payload, Validator, ValueType};

type Rule<T> = Box<dyn Fn(&T) -> std::result::Result<(), String> + Send + Sync>;

/// Declaration of a cell: label, initial value and constraints.
///
/// # Example
///
/// ```rust
/// use trellis_core::{CellSpec, Graph};
///
/// let graph = Graph::new();
/// let bins = graph
///     .define_cell(CellSpec::new("seaborn_bin_count", 10_i64).between(2, 20))
///     .unwrap();
///
/// assert!(graph.set(&bins, 40).is_err());
/// assert_eq!(graph.get(&bins).unwrap(), 10);
/// ```
pub struct CellSpec<T> {
    label: String,
    initial: T,
    rules: Vec<Rule<T>>,
}

impl<T> CellSpec<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(label: impl Into<String>, initial: T) -> Self {
        Self {
            label: label.into(),
            initial,
            rules: Vec::new(),
        }
    }

    /// Add a custom rule. The rule returns the rejection reason on failure.
    pub fn validate<F>(mut self, rule: F) -> Self
    where
        F: Fn(&T) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.rules.push(Box::new(rule));
        self
    }

    /// Only accept one of `choices`.
    pub fn one_of(self, choices: impl IntoIterator<Item = T>) -> Self
    where
        T: PartialEq + Debug,
    {
        let choices: Vec<T> = choices.into_iter().collect();
        self.validate(move |value| {
            if choices.contains(value) {
                Ok(())
            } else {
                Err(format!("{value:?} is not one of {choices:?}"))
            }
        })
    }

    /// Only accept values in `min..=max`.
    pub fn between(self, min: T, max: T) -> Self
    where
        T: PartialOrd + Debug,
    {
        self.validate(move |value| {
            if *value >= min && *value <= max {
                Ok(())
            } else {
                Err(format!("{value:?} is outside {min:?}..={max:?}"))
            }
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn check(&self, value: &T) -> std::result::Result<(), String> {
        self.rules.iter().try_for_each(|rule| rule(value))
    }

    fn into_parts(self) -> (String, T, Validator) {
        let rules = self.rules;
        let validator: Validator = Arc::new(move |value: &(dyn Any + Send + Sync)| {
            let value = value
                .downcast_ref::<T>()
                .ok_or_else(|| format!("expected a value of type `{}`", type_name::<T>()))?;
            rules.iter().try_for_each(|rule| rule(value))
        });
        (self.label, self.initial, validator)
    }
}

impl<E> CellSpec<Vec<E>>
where
    E: PartialEq + Debug + Send + Sync + 'static,
{
    /// Multi-select: every selected element must be one of `choices`.
    pub fn subset_of(self, choices: impl IntoIterator<Item = E>) -> Self {
        let choices: Vec<E> = choices.into_iter().collect();
        self.validate(move |selected| {
            match selected.iter().find(|item| !choices.contains(*item)) {
                Some(item) => Err(format!("{item:?} is not one of {choices:?}")),
                None => Ok(()),
            }
        })
    }
}

impl<T: Debug> Debug for CellSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellSpec")
            .field("label", &self.label)
            .field("initial", &self.initial)
            .field("rules", &self.rules.len())
            .finish()
    }
}

/// Typed handle to a cell registered on a [`Graph`].
pub struct Cell<T> {
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Cell<T> {
    pub(crate) fn new(id: NodeId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Cell<T> {}

impl<T> Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cell").field(&self.id).finish()
    }
}

impl<T> Source<T> for Cell<T> {
    fn node_id(&self) -> NodeId {
        self.id
    }
}

impl Graph {
    /// Register a cell. The initial value must pass the declared constraints.
    pub fn define_cell<T>(&self, spec: CellSpec<T>) -> Result<Cell<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        if let Err(reason) = spec.check(&spec.initial) {
            return Err(ReactiveError::InvalidInput {
                cell: spec.label,
                reason,
            });
        }
        let (label, initial, validator) = spec.into_parts();
        let node = Node::cell(label, ValueType::of::<T>(), Arc::new(initial), validator);
        let label = node.label().to_string();

        let id = self.scheduler.borrow_mut().add_node(node)?;
        debug!(cell = %label, %id, "cell defined");
        Ok(Cell::new(id))
    }

    /// Look up a cell by label, checking its value type.
    pub fn cell<T: 'static>(&self, label: &str) -> Result<Cell<T>> {
        self.lookup_typed(label, NodeKind::Cell, ValueType::of::<T>())
            .map(Cell::new)
    }

    /// Write a cell.
    ///
    /// Outside a batch the write commits immediately. Inside one it is
    /// staged and committed together with the rest of the batch.
    pub fn set<T>(&self, cell: &Cell<T>, value: T) -> Result<()>
    where
        T: Send + Sync + 'static,
    {
        self.write(cell.id(), Arc::new(value))
    }

    /// Write a cell through a type-erased value, as delivered by a UI layer
    /// that only knows cells by label. The value must have the cell's type.
    pub fn set_dyn(&self, label: &str, value: Box<dyn Any + Send + Sync>) -> Result<()> {
        let id = self.scheduler.borrow().lookup(label)?;
        self.write(id, Arc::from(value))
    }

    /// Write a cell with a value computed from its latest value: the write
    /// staged in the open batch if there is one, else the committed value.
    pub fn update<T, F>(&self, cell: &Cell<T>, f: F) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> T,
    {
        let staged = self.scheduler.borrow().staged(cell.id());
        let current = match staged {
            Some(value) => self.downcast(cell.id(), value)?,
            None => self.get_untracked(cell)?,
        };
        self.set(cell, f(&current))
    }

    fn write(&self, id: NodeId, value: AnyValue) -> Result<()> {
        if let Some(active) = self.stack.borrow().current() {
            let scheduler = self.scheduler.borrow();
            return Err(ReactiveError::WriteDuringEvaluation {
                cell: scheduler.label_of(id),
                node: scheduler.label_of(active),
            });
        }

        let label = {
            let scheduler = self.scheduler.borrow();
            let node = scheduler.node(id)?;
            let label = node.label().to_string();
            let Payload::Cell(slot) = &node.payload else {
                return Err(ReactiveError::InvalidInput {
                    cell: label,
                    reason: "only cells can be written".to_string(),
                });
            };
            if (*value).type_id() != node.value_type().id {
                return Err(ReactiveError::InvalidInput {
                    cell: label,
                    reason: format!("expected a value of type `{}`", node.value_type().name),
                });
            }
            if let Err(reason) = (slot.validator)(&*value) {
                return Err(ReactiveError::InvalidInput { cell: label, reason });
            }
            label
        };

        let implicit = !self.in_batch();
        if implicit {
            self.begin_batch()?;
        }
        self.scheduler.borrow_mut().stage(id, value)?;
        trace!(cell = %label, "write staged");
        if implicit {
            self.end_batch()?;
        }
        Ok(())
    }
}
