//! Parameter binding.
//!
//! [`ParamBinder`] fixes a slot order for a query's declared parameters
//! before any value is bound, so positional (1-based) indices map to the same
//! declared names on every run regardless of map iteration order:
//!
//! 1. reserve slots `1..=N`;
//! 2. place each positional name `pK` at slot `K` (when `K <= N`);
//! 3. fill the remaining slots with the other names in ascending order.

use std::sync::Arc;

use crate::error::{ParameterError, Result};
use crate::service::Value;

use super::parser::positional_index;
use super::types::{BindValue, BoundParam, CoerceError, ParamSet, ParamType, Query};

#[derive(Debug, Clone)]
struct Slot {
    name: String,
    declared: Option<ParamType>,
    bound: Option<(ParamType, Value)>,
}

/// Binds values to a query's parameters and accumulates batches.
#[derive(Debug, Clone)]
pub struct ParamBinder {
    query: Arc<Query>,
    slots: Vec<Slot>,
    batch: Vec<ParamSet>,
}

impl ParamBinder {
    /// Creates a binder with slots assigned for `query`.
    pub fn new(query: Arc<Query>) -> Self {
        let slots = assign_slots(&query)
            .into_iter()
            .map(|name| {
                let declared = query.params().get(&name).cloned().flatten();
                Slot {
                    name,
                    declared,
                    bound: None,
                }
            })
            .collect();
        Self {
            query,
            slots,
            batch: Vec::new(),
        }
    }

    pub fn query(&self) -> &Arc<Query> {
        &self.query
    }

    /// Slot names in positional order.
    pub fn slot_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn param_count(&self) -> usize {
        self.slots.len()
    }

    /// Binds a value by 1-based position.
    ///
    /// `hint` supplies a type for parameters the query declares without one.
    pub fn set_by_index(
        &mut self,
        index: usize,
        value: impl Into<BindValue>,
        hint: Option<ParamType>,
    ) -> Result<()> {
        let count = self.slots.len();
        if index == 0 || index > count {
            return Err(ParameterError::OutOfRange { index, count }.into());
        }
        let slot = &mut self.slots[index - 1];
        slot.bound = Some(coerce(slot, value.into(), hint)?);
        Ok(())
    }

    /// Binds a value by name. A leading `$` is accepted.
    pub fn set_by_name(
        &mut self,
        name: &str,
        value: impl Into<BindValue>,
        hint: Option<ParamType>,
    ) -> Result<()> {
        let name = name.strip_prefix('$').unwrap_or(name);
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| ParameterError::NotFound(name.to_string()))?;
        slot.bound = Some(coerce(slot, value.into(), hint)?);
        Ok(())
    }

    /// Clears current bindings. Batched entries are kept.
    pub fn clear_parameters(&mut self) {
        for slot in &mut self.slots {
            slot.bound = None;
        }
    }

    /// Builds the parameter set for the current bindings.
    ///
    /// Unbound nullable parameters are sent as NULL; unbound required ones fail.
    pub fn build(&self) -> Result<ParamSet> {
        let mut params = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let (ty, value) = match (&slot.bound, &slot.declared) {
                (Some((ty, value)), _) => (ty.clone(), value.clone()),
                (None, Some(ty)) if ty.is_optional() => (ty.clone(), Value::Null),
                (None, _) => {
                    return Err(ParameterError::MissingRequiredValue(slot.name.clone()).into())
                }
            };
            params.push(BoundParam {
                name: slot.name.clone(),
                ty,
                value,
            });
        }
        Ok(ParamSet::from_params(params))
    }

    /// Snapshots current bindings into the batch, then clears them.
    pub fn add_to_batch(&mut self) -> Result<()> {
        let set = self.build()?;
        self.batch.push(set);
        self.clear_parameters();
        Ok(())
    }

    pub fn batch(&self) -> &[ParamSet] {
        &self.batch
    }

    /// Takes the accumulated batch, leaving it empty.
    pub fn take_batch(&mut self) -> Vec<ParamSet> {
        std::mem::take(&mut self.batch)
    }

    pub fn clear_batch(&mut self) {
        self.batch.clear();
    }
}

/// Computes the deterministic slot order for `query`'s declared names.
pub fn assign_slots(query: &Query) -> Vec<String> {
    let count = query.param_count();
    let mut slots: Vec<Option<String>> = vec![None; count];

    for name in query.params().keys() {
        if let Some(k) = positional_index(name) {
            if k <= count && slots[k - 1].is_none() {
                slots[k - 1] = Some(name.clone());
            }
        }
    }

    let placed: Vec<String> = slots.iter().flatten().cloned().collect();
    // BTreeMap keys are already in ascending order.
    let mut remaining = query
        .params()
        .keys()
        .filter(|name| !placed.contains(name));
    slots
        .into_iter()
        .map(|slot| slot.or_else(|| remaining.next().cloned()).unwrap_or_default())
        .collect()
}

fn coerce(slot: &Slot, value: BindValue, hint: Option<ParamType>) -> Result<(ParamType, Value)> {
    match value {
        BindValue::Typed(typed) => {
            let expected = slot.declared.as_ref().or(hint.as_ref());
            if let Some(expected) = expected {
                if *expected != typed.ty {
                    return Err(ParameterError::TypeMismatch {
                        name: slot.name.clone(),
                        expected: expected.to_string(),
                        actual: typed.ty.to_string(),
                    }
                    .into());
                }
            }
            if typed.value.is_null() && !typed.ty.is_optional() {
                return Err(ParameterError::MissingRequiredValue(slot.name.clone()).into());
            }
            Ok((typed.ty, typed.value))
        }
        BindValue::Raw(value) => {
            let ty = match slot.declared.clone().or(hint) {
                Some(ty) => ty,
                None => ParamType::infer(&value).ok_or_else(|| ParameterError::TypeMismatch {
                    name: slot.name.clone(),
                    expected: "a typed value".to_string(),
                    actual: value.kind_name().to_string(),
                })?,
            };
            match ty.coerce(value) {
                Ok(value) => Ok((ty, value)),
                Err(CoerceError::Missing) => {
                    Err(ParameterError::MissingRequiredValue(slot.name.clone()).into())
                }
                Err(CoerceError::Mismatch(actual)) => Err(ParameterError::TypeMismatch {
                    name: slot.name.clone(),
                    expected: ty.to_string(),
                    actual: actual.to_string(),
                }
                .into()),
            }
        }
    }
}
