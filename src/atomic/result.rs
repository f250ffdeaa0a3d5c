//! Operation results.
//!
//! The primary reports a [`CacheReturn`] for every update. For transform updates the
//! return carries one [`InvokeOutcome`] per key; partial returns for disjoint keys are
//! merged as they arrive. At completion the near node converts the accumulated return
//! into the [`UpdateOutcome`] shape the caller asked for.

use crate::core::types::{Key, Operation};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Result of running an entry processor against one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeOutcome {
    /// Value produced by the processor (`None` when it produced nothing).
    Value(Option<Bytes>),
    /// The processor failed for this key.
    Error(String),
}

/// Value carried by a return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnValue {
    /// Value stored before the update.
    Previous(Option<Bytes>),
    /// Per-key entry processor results.
    Transform(BTreeMap<Key, InvokeOutcome>),
}

/// Return of an update as reported by the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheReturn {
    pub value: Option<ReturnValue>,
    pub success: bool,
}

impl CacheReturn {
    /// Return with only a success flag.
    pub fn success(success: bool) -> Self {
        Self {
            value: None,
            success,
        }
    }

    /// Return carrying the previous value.
    pub fn previous(previous: Option<Bytes>, success: bool) -> Self {
        Self {
            value: Some(ReturnValue::Previous(previous)),
            success,
        }
    }

    /// Record the entry processor result for `key`.
    pub fn add_invoke_result(&mut self, key: Key, outcome: InvokeOutcome) {
        match &mut self.value {
            Some(ReturnValue::Transform(results)) => {
                results.insert(key, outcome);
            }
            _ => {
                let mut results = BTreeMap::new();
                results.insert(key, outcome);
                self.value = Some(ReturnValue::Transform(results));
            }
        }
    }

    /// Merge a partial return into this one.
    ///
    /// Transform results are unioned per key; the combined return succeeds only if
    /// both parts did.
    pub fn merge(&mut self, other: CacheReturn) {
        self.success = self.success && other.success;
        self.value = match (self.value.take(), other.value) {
            (Some(ReturnValue::Transform(mut mine)), Some(ReturnValue::Transform(theirs))) => {
                mine.extend(theirs);
                Some(ReturnValue::Transform(mine))
            }
            (None, theirs) => theirs,
            (mine, _) => mine,
        };
    }

    /// Whether the primary has something other than a success flag to return.
    pub fn has_value(&self) -> bool {
        match &self.value {
            Some(ReturnValue::Previous(previous)) => previous.is_some(),
            Some(ReturnValue::Transform(results)) => !results.is_empty(),
            None => false,
        }
    }

    /// Transform results, if any.
    pub fn invoke_results(&self) -> Option<&BTreeMap<Key, InvokeOutcome>> {
        match &self.value {
            Some(ReturnValue::Transform(results)) => Some(results),
            _ => None,
        }
    }
}

/// Result handed to the caller of an atomic update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Plain success flag.
    Success(bool),
    /// Previous value, when the caller asked for it.
    Previous(Option<Bytes>),
    /// Entry processor results.
    Transform(BTreeMap<Key, InvokeOutcome>),
    /// The return exactly as reported by the primary.
    Raw(CacheReturn),
}

impl UpdateOutcome {
    /// Convert the accumulated return into the shape requested by the caller.
    pub fn from_return(
        ret: CacheReturn,
        operation: Operation,
        return_value: bool,
        raw: bool,
    ) -> Self {
        if raw {
            return Self::Raw(ret);
        }

        if operation == Operation::Transform {
            return match ret.value {
                Some(ReturnValue::Transform(results)) => Self::Transform(results),
                _ => Self::Transform(BTreeMap::new()),
            };
        }

        if return_value {
            return match ret.value {
                Some(ReturnValue::Previous(previous)) => Self::Previous(previous),
                _ => Self::Previous(None),
            };
        }

        Self::Success(ret.success)
    }

    /// Success flag of the outcome.
    pub fn is_success(&self) -> bool {
        match self {
            Self::Success(success) => *success,
            Self::Raw(ret) => ret.success,
            Self::Previous(_) | Self::Transform(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &'static str) -> Key {
        Bytes::from_static(s.as_bytes())
    }

    fn transform(entries: &[(&'static str, &'static str)]) -> CacheReturn {
        let mut ret = CacheReturn::success(true);
        for (k, v) in entries {
            ret.add_invoke_result(
                key(k),
                InvokeOutcome::Value(Some(Bytes::from_static(v.as_bytes()))),
            );
        }
        ret
    }

    #[test]
    fn transform_merge_is_commutative() {
        let a = transform(&[("k1", "v1")]);
        let b = transform(&[("k2", "v2")]);

        let mut ab = a.clone();
        ab.merge(b.clone());
        let mut ba = b;
        ba.merge(a);

        assert_eq!(ab, ba);
        assert_eq!(ab.invoke_results().map(|r| r.len()), Some(2));
    }

    #[test]
    fn merge_into_empty_takes_other() {
        let mut ret = CacheReturn::success(true);
        ret.merge(transform(&[("k", "v")]));
        assert!(ret.has_value());
    }

    #[test]
    fn previous_none_has_no_value() {
        assert!(!CacheReturn::previous(None, true).has_value());
        assert!(CacheReturn::previous(Some(key("old")), true).has_value());
    }

    #[test]
    fn transform_without_results_is_empty_map() {
        let outcome =
            UpdateOutcome::from_return(CacheReturn::success(true), Operation::Transform, false, false);
        assert_eq!(outcome, UpdateOutcome::Transform(BTreeMap::new()));
    }

    #[test]
    fn plain_update_yields_success_flag() {
        let outcome = UpdateOutcome::from_return(
            CacheReturn::previous(Some(key("old")), false),
            Operation::Update,
            false,
            false,
        );
        assert_eq!(outcome, UpdateOutcome::Success(false));
    }

    #[test]
    fn return_value_yields_previous() {
        let outcome = UpdateOutcome::from_return(
            CacheReturn::previous(Some(key("old")), true),
            Operation::Update,
            true,
            false,
        );
        assert_eq!(outcome, UpdateOutcome::Previous(Some(key("old"))));
    }
}
