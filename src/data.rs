//! Data structures for passing keys and values into and out of a batch.

use std::collections::hash_map::{Entry, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::mem;
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::error::ContractViolation;
use crate::fields::FieldSet;

/// Identifies one key within a single batch. Tokens are handed to the
/// `BatchFuture`s waiting on that key and used to pull the key's outcome out
/// of the `ValueSet` once the batch settles.
#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    pub(crate) fn duplicate(&self) -> Self {
        Token(self.0)
    }
}

/// Implemented by records that know which key they were loaded for. This is
/// how the loader matches the records returned by a fetch function back to
/// the callers that asked for them; position in the returned list means
/// nothing.
///
/// `entry_key` returns `None` for a record that doesn't carry a usable key.
/// Such a record makes the whole batch fail with
/// [`ContractViolation::MissingKey`].
pub trait KeyedEntry<Key> {
    fn entry_key(&self) -> Option<Key>;
}

impl<Key: Clone, Value> KeyedEntry<Key> for (Key, Value) {
    fn entry_key(&self) -> Option<Key> {
        Some(self.0.clone())
    }
}

/// What to do when a fetch function returns more than one record for the same
/// key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDuplicate {
    /// Fail the whole batch with [`ContractViolation::DuplicateKey`].
    #[default]
    Reject,
    KeepFirst,
    KeepLast,
}

/// The set of keys accumulating in an open batch, along with the union of the
/// fields every caller in the batch asked for.
#[derive(Debug)]
pub(crate) struct KeySet<Key: Eq + Hash> {
    // Keys are kept in the order they were first requested; the token for a
    // key is its 1-based position in `keys`. Keys are never removed, so
    // tokens stay stable for the life of the batch.
    keys: Vec<Key>,
    tokens: HashMap<Key, Token>,
    fields: FieldSet,
}

impl<Key: Eq + Hash + Clone> KeySet<Key> {
    pub(crate) fn new() -> Self {
        Self {
            keys: Vec::new(),
            tokens: HashMap::new(),
            fields: FieldSet::new(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn fields(&self) -> &FieldSet {
        &self.fields
    }

    /// Add a key to this KeySet, widening the batch projection to include
    /// `fields`, and return the token associated with that key. Adding a key
    /// that's already present returns the existing token.
    pub(crate) fn add_key(&mut self, key: Key, fields: &FieldSet) -> Token {
        self.merge_fields(fields);

        match self.tokens.entry(key) {
            Entry::Occupied(entry) => entry.get().duplicate(),
            Entry::Vacant(entry) => {
                self.keys.push(entry.key().clone());
                // keys.len() is at least 1 after the push
                let position = NonZeroUsize::new(self.keys.len()).unwrap_or(NonZeroUsize::MIN);
                let token = Token(position);
                entry.insert(token.duplicate());
                token
            }
        }
    }

    /// Widen the batch projection without adding a key.
    pub(crate) fn merge_fields(&mut self, fields: &FieldSet) {
        if !fields.is_subset(&self.fields) {
            self.fields = self.fields.union(fields);
        }
    }

    /// Take the keyset out of this particular &mut self instance, replacing it
    /// with an empty set. Helper method for when the state transitions out
    /// of Accumulating. The returned `KeyIndex` is kept by the loader to match
    /// records back to tokens; the `KeyBatch` goes to the fetch function.
    pub(crate) fn take(&mut self) -> (KeyIndex<Key>, KeyBatch<Key>) {
        let keys = mem::take(&mut self.keys);
        let tokens = mem::take(&mut self.tokens);
        let fields = mem::take(&mut self.fields);

        (KeyIndex { tokens }, KeyBatch { keys, fields })
    }
}

/// The keys of a dispatched batch, as handed to a fetch function: every key is
/// distinct, they're in the order they were first requested, and `fields` is
/// the union of the fields requested by every caller in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBatch<Key> {
    keys: Vec<Key>,
    fields: FieldSet,
}

impl<Key> KeyBatch<Key> {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// The projection the backend fetch must honor.
    pub fn fields(&self) -> &FieldSet {
        &self.fields
    }

    pub fn into_parts(self) -> (Vec<Key>, FieldSet) {
        (self.keys, self.fields)
    }
}

/// Token lookup for a dispatched batch.
#[derive(Debug)]
pub(crate) struct KeyIndex<Key> {
    tokens: HashMap<Key, Token>,
}

impl<Key> Default for KeyIndex<Key> {
    fn default() -> Self {
        Self {
            tokens: HashMap::new(),
        }
    }
}

impl<Key: Eq + Hash + Debug> KeyIndex<Key> {
    /// Pair each record returned by a fetch function with the token of the
    /// key it declares. Keys with no record are simply absent from the
    /// result; they settle as not found.
    pub(crate) fn into_values<Value: KeyedEntry<Key>>(
        self,
        records: impl IntoIterator<Item = Value>,
        on_duplicate: OnDuplicate,
    ) -> Result<ValueSet<Value>, ContractViolation> {
        let mut values = HashMap::with_capacity(self.tokens.len());

        for (position, record) in records.into_iter().enumerate() {
            let key = record
                .entry_key()
                .ok_or(ContractViolation::MissingKey { position })?;

            let token = match self.tokens.get(&key) {
                Some(token) => token.duplicate(),
                None => {
                    return Err(ContractViolation::UnexpectedKey {
                        key: format!("{:?}", key),
                    })
                }
            };

            match values.entry(token) {
                Entry::Vacant(entry) => {
                    entry.insert(record);
                }
                Entry::Occupied(mut entry) => match on_duplicate {
                    OnDuplicate::Reject => {
                        return Err(ContractViolation::DuplicateKey {
                            key: format!("{:?}", key),
                        })
                    }
                    OnDuplicate::KeepFirst => {}
                    OnDuplicate::KeepLast => {
                        entry.insert(record);
                    }
                },
            }
        }

        Ok(ValueSet {
            values,
            requested: self.tokens.len(),
        })
    }
}

/// A value set is an opaque data structure that contains the result of a
/// batch. The loader keeps it around for the rest of the request so that
/// repeated loads of the same key are answered from it.
#[derive(Debug)]
pub(crate) struct ValueSet<Value> {
    values: HashMap<Token, Value>,
    requested: usize,
}

impl<Value> ValueSet<Value> {
    pub(crate) fn found(&self) -> usize {
        self.values.len()
    }

    pub(crate) fn not_found(&self) -> usize {
        self.requested - self.values.len()
    }
}

impl<Value: Clone> ValueSet<Value> {
    /// Get the value associated with a token. `None` means the backend had no
    /// record for that key.
    pub(crate) fn get(&self, token: &Token) -> Option<Value> {
        self.values.get(token).cloned()
    }
}
