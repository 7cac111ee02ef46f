//! Data structures for passing keys into a batch function and values back
//! out of it.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::mem;
use std::num::NonZeroUsize;

use thiserror::Error;

/// Handle to one distinct key of a [`KeySet`], and to its value in the
/// [`ValueSet`] produced from that key set. Tokens are handed out in
/// first-request order, starting at 1.
#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    pub(crate) fn duplicate(&self) -> Self {
        Token(self.0)
    }

    fn index(&self) -> usize {
        self.0.get() - 1
    }
}

/// What to do when a keyed batch result contains several values for the
/// same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnDuplicate {
    /// Keep the first value and silently ignore the rest.
    #[default]
    Ignore,
    /// Keep the last value.
    Replace,
    /// Treat duplicates as a contract violation.
    Error,
}

/// A batch result that didn't line up with the keys it was computed for.
/// These are bugs in the batch function, never "not found" conditions, and
/// they should be surfaced rather than papered over: a misaligned result
/// hands one caller's data to another.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntoValuesError {
    #[error("batch produced {actual} values for {expected} keys")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("batch produced a value for unrequested key {key}")]
    UnknownKey { key: String },

    #[error("batch produced more than one value for key {key}")]
    DuplicateKey { key: String },
}

/// Trait for values that carry their own key, such as a database row that
/// includes its primary key. Used by [`KeySet::values_from_iter`] to pair
/// unordered results back up with the requested keys.
pub trait KeyedEntry<Key: ?Sized> {
    fn get_key(&self) -> &Key;
}

/// A set of keys passed into a batch function. All keys are distinct and are
/// yielded by [`keys`][KeySet::keys] in the order they were first requested.
/// Once the request is done, use one of the `into_*` / `*_from_*` methods to
/// turn the results into a [`ValueSet`], which is handed back to the loader.
/// Those methods are the only way to build a `ValueSet`, and each of them
/// guarantees exactly one value per key.
#[derive(Debug)]
pub struct KeySet<Key: Eq + Hash> {
    // Keys are never removed, so the position of a key in `keys` is always
    // its token's index.
    keys: Vec<Key>,
    tokens: HashMap<Key, Token>,
}

impl<Key: Eq + Hash> KeySet<Key> {
    pub(crate) fn new() -> Self {
        Self {
            keys: Vec::new(),
            tokens: HashMap::new(),
        }
    }

    /// Check if there are any keys in this keyset
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Get the number of distinct keys in this keyset.
    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Iterate over the keys, in the order they were first requested.
    pub fn keys(&self) -> std::slice::Iter<'_, Key> {
        self.keys.iter()
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.tokens.contains_key(key)
    }

    /// Compute a value for each key.
    pub fn into_values<Value>(self, mut get_value: impl FnMut(&Key) -> Value) -> ValueSet<Value> {
        ValueSet {
            values: self.keys.iter().map(|key| get_value(key)).collect(),
        }
    }

    /// Fallible version of into_values. Returns the first error produced by
    /// `get_value`.
    pub fn try_into_values<Value, Error>(
        self,
        get_value: impl FnMut(&Key) -> Result<Value, Error>,
    ) -> Result<ValueSet<Value>, Error> {
        let values = self.keys.iter().map(get_value).collect::<Result<_, _>>()?;
        Ok(ValueSet { values })
    }

    /// Pair a positional result with the keys: `values[i]` belongs to the
    /// i-th key yielded by [`keys`][KeySet::keys]. Fails if the lengths
    /// differ.
    pub fn values_from_vec<Value>(
        self,
        values: Vec<Value>,
    ) -> Result<ValueSet<Value>, IntoValuesError> {
        if values.len() != self.keys.len() {
            return Err(IntoValuesError::LengthMismatch {
                expected: self.keys.len(),
                actual: values.len(),
            });
        }

        Ok(ValueSet { values })
    }

    /// Pair an unordered collection of keyed records with the keys. Keys
    /// with no matching record get `None`. A record whose key was never
    /// requested is an error.
    pub fn values_from_iter<Value, Q>(
        self,
        on_duplicate: OnDuplicate,
        entries: impl IntoIterator<Item = Value>,
    ) -> Result<ValueSet<Option<Value>>, IntoValuesError>
    where
        Value: KeyedEntry<Q>,
        Key: Borrow<Q>,
        Q: Hash + Eq + Debug + ?Sized,
    {
        let mut values: Vec<Option<Value>> = self.keys.iter().map(|_| None).collect();

        for entry in entries {
            let index = self.index_of(entry.get_key())?;
            let slot = &mut values[index];

            match (slot.is_some(), on_duplicate) {
                (false, _) | (true, OnDuplicate::Replace) => *slot = Some(entry),
                (true, OnDuplicate::Ignore) => {}
                (true, OnDuplicate::Error) => {
                    return Err(IntoValuesError::DuplicateKey {
                        key: format!("{:?}", entry.get_key()),
                    })
                }
            }
        }

        Ok(ValueSet { values })
    }

    /// Partition a flat collection of records into one group per key, using
    /// `key_of` to find the key each record belongs to. Records keep their
    /// relative order inside a group; keys with no records get an empty
    /// group. Records for which `key_of` returns `None` are skipped.
    pub fn groups_from_iter<Value, Q>(
        self,
        entries: impl IntoIterator<Item = Value>,
        key_of: impl Fn(&Value) -> Option<&Q>,
    ) -> Result<ValueSet<Vec<Value>>, IntoValuesError>
    where
        Key: Borrow<Q>,
        Q: Hash + Eq + Debug + ?Sized,
    {
        let mut values: Vec<Vec<Value>> = self.keys.iter().map(|_| Vec::new()).collect();

        for entry in entries {
            let index = match key_of(&entry) {
                None => continue,
                Some(key) => self.index_of(key)?,
            };
            values[index].push(entry);
        }

        Ok(ValueSet { values })
    }

    fn index_of<Q>(&self, key: &Q) -> Result<usize, IntoValuesError>
    where
        Key: Borrow<Q>,
        Q: Hash + Eq + Debug + ?Sized,
    {
        self.tokens
            .get(key)
            .map(Token::index)
            .ok_or_else(|| IntoValuesError::UnknownKey {
                key: format!("{:?}", key),
            })
    }

    /// Take the keyset out of this particular &mut self instance, replacing
    /// it with an empty set. Helper for when a batch stops accumulating.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            keys: mem::take(&mut self.keys),
            tokens: mem::take(&mut self.tokens),
        }
    }
}

impl<Key: Eq + Hash + Clone> KeySet<Key> {
    /// Add a key to this KeySet, and return the token associated with that
    /// key. Adding a key that is already present returns its existing
    /// token.
    pub(crate) fn add_key(&mut self, key: Key) -> Token {
        if let Some(token) = self.tokens.get(&key) {
            return token.duplicate();
        }

        let token = Token(NonZeroUsize::new(self.keys.len() + 1).expect("len + 1 is never zero"));
        self.keys.push(key.clone());
        self.tokens.insert(key, token.duplicate());
        token
    }
}

/// The result of a batch operation: exactly one value per key of the
/// [`KeySet`] it was created from. Values are never removed, so every
/// caller of a key (including later cache hits) can read it.
#[derive(Debug)]
pub struct ValueSet<Value> {
    values: Vec<Value>,
}

impl<Value> ValueSet<Value> {
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn get(&self, token: &Token) -> Option<&Value> {
        self.values.get(token.index())
    }

    /// Transform every value, keeping the key association.
    pub fn map<Other>(self, f: impl FnMut(Value) -> Other) -> ValueSet<Other> {
        ValueSet {
            values: self.values.into_iter().map(f).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        id: &'static str,
        name: &'static str,
    }

    impl KeyedEntry<str> for Row {
        fn get_key(&self) -> &str {
            self.id
        }
    }

    fn keyset(keys: &[&'static str]) -> (KeySet<String>, Vec<Token>) {
        let mut set = KeySet::new();
        let tokens = keys.iter().map(|key| set.add_key(key.to_string())).collect();
        (set, tokens)
    }

    #[test]
    fn keys_are_deduplicated_in_first_request_order() {
        let (set, tokens) = keyset(&["b", "a", "b", "c", "a"]);

        assert_eq!(set.len(), 3);
        assert_eq!(set.keys().collect::<Vec<_>>(), ["b", "a", "c"]);
        assert_eq!(tokens[0], tokens[2]);
        assert_eq!(tokens[1], tokens[4]);
    }

    #[test]
    fn values_from_vec_rejects_wrong_length() {
        let (set, _) = keyset(&["a", "b"]);
        let err = set.values_from_vec(vec![1]).unwrap_err();
        assert_eq!(
            err,
            IntoValuesError::LengthMismatch {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn values_from_iter_fills_missing_with_none() {
        let (set, tokens) = keyset(&["1", "2", "3"]);
        let rows = vec![
            Row { id: "3", name: "C" },
            Row { id: "1", name: "A" },
        ];

        let values = set.values_from_iter(OnDuplicate::Ignore, rows).unwrap();

        assert_eq!(values.get(&tokens[0]).unwrap().as_ref().unwrap().name, "A");
        assert_eq!(values.get(&tokens[1]).unwrap(), &None);
        assert_eq!(values.get(&tokens[2]).unwrap().as_ref().unwrap().name, "C");
    }

    #[test]
    fn values_from_iter_rejects_unknown_key() {
        let (set, _) = keyset(&["1"]);
        let rows = vec![Row { id: "9", name: "Z" }];

        let err = set.values_from_iter(OnDuplicate::Ignore, rows).unwrap_err();
        assert_eq!(
            err,
            IntoValuesError::UnknownKey {
                key: "\"9\"".into()
            }
        );
    }

    #[test]
    fn values_from_iter_duplicate_policies() {
        let rows = || {
            vec![
                Row { id: "1", name: "first" },
                Row { id: "1", name: "second" },
            ]
        };

        let (set, tokens) = keyset(&["1"]);
        let values = set.values_from_iter(OnDuplicate::Ignore, rows()).unwrap();
        assert_eq!(values.get(&tokens[0]).unwrap().as_ref().unwrap().name, "first");

        let (set, tokens) = keyset(&["1"]);
        let values = set.values_from_iter(OnDuplicate::Replace, rows()).unwrap();
        assert_eq!(values.get(&tokens[0]).unwrap().as_ref().unwrap().name, "second");

        let (set, _) = keyset(&["1"]);
        assert!(matches!(
            set.values_from_iter(OnDuplicate::Error, rows()),
            Err(IntoValuesError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn groups_preserve_order_and_include_empty_groups() {
        let (set, tokens) = keyset(&["c1", "c2"]);
        let users = vec![("c1", "u1"), ("c3", "x"), ("c1", "u2")];

        // c3 is not a requested key
        let err = set
            .groups_from_iter(users.clone(), |(company, _)| Some(*company))
            .unwrap_err();
        assert!(matches!(err, IntoValuesError::UnknownKey { .. }));

        let (set, _) = keyset(&["c1", "c2"]);
        let groups = set
            .groups_from_iter(
                users.into_iter().filter(|(company, _)| *company != "c3"),
                |(company, _)| Some(*company),
            )
            .unwrap();

        assert_eq!(groups.get(&tokens[0]).unwrap(), &[("c1", "u1"), ("c1", "u2")]);
        assert!(groups.get(&tokens[1]).unwrap().is_empty());
    }
}
