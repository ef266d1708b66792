use indexmap::IndexMap;

/// Ordered mapping from a Troika directive name to its raw byte value.
///
/// Insertion order is preserved; setting a key that already exists overwrites
/// its value in place without changing its position — this is what lets the
/// generator emit directives in parse/translation order (`spec.md` §4.3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectiveMap(IndexMap<String, Vec<u8>>);

impl DirectiveMap {
    #[must_use]
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    /// Insert or overwrite a directive, keeping its original position if it
    /// already existed.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.0.insert(key.into(), value.into());
    }

    /// Insert a directive only if it is not already present.
    pub fn set_default(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.0.entry(key.into()).or_insert_with(|| value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.0.shift_remove(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl FromIterator<(String, Vec<u8>)> for DirectiveMap {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A native directive captured by a site's native parser: the parsed
/// `(key, value)` pair plus the original line bytes, verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeDirective {
    pub value: Option<Vec<u8>>,
    pub line: Vec<u8>,
}

/// Ordered mapping from a site-native directive key (e.g. `-o`, `--output`)
/// to its captured `NativeDirective`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeMap(IndexMap<String, NativeDirective>);

impl NativeMap {
    #[must_use]
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    pub fn set(&mut self, key: impl Into<String>, value: Option<Vec<u8>>, line: Vec<u8>) {
        self.0.insert(key.into(), NativeDirective { value, line });
    }

    pub fn remove(&mut self, key: &str) -> Option<NativeDirective> {
        self.0.shift_remove(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &NativeDirective> {
        self.0.values()
    }
}

impl FromIterator<(String, NativeDirective)> for NativeMap {
    fn from_iter<I: IntoIterator<Item = (String, NativeDirective)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_in_place() {
        let mut m = DirectiveMap::new();
        m.set("name", b"first".to_vec());
        m.set("walltime", b"01:00:00".to_vec());
        m.set("name", b"second".to_vec());

        let keys: Vec<&str> = m.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["name", "walltime"]);
        assert_eq!(m.get("name"), Some(b"second".as_slice()));
    }

    #[test]
    fn set_default_does_not_overwrite() {
        let mut m = DirectiveMap::new();
        m.set("name", b"first".to_vec());
        m.set_default("name", b"second".to_vec());
        assert_eq!(m.get("name"), Some(b"first".as_slice()));
    }

    #[test]
    fn remove_drops_the_key() {
        let mut m = DirectiveMap::new();
        m.set("error_file", b"foo".to_vec());
        assert!(m.remove("error_file").is_some());
        assert!(m.get("error_file").is_none());
    }
}
