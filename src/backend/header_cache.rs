//! Receive-side header dictionary.
//!
//! The front-end may send a header line once with a non-zero id and later
//! refer to it by id alone. Ids are small, so the table is a plain vector
//! indexed by id.

#[derive(Debug, Default, Clone)]
struct Entry {
    key: Vec<u8>,
    value: Vec<u8>,
}

#[derive(Debug, Default)]
pub(crate) struct HeaderCacheRecv {
    items: Vec<Entry>,
}

impl HeaderCacheRecv {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store `key`/`value` under `id`, replacing whatever was there.
    pub(crate) fn insert(&mut self, id: u16, key: &[u8], value: &[u8]) {
        let idx = id as usize;
        if idx >= self.items.len() {
            self.items.resize_with(idx + 1, Entry::default);
        }
        let entry = &mut self.items[idx];
        entry.key.clear();
        entry.key.extend_from_slice(key);
        entry.value.clear();
        entry.value.extend_from_slice(value);
    }

    /// The pair stored under `id`, or two empty slices.
    pub(crate) fn get(&self, id: u16) -> (&[u8], &[u8]) {
        match self.items.get(id as usize) {
            Some(entry) => (entry.key.as_slice(), entry.value.as_slice()),
            None => (&[][..], &[][..]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_id_is_empty() {
        let cache = HeaderCacheRecv::new();
        assert_eq!(cache.get(0), (&b""[..], &b""[..]));
        assert_eq!(cache.get(u16::MAX), (&b""[..], &b""[..]));
    }

    #[test]
    fn test_insert_grows_and_overwrites() {
        let mut cache = HeaderCacheRecv::new();
        cache.insert(5, b"Host", b"example.com");
        assert_eq!(cache.items.len(), 6);
        assert_eq!(cache.get(5), (&b"Host"[..], &b"example.com"[..]));
        // gaps stay empty
        assert_eq!(cache.get(2), (&b""[..], &b""[..]));

        cache.insert(5, b"Accept", b"*/*");
        assert_eq!(cache.get(5), (&b"Accept"[..], &b"*/*"[..]));
        assert_eq!(cache.items.len(), 6);
    }
}
