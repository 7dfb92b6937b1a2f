use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::Ctrie;

impl<K, V, H, const LOCAL_GC_BUFFER_SIZE: usize> Serialize for Ctrie<K, V, H, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Serialize + Hash + Eq + Clone + Send + Sync,
    V: 'static + Serialize + Clone + Send + Sync,
    H: BuildHasher + Clone,
{
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // len() and iter() would each take their own snapshot
        let entries: Vec<(K, V)> = self.iter().collect();

        let mut map = s.serialize_map(Some(entries.len()))?;
        for (k, v) in &entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

struct CtrieVisitor<K, V, H, const LOCAL_GC_BUFFER_SIZE: usize> {
    pd: PhantomData<(K, V, H)>,
}

impl<'de, K, V, H, const LOCAL_GC_BUFFER_SIZE: usize> Visitor<'de> for CtrieVisitor<K, V, H, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Deserialize<'de> + Hash + Eq + Clone + Send + Sync,
    V: 'static + Deserialize<'de> + Clone + Send + Sync,
    H: BuildHasher + Clone + Default,
{
    type Value = Ctrie<K, V, H, LOCAL_GC_BUFFER_SIZE>;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a map of keys to values")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let trie = Ctrie::default();

        while let Some((key, value)) = access.next_entry()? {
            trie.insert(key, value);
        }

        Ok(trie)
    }
}

impl<'de, K, V, H, const LOCAL_GC_BUFFER_SIZE: usize> Deserialize<'de> for Ctrie<K, V, H, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Deserialize<'de> + Hash + Eq + Clone + Send + Sync,
    V: 'static + Deserialize<'de> + Clone + Send + Sync,
    H: BuildHasher + Clone + Default,
{
    fn deserialize<D>(d: D) -> Result<Ctrie<K, V, H, LOCAL_GC_BUFFER_SIZE>, D::Error>
    where
        D: Deserializer<'de>,
    {
        d.deserialize_map(CtrieVisitor { pd: PhantomData })
    }
}
