//! インメモリのモックストレージ
//!
//! ディスクに触れずに上位層をテストするための`Storage`実装です。

use super::{IterateFlow, IterateVisitor, Storage};
use crate::error::{CacheError, Result};
use crate::types::{ObjectId, ObjectIndex, ObjectMetadata};
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::sync::Mutex;

/// モックストレージ
pub struct MockStorage {
    part_size: u64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<u64, ObjectMetadata>,
    parts: HashMap<u64, BTreeMap<u32, Vec<u8>>>,
}

impl MockStorage {
    /// 指定パートサイズのモックを作成
    pub fn new(part_size: u64) -> Self {
        Self {
            part_size,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// 保存されているオブジェクト数
    pub fn object_count(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }
}

impl Storage for MockStorage {
    fn part_size(&self) -> u64 {
        self.part_size
    }

    fn get_metadata(&self, id: &ObjectId) -> Result<ObjectMetadata> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&id.hash_value())
            .cloned()
            .ok_or(CacheError::NotFound)
    }

    fn save_metadata(&self, meta: &ObjectMetadata) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let hash = meta.id.hash_value();
        if inner.objects.contains_key(&hash) {
            return Err(CacheError::AlreadyExists);
        }
        inner.objects.insert(hash, meta.clone());
        Ok(())
    }

    fn replace_metadata(&self, meta: &ObjectMetadata) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.objects.insert(meta.id.hash_value(), meta.clone());
        Ok(())
    }

    fn get_part(&self, idx: &ObjectIndex) -> Result<Box<dyn Read + Send>> {
        let inner = self.inner.lock().unwrap();
        let data = inner
            .parts
            .get(&idx.id.hash_value())
            .and_then(|bucket| bucket.get(&idx.part))
            .cloned()
            .ok_or(CacheError::NotFound)?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn save_part(&self, idx: &ObjectIndex, data: &mut dyn Read) -> Result<()> {
        let mut buf = Vec::new();
        data.take(self.part_size + 1)
            .read_to_end(&mut buf)
            .map_err(CacheError::Io)?;
        if buf.len() as u64 > self.part_size {
            return Err(CacheError::InvalidSize);
        }

        let mut inner = self.inner.lock().unwrap();
        let hash = idx.id.hash_value();
        if !inner.objects.contains_key(&hash) {
            return Err(CacheError::NotFound);
        }
        let bucket = inner.parts.entry(hash).or_default();
        if bucket.contains_key(&idx.part) {
            return Err(CacheError::AlreadyExists);
        }
        bucket.insert(idx.part, buf);
        Ok(())
    }

    fn get_available_parts(&self, id: &ObjectId) -> Result<Vec<ObjectIndex>> {
        let inner = self.inner.lock().unwrap();
        let hash = id.hash_value();
        if !inner.objects.contains_key(&hash) {
            return Err(CacheError::NotFound);
        }
        Ok(inner
            .parts
            .get(&hash)
            .map(|bucket| {
                bucket
                    .keys()
                    .map(|part| ObjectIndex::new(id.clone(), *part))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn discard(&self, id: &ObjectId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let hash = id.hash_value();
        if inner.objects.remove(&hash).is_none() {
            return Err(CacheError::NotFound);
        }
        inner.parts.remove(&hash);
        Ok(())
    }

    fn discard_part(&self, idx: &ObjectIndex) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .parts
            .get_mut(&idx.id.hash_value())
            .and_then(|bucket| bucket.remove(&idx.part))
            .map(|_| ())
            .ok_or(CacheError::NotFound)
    }

    fn iterate(&self, visitor: &mut dyn IterateVisitor) -> Result<()> {
        let snapshot: Vec<(ObjectMetadata, Vec<ObjectIndex>)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .objects
                .values()
                .map(|meta| {
                    let parts = inner
                        .parts
                        .get(&meta.id.hash_value())
                        .map(|bucket| {
                            bucket
                                .keys()
                                .map(|part| ObjectIndex::new(meta.id.clone(), *part))
                                .collect()
                        })
                        .unwrap_or_default();
                    (meta.clone(), parts)
                })
                .collect()
        };

        for (meta, parts) in snapshot {
            if visitor.on_object(&meta, &parts) == IterateFlow::Stop {
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{unix_now, Headers};

    fn meta(path: &str) -> ObjectMetadata {
        ObjectMetadata {
            id: ObjectId::new("testkey", path),
            response_timestamp: unix_now(),
            expires_at: unix_now() + 60,
            size: 20,
            headers: Headers::new(),
            is_cacheable: true,
            code: 200,
        }
    }

    #[test]
    fn test_expected_errors() {
        let storage = MockStorage::new(10);
        let obj = meta("/lorem/ipsum");
        let idx = ObjectIndex::new(obj.id.clone(), 5);

        assert!(storage.get_metadata(&obj.id).unwrap_err().is_not_found());
        assert!(matches!(storage.get_part(&idx), Err(e) if e.is_not_found()));
    }

    #[test]
    fn test_operations() {
        let storage = MockStorage::new(10);
        let obj1 = meta("/lorem/ipsum");
        let obj2 = meta("/lorem/ipsum/2");

        storage.save_metadata(&obj1).unwrap();
        assert!(storage.save_metadata(&obj1).unwrap_err().is_already_exists());
        storage.save_metadata(&obj2).unwrap();

        let idx = ObjectIndex::new(obj2.id.clone(), 13);
        storage
            .save_part(&idx, &mut Cursor::new(b"loremipsum".to_vec()))
            .unwrap();
        assert!(storage
            .save_part(&idx, &mut Cursor::new(b"loremipsum".to_vec()))
            .unwrap_err()
            .is_already_exists());

        // イテレーションは最初のStopで打ち切られる
        struct StopFirst(usize);
        impl IterateVisitor for StopFirst {
            fn on_object(&mut self, _: &ObjectMetadata, _: &[ObjectIndex]) -> IterateFlow {
                self.0 += 1;
                IterateFlow::Stop
            }
        }
        let mut visitor = StopFirst(0);
        storage.iterate(&mut visitor).unwrap();
        assert_eq!(visitor.0, 1);

        storage.discard(&obj1.id).unwrap();
        assert_eq!(storage.object_count(), 1);

        storage.discard_part(&idx).unwrap();
        assert!(matches!(storage.get_part(&idx), Err(e) if e.is_not_found()));
    }
}
