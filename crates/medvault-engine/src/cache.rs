//! 已解析实例的有界LRU缓存
//!
//! 一把互斥锁同时覆盖LRU结构与数据集本身：持有访问凭据期间其他
//! 访问全部阻塞，调用方必须保持短暂持有，且不得在持有期间做I/O。
//! 未命中在锁内串行补载，同一实例的并发访问看到第一次补载的结果。

use async_trait::async_trait;
use medvault_core::Result;
use medvault_dicom::Dataset;
use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// 未命中时的数据集提供方（读附件并解析）
#[async_trait]
pub trait DatasetProvider: Send + Sync {
    async fn load(&self, public_id: &str) -> Result<Dataset>;
}

struct CacheInner {
    /// 队首最旧，队尾最新
    order: VecDeque<String>,
    entries: HashMap<String, Arc<Dataset>>,
}

/// 有界LRU缓存
pub struct DicomCache {
    capacity: usize,
    provider: Arc<dyn DatasetProvider>,
    inner: Mutex<CacheInner>,
}

/// 缓存访问凭据，持有期间独占整个缓存
pub struct DatasetGuard<'a> {
    _lock: MutexGuard<'a, CacheInner>,
    dataset: Arc<Dataset>,
}

impl Deref for DatasetGuard<'_> {
    type Target = Dataset;

    fn deref(&self) -> &Dataset {
        &self.dataset
    }
}

impl DicomCache {
    pub fn new(capacity: usize, provider: Arc<dyn DatasetProvider>) -> Self {
        DicomCache {
            capacity: capacity.max(1),
            provider,
            inner: Mutex::new(CacheInner {
                order: VecDeque::new(),
                entries: HashMap::new(),
            }),
        }
    }

    /// 访问一个实例的数据集，未命中时经由提供方补载
    pub async fn access(&self, public_id: &str) -> Result<DatasetGuard<'_>> {
        let mut inner = self.inner.lock().await;

        if !inner.entries.contains_key(public_id) {
            debug!("dicom cache miss for {}", public_id);
            let dataset = Arc::new(self.provider.load(public_id).await?);
            inner.entries.insert(public_id.to_string(), dataset);
            inner.order.push_back(public_id.to_string());

            while inner.entries.len() > self.capacity {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.entries.remove(&evicted);
                    debug!("dicom cache evicted {}", evicted);
                }
            }
        } else {
            // 命中后挪到最新端
            inner.order.retain(|id| id != public_id);
            inner.order.push_back(public_id.to_string());
        }

        let dataset = inner.entries.get(public_id).cloned().expect("entry just ensured");
        Ok(DatasetGuard {
            _lock: inner,
            dataset,
        })
    }

    /// 实例从索引消失时同步失效
    pub async fn invalidate(&self, public_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.entries.remove(public_id).is_some() {
            inner.order.retain(|id| id != public_id);
            debug!("dicom cache invalidated {}", public_id);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::tags as dict;
    use dicom_object::InMemDicomObject;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl DatasetProvider for CountingProvider {
        async fn load(&self, public_id: &str) -> Result<Dataset> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let mut obj = InMemDicomObject::new_empty();
            obj.put(DataElement::new(
                dict::SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, public_id),
            ));
            medvault_dicom::parser::with_default_meta(obj)
        }
    }

    fn cache(capacity: usize) -> (DicomCache, Arc<CountingProvider>) {
        let provider = Arc::new(CountingProvider {
            loads: AtomicUsize::new(0),
        });
        (DicomCache::new(capacity, provider.clone()), provider)
    }

    #[tokio::test]
    async fn test_hit_does_not_reload() {
        let (cache, provider) = cache(2);
        {
            let guard = cache.access("1.2.3").await.unwrap();
            assert!(guard.element(dicom_dictionary_std::tags::SOP_INSTANCE_UID).is_ok());
        }
        cache.access("1.2.3").await.unwrap();
        assert_eq!(provider.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_capacity_two_evicts_oldest() {
        let (cache, provider) = cache(2);

        // A, B, C：A被驱逐，B仍然驻留
        cache.access("A").await.unwrap();
        cache.access("B").await.unwrap();
        cache.access("C").await.unwrap();
        assert_eq!(cache.len().await, 2);

        cache.access("B").await.unwrap();
        assert_eq!(provider.loads.load(Ordering::SeqCst), 3);

        // A需要重建
        cache.access("A").await.unwrap();
        assert_eq!(provider.loads.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_access_refreshes_lru_position() {
        let (cache, provider) = cache(2);
        cache.access("A").await.unwrap();
        cache.access("B").await.unwrap();
        // 触达A之后B成为最旧者
        cache.access("A").await.unwrap();
        cache.access("C").await.unwrap();

        cache.access("A").await.unwrap();
        assert_eq!(provider.loads.load(Ordering::SeqCst), 3);
        cache.access("B").await.unwrap();
        assert_eq!(provider.loads.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let (cache, provider) = cache(2);
        cache.access("A").await.unwrap();
        cache.invalidate("A").await;
        assert!(cache.is_empty().await);
        cache.access("A").await.unwrap();
        assert_eq!(provider.loads.load(Ordering::SeqCst), 2);
    }
}
