//! 监听者总线与变更分发
//!
//! 监听者按注册顺序收到回调。`filter_incoming` 的错误会中止入库；
//! `on_stored` 与 `on_change` 的错误只记录日志（至少一次、尽力而为）。
//! 已提交的变更经有界通道由后台任务异步扇出，入库延迟不受监听者
//! 拖累。监听者回调在总线锁内执行，不得同步地重入总线。

use medvault_core::{ChangeRecord, RequestOrigin, Result};
use medvault_dicom::DicomMap;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 变更分发通道的容量
const CHANGE_QUEUE_CAPACITY: usize = 2048;

/// 归档事件监听者
///
/// 所有回调都有缺省空实现，监听者只需要覆盖自己关心的事件。
pub trait ArchiveListener: Send + Sync {
    /// 入库过滤：返回 false 丢弃该实例，错误中止入库
    fn filter_incoming(&self, _instance: &Value, _origin: &RequestOrigin) -> Result<bool> {
        Ok(true)
    }

    /// 实例提交成功后的通知
    fn on_stored(&self, _public_id: &str, _summary: &DicomMap, _instance: &Value) -> Result<()> {
        Ok(())
    }

    /// 索引变更通知（由后台分发任务送达）
    fn on_change(&self, _change: &ChangeRecord) -> Result<()> {
        Ok(())
    }
}

struct NamedListener {
    name: String,
    listener: Arc<dyn ArchiveListener>,
}

/// 进程级监听者注册表
pub struct ListenerBus {
    listeners: Mutex<Vec<NamedListener>>,
}

impl Default for ListenerBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerBus {
    pub fn new() -> Self {
        ListenerBus {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// 以名字注册监听者，重名即替换
    pub fn register(&self, name: impl Into<String>, listener: Arc<dyn ArchiveListener>) {
        let name = name.into();
        let mut listeners = self.listeners.lock().unwrap();
        listeners.retain(|l| l.name != name);
        info!("registered listener '{}'", name);
        listeners.push(NamedListener { name, listener });
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|l| l.name != name);
        before != listeners.len()
    }

    /// 按注册顺序执行入库过滤
    ///
    /// 任一监听者返回 false 即短路；监听者报错直接上抛给入库方。
    pub fn filter_incoming(&self, instance: &Value, origin: &RequestOrigin) -> Result<bool> {
        let listeners = self.listeners.lock().unwrap();
        for entry in listeners.iter() {
            match entry.listener.filter_incoming(instance, origin) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("listener '{}' rejected the incoming instance", entry.name);
                    return Ok(false);
                }
                Err(e) => {
                    error!(
                        "error in the '{}' callback while filtering an instance: {}",
                        entry.name, e
                    );
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    /// 通知所有监听者实例已入库，单个监听者的失败被记录并吞掉
    pub fn dispatch_stored(&self, public_id: &str, summary: &DicomMap, instance: &Value) {
        let listeners = self.listeners.lock().unwrap();
        for entry in listeners.iter() {
            if let Err(e) = entry.listener.on_stored(public_id, summary, instance) {
                error!(
                    "error in the '{}' callback while signaling a stored instance: {}",
                    entry.name, e
                );
            }
        }
    }

    /// 扇出一条变更记录，失败同样只记录
    pub fn dispatch_change(&self, change: &ChangeRecord) {
        let listeners = self.listeners.lock().unwrap();
        for entry in listeners.iter() {
            if let Err(e) = entry.listener.on_change(change) {
                error!(
                    "error in the '{}' callback while signaling a change: {}",
                    entry.name, e
                );
            }
        }
    }
}

/// 后台变更分发器
///
/// 消费有界队列中已提交的变更并扇出到总线。
pub struct ChangeDispatcher {
    tx: mpsc::Sender<ChangeRecord>,
    worker: JoinHandle<()>,
}

impl ChangeDispatcher {
    pub fn start(bus: Arc<ListenerBus>) -> Self {
        let (tx, mut rx) = mpsc::channel::<ChangeRecord>(CHANGE_QUEUE_CAPACITY);
        let worker = tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                bus.dispatch_change(&change);
            }
            debug!("change dispatcher drained");
        });
        ChangeDispatcher { tx, worker }
    }

    /// 入队一条已提交的变更
    pub async fn publish(&self, change: ChangeRecord) {
        if self.tx.send(change).await.is_err() {
            warn!("change dispatcher is gone, dropping a change record");
        }
    }

    /// 排空队列并停止后台任务
    pub async fn stop(self) {
        drop(self.tx);
        let _ = self.worker.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medvault_core::{ArchiveError, ChangeKind, ResourceLevel};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        stored: AtomicUsize,
        changes: AtomicUsize,
        reject: bool,
        fail_filter: bool,
        fail_stored: bool,
    }

    impl ArchiveListener for Recorder {
        fn filter_incoming(&self, _instance: &Value, _origin: &RequestOrigin) -> Result<bool> {
            if self.fail_filter {
                return Err(ArchiveError::internal("scripted failure"));
            }
            Ok(!self.reject)
        }

        fn on_stored(&self, _public_id: &str, _summary: &DicomMap, _instance: &Value) -> Result<()> {
            self.stored.fetch_add(1, Ordering::SeqCst);
            if self.fail_stored {
                return Err(ArchiveError::internal("stored failure"));
            }
            Ok(())
        }

        fn on_change(&self, _change: &ChangeRecord) -> Result<()> {
            self.changes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn change() -> ChangeRecord {
        ChangeRecord {
            seq: 1,
            kind: ChangeKind::NewInstance,
            level: ResourceLevel::Instance,
            public_id: "1.2.3".to_string(),
            timestamp: chrono_now(),
        }
    }

    fn chrono_now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }

    #[test]
    fn test_filter_short_circuits() {
        let bus = ListenerBus::new();
        let accept = Arc::new(Recorder::default());
        let reject = Arc::new(Recorder {
            reject: true,
            ..Default::default()
        });
        bus.register("accept", accept);
        bus.register("reject", reject);
        bus.register("after", Arc::new(Recorder::default()));

        let verdict = bus
            .filter_incoming(&Value::Null, &RequestOrigin::default())
            .unwrap();
        assert!(!verdict);
    }

    #[test]
    fn test_filter_error_propagates() {
        let bus = ListenerBus::new();
        bus.register(
            "failing",
            Arc::new(Recorder {
                fail_filter: true,
                ..Default::default()
            }),
        );
        assert!(bus
            .filter_incoming(&Value::Null, &RequestOrigin::default())
            .is_err());
    }

    #[test]
    fn test_stored_errors_are_swallowed() {
        let bus = ListenerBus::new();
        let failing = Arc::new(Recorder {
            fail_stored: true,
            ..Default::default()
        });
        let second = Arc::new(Recorder::default());
        bus.register("failing", failing.clone());
        bus.register("second", second.clone());

        bus.dispatch_stored("1.2.3", &DicomMap::new(), &Value::Null);
        // 前一个失败不阻止后一个收到事件
        assert_eq!(failing.stored.load(Ordering::SeqCst), 1);
        assert_eq!(second.stored.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_replaces_same_name() {
        let bus = ListenerBus::new();
        let first = Arc::new(Recorder {
            reject: true,
            ..Default::default()
        });
        bus.register("scripting", first);
        bus.register("scripting", Arc::new(Recorder::default()));

        let verdict = bus
            .filter_incoming(&Value::Null, &RequestOrigin::default())
            .unwrap();
        assert!(verdict);
        assert!(bus.unregister("scripting"));
        assert!(!bus.unregister("scripting"));
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_in_background() {
        let bus = Arc::new(ListenerBus::new());
        let recorder = Arc::new(Recorder::default());
        bus.register("recorder", recorder.clone());

        let dispatcher = ChangeDispatcher::start(bus.clone());
        dispatcher.publish(change()).await;
        dispatcher.publish(change()).await;
        dispatcher.stop().await;

        assert_eq!(recorder.changes.load(Ordering::SeqCst), 2);
    }
}
