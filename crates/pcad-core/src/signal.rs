//! 变更信号
//!
//! 提供最小的观察者原语，用于变更传播：
//! - `connect`: 注册观察者回调
//! - `emit`: 同步触发全部观察者
//!
//! 独占锁释放时通过互斥量描述符上的信号通知节点变更，
//! 非阻塞的UI镜像消费者也借助它配合 `try_lock` 轮询。

use parking_lot::Mutex;
use std::sync::Arc;

/// 观察者回调
pub type Observer = Arc<dyn Fn() + Send + Sync>;

/// 同步信号
///
/// 观察者列表受内部互斥量保护；`emit` 先复制列表再调用，
/// 允许观察者在回调中再次连接或触发信号而不会死锁。
#[derive(Default)]
pub struct Signal {
    observers: Mutex<Vec<Observer>>,
}

impl Signal {
    /// 创建空信号
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册观察者
    pub fn connect<F>(&self, observer: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.observers.lock().push(Arc::new(observer));
    }

    /// 触发全部观察者
    pub fn emit(&self) {
        // 复制后调用，回调内可安全地重入信号
        let observers: Vec<Observer> = self.observers.lock().clone();
        for observer in observers {
            observer();
        }
    }

    /// 当前观察者数量
    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("observers", &self.observer_count())
            .finish()
    }
}
