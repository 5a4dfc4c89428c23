//! 线程安全队列
//!
//! 工作线程派发循环使用的阻塞队列。`pull` 在计数信号量上等待，
//! 调用时线程不得持有任何锁，这是显式检查的前置条件：
//! 队列的意义就在于等待时不饿死任何锁的持有者。

use crate::policy;
use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use thiserror::Error;

/// 队列操作错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// 持锁等待会饿死锁的持有者
    #[error("cannot pull from queue while this thread holds locks")]
    PullWhileLocked,

    /// 所有发送端都已关闭
    #[error("queue is disconnected")]
    Disconnected,
}

/// 线程安全队列
///
/// 可克隆；克隆共享同一条通道。
pub struct ThreadSafeQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> ThreadSafeQueue<T> {
    /// 创建空队列
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// 入队
    pub fn push(&self, value: T) {
        // 两端都在self里，发送不会失败
        let _ = self.tx.send(value);
    }

    /// 阻塞出队
    ///
    /// 前置条件：本线程不持有任何锁。
    pub fn pull(&self) -> Result<T, QueueError> {
        if policy::holds_any_lock() {
            return Err(QueueError::PullWhileLocked);
        }
        self.rx.recv().map_err(|_| QueueError::Disconnected)
    }

    /// 非阻塞出队
    pub fn try_pull(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(v) => Some(v),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// 当前长度
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> Default for ThreadSafeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ThreadSafeQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::ExclusiveLock;
    use crate::mutex::MutexDescriptor;

    #[test]
    fn test_push_pull_order() {
        let q = ThreadSafeQueue::new();
        q.push(1);
        q.push(2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pull().unwrap(), 1);
        assert_eq!(q.pull().unwrap(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn test_pull_while_holding_lock_is_rejected() {
        let q: ThreadSafeQueue<i32> = ThreadSafeQueue::new();
        q.push(42);

        let d = MutexDescriptor::default_layer();
        let lock = ExclusiveLock::single(&d).unwrap();
        assert_eq!(q.pull(), Err(QueueError::PullWhileLocked));
        drop(lock);

        assert_eq!(q.pull().unwrap(), 42);
    }

    #[test]
    fn test_pull_blocks_until_push() {
        let q = ThreadSafeQueue::new();
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.pull().unwrap());
        std::thread::sleep(std::time::Duration::from_millis(20));
        q.push("hello");
        assert_eq!(handle.join().unwrap(), "hello");
    }

    #[test]
    fn test_try_pull_empty() {
        let q: ThreadSafeQueue<u8> = ThreadSafeQueue::new();
        assert!(q.try_pull().is_none());
    }
}
