//! 互斥量描述符与受保护数据
//!
//! 核心类型：
//! - `MutexDescriptor`: 一把读写锁加一个整数层号，锁策略的最小单元
//! - `ThreadSafeStruct<T>`: 一个描述符加一份受保护数据
//! - `MutexHolder`: 门（gate）接受的"互斥量持有者"能力
//!
//! 描述符只提供原始的加锁/解锁操作，分层检查在线程本地的
//! 锁策略（`policy`模块）中进行，绝不在描述符自身上记录状态。

use crate::signal::Signal;
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;
use std::cell::UnsafeCell;
use std::sync::Arc;

/// "无锁"哨兵层号
///
/// 带此层号的描述符永远不参与分层检查，也不允许通过
/// 锁策略加锁（见 `LockError::LockFreeThenLock`）。
pub const LAYER_LOCK_FREE: i32 = i32::MIN;

/// 全局UUID注册表使用的层号
///
/// 取最大值，保证任何已持有普通层锁的线程仍可在其上叠加注册表锁。
pub const LAYER_REGISTRY: i32 = i32::MAX;

/// 描述符身份
///
/// 以描述符的堆地址为键，用于线程本地登记和集合去重。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId(usize);

/// 互斥量描述符
///
/// 一把读写锁和一个层号。层号是全序提示：线程已持有的层号
/// 自底向上单调不减，新的独占锁只能叠加在严格更大的层号之上。
pub struct MutexDescriptor {
    /// 原始读写锁
    raw: RawRwLock,

    /// 层号，默认0
    layer: i32,

    /// 独占解锁信号（在OS锁释放之后、登记清除之前触发）
    unlocked: Signal,

    /// 移交纪元，见 `LockTransfer::is_obsolete`
    handoff_epoch: std::sync::atomic::AtomicU64,
}

impl MutexDescriptor {
    /// 创建指定层号的描述符
    pub fn new(layer: i32) -> Arc<Self> {
        Arc::new(Self {
            raw: RawRwLock::INIT,
            layer,
            unlocked: Signal::new(),
            handoff_epoch: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// 创建默认层号（0）的描述符
    pub fn default_layer() -> Arc<Self> {
        Self::new(0)
    }

    /// 创建无锁哨兵描述符
    pub fn lock_free() -> Arc<Self> {
        Self::new(LAYER_LOCK_FREE)
    }

    /// 层号
    pub fn layer(&self) -> i32 {
        self.layer
    }

    /// 是否为无锁哨兵
    pub fn is_lock_free(&self) -> bool {
        self.layer == LAYER_LOCK_FREE
    }

    /// 独占解锁信号
    pub fn on_exclusive_unlock(&self) -> &Signal {
        &self.unlocked
    }

    /// 描述符身份
    pub fn id(self: &Arc<Self>) -> DescriptorId {
        DescriptorId(Arc::as_ptr(self) as usize)
    }

    /// 当前移交纪元
    pub(crate) fn handoff_epoch(&self) -> u64 {
        self.handoff_epoch.load(std::sync::atomic::Ordering::Acquire)
    }

    /// 推进移交纪元，返回新值
    pub(crate) fn bump_handoff_epoch(&self) -> u64 {
        self.handoff_epoch
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel)
            + 1
    }

    // === 原始锁操作（仅供locks模块使用） ===

    pub(crate) fn lock_exclusive_blocking(&self) {
        self.raw.lock_exclusive();
    }

    pub(crate) fn try_lock_exclusive(&self) -> bool {
        self.raw.try_lock_exclusive()
    }

    pub(crate) fn unlock_exclusive(&self) {
        // 调用方保证当前确实持有独占锁
        unsafe { self.raw.unlock_exclusive() };
    }

    pub(crate) fn lock_shared_blocking(&self) {
        self.raw.lock_shared();
    }

    pub(crate) fn try_lock_shared(&self) -> bool {
        self.raw.try_lock_shared()
    }

    pub(crate) fn unlock_shared(&self) {
        // 调用方保证当前确实持有共享锁
        unsafe { self.raw.unlock_shared() };
    }
}

impl std::fmt::Debug for MutexDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexDescriptor")
            .field("layer", &self.layer)
            .finish()
    }
}

/// 互斥量持有者能力
///
/// 任何"一个描述符加一份类型化数据"的组合。门通过它取得
/// 描述符（加锁）和数据指针（解引用）。
pub trait MutexHolder {
    /// 受保护数据类型
    type Data;

    /// 保护数据的描述符
    fn descriptor(&self) -> &Arc<MutexDescriptor>;

    /// 数据指针
    ///
    /// 仅在通过锁策略持有相应锁时解引用才是安全的，
    /// 门负责维持这一约束。
    fn data_ptr(&self) -> *mut Self::Data;
}

/// 受互斥量保护的数据
///
/// 每个节点的载荷放在一个 `ThreadSafeStruct` 里；描述符与数据
/// 一一对应，绝不在节点之间共享（父子包含关系除外，见
/// `ResultHolder` 借用父节点互斥量集合的模式）。
pub struct ThreadSafeStruct<T> {
    descriptor: Arc<MutexDescriptor>,
    cell: UnsafeCell<T>,
}

// 数据访问由锁策略把守
unsafe impl<T: Send> Send for ThreadSafeStruct<T> {}
unsafe impl<T: Send> Sync for ThreadSafeStruct<T> {}

impl<T> ThreadSafeStruct<T> {
    /// 以默认层号创建
    pub fn new(value: T) -> Self {
        Self::with_layer(value, 0)
    }

    /// 以指定层号创建
    pub fn with_layer(value: T, layer: i32) -> Self {
        Self {
            descriptor: MutexDescriptor::new(layer),
            cell: UnsafeCell::new(value),
        }
    }

    /// 取回内部值
    pub fn into_inner(self) -> T {
        self.cell.into_inner()
    }
}

impl<T> MutexHolder for ThreadSafeStruct<T> {
    type Data = T;

    fn descriptor(&self) -> &Arc<MutexDescriptor> {
        &self.descriptor
    }

    fn data_ptr(&self) -> *mut T {
        self.cell.get()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ThreadSafeStruct<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSafeStruct")
            .field("layer", &self.descriptor.layer())
            .finish_non_exhaustive()
    }
}
