//! 读写门
//!
//! 取得受互斥量保护数据引用的唯一正规途径：
//! - `ReaderGate`: 共享锁 + 只读访问
//! - `WriterGate`: 独占锁 + 可变访问
//! - `ReaderKeeper` / `WriterKeeper`: 持有 `Arc` 所有权的变体
//!
//! 门在构造时对持有者的描述符集合加锁，锁的生命周期与门相同；
//! `release` 提前放锁。按持有者索引访问数据，调试模式下断言
//! 持有者确实属于当前线程已锁的集合，防止透过错误的门访问数据。

use crate::locks::{ExclusiveLock, SharedLock};
use crate::mutex::{MutexDescriptor, MutexHolder};
use crate::policy::{self, LockError};
use std::sync::Arc;

/// 共享访问门
pub struct ReaderGate {
    lock: SharedLock,
}

impl ReaderGate {
    /// 锁住单个持有者
    pub fn new<H: MutexHolder>(holder: &H) -> Result<Self, LockError> {
        Self::from_descriptors(std::slice::from_ref(holder.descriptor()))
    }

    /// 锁住一组描述符（多个持有者作为一个集合加锁）
    pub fn from_descriptors(descs: &[Arc<MutexDescriptor>]) -> Result<Self, LockError> {
        Ok(Self {
            lock: SharedLock::new(descs)?,
        })
    }

    /// 非阻塞变体，供镜像消费者轮询
    pub fn try_new<H: MutexHolder>(holder: &H) -> Result<Option<Self>, LockError> {
        Ok(SharedLock::try_new(std::slice::from_ref(holder.descriptor()))?
            .map(|lock| Self { lock }))
    }

    /// 读取持有者的数据
    pub fn get<'g, H: MutexHolder>(&'g self, holder: &'g H) -> &'g H::Data {
        debug_assert!(
            policy::is_locked(holder.descriptor()),
            "holder accessed through a gate that does not cover it"
        );
        unsafe { &*holder.data_ptr() }
    }

    /// 取可变指针（刻意保留的狭窄例外）
    ///
    /// 仅持共享锁时取得可变指针：解析器在遍历链条时需要它来
    /// 构造成员指针。普通调用方一律使用 `WriterGate`。
    pub fn get_non_const<H: MutexHolder>(&self, holder: &H) -> *mut H::Data {
        debug_assert!(
            policy::is_locked(holder.descriptor()),
            "holder accessed through a gate that does not cover it"
        );
        holder.data_ptr()
    }

    /// 提前放锁
    pub fn release(self) {
        self.lock.release();
    }
}

/// 独占访问门
pub struct WriterGate {
    lock: ExclusiveLock,
}

impl WriterGate {
    /// 锁住单个持有者
    pub fn new<H: MutexHolder>(holder: &H) -> Result<Self, LockError> {
        Self::from_descriptors(std::slice::from_ref(holder.descriptor()))
    }

    /// 锁住一组描述符
    pub fn from_descriptors(descs: &[Arc<MutexDescriptor>]) -> Result<Self, LockError> {
        Ok(Self {
            lock: ExclusiveLock::new(descs)?,
        })
    }

    /// 非阻塞变体
    pub fn try_new<H: MutexHolder>(holder: &H) -> Result<Option<Self>, LockError> {
        Ok(
            ExclusiveLock::try_new(std::slice::from_ref(holder.descriptor()))?
                .map(|lock| Self { lock }),
        )
    }

    /// 读取持有者的数据
    pub fn get<'g, H: MutexHolder>(&'g self, holder: &'g H) -> &'g H::Data {
        debug_assert!(
            policy::is_locked_exclusively(holder.descriptor()),
            "holder accessed through a gate that does not cover it"
        );
        unsafe { &*holder.data_ptr() }
    }

    /// 可变访问持有者的数据
    ///
    /// 借用整个门，同一时刻只能存在一个可变引用。
    pub fn get_mut<'g, H: MutexHolder>(&'g mut self, holder: &'g H) -> &'g mut H::Data {
        debug_assert!(
            policy::is_locked_exclusively(holder.descriptor()),
            "holder accessed through a gate that does not cover it"
        );
        unsafe { &mut *holder.data_ptr() }
    }

    /// 提前放锁（释放时触发各描述符的独占解锁信号）
    pub fn release(self) {
        self.lock.release();
    }
}

/// 持有所有权的共享门
pub struct ReaderKeeper<H: MutexHolder> {
    holder: Arc<H>,
    gate: ReaderGate,
}

impl<H: MutexHolder> ReaderKeeper<H> {
    pub fn new(holder: Arc<H>) -> Result<Self, LockError> {
        let gate = ReaderGate::new(holder.as_ref())?;
        Ok(Self { holder, gate })
    }

    pub fn get(&self) -> &H::Data {
        self.gate.get(self.holder.as_ref())
    }

    /// 放锁并交还持有者
    pub fn release(self) -> Arc<H> {
        self.gate.release();
        self.holder
    }
}

/// 持有所有权的独占门
pub struct WriterKeeper<H: MutexHolder> {
    holder: Arc<H>,
    gate: WriterGate,
}

impl<H: MutexHolder> WriterKeeper<H> {
    pub fn new(holder: Arc<H>) -> Result<Self, LockError> {
        let gate = WriterGate::new(holder.as_ref())?;
        Ok(Self { holder, gate })
    }

    pub fn get(&self) -> &H::Data {
        self.gate.get(self.holder.as_ref())
    }

    pub fn get_mut(&mut self) -> &mut H::Data {
        // holder的借用经过Arc，与gate的可变借用不冲突
        debug_assert!(policy::is_locked_exclusively(self.holder.descriptor()));
        unsafe { &mut *self.holder.data_ptr() }
    }

    pub fn release(self) -> Arc<H> {
        self.gate.release();
        self.holder
    }
}
