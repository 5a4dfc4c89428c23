//! 解析结果句柄
//!
//! `ResultHolder<T>` 捆绑三样东西：安全解引用所需的互斥量集合、
//! 指向最终值的强引用锚（拥有者节点）和弱引用（供缓存存放）。
//!
//! 句柄有两种状态：
//! - **已锁**：锚为强引用且共享锁在手，可直接解引用
//! - **已放**：强引用已放掉，使用前必须经弱引用重新加锁
//!
//! 不变量：强/弱引用永远指向同一对象。普通值成员的指针指向
//! 拥有者节点载荷内部，互斥量集合借用的是父节点的；句柄存活
//! 期间锚保证载荷不被释放，锁保证没有并发写。
//!
//! 共享锁是线程本地登记的一部分，因此句柄不跨线程（`!Send`）。

use crate::locks::{ExclusiveLock, SharedLock};
use crate::mutex::MutexDescriptor;
use crate::path::Path;
use crate::policy::LockError;
use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

/// 句柄当前持有的锁
enum HolderLock {
    Shared(SharedLock),
    Exclusive(ExclusiveLock),
}

/// 解析结果句柄
pub struct ResultHolder<T: ?Sized> {
    /// 解引用所需的互斥量集合
    mutexes: Vec<Arc<MutexDescriptor>>,

    /// 强引用锚：已锁状态下Some，保证值的所属分配存活
    strong: Option<Arc<dyn Any + Send + Sync>>,

    /// 弱引用锚：缓存存放与重新加锁的入口
    weak: Weak<dyn Any + Send + Sync>,

    /// 持有的锁（与strong同步出现/消失）
    lock: Option<HolderLock>,

    /// 最终值指针（锚存活且持锁时有效）
    value: NonNull<T>,

    /// 具体值类型，供运行期向下转型
    type_id: TypeId,

    /// 产生本句柄的路径，供缓存过期后重新解析
    path: Path,

    /// 锁登记绑定线程
    _not_send: PhantomData<*const ()>,
}

impl<T: ?Sized + 'static> ResultHolder<T> {
    pub(crate) fn new(
        value: NonNull<T>,
        type_id: TypeId,
        anchor: Arc<dyn Any + Send + Sync>,
        mutexes: Vec<Arc<MutexDescriptor>>,
        lock: SharedLock,
        path: Path,
    ) -> Self {
        Self {
            weak: Arc::downgrade(&anchor),
            strong: Some(anchor),
            lock: Some(HolderLock::Shared(lock)),
            mutexes,
            value,
            type_id,
            path,
            _not_send: PhantomData,
        }
    }

    /// 是否处于已锁状态
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// 被引用的对象是否仍然存活
    pub fn is_alive(&self) -> bool {
        self.weak.strong_count() > 0
    }

    /// 读取最终值
    ///
    /// 已放状态下返回None，必须先 `lock_shared`。
    pub fn get(&self) -> Option<&T> {
        self.lock.as_ref()?;
        self.strong.as_ref()?;
        Some(unsafe { self.value.as_ref() })
    }

    /// 可变访问最终值
    ///
    /// 仅在独占加锁（`lock_exclusive`）后可用。
    pub fn get_mut(&mut self) -> Option<&mut T> {
        match self.lock {
            Some(HolderLock::Exclusive(_)) => {}
            _ => return None,
        }
        self.strong.as_ref()?;
        Some(unsafe { self.value.as_mut() })
    }

    /// 放掉锁和强引用
    ///
    /// 之后只剩弱引用；对象可以被别处销毁。
    pub fn release_shared(&mut self) {
        self.lock = None;
        self.strong = None;
    }

    /// 经弱引用重新共享加锁
    ///
    /// 对象已销毁时返回 `Ok(false)`；锁协议违规照常报错。
    pub fn lock_shared(&mut self) -> Result<bool, LockError> {
        if self.lock.is_some() {
            return Ok(true);
        }
        let Some(anchor) = self.weak.upgrade() else {
            return Ok(false);
        };
        let lock = SharedLock::new(&self.mutexes)?;
        self.strong = Some(anchor);
        self.lock = Some(HolderLock::Shared(lock));
        Ok(true)
    }

    /// 经弱引用重新独占加锁
    pub fn lock_exclusive(&mut self) -> Result<bool, LockError> {
        if matches!(self.lock, Some(HolderLock::Exclusive(_))) {
            return Ok(true);
        }
        if matches!(self.lock, Some(HolderLock::Shared(_))) {
            // 不做锁升级：先放再取，调用方自行承受窗口期
            self.release_shared();
        }
        let Some(anchor) = self.weak.upgrade() else {
            return Ok(false);
        };
        let lock = ExclusiveLock::new(&self.mutexes)?;
        self.strong = Some(anchor);
        self.lock = Some(HolderLock::Exclusive(lock));
        Ok(true)
    }

    /// 解引用所需的互斥量集合
    pub fn mutexes(&self) -> &[Arc<MutexDescriptor>] {
        &self.mutexes
    }

    /// 产生本句柄的路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 尝试以更具体的类型看待本句柄
    ///
    /// 运行期检查实际值类型；失败时原样退还。
    pub fn cast<S: Any>(self) -> Result<ResultHolder<S>, ResultHolder<T>> {
        if self.type_id != TypeId::of::<S>() {
            return Err(self);
        }
        Ok(ResultHolder {
            mutexes: self.mutexes,
            strong: self.strong,
            weak: self.weak,
            lock: self.lock,
            value: self.value.cast::<S>(),
            type_id: self.type_id,
            path: self.path,
            _not_send: PhantomData,
        })
    }

    pub(crate) fn parts_for_cache(
        &self,
    ) -> (Weak<dyn Any + Send + Sync>, NonNull<()>, TypeId, Vec<Arc<MutexDescriptor>>) {
        (
            self.weak.clone(),
            self.value.cast(),
            self.type_id,
            self.mutexes.clone(),
        )
    }
}

impl<T: ?Sized> std::fmt::Debug for ResultHolder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultHolder")
            .field("locked", &self.lock.is_some())
            .field("path", &self.path.to_string())
            .finish_non_exhaustive()
    }
}
