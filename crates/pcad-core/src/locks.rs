//! 共享锁与独占锁
//!
//! 对一组描述符的RAII加锁：
//! - `ExclusiveLock`: 旋转重试的多锁算法（`std::lock`思路推广到
//!   运行期才知道大小的集合），对任何遵守同一协议的线程无死锁风险
//! - `SharedLock`: 按层号升序逐个阻塞加锁（分层不变量保证低层
//!   不会被已独占持有高层的线程请求，因此无需重试环）
//! - `try_`变体：非阻塞，OS层面的失败不是错误，而是布尔信号
//! - `LockTransfer`: 把独占锁从当前线程移交给新线程
//!
//! 两种锁都绑定取锁线程（`!Send`），登记在线程本地的锁策略中。

use crate::mutex::{DescriptorId, MutexDescriptor};
use crate::policy::{self, AcquisitionPlan, LockError};
use std::marker::PhantomData;
use std::sync::Arc;

/// 旋转重试地独占加锁整个集合
///
/// 无条件锁第一个描述符，按固定顺序try其余；一旦失败就全部释放，
/// 把起点旋转到失败的描述符上重试。起点严格推进（模旋转计数），
/// 饥饿以描述符个数为界。
fn acquire_all_exclusive(descs: &[Arc<MutexDescriptor>]) {
    if descs.is_empty() {
        return;
    }
    let n = descs.len();
    let mut start = 0usize;
    let mut rounds = 0usize;
    loop {
        descs[start].lock_exclusive_blocking();
        let mut failed = None;
        let mut locked = vec![start];
        for k in 1..n {
            let idx = (start + k) % n;
            if descs[idx].try_lock_exclusive() {
                locked.push(idx);
            } else {
                failed = Some(idx);
                break;
            }
        }
        match failed {
            None => return,
            Some(idx) => {
                for i in locked {
                    descs[i].unlock_exclusive();
                }
                rounds += 1;
                tracing::trace!(rotations = rounds, "exclusive multi-lock rotating retry");
                start = idx;
            }
        }
    }
}

/// 非阻塞地独占加锁整个集合，失败时完全回滚
fn try_acquire_all_exclusive(descs: &[Arc<MutexDescriptor>]) -> bool {
    let mut locked = Vec::with_capacity(descs.len());
    for desc in descs {
        if desc.try_lock_exclusive() {
            locked.push(desc);
        } else {
            for d in locked {
                d.unlock_exclusive();
            }
            return false;
        }
    }
    true
}

/// 一组描述符上的独占锁
pub struct ExclusiveLock {
    /// 本对象实际取得的描述符（幂等剔除之后）
    acquired: Vec<Arc<MutexDescriptor>>,
    /// 锁绑定取锁线程
    _not_send: PhantomData<*const ()>,
}

impl ExclusiveLock {
    /// 阻塞地独占锁住一组描述符
    pub fn new(set: &[Arc<MutexDescriptor>]) -> Result<Self, LockError> {
        let plan = policy::plan_exclusive(set)?;
        acquire_all_exclusive(&plan.acquire);
        Ok(Self::commit(plan))
    }

    /// 单描述符便捷构造
    pub fn single(desc: &Arc<MutexDescriptor>) -> Result<Self, LockError> {
        Self::new(std::slice::from_ref(desc))
    }

    /// 非阻塞变体
    ///
    /// OS层面的try失败返回 `Ok(None)`，协议违规才是错误。
    pub fn try_new(set: &[Arc<MutexDescriptor>]) -> Result<Option<Self>, LockError> {
        let plan = policy::plan_exclusive(set)?;
        if !try_acquire_all_exclusive(&plan.acquire) {
            return Ok(None);
        }
        Ok(Some(Self::commit(plan)))
    }

    fn commit(plan: AcquisitionPlan) -> Self {
        policy::commit(&plan);
        Self {
            acquired: plan.acquire,
            _not_send: PhantomData,
        }
    }

    /// 本对象取得的描述符
    pub fn descriptors(&self) -> &[Arc<MutexDescriptor>] {
        &self.acquired
    }

    /// 提前释放
    pub fn release(self) {}

    /// 从当前线程分离，准备移交给新线程
    ///
    /// 要求本锁的描述符恰好构成当前线程的整个栈顶层；
    /// 分离推进每个描述符的移交纪元，使早先分离出去、
    /// 尚未恢复的写操作可以发现自己已被取代。
    pub fn detach(self) -> Result<LockTransfer, LockError> {
        let ids: Vec<DescriptorId> = self.acquired.iter().map(|d| d.id()).collect();
        let layer = policy::detach_top(&ids)?;

        let epochs: Vec<u64> = self
            .acquired
            .iter()
            .map(|d| d.bump_handoff_epoch())
            .collect();

        let descriptors = self.acquired.clone();
        // OS锁保持持有，登记已弹出，禁止Drop再释放
        std::mem::forget(self);

        Ok(LockTransfer {
            descriptors,
            layer,
            epochs,
        })
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        let ids: Vec<DescriptorId> = self.acquired.iter().map(|d| d.id()).collect();
        // 先放OS锁，再发信号，最后清登记
        for desc in &self.acquired {
            desc.unlock_exclusive();
        }
        for desc in &self.acquired {
            desc.on_exclusive_unlock().emit();
        }
        policy::forget(&ids);
    }
}

/// 一组描述符上的共享锁
pub struct SharedLock {
    acquired: Vec<Arc<MutexDescriptor>>,
    _not_send: PhantomData<*const ()>,
}

impl SharedLock {
    /// 阻塞地共享锁住一组描述符
    pub fn new(set: &[Arc<MutexDescriptor>]) -> Result<Self, LockError> {
        let mut plan = policy::plan_shared(set)?;
        // 按层号升序加锁
        plan.acquire.sort_by_key(|d| d.layer());
        for desc in &plan.acquire {
            desc.lock_shared_blocking();
        }
        Ok(Self::commit(plan))
    }

    /// 单描述符便捷构造
    pub fn single(desc: &Arc<MutexDescriptor>) -> Result<Self, LockError> {
        Self::new(std::slice::from_ref(desc))
    }

    /// 非阻塞变体
    pub fn try_new(set: &[Arc<MutexDescriptor>]) -> Result<Option<Self>, LockError> {
        let mut plan = policy::plan_shared(set)?;
        plan.acquire.sort_by_key(|d| d.layer());
        let mut locked = Vec::with_capacity(plan.acquire.len());
        for desc in &plan.acquire {
            if desc.try_lock_shared() {
                locked.push(desc.clone());
            } else {
                for d in locked {
                    d.unlock_shared();
                }
                return Ok(None);
            }
        }
        Ok(Some(Self::commit(plan)))
    }

    fn commit(plan: AcquisitionPlan) -> Self {
        policy::commit(&plan);
        Self {
            acquired: plan.acquire,
            _not_send: PhantomData,
        }
    }

    /// 本对象取得的描述符
    pub fn descriptors(&self) -> &[Arc<MutexDescriptor>] {
        &self.acquired
    }

    /// 提前释放
    pub fn release(self) {}
}

impl Drop for SharedLock {
    fn drop(&mut self) {
        let ids: Vec<DescriptorId> = self.acquired.iter().map(|d| d.id()).collect();
        for desc in &self.acquired {
            desc.unlock_shared();
        }
        policy::forget(&ids);
    }
}

/// 线程间移交中的独占锁
///
/// OS锁保持持有；在接收线程上 `attach` 重新登记。
/// 这是系统唯一的"取消"相关机制：长写操作被移交到新线程后，
/// 旧线程可以继续；若同一描述符随后又被再次移交，
/// 先前的移交即过时（`is_obsolete`），恢复的写操作应当放弃。
pub struct LockTransfer {
    descriptors: Vec<Arc<MutexDescriptor>>,
    layer: i32,
    epochs: Vec<u64>,
}

// OS锁的持有权随对象移动到接收线程
unsafe impl Send for LockTransfer {}

impl LockTransfer {
    /// 在当前（新）线程上恢复为独占锁
    ///
    /// 新线程上的分层检查失败时，移交被放弃并释放OS锁。
    pub fn attach(self) -> Result<ExclusiveLock, LockError> {
        policy::commit_attached(&self.descriptors, self.layer)?;
        let mut this = std::mem::ManuallyDrop::new(self);
        Ok(ExclusiveLock {
            acquired: std::mem::take(&mut this.descriptors),
            _not_send: PhantomData,
        })
    }

    /// 本次移交是否已被更新的移交取代
    pub fn is_obsolete(&self) -> bool {
        self.descriptors
            .iter()
            .zip(&self.epochs)
            .any(|(desc, &epoch)| desc.handoff_epoch() != epoch)
    }

    /// 移交中的描述符
    pub fn descriptors(&self) -> &[Arc<MutexDescriptor>] {
        &self.descriptors
    }
}

impl Drop for LockTransfer {
    fn drop(&mut self) {
        // 移交被放弃：在持有OS锁的线程之外释放它们
        for desc in &self.descriptors {
            desc.unlock_exclusive();
        }
        for desc in &self.descriptors {
            desc.on_exclusive_unlock().emit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_exclusive_then_drop_releases() {
        let d = MutexDescriptor::default_layer();
        {
            let lock = ExclusiveLock::single(&d).unwrap();
            assert!(policy::is_locked_exclusively(&d));
            assert_eq!(lock.descriptors().len(), 1);
        }
        assert!(!policy::holds_any_lock());
        assert!(d.try_lock_exclusive());
        d.unlock_exclusive();
    }

    #[test]
    fn test_shared_locks_sorted_by_layer() {
        let a = MutexDescriptor::new(5);
        let b = MutexDescriptor::new(1);
        let lock = SharedLock::new(&[a.clone(), b.clone()]).unwrap();
        assert!(policy::is_locked(&a));
        assert!(policy::is_locked(&b));
        assert!(!policy::is_locked_exclusively(&a));
        drop(lock);
        assert!(!policy::holds_any_lock());
    }

    #[test]
    fn test_try_lock_failure_is_not_an_error() {
        let d = MutexDescriptor::default_layer();
        d.lock_exclusive_blocking();

        // 另起线程，OS锁被占时try变体返回None
        let d2 = d.clone();
        let handle = std::thread::spawn(move || {
            let attempt = ExclusiveLock::try_new(&[d2.clone()]).unwrap();
            assert!(attempt.is_none());
            let attempt = SharedLock::try_new(&[d2]).unwrap();
            assert!(attempt.is_none());
        });
        handle.join().unwrap();

        d.unlock_exclusive();
    }

    #[test]
    fn test_exclusive_reentry_drops_duplicates() {
        let d = MutexDescriptor::default_layer();
        let outer = ExclusiveLock::single(&d).unwrap();
        let inner = ExclusiveLock::single(&d).unwrap();
        assert!(inner.descriptors().is_empty());
        drop(inner);
        // 幂等重入的释放不得触碰外层锁
        assert!(policy::is_locked_exclusively(&d));
        drop(outer);
        assert!(!policy::holds_any_lock());
    }

    #[test]
    fn test_unlock_signal_fires_once_per_release() {
        let d = MutexDescriptor::default_layer();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        d.on_exclusive_unlock().connect(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        drop(ExclusiveLock::single(&d).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // 共享锁释放不发独占解锁信号
        drop(SharedLock::single(&d).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detach_attach_across_threads() {
        let d = MutexDescriptor::default_layer();
        let lock = ExclusiveLock::single(&d).unwrap();
        let transfer = lock.detach().unwrap();
        assert!(!policy::holds_any_lock());
        assert!(!transfer.is_obsolete());

        let d2 = d.clone();
        let handle = std::thread::spawn(move || {
            let lock = transfer.attach().unwrap();
            assert!(policy::is_locked_exclusively(&d2));
            drop(lock);
            assert!(!policy::holds_any_lock());
        });
        handle.join().unwrap();

        assert!(d.try_lock_exclusive());
        d.unlock_exclusive();
    }

    #[test]
    fn test_transfer_becomes_obsolete_after_newer_handoff() {
        let d = MutexDescriptor::default_layer();
        let first = ExclusiveLock::single(&d).unwrap().detach().unwrap();

        // 恢复并再次移交，旧的移交过时
        let second = first.attach().unwrap().detach().unwrap();
        assert!(!second.is_obsolete());

        let third = second.attach().unwrap();
        let stale_epoch_probe = third.detach().unwrap();
        assert!(!stale_epoch_probe.is_obsolete());
        drop(stale_epoch_probe);
    }

    #[test]
    fn test_random_exclusive_subsets_terminate() {
        use rand::seq::SliceRandom;
        use rand::Rng;

        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        // 多线程随机锁取描述符子集；旋转重试下全部线程应在
        // 有限时间内完成
        let descs: Vec<_> = (0..6).map(|_| MutexDescriptor::default_layer()).collect();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let descs = descs.clone();
            handles.push(std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..300 {
                    let k = rng.gen_range(1..=descs.len());
                    let mut subset = descs.clone();
                    subset.shuffle(&mut rng);
                    subset.truncate(k);
                    let lock = ExclusiveLock::new(&subset).unwrap();
                    drop(lock);
                }
            }));
        }

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            for h in handles {
                h.join().unwrap();
            }
            let _ = tx.send(());
        });
        rx.recv_timeout(std::time::Duration::from_secs(30))
            .expect("randomized lock workload should not deadlock");
    }

    #[test]
    fn test_concurrent_exclusive_pairs_terminate() {
        // 两个线程以相反顺序请求同一对描述符，旋转重试保证推进
        let a = MutexDescriptor::default_layer();
        let b = MutexDescriptor::default_layer();

        let mut handles = Vec::new();
        for flip in [false, true] {
            let (x, y) = if flip {
                (b.clone(), a.clone())
            } else {
                (a.clone(), b.clone())
            };
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let lock = ExclusiveLock::new(&[x.clone(), y.clone()]).unwrap();
                    drop(lock);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
