//! 分层锁策略
//!
//! 每个线程持有一份私有的锁登记：一叠"层"，每层记录是否独占、
//! 层号以及该层取得的描述符集合。所有加锁路径在取OS锁之前
//! 先在这里做分层检查（plan），取锁成功后再登记（commit），
//! 失败时没有任何登记需要回滚。
//!
//! 分层规则：
//! - 线程的第一次加锁：层号取请求集合的最大值，不做进一步检查
//! - 非首次独占：已被本线程独占持有的描述符从请求中剔除（幂等重入）；
//!   已被共享持有的描述符是致命协议错误；其余描述符的层号必须
//!   严格大于当前栈顶层号
//! - 非首次共享：已持有的描述符（任一种）从请求中剔除；栈顶为独占时
//!   推入新层（层号必须严格更大）；栈顶为共享时并入栈顶层
//!   （层号不得小于栈顶）

use crate::mutex::{DescriptorId, MutexDescriptor};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// 锁协议违规
///
/// 全部是致命的类型化错误，绝不静默降级；RAII展开保证
/// 报告错误时线程本地登记保持一致。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// 请求的层号不大于当前已持有的层号
    #[error("cannot acquire exclusive lock at layer {requested}: thread already holds layer {held}")]
    AlreadyHasLayer { held: i32, requested: i32 },

    /// 对已共享持有的描述符请求独占锁
    #[error("cannot acquire exclusive lock over a descriptor this thread holds non-exclusively")]
    NoExclusiveOverNonExclusive,

    /// 在独占层之上请求同层号的共享锁
    #[error("cannot acquire shared lock at layer {requested} on top of an exclusive lock of the same layer")]
    NoLocksAfterExclusiveLock { requested: i32 },

    /// 共享请求的层号小于当前栈顶层号
    #[error("cannot acquire shared lock at layer {requested}: thread already holds bigger layer {held}")]
    AlreadyHasBiggerLayer { held: i32, requested: i32 },

    /// 试图对无锁哨兵描述符加锁
    #[error("descriptor is marked lock-free and cannot participate in locking")]
    LockFreeThenLock,

    /// 待移交的锁不构成完整的栈顶层
    #[error("cannot detach: lock does not own the entire top layer of this thread")]
    DetachNotTopLayer,
}

/// 一层锁登记
struct Frame {
    /// 该层是否为独占
    exclusive: bool,

    /// 该层的层号（成员描述符层号的最大值）
    layer: i32,

    /// 该层取得的描述符及各自层号
    descriptors: HashMap<DescriptorId, i32>,
}

thread_local! {
    /// 线程本地锁上下文，生命周期与线程相同
    static CONTEXT: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// 登记动作，由plan产生、commit执行
pub(crate) enum FrameAction {
    /// 无事可做（请求被幂等剔除殆尽）
    None,
    /// 推入新层
    Push { exclusive: bool, layer: i32 },
    /// 并入栈顶共享层，层号抬升为给定值
    MergeTop { layer: i32 },
}

/// 一次加锁计划
pub(crate) struct AcquisitionPlan {
    /// 实际需要取OS锁的描述符（已去重、剔除已持有者）
    pub acquire: Vec<Arc<MutexDescriptor>>,
    /// 取锁成功后的登记动作
    pub action: FrameAction,
}

/// 去重并拒绝无锁哨兵
fn sanitize(set: &[Arc<MutexDescriptor>]) -> Result<Vec<Arc<MutexDescriptor>>, LockError> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(set.len());
    for desc in set {
        if desc.is_lock_free() {
            return Err(LockError::LockFreeThenLock);
        }
        if seen.insert(desc.id()) {
            out.push(desc.clone());
        }
    }
    Ok(out)
}

fn max_layer(set: &[Arc<MutexDescriptor>]) -> i32 {
    set.iter().map(|d| d.layer()).max().unwrap_or(0)
}

/// 规划一次独占加锁
pub(crate) fn plan_exclusive(set: &[Arc<MutexDescriptor>]) -> Result<AcquisitionPlan, LockError> {
    let set = sanitize(set)?;
    CONTEXT.with(|ctx| {
        let frames = ctx.borrow();

        let mut acquire = Vec::with_capacity(set.len());
        for desc in set {
            let id = desc.id();
            let held = frames.iter().rev().find_map(|f| {
                f.descriptors.contains_key(&id).then_some(f.exclusive)
            });
            match held {
                // 幂等重入：已独占持有，直接剔除
                Some(true) => {}
                Some(false) => return Err(LockError::NoExclusiveOverNonExclusive),
                None => acquire.push(desc),
            }
        }

        if acquire.is_empty() {
            return Ok(AcquisitionPlan {
                acquire,
                action: FrameAction::None,
            });
        }

        let layer = max_layer(&acquire);
        if let Some(top) = frames.last() {
            // 新的独占层必须严格高于栈顶
            for desc in &acquire {
                if desc.layer() <= top.layer {
                    return Err(LockError::AlreadyHasLayer {
                        held: top.layer,
                        requested: desc.layer(),
                    });
                }
            }
        }

        Ok(AcquisitionPlan {
            acquire,
            action: FrameAction::Push {
                exclusive: true,
                layer,
            },
        })
    })
}

/// 规划一次共享加锁
pub(crate) fn plan_shared(set: &[Arc<MutexDescriptor>]) -> Result<AcquisitionPlan, LockError> {
    let set = sanitize(set)?;
    CONTEXT.with(|ctx| {
        let frames = ctx.borrow();

        // 已持有的描述符（任一种）从请求中剔除
        let acquire: Vec<_> = set
            .into_iter()
            .filter(|desc| {
                let id = desc.id();
                !frames.iter().any(|f| f.descriptors.contains_key(&id))
            })
            .collect();

        if acquire.is_empty() {
            return Ok(AcquisitionPlan {
                acquire,
                action: FrameAction::None,
            });
        }

        let layer = max_layer(&acquire);
        let action = match frames.last() {
            None => FrameAction::Push {
                exclusive: false,
                layer,
            },
            Some(top) if top.exclusive => {
                if layer == top.layer {
                    return Err(LockError::NoLocksAfterExclusiveLock { requested: layer });
                }
                if layer < top.layer {
                    return Err(LockError::AlreadyHasBiggerLayer {
                        held: top.layer,
                        requested: layer,
                    });
                }
                FrameAction::Push {
                    exclusive: false,
                    layer,
                }
            }
            Some(top) => {
                if layer < top.layer {
                    return Err(LockError::AlreadyHasBiggerLayer {
                        held: top.layer,
                        requested: layer,
                    });
                }
                FrameAction::MergeTop {
                    layer: layer.max(top.layer),
                }
            }
        };

        Ok(AcquisitionPlan { acquire, action })
    })
}

/// 登记一次已成功的加锁
pub(crate) fn commit(plan: &AcquisitionPlan) {
    let entries: Vec<(DescriptorId, i32)> =
        plan.acquire.iter().map(|d| (d.id(), d.layer())).collect();

    CONTEXT.with(|ctx| {
        let mut frames = ctx.borrow_mut();
        match plan.action {
            FrameAction::None => {}
            FrameAction::Push { exclusive, layer } => {
                frames.push(Frame {
                    exclusive,
                    layer,
                    descriptors: entries.iter().copied().collect(),
                });
            }
            FrameAction::MergeTop { layer } => {
                if let Some(top) = frames.last_mut() {
                    top.layer = layer;
                    top.descriptors.extend(entries.iter().copied());
                }
            }
        }
    });
}

/// 直接登记一层已被OS持有的独占锁（锁移交的attach端）
pub(crate) fn commit_attached(
    set: &[Arc<MutexDescriptor>],
    layer: i32,
) -> Result<(), LockError> {
    CONTEXT.with(|ctx| {
        let mut frames = ctx.borrow_mut();
        if let Some(top) = frames.last() {
            if layer <= top.layer {
                return Err(LockError::AlreadyHasLayer {
                    held: top.layer,
                    requested: layer,
                });
            }
        }
        frames.push(Frame {
            exclusive: true,
            layer,
            descriptors: set.iter().map(|d| (d.id(), d.layer())).collect(),
        });
        Ok(())
    })
}

/// 清除一批描述符的登记
///
/// 在OS锁已经释放（独占时还已发出解锁信号）之后调用。
/// 层号随成员收缩重新计算，空层随即弹出。
pub(crate) fn forget(ids: &[DescriptorId]) {
    CONTEXT.with(|ctx| {
        let mut frames = ctx.borrow_mut();
        for id in ids {
            for frame in frames.iter_mut().rev() {
                if frame.descriptors.remove(id).is_some() {
                    if let Some(max) = frame.descriptors.values().copied().max() {
                        frame.layer = max;
                    }
                    break;
                }
            }
        }
        frames.retain(|f| !f.descriptors.is_empty());
    });
}

/// 验证给定描述符集恰好构成当前栈顶层，成功则弹出该层（不解OS锁）
///
/// 锁移交的detach端。
pub(crate) fn detach_top(ids: &[DescriptorId]) -> Result<i32, LockError> {
    CONTEXT.with(|ctx| {
        let mut frames = ctx.borrow_mut();
        let top = frames.last().ok_or(LockError::DetachNotTopLayer)?;
        if !top.exclusive || top.descriptors.len() != ids.len() {
            return Err(LockError::DetachNotTopLayer);
        }
        if !ids.iter().all(|id| top.descriptors.contains_key(id)) {
            return Err(LockError::DetachNotTopLayer);
        }
        let layer = top.layer;
        frames.pop();
        Ok(layer)
    })
}

/// 本线程是否持有该描述符（任一种锁）
pub fn is_locked(desc: &Arc<MutexDescriptor>) -> bool {
    let id = desc.id();
    CONTEXT.with(|ctx| {
        ctx.borrow()
            .iter()
            .any(|f| f.descriptors.contains_key(&id))
    })
}

/// 本线程是否独占持有该描述符
pub fn is_locked_exclusively(desc: &Arc<MutexDescriptor>) -> bool {
    let id = desc.id();
    CONTEXT.with(|ctx| {
        ctx.borrow()
            .iter()
            .any(|f| f.exclusive && f.descriptors.contains_key(&id))
    })
}

/// 本线程是否持有任何锁
pub fn holds_any_lock() -> bool {
    CONTEXT.with(|ctx| !ctx.borrow().is_empty())
}

/// 当前栈顶层号（无锁时为None）
pub fn top_layer() -> Option<i32> {
    CONTEXT.with(|ctx| ctx.borrow().last().map(|f| f.layer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descs(layers: &[i32]) -> Vec<Arc<MutexDescriptor>> {
        layers.iter().map(|&l| MutexDescriptor::new(l)).collect()
    }

    fn commit_plan(plan: AcquisitionPlan) {
        // 测试中跳过OS锁，只驱动登记
        commit(&plan);
    }

    #[test]
    fn test_first_lock_records_max_layer() {
        let set = descs(&[1, 3, 2]);
        let plan = plan_exclusive(&set).unwrap();
        assert_eq!(plan.acquire.len(), 3);
        commit_plan(plan);

        assert_eq!(top_layer(), Some(3));
        assert!(is_locked(&set[0]));
        assert!(is_locked_exclusively(&set[1]));

        forget(&set.iter().map(|d| d.id()).collect::<Vec<_>>());
        assert!(!holds_any_lock());
    }

    #[test]
    fn test_exclusive_requires_strictly_greater_layer() {
        let low = descs(&[2]);
        let plan = plan_exclusive(&low).unwrap();
        commit_plan(plan);

        let same = descs(&[2]);
        assert!(matches!(
            plan_exclusive(&same),
            Err(LockError::AlreadyHasLayer { held: 2, requested: 2 })
        ));

        let higher = descs(&[5]);
        let plan = plan_exclusive(&higher).unwrap();
        commit_plan(plan);
        assert_eq!(top_layer(), Some(5));

        forget(&[higher[0].id(), low[0].id()]);
    }

    #[test]
    fn test_exclusive_reentry_is_idempotent() {
        let set = descs(&[1]);
        commit_plan(plan_exclusive(&set).unwrap());

        let plan = plan_exclusive(&set).unwrap();
        assert!(plan.acquire.is_empty());
        assert!(matches!(plan.action, FrameAction::None));

        forget(&[set[0].id()]);
    }

    #[test]
    fn test_no_exclusive_over_shared() {
        let set = descs(&[1]);
        commit_plan(plan_shared(&set).unwrap());

        assert!(matches!(
            plan_exclusive(&set),
            Err(LockError::NoExclusiveOverNonExclusive)
        ));

        forget(&[set[0].id()]);
    }

    #[test]
    fn test_shared_after_exclusive_same_layer_rejected() {
        let excl = descs(&[4]);
        commit_plan(plan_exclusive(&excl).unwrap());

        let shared = descs(&[4]);
        assert!(matches!(
            plan_shared(&shared),
            Err(LockError::NoLocksAfterExclusiveLock { requested: 4 })
        ));

        let lower = descs(&[1]);
        assert!(matches!(
            plan_shared(&lower),
            Err(LockError::AlreadyHasBiggerLayer { held: 4, requested: 1 })
        ));

        forget(&[excl[0].id()]);
    }

    #[test]
    fn test_shared_merges_into_shared_top() {
        let a = descs(&[1]);
        commit_plan(plan_shared(&a).unwrap());

        let b = descs(&[2]);
        let plan = plan_shared(&b).unwrap();
        assert!(matches!(plan.action, FrameAction::MergeTop { layer: 2 }));
        commit_plan(plan);

        assert_eq!(top_layer(), Some(2));

        // 释放后层号收缩回剩余成员的最大值
        forget(&[b[0].id()]);
        assert_eq!(top_layer(), Some(1));
        forget(&[a[0].id()]);
        assert!(!holds_any_lock());
    }

    #[test]
    fn test_lock_free_rejected() {
        let lf = MutexDescriptor::lock_free();
        assert!(matches!(
            plan_shared(&[lf.clone()]),
            Err(LockError::LockFreeThenLock)
        ));
        assert!(matches!(
            plan_exclusive(&[lf]),
            Err(LockError::LockFreeThenLock)
        ));
    }

    #[test]
    fn test_detach_top_requires_whole_layer() {
        let set = descs(&[1, 1]);
        commit_plan(plan_exclusive(&set).unwrap());

        // 只给一半成员不允许移交
        assert!(matches!(
            detach_top(&[set[0].id()]),
            Err(LockError::DetachNotTopLayer)
        ));

        let ids: Vec<_> = set.iter().map(|d| d.id()).collect();
        assert_eq!(detach_top(&ids).unwrap(), 1);
        assert!(!holds_any_lock());
    }
}
