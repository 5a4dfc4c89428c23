//! 导出能力
//!
//! 节点对"我能把名字X解析成类型T的子值"的声明。每个具体载荷
//! 在构造时登记一组能力（trait对象注册表，取代编译期变长组合）：
//! - `FieldExport`: 普通值成员，返回的指针在拥有者节点存活期间
//!   有效，包装进借用父节点互斥量集合的 `ResultHolder`
//! - `ChildExport`: 复合成员，独立加锁的子节点的强引用
//! - `ChildrenExport`: 经多索引容器按名字或UUID查找的动态子节点
//!
//! 能力按声明顺序逐个尝试，第一个非空结果短路整条链；
//! 名字未知时返回"未找到"，这是正常结果，不是错误。

use crate::multi_index::MultiIndexMap;
use crate::path::PathToken;
use std::any::TypeId;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::exporter::Exporter;

/// 单步解析结果
pub enum StepResult {
    /// 没有能力认领前端标记
    NotFound,

    /// 解析进入子节点，消耗了若干标记
    Chain {
        node: Arc<dyn Exporter>,
        consumed: usize,
    },

    /// 解析到普通值成员
    ///
    /// 指针指向父节点载荷内部，仅在持有父节点互斥量
    /// 且父节点存活时有效。
    Field {
        ptr: NonNull<()>,
        type_id: TypeId,
        consumed: usize,
    },
}

/// 导出能力
///
/// `resolve` 检查标记序列的前端；认领则消耗至少一个标记，
/// 否则返回 `NotFound`（缺省实现即如此，能力可以不贡献
/// 任何解析步骤，缺席是默认行为）。
///
/// 约定：`payload` 指向的载荷已被调用方通过锁策略锁住。
pub trait Capability<P>: Send + Sync {
    /// 尝试解析前端标记
    fn resolve(&self, payload: *mut P, tokens: &[PathToken]) -> StepResult {
        let _ = (payload, tokens);
        StepResult::NotFound
    }
}

/// 普通值成员导出
///
/// 把名字映射到载荷里的一个成员字段。
pub struct FieldExport<P, T> {
    name: &'static str,
    getter: fn(&mut P) -> &mut T,
}

impl<P, T> FieldExport<P, T>
where
    P: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    /// 登记名为 `name` 的值成员
    pub fn boxed(name: &'static str, getter: fn(&mut P) -> &mut T) -> Box<dyn Capability<P>> {
        Box::new(Self { name, getter })
    }
}

impl<P, T> Capability<P> for FieldExport<P, T>
where
    P: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn resolve(&self, payload: *mut P, tokens: &[PathToken]) -> StepResult {
        match tokens.first() {
            Some(PathToken::Name(name)) if name == self.name => {
                // 调用方已锁住载荷
                let member = (self.getter)(unsafe { &mut *payload });
                StepResult::Field {
                    ptr: NonNull::from(member).cast(),
                    type_id: TypeId::of::<T>(),
                    consumed: 1,
                }
            }
            _ => StepResult::NotFound,
        }
    }
}

/// 复合成员导出
///
/// 把名字（或子节点自身的UUID）映射到一个独立加锁的子节点。
pub struct ChildExport<P> {
    name: &'static str,
    getter: fn(&P) -> Arc<dyn Exporter>,
}

impl<P> ChildExport<P>
where
    P: Send + Sync + 'static,
{
    /// 登记名为 `name` 的子节点成员
    pub fn boxed(name: &'static str, getter: fn(&P) -> Arc<dyn Exporter>) -> Box<dyn Capability<P>> {
        Box::new(Self { name, getter })
    }
}

impl<P> Capability<P> for ChildExport<P>
where
    P: Send + Sync + 'static,
{
    fn resolve(&self, payload: *mut P, tokens: &[PathToken]) -> StepResult {
        match tokens.first() {
            Some(PathToken::Name(name)) if name == self.name => {
                let node = (self.getter)(unsafe { &*payload });
                StepResult::Chain { node, consumed: 1 }
            }
            Some(PathToken::Uuid(uuid)) => {
                let node = (self.getter)(unsafe { &*payload });
                if node.uuid() == *uuid {
                    StepResult::Chain { node, consumed: 1 }
                } else {
                    StepResult::NotFound
                }
            }
            _ => StepResult::NotFound,
        }
    }
}

/// 动态子节点导出
///
/// 载荷持有一个多索引容器，按名字或UUID认领前端标记。
pub struct ChildrenExport<P> {
    getter: fn(&P) -> &MultiIndexMap,
}

impl<P> ChildrenExport<P>
where
    P: Send + Sync + 'static,
{
    /// 登记动态子节点容器
    pub fn boxed(getter: fn(&P) -> &MultiIndexMap) -> Box<dyn Capability<P>> {
        Box::new(Self { getter })
    }
}

impl<P> Capability<P> for ChildrenExport<P>
where
    P: Send + Sync + 'static,
{
    fn resolve(&self, payload: *mut P, tokens: &[PathToken]) -> StepResult {
        let children = (self.getter)(unsafe { &*payload });
        let found = match tokens.first() {
            Some(PathToken::Name(name)) => children.get_by_name(name),
            Some(PathToken::Uuid(uuid)) => children.get_by_uuid(*uuid),
            None => None,
        };
        match found {
            Some(node) => StepResult::Chain { node, consumed: 1 },
            None => StepResult::NotFound,
        }
    }
}
