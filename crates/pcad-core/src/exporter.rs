//! 导出者节点
//!
//! 文档模型的图节点：UUID+名字身份、独占解锁时触发的变更信号、
//! 一份受互斥量保护的载荷，以及一组导出能力。
//!
//! 生命周期：
//! - 工厂返回引用计数句柄（`Arc::new_cyclic` 两阶段初始化，
//!   节点内部存自身弱引用，随时可升格出新的强引用）
//! - 全局UUID注册表只存弱引用，绝不延长节点寿命
//! - 最后一个强引用消失时节点销毁

use crate::export::{Capability, StepResult};
use crate::gate::{ReaderGate, WriterGate};
use crate::locks::ExclusiveLock;
use crate::mutex::{MutexDescriptor, MutexHolder, ThreadSafeStruct, LAYER_REGISTRY};
use crate::path::PathToken;
use crate::policy::{self, LockError};
use crate::signal::Signal;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Weak};
use thiserror::Error;
use uuid::Uuid;

/// 命名错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    /// 名字形如UUID，会与路径标记的UUID解析混淆
    #[error("name '{0}' looks like a UUID and cannot be used as an object name")]
    InvalidName(String),

    /// 改名要求的独占锁违反了锁协议
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// 节点身份
///
/// UUID在构造时生成且不可变；名字可选，只能在持有节点
/// 独占锁时修改，且不得形如UUID。
pub struct ExporterIdentity {
    uuid: Uuid,
    name: parking_lot::RwLock<Option<String>>,
}

impl ExporterIdentity {
    /// 生成全新身份
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: parking_lot::RwLock::new(None),
        }
    }

    /// 节点UUID
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// 当前名字
    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    fn set_name_unchecked(&self, name: &str) {
        *self.name.write() = Some(name.to_string());
    }
}

impl Default for ExporterIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExporterIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExporterIdentity")
            .field("uuid", &self.uuid)
            .field("name", &self.name())
            .finish()
    }
}

/// 校验对象名
///
/// 形如UUID的字符串不能作名字，否则点分路径无从区分两种标记。
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if Uuid::parse_str(name).is_ok() {
        return Err(NameError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// 节点载荷
///
/// 普通结构体加上两样能力声明：导出表和深拷贝。
pub trait Payload: Send + Sync + Sized + 'static {
    /// 声明本载荷的导出能力（构造时调用一次）
    fn exports() -> Vec<Box<dyn Capability<Self>>>;

    /// 深拷贝载荷
    ///
    /// 子节点递归深拷贝并获得全新身份。调用时本载荷已被锁住。
    fn deep_clone(&self) -> Result<Self, LockError>;
}

/// 类型擦除的导出者节点
///
/// 解析器沿着异构节点链行走依赖的对象安全接口。
pub trait Exporter: Send + Sync + 'static {
    /// 节点UUID
    fn uuid(&self) -> Uuid;

    /// 节点名字
    fn name(&self) -> Option<String>;

    /// 改名（要求并在内部取得节点的独占锁）
    fn set_name(&self, name: &str) -> Result<(), NameError>;

    /// 保护载荷的描述符
    fn descriptor(&self) -> &Arc<MutexDescriptor>;

    /// 变更信号（独占锁释放时触发）
    fn changed(&self) -> &Signal;

    /// 解析一步路径
    ///
    /// 约定：调用方已持有本节点的锁；每个成功步骤至少消耗一个标记。
    fn resolve_step(self: Arc<Self>, tokens: &[PathToken]) -> StepResult;

    /// 深拷贝为独立节点（全新身份）
    fn deep_copy_node(&self) -> Result<Arc<dyn Exporter>, LockError>;

    /// 向下转型支持
    fn as_any(&self) -> &dyn Any;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// 导出者节点
///
/// 身份 + 受保护载荷 + 变更信号 + 导出能力表。
pub struct ExporterNode<P: Payload> {
    identity: ExporterIdentity,
    data: ThreadSafeStruct<P>,
    changed: Signal,
    exports: Vec<Box<dyn Capability<P>>>,
    self_weak: Weak<ExporterNode<P>>,
}

impl<P: Payload> ExporterNode<P> {
    /// 以默认层号创建节点
    pub fn new(payload: P) -> Arc<Self> {
        Self::with_layer(payload, 0)
    }

    /// 以指定层号创建节点
    pub fn with_layer(payload: P, layer: i32) -> Arc<Self> {
        let node = Arc::new_cyclic(|weak: &Weak<ExporterNode<P>>| Self {
            identity: ExporterIdentity::new(),
            data: ThreadSafeStruct::with_layer(payload, layer),
            changed: Signal::new(),
            exports: P::exports(),
            self_weak: weak.clone(),
        });

        // 独占解锁传播为节点变更信号；弱引用保证观察者不延长节点寿命
        let weak = node.self_weak.clone();
        node.data.descriptor().on_exclusive_unlock().connect(move || {
            if let Some(node) = weak.upgrade() {
                node.changed.emit();
            }
        });

        if let Err(e) = register_uuid(&(node.clone() as Arc<dyn Exporter>)) {
            tracing::warn!(error = %e, uuid = %node.identity.uuid(), "uuid registration skipped");
        }
        node
    }

    /// 节点UUID
    pub fn uuid(&self) -> Uuid {
        self.identity.uuid()
    }

    /// 节点名字
    pub fn name(&self) -> Option<String> {
        self.identity.name()
    }

    /// 保护载荷的描述符
    pub fn descriptor(&self) -> &Arc<MutexDescriptor> {
        self.data.descriptor()
    }

    /// 变更信号
    pub fn changed(&self) -> &Signal {
        &self.changed
    }

    /// 从内部升格出自身的强引用
    pub fn self_arc(&self) -> Option<Arc<Self>> {
        self.self_weak.upgrade()
    }

    /// 改名
    ///
    /// 名字不得形如UUID；内部取节点独占锁（已独占持有时幂等重入）。
    pub fn set_name(&self, name: &str) -> Result<(), NameError> {
        validate_name(name)?;
        let _lock = ExclusiveLock::single(self.data.descriptor())?;
        self.identity.set_name_unchecked(name);
        Ok(())
    }

    /// 共享访问载荷
    pub fn read(&self) -> Result<ReaderGate, LockError> {
        ReaderGate::new(&self.data)
    }

    /// 独占访问载荷
    pub fn write(&self) -> Result<WriterGate, LockError> {
        WriterGate::new(&self.data)
    }

    /// 载荷持有者（供门索引访问）
    pub fn holder(&self) -> &ThreadSafeStruct<P> {
        &self.data
    }

    /// 深拷贝
    ///
    /// 结构上完全独立的克隆，带全新身份；子节点递归深拷贝。
    pub fn deep_copy(&self) -> Result<Arc<Self>, LockError> {
        let payload = {
            let gate = ReaderGate::new(&self.data)?;
            gate.get(&self.data).deep_clone()?
        };
        Ok(Self::with_layer(payload, self.data.descriptor().layer()))
    }
}

impl<P: Payload> MutexHolder for ExporterNode<P> {
    type Data = P;

    fn descriptor(&self) -> &Arc<MutexDescriptor> {
        self.data.descriptor()
    }

    fn data_ptr(&self) -> *mut P {
        self.data.data_ptr()
    }
}

impl<P: Payload> Exporter for ExporterNode<P> {
    fn uuid(&self) -> Uuid {
        self.identity.uuid()
    }

    fn name(&self) -> Option<String> {
        self.identity.name()
    }

    fn set_name(&self, name: &str) -> Result<(), NameError> {
        ExporterNode::set_name(self, name)
    }

    fn descriptor(&self) -> &Arc<MutexDescriptor> {
        self.data.descriptor()
    }

    fn changed(&self) -> &Signal {
        &self.changed
    }

    fn resolve_step(self: Arc<Self>, tokens: &[PathToken]) -> StepResult {
        debug_assert!(
            policy::is_locked(self.data.descriptor()),
            "resolve_step requires the caller to hold a lock on this node"
        );
        if tokens.is_empty() {
            return StepResult::NotFound;
        }
        let payload = self.data.data_ptr();
        for capability in &self.exports {
            match capability.resolve(payload, tokens) {
                StepResult::NotFound => continue,
                found => return found,
            }
        }
        StepResult::NotFound
    }

    fn deep_copy_node(&self) -> Result<Arc<dyn Exporter>, LockError> {
        Ok(self.deep_copy()?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<P: Payload> std::fmt::Debug for ExporterNode<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExporterNode")
            .field("identity", &self.identity)
            .field("exports", &self.exports.len())
            .finish_non_exhaustive()
    }
}

// === 全局UUID注册表 ===

/// 注册表清扫阈值
const SWEEP_THRESHOLD: usize = 64;

struct UuidRegistry {
    table: ThreadSafeStruct<HashMap<Uuid, Weak<dyn Exporter>>>,
}

static REGISTRY: LazyLock<UuidRegistry> = LazyLock::new(|| UuidRegistry {
    table: ThreadSafeStruct::with_layer(HashMap::new(), LAYER_REGISTRY),
});

/// 把节点登记进全局UUID注册表
///
/// 只存弱引用：注册表是纯索引，绝不延长节点寿命。
/// 注册表互斥量取最大层号，已持有普通层锁的线程仍可叠加。
pub fn register_uuid(node: &Arc<dyn Exporter>) -> Result<(), LockError> {
    let mut gate = WriterGate::new(&REGISTRY.table)?;
    let table = gate.get_mut(&REGISTRY.table);

    if table.len() >= SWEEP_THRESHOLD && table.len() % SWEEP_THRESHOLD == 0 {
        let before = table.len();
        table.retain(|_, weak| weak.strong_count() > 0);
        tracing::debug!(
            removed = before - table.len(),
            remaining = table.len(),
            "swept dead entries from uuid registry"
        );
    }

    table.insert(node.uuid(), Arc::downgrade(node));
    Ok(())
}

/// 按UUID取节点
///
/// 弱引用升格失败（节点已销毁）时返回None。
pub fn get_by_uuid(uuid: Uuid) -> Option<Arc<dyn Exporter>> {
    let gate = match ReaderGate::new(&REGISTRY.table) {
        Ok(gate) => gate,
        Err(e) => {
            tracing::error!(error = %e, "uuid registry lookup failed");
            return None;
        }
    };
    let table = gate.get(&REGISTRY.table);
    table.get(&uuid).and_then(|weak| weak.upgrade())
}
