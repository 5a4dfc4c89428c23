//! PCAD 并发核心
//!
//! 文档模型的并发基座：分层互斥锁策略、导出者节点图和
//! 点分路径解析。
//!
//! # 架构设计
//!
//! 三层结构：
//! - 锁层：`MutexDescriptor` + 线程本地锁登记（`policy`），
//!   强制"新锁层号必须高于已持有锁"的全序，杜绝锁序死锁
//! - 节点层：`ExporterNode` 把载荷、身份、变更信号和导出能力
//!   捆成引用计数的图节点
//! - 解析层：`PathResolver` 沿导出能力行走点分路径，产出
//!   带锁的 `ResultHolder`，中途经过的链可缓存
//!
//! # 示例
//!
//! ```rust
//! use pcad_core::prelude::*;
//!
//! struct Leaf { value: f64 }
//!
//! impl Payload for Leaf {
//!     fn exports() -> Vec<Box<dyn Capability<Self>>> {
//!         vec![FieldExport::boxed("value", |p: &mut Leaf| &mut p.value)]
//!     }
//!     fn deep_clone(&self) -> Result<Self, LockError> {
//!         Ok(Leaf { value: self.value })
//!     }
//! }
//!
//! let node = ExporterNode::new(Leaf { value: 4.0 });
//! let root: std::sync::Arc<dyn Exporter> = node;
//! let holder = pcad_core::resolver::try_resolve::<f64>(&root, "value").unwrap();
//! assert_eq!(*holder.get().unwrap(), 4.0);
//! ```

pub mod cache;
pub mod export;
pub mod exporter;
pub mod gate;
pub mod holder;
pub mod locks;
pub mod multi_index;
pub mod mutex;
pub mod path;
pub mod policy;
pub mod queue;
pub mod resolver;
pub mod signal;

pub mod prelude {
    //! 常用类型的便捷导入
    pub use crate::cache::{CacheConfig, CacheStats, Clock, SystemClock};
    pub use crate::export::{Capability, ChildExport, ChildrenExport, FieldExport, StepResult};
    pub use crate::exporter::{
        get_by_uuid, register_uuid, validate_name, Exporter, ExporterIdentity, ExporterNode,
        NameError, Payload,
    };
    pub use crate::gate::{ReaderGate, ReaderKeeper, WriterGate, WriterKeeper};
    pub use crate::holder::ResultHolder;
    pub use crate::locks::{ExclusiveLock, LockTransfer, SharedLock};
    pub use crate::multi_index::MultiIndexMap;
    pub use crate::mutex::{
        MutexDescriptor, MutexHolder, ThreadSafeStruct, LAYER_LOCK_FREE, LAYER_REGISTRY,
    };
    pub use crate::path::{Path, PathToken};
    pub use crate::policy::LockError;
    pub use crate::queue::{QueueError, ThreadSafeQueue};
    pub use crate::resolver::{resolve, try_resolve, PathResolver, ResolveError};
    pub use crate::signal::Signal;
}
