//! 多索引容器
//!
//! 同一组节点按UUID和名字双重索引。名字索引记录插入时的名字，
//! 节点改名后调用 `refresh_names` 重建。装配类节点和动态子节点
//! 导出（`ChildrenExport`）都建立在它之上。

use crate::exporter::Exporter;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// 按UUID与名字双重索引的节点容器
#[derive(Default)]
pub struct MultiIndexMap {
    by_uuid: HashMap<Uuid, Arc<dyn Exporter>>,
    by_name: HashMap<String, Uuid>,
}

impl MultiIndexMap {
    /// 创建空容器
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入节点
    ///
    /// 同UUID的旧节点被替换；有名字的节点同时进入名字索引。
    pub fn insert(&mut self, node: Arc<dyn Exporter>) {
        let uuid = node.uuid();
        if let Some(name) = node.name() {
            self.by_name.insert(name, uuid);
        }
        self.by_uuid.insert(uuid, node);
    }

    /// 按UUID移除
    pub fn remove(&mut self, uuid: Uuid) -> Option<Arc<dyn Exporter>> {
        let node = self.by_uuid.remove(&uuid)?;
        self.by_name.retain(|_, id| *id != uuid);
        Some(node)
    }

    /// 按UUID查找
    pub fn get_by_uuid(&self, uuid: Uuid) -> Option<Arc<dyn Exporter>> {
        self.by_uuid.get(&uuid).cloned()
    }

    /// 按名字查找
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn Exporter>> {
        let uuid = self.by_name.get(name)?;
        self.by_uuid.get(uuid).cloned()
    }

    /// 节点改名后重建名字索引
    pub fn refresh_names(&mut self) {
        self.by_name.clear();
        for (uuid, node) in &self.by_uuid {
            if let Some(name) = node.name() {
                self.by_name.insert(name, *uuid);
            }
        }
    }

    /// 遍历全部节点
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Exporter>> {
        self.by_uuid.values()
    }

    /// 节点个数
    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }
}

impl std::fmt::Debug for MultiIndexMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiIndexMap")
            .field("len", &self.len())
            .field("named", &self.by_name.len())
            .finish()
    }
}
