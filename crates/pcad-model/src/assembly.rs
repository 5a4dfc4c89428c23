//! 装配节点
//!
//! 持有一组动态子节点的容器。子节点按UUID与名字双重索引，
//! 经 `ChildrenExport` 导出；路径里既可以写子节点的名字，
//! 也可以直接写它的UUID。

use pcad_core::export::{Capability, ChildrenExport};
use pcad_core::exporter::{Exporter, ExporterNode, Payload};
use pcad_core::multi_index::MultiIndexMap;
use pcad_core::policy::LockError;
use std::sync::Arc;
use uuid::Uuid;

/// 装配载荷
#[derive(Default)]
pub struct AssemblyPayload {
    children: MultiIndexMap,
}

impl AssemblyPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// 子节点容器
    pub fn children(&self) -> &MultiIndexMap {
        &self.children
    }

    /// 收入一个子节点
    pub fn insert(&mut self, node: Arc<dyn Exporter>) {
        self.children.insert(node);
    }

    /// 按UUID移走一个子节点
    pub fn remove(&mut self, uuid: Uuid) -> Option<Arc<dyn Exporter>> {
        self.children.remove(uuid)
    }

    /// 子节点改名后重建名字索引
    pub fn refresh_names(&mut self) {
        self.children.refresh_names();
    }
}

impl Payload for AssemblyPayload {
    fn exports() -> Vec<Box<dyn Capability<Self>>> {
        vec![ChildrenExport::boxed(|p: &AssemblyPayload| &p.children)]
    }

    fn deep_clone(&self) -> Result<Self, LockError> {
        let mut children = MultiIndexMap::new();
        for child in self.children.iter() {
            children.insert(child.deep_copy_node()?);
        }
        Ok(Self { children })
    }
}

/// 装配节点
pub type AssemblyNode = ExporterNode<AssemblyPayload>;

/// 创建空装配节点
pub fn assembly_node() -> Arc<AssemblyNode> {
    ExporterNode::new(AssemblyPayload::new())
}

/// 在独占锁下把子节点收入装配
pub fn add_child(assembly: &AssemblyNode, child: Arc<dyn Exporter>) -> Result<(), LockError> {
    let mut gate = assembly.write()?;
    gate.get_mut(assembly.holder()).insert(child);
    Ok(())
}

/// 子节点改名后重建装配的名字索引
pub fn refresh_names(assembly: &AssemblyNode) -> Result<(), LockError> {
    let mut gate = assembly.write()?;
    gate.get_mut(assembly.holder()).refresh_names();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::point_node;

    #[test]
    fn test_children_indexed_by_name_and_uuid() {
        let asm = assembly_node();
        let p = point_node(1.0, 0.0, 0.0);
        p.set_name("anchor").unwrap();
        let uuid = p.uuid();
        add_child(&asm, p).unwrap();

        let gate = asm.read().unwrap();
        let children = gate.get(asm.holder()).children();
        assert_eq!(children.get_by_name("anchor").unwrap().uuid(), uuid);
        assert!(children.get_by_uuid(uuid).is_some());
    }

    #[test]
    fn test_resolve_child_by_name_and_by_uuid_token() {
        use crate::line::line_2points;
        use nalgebra::Point3;
        use pcad_core::resolver::try_resolve;

        let asm = assembly_node();
        let line = line_2points(Point3::new(2.0, 0.0, 0.0), Point3::new(5.0, 0.0, 0.0));
        line.set_name("axis").unwrap();
        let line_uuid = line.uuid();
        add_child(&asm, line).unwrap();

        let root: Arc<dyn Exporter> = asm;

        let by_name = try_resolve::<f64>(&root, "axis.start.x").unwrap();
        assert_eq!(*by_name.get().unwrap(), 2.0);
        drop(by_name);

        // UUID标记与名字标记等价
        let dotted = format!("{line_uuid}.start.x");
        let by_uuid = try_resolve::<f64>(&root, &dotted).unwrap();
        assert_eq!(*by_uuid.get().unwrap(), 2.0);
    }

    #[test]
    fn test_deep_clone_copies_children() {
        let asm = assembly_node();
        let p = point_node(4.0, 0.0, 0.0);
        p.set_name("pivot").unwrap();
        add_child(&asm, p.clone()).unwrap();

        let copy = asm.deep_copy().unwrap();
        let gate = copy.read().unwrap();
        let children = gate.get(copy.holder()).children();
        assert_eq!(children.len(), 1);
        // 子节点是独立的克隆，不与原装配共享
        assert!(children.get_by_uuid(p.uuid()).is_none());
    }

    #[test]
    fn test_refresh_names_after_rename() {
        let asm = assembly_node();
        let p = point_node(0.0, 0.0, 0.0);
        p.set_name("before").unwrap();
        add_child(&asm, p.clone()).unwrap();

        p.set_name("after").unwrap();
        refresh_names(&asm).unwrap();

        let gate = asm.read().unwrap();
        let children = gate.get(asm.holder()).children();
        assert!(children.get_by_name("before").is_none());
        assert_eq!(children.get_by_name("after").unwrap().uuid(), p.uuid());
    }
}
