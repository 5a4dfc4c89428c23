//! 线节点
//!
//! 两点定义的线段。端点是独立加锁的子节点，以复合成员的形式
//! 导出（`start` / `end`），路径可以继续深入端点的坐标分量。

use crate::point::{point_node, PointNode};
use nalgebra::Point3;
use pcad_core::export::{Capability, ChildExport};
use pcad_core::exporter::{Exporter, ExporterNode, Payload};
use pcad_core::gate::ReaderGate;
use pcad_core::policy::LockError;
use std::sync::Arc;

/// 线载荷：两个端点节点的强引用
pub struct LinePayload {
    pub start: Arc<PointNode>,
    pub end: Arc<PointNode>,
}

impl Payload for LinePayload {
    fn exports() -> Vec<Box<dyn Capability<Self>>> {
        vec![
            ChildExport::boxed("start", |p: &LinePayload| {
                p.start.clone() as Arc<dyn Exporter>
            }),
            ChildExport::boxed("end", |p: &LinePayload| p.end.clone() as Arc<dyn Exporter>),
        ]
    }

    fn deep_clone(&self) -> Result<Self, LockError> {
        // 端点递归深拷贝，克隆出的线与原线不共享任何节点
        Ok(Self {
            start: self.start.deep_copy()?,
            end: self.end.deep_copy()?,
        })
    }
}

/// 线节点
pub type LineNode = ExporterNode<LinePayload>;

/// 由两个已有端点节点创建线节点
pub fn line_from_points(start: Arc<PointNode>, end: Arc<PointNode>) -> Arc<LineNode> {
    ExporterNode::new(LinePayload { start, end })
}

/// 由两组坐标创建线节点（端点节点一并新建）
pub fn line_2points(start: Point3<f64>, end: Point3<f64>) -> Arc<LineNode> {
    line_from_points(
        point_node(start.x, start.y, start.z),
        point_node(end.x, end.y, end.z),
    )
}

/// 线段长度
///
/// 同时共享锁住两个端点后测量，读到的是一致快照。
pub fn length(line: &LineNode) -> Result<f64, LockError> {
    let gate = ReaderGate::new(line.holder())?;
    let payload = gate.get(line.holder());

    let endpoints = [
        payload.start.descriptor().clone(),
        payload.end.descriptor().clone(),
    ];
    let point_gate = ReaderGate::from_descriptors(&endpoints)?;
    let a = point_gate.get(payload.start.holder()).coords;
    let b = point_gate.get(payload.end.holder()).coords;
    Ok((b - a).norm())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_is_euclidean_distance() {
        let line = line_2points(Point3::new(0.0, 0.0, 0.0), Point3::new(3.0, 4.0, 0.0));
        assert_eq!(length(&line).unwrap(), 5.0);
    }

    #[test]
    fn test_resolve_start_point_from_origin_line() {
        let line = line_2points(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 10.0, 10.0));
        let root: Arc<dyn Exporter> = line;

        let start = pcad_core::resolver::try_resolve::<PointNode>(&root, "start").unwrap();
        let node = start.get().unwrap();
        let gate = node.read().unwrap();
        assert_eq!(gate.get(node.holder()).coords, Point3::new(0.0, 0.0, 0.0));
    }

    #[test]
    fn test_resolve_start_x_component() {
        let line = line_2points(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 10.0, 10.0));
        let root: Arc<dyn Exporter> = line;

        let x = pcad_core::resolver::try_resolve::<f64>(&root, "start.x").unwrap();
        assert_eq!(*x.get().unwrap(), 0.0);

        let missing = pcad_core::resolver::try_resolve::<f64>(&root, "middle.x");
        assert!(missing.is_err());
    }

    #[test]
    fn test_holder_sees_mutation_after_relock() {
        let line = line_2points(Point3::new(1.0, 0.0, 0.0), Point3::new(2.0, 0.0, 0.0));
        let root: Arc<dyn Exporter> = line.clone();

        let mut x = pcad_core::resolver::try_resolve::<f64>(&root, "start.x").unwrap();
        assert_eq!(*x.get().unwrap(), 1.0);
        x.release_shared();

        {
            let gate = line.read().unwrap();
            let start = gate.get(line.holder()).start.clone();
            drop(gate);
            let mut pg = start.write().unwrap();
            pg.get_mut(start.holder()).coords.x = 9.0;
        }

        assert!(x.lock_shared().unwrap());
        assert_eq!(*x.get().unwrap(), 9.0);
    }

    #[test]
    fn test_deep_copy_does_not_share_endpoints() {
        let line = line_2points(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0));
        let copy = line.deep_copy().unwrap();

        let orig = line.read().unwrap();
        let cloned = copy.read().unwrap();
        assert_ne!(
            orig.get(line.holder()).start.uuid(),
            cloned.get(copy.holder()).start.uuid()
        );
    }
}
