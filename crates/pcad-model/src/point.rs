//! 点节点
//!
//! 最小的文档模型节点：三维坐标，逐分量导出为普通值成员。

use nalgebra::Point3;
use pcad_core::export::{Capability, FieldExport};
use pcad_core::exporter::{ExporterNode, Payload};
use pcad_core::policy::LockError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 点载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointPayload {
    /// 三维坐标
    pub coords: Point3<f64>,
}

impl PointPayload {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            coords: Point3::new(x, y, z),
        }
    }
}

impl Payload for PointPayload {
    fn exports() -> Vec<Box<dyn Capability<Self>>> {
        vec![
            FieldExport::boxed("x", |p: &mut PointPayload| &mut p.coords.x),
            FieldExport::boxed("y", |p: &mut PointPayload| &mut p.coords.y),
            FieldExport::boxed("z", |p: &mut PointPayload| &mut p.coords.z),
        ]
    }

    fn deep_clone(&self) -> Result<Self, LockError> {
        Ok(self.clone())
    }
}

/// 点节点
pub type PointNode = ExporterNode<PointPayload>;

/// 创建点节点
pub fn point_node(x: f64, y: f64, z: f64) -> Arc<PointNode> {
    ExporterNode::new(PointPayload::new(x, y, z))
}
