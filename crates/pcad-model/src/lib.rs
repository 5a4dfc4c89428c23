//! PCAD 文档模型节点
//!
//! 建立在 `pcad-core` 之上的具体模型类型：
//! - `PointNode`: 三维坐标点，分量按名字导出
//! - `LineNode`: 两点线段，端点作为复合成员导出
//! - `AssemblyNode`: 动态子节点容器，按名字或UUID解析
//!
//! # 示例
//!
//! ```rust
//! use nalgebra::Point3;
//! use pcad_model::prelude::*;
//! use pcad_core::exporter::Exporter;
//! use std::sync::Arc;
//!
//! let line = line_2points(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 0.0, 0.0));
//! let root: Arc<dyn Exporter> = line;
//! let x = pcad_core::resolver::try_resolve::<f64>(&root, "start.x").unwrap();
//! assert_eq!(*x.get().unwrap(), 0.0);
//! ```

pub mod assembly;
pub mod line;
pub mod point;

pub mod prelude {
    //! 常用类型的便捷导入
    pub use crate::assembly::{add_child, assembly_node, refresh_names, AssemblyNode, AssemblyPayload};
    pub use crate::line::{length, line_2points, line_from_points, LineNode, LinePayload};
    pub use crate::point::{point_node, PointNode, PointPayload};
}
