//! 路径与标记
//!
//! 点分路径的解析与表示，如 `"circle1.center.x"`：
//! - `PathToken`: 名字或UUID（形如UUID的片段按UUID解析）
//! - `Path`: 根节点UUID加一串标记，可在缓存过期后重新解析
//!
//! 正因为UUID片段有歧义，给对象起名时禁止使用形如UUID的
//! 字符串（见 `NameError::InvalidName`）。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 路径标记
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathToken {
    /// 名字片段
    Name(String),
    /// UUID片段
    Uuid(Uuid),
}

impl PathToken {
    /// 解析单个片段
    ///
    /// 形如UUID的字符串解析为 `Uuid`，其余为 `Name`。
    pub fn parse(piece: &str) -> Self {
        match Uuid::parse_str(piece) {
            Ok(uuid) => PathToken::Uuid(uuid),
            Err(_) => PathToken::Name(piece.to_string()),
        }
    }

    /// 片段是否为名字
    pub fn is_name(&self) -> bool {
        matches!(self, PathToken::Name(_))
    }
}

impl std::fmt::Display for PathToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathToken::Name(name) => write!(f, "{}", name),
            PathToken::Uuid(uuid) => write!(f, "{}", uuid),
        }
    }
}

/// 解析路径
///
/// 根节点身份加一串有序标记。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    /// 根节点UUID
    root: Uuid,

    /// 标记序列
    tokens: Vec<PathToken>,
}

impl Path {
    /// 从点分字符串构造
    ///
    /// 空片段被忽略；空字符串得到空标记序列（解析根节点自身）。
    pub fn parse(root: Uuid, dotted: &str) -> Self {
        let tokens = dotted
            .trim()
            .split('.')
            .filter(|piece| !piece.is_empty())
            .map(PathToken::parse)
            .collect();
        Self { root, tokens }
    }

    /// 从现成的标记序列构造
    pub fn new(root: Uuid, tokens: Vec<PathToken>) -> Self {
        Self { root, tokens }
    }

    /// 根节点UUID
    pub fn root(&self) -> Uuid {
        self.root
    }

    /// 标记序列
    pub fn tokens(&self) -> &[PathToken] {
        &self.tokens
    }

    /// 追加一个片段
    pub fn push(&mut self, token: PathToken) {
        self.tokens.push(token);
    }

    /// 标记个数
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// 是否指向根自身
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.root)?;
        for token in &self.tokens {
            write!(f, ".{}", token)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        let root = Uuid::new_v4();
        let path = Path::parse(root, "line1.start.x");
        assert_eq!(path.root(), root);
        assert_eq!(path.len(), 3);
        assert!(path.tokens().iter().all(|t| t.is_name()));
    }

    #[test]
    fn test_uuid_piece_detected() {
        let id = "123e4567-e89b-12d3-a456-426614174000";
        let token = PathToken::parse(id);
        assert!(matches!(token, PathToken::Uuid(u) if u.to_string() == id));
    }

    #[test]
    fn test_empty_pieces_ignored() {
        let path = Path::parse(Uuid::new_v4(), "a..b.");
        assert_eq!(path.len(), 2);

        let path = Path::parse(Uuid::new_v4(), "");
        assert!(path.is_empty());
    }

    #[test]
    fn test_display_roundtrip() {
        let root = Uuid::new_v4();
        let path = Path::parse(root, "line.start.x");
        let shown = path.to_string();
        let (shown_root, rest) = shown.split_once('.').unwrap();
        let reparsed = Path::parse(shown_root.parse().unwrap(), rest);
        assert_eq!(path, reparsed);
    }
}
