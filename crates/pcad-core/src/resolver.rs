//! 路径解析器
//!
//! 把点分路径（根UUID + 名字/UUID标记序列）解析成带锁的结果
//! 句柄。解析器绑定一条路径，内嵌一份路径缓存；重复解析同一条
//! 路径时先试缓存的最终值，再试链上最深的存活节点，最后才从根
//! 重走。
//!
//! 行走协定：每步先对当前节点共享加锁，再让节点的导出能力认领
//! 前端标记。进入子节点时放掉当前锁；解析到普通值成员时当前锁
//! 直接转交给结果句柄。

use crate::cache::{CacheConfig, CacheStats, Clock, PathCache};
use crate::export::StepResult;
use crate::exporter::{self, Exporter};
use crate::holder::ResultHolder;
use crate::locks::SharedLock;
use crate::path::{Path, PathToken};
use crate::policy::LockError;
use std::any::{Any, TypeId};
use std::ptr::NonNull;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// 解析错误
#[derive(Debug, Error)]
pub enum ResolveError {
    /// 某个标记没有被任何导出能力认领
    #[error("path step '{0}' matched no export")]
    NotFound(String),

    /// 标记耗尽时停在的对象不是请求的类型，路径还不够长
    #[error("path ended before reaching a value of the requested type")]
    TooFewTokens,

    /// 已解析到普通值成员但路径还有剩余标记
    #[error("path continues past a plain value member")]
    TooManyTokens,

    /// 值存在但类型与请求不符
    #[error("value exists but does not export the requested type")]
    DoesNotExport,

    /// 行走途中的锁协议违规
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// 解析起点
enum RootRef {
    /// 调用方已持有根节点的强引用
    Held(Arc<dyn Exporter>),

    /// 只有UUID，解析时经全局注册表查找
    Uuid(Uuid),
}

/// 路径解析器
///
/// 绑定一条路径，可反复解析；缓存跟着解析器走。
pub struct PathResolver {
    root: RootRef,
    tokens: Vec<PathToken>,
    cache: PathCache,
}

impl PathResolver {
    /// 以持有的根节点和点分路径创建
    pub fn new(root: &Arc<dyn Exporter>, dotted: &str) -> Self {
        Self {
            root: RootRef::Held(root.clone()),
            tokens: parse_tokens(dotted),
            cache: PathCache::new(CacheConfig::default()),
        }
    }

    /// 以根UUID和点分路径创建（解析时经注册表找根）
    pub fn from_uuid(root: Uuid, dotted: &str) -> Self {
        Self {
            root: RootRef::Uuid(root),
            tokens: parse_tokens(dotted),
            cache: PathCache::new(CacheConfig::default()),
        }
    }

    /// 从结构化路径创建
    ///
    /// 配合 `ResultHolder::path` 使用：句柄过期后凭路径重新解析。
    pub fn from_path(path: &Path) -> Self {
        Self {
            root: RootRef::Uuid(path.root()),
            tokens: path.tokens().to_vec(),
            cache: PathCache::new(CacheConfig::default()),
        }
    }

    /// 替换缓存配置
    pub fn with_cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = PathCache::new(config);
        self
    }

    /// 替换缓存配置并注入时钟
    pub fn with_clock(mut self, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        self.cache = PathCache::with_clock(config, clock);
        self
    }

    /// 丢弃全部缓存
    pub fn invalidate_cache(&mut self) {
        self.cache.invalidate();
    }

    /// 缓存统计快照
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// 解析为类型T的结果句柄
    pub fn try_resolve<T: Any + Send + Sync>(
        &mut self,
    ) -> Result<ResultHolder<T>, ResolveError> {
        self.cache.prune();

        if self.cache.is_enabled() {
            match self.try_cached_final::<T>() {
                Ok(Some(holder)) => {
                    self.cache.note_hit();
                    return Ok(holder);
                }
                Ok(None) => self.cache.note_miss(),
                Err(e) => {
                    self.cache.invalidate();
                    return Err(e);
                }
            }
        }

        match self.walk::<T>() {
            Ok(holder) => Ok(holder),
            Err(e) => {
                // 行走失败即整体作废，途中记下的半截前沿不可信
                self.cache.invalidate();
                Err(e)
            }
        }
    }

    /// 从根（或缓存恢复点）沿导出能力走完标记序列
    fn walk<T: Any + Send + Sync>(&mut self) -> Result<ResultHolder<T>, ResolveError> {
        let total = self.tokens.len();
        let (mut consumed, mut current) = match self.cache.resume_point(total) {
            Some(resume) => resume,
            None => (0, self.root_node()?),
        };

        loop {
            let lock = SharedLock::single(current.descriptor())?;
            let remaining = &self.tokens[consumed..];

            if remaining.is_empty() {
                // 路径停在节点上：请求的类型必须就是这个节点
                let typed: Arc<T> = current
                    .clone()
                    .as_any_arc()
                    .downcast::<T>()
                    .map_err(|_| ResolveError::TooFewTokens)?;
                return Ok(self.finish_at_node(typed, &current, lock));
            }

            match current.clone().resolve_step(remaining) {
                StepResult::NotFound => {
                    return Err(ResolveError::NotFound(remaining[0].to_string()));
                }
                StepResult::Chain { node, consumed: n } => {
                    assert!(n >= 1, "a capability must consume at least one token");
                    consumed += n;
                    self.cache.record(total - consumed, &node);
                    // 先放父节点锁再锁子节点，不形成嵌套
                    drop(lock);
                    current = node;
                }
                StepResult::Field {
                    ptr,
                    type_id,
                    consumed: n,
                } => {
                    assert!(n >= 1, "a capability must consume at least one token");
                    if consumed + n < total {
                        return Err(ResolveError::TooManyTokens);
                    }
                    if type_id != TypeId::of::<T>() {
                        return Err(ResolveError::DoesNotExport);
                    }
                    return Ok(self.finish_at_field(ptr, &current, lock));
                }
            }
        }
    }

    /// `try_resolve` 的Option外衣，失败记一条调试日志
    pub fn resolve<T: Any + Send + Sync>(&mut self) -> Option<ResultHolder<T>> {
        match self.try_resolve::<T>() {
            Ok(holder) => Some(holder),
            Err(e) => {
                tracing::debug!(error = %e, path = %self.path(), "path resolution failed");
                None
            }
        }
    }

    /// 本解析器绑定的路径
    pub fn path(&self) -> Path {
        let root = match &self.root {
            RootRef::Held(node) => node.uuid(),
            RootRef::Uuid(uuid) => *uuid,
        };
        Path::new(root, self.tokens.clone())
    }

    /// 取根节点的强引用
    fn root_node(&self) -> Result<Arc<dyn Exporter>, ResolveError> {
        match &self.root {
            RootRef::Held(node) => Ok(node.clone()),
            RootRef::Uuid(uuid) => exporter::get_by_uuid(*uuid)
                .ok_or_else(|| ResolveError::NotFound(uuid.to_string())),
        }
    }

    /// 缓存的最终值仍然可用时直接构造句柄
    fn try_cached_final<T: Any + Send + Sync>(
        &mut self,
    ) -> Result<Option<ResultHolder<T>>, ResolveError> {
        let Some(entry) = self.cache.fresh_final() else {
            return Ok(None);
        };
        if entry.type_id != TypeId::of::<T>() {
            // 同一路径换了请求类型，旧缓存整体作废
            self.cache.invalidate();
            return Ok(None);
        }
        let Some(anchor) = entry.weak.upgrade() else {
            return Ok(None);
        };
        let lock = SharedLock::new(&entry.mutexes)?;
        Ok(Some(ResultHolder::new(
            entry.value.cast::<T>(),
            entry.type_id,
            anchor,
            entry.mutexes,
            lock,
            self.path(),
        )))
    }

    /// 路径停在节点上：节点自身就是最终值
    fn finish_at_node<T: Any + Send + Sync>(
        &mut self,
        node: Arc<T>,
        source: &Arc<dyn Exporter>,
        lock: SharedLock,
    ) -> ResultHolder<T> {
        // Arc指向的分配永不为空
        let ptr = unsafe { NonNull::new_unchecked(Arc::as_ptr(&node) as *mut T) };
        // 互斥量集合取自节点本身。重入解析时锁对象没有新取任何
        // 描述符，句柄重新加锁仍要锁住节点。
        let mutexes = vec![source.descriptor().clone()];
        let holder = ResultHolder::new(
            ptr,
            TypeId::of::<T>(),
            node as Arc<dyn Any + Send + Sync>,
            mutexes,
            lock,
            self.path(),
        );
        self.record_final(&holder);
        holder
    }

    /// 路径停在普通值成员上：句柄借用父节点的互斥量和锚
    fn finish_at_field<T: Any + Send + Sync>(
        &mut self,
        ptr: NonNull<()>,
        parent: &Arc<dyn Exporter>,
        lock: SharedLock,
    ) -> ResultHolder<T> {
        let mutexes = vec![parent.descriptor().clone()];
        let holder = ResultHolder::new(
            ptr.cast::<T>(),
            TypeId::of::<T>(),
            parent.clone().as_any_arc(),
            mutexes,
            lock,
            self.path(),
        );
        self.record_final(&holder);
        holder
    }

    fn record_final<T: ?Sized + 'static>(&mut self, holder: &ResultHolder<T>) {
        let (weak, value, type_id, mutexes) = holder.parts_for_cache();
        self.cache.record_final(weak, value, type_id, mutexes);
    }
}

impl std::fmt::Debug for PathResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathResolver")
            .field("path", &self.path().to_string())
            .finish_non_exhaustive()
    }
}

fn parse_tokens(dotted: &str) -> Vec<PathToken> {
    dotted
        .split('.')
        .filter(|piece| !piece.is_empty())
        .map(PathToken::parse)
        .collect()
}

/// 一次性解析（每次都从根走，不建缓存）
pub fn try_resolve<T: Any + Send + Sync>(
    root: &Arc<dyn Exporter>,
    dotted: &str,
) -> Result<ResultHolder<T>, ResolveError> {
    let config = CacheConfig {
        enabled: false,
        ..CacheConfig::default()
    };
    PathResolver::new(root, dotted)
        .with_cache_config(config)
        .try_resolve()
}

/// 一次性解析的Option外衣
pub fn resolve<T: Any + Send + Sync>(
    root: &Arc<dyn Exporter>,
    dotted: &str,
) -> Option<ResultHolder<T>> {
    try_resolve(root, dotted).ok()
}
