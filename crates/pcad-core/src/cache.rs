//! 路径缓存
//!
//! 缓存一次解析途中经过的中间节点链，让重复解析跳过已经走过的
//! 前缀。链上只存弱引用，缓存绝不延长节点寿命；最终值另存
//! 一份弱句柄，命中时无需锁任何中间节点。
//!
//! 条目按墙钟时间分"层"修剪（`layer_duration`），每步修剪丢掉
//! 最老一层的条目；超过 `max_layers` 层的条目一律过期。时钟可
//! 注入，过期测试不必真等。

use crate::exporter::Exporter;
use crate::mutex::MutexDescriptor;
use std::any::{Any, TypeId};
use std::ptr::NonNull;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// 时钟抽象，供测试人为推进时间
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// 真实墙钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 缓存配置
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// 每层的时长
    pub layer_duration: Duration,

    /// 容忍的层数，超过即过期
    pub max_layers: usize,

    /// 是否启用（禁用时每次解析都从头走）
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            layer_duration: Duration::from_secs(30),
            max_layers: 4,
            enabled: true,
        }
    }
}

/// 缓存统计
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// 最终值直接命中次数
    pub hits: usize,

    /// 未命中（含部分前缀恢复）次数
    pub misses: usize,

    /// 被修剪掉的条目数
    pub pruned_entries: usize,

    /// 整体失效次数
    pub invalidations: usize,
}

/// 链上一帧：解析到某节点时还剩多少标记
struct CacheEntry {
    tokens_left: usize,
    node: Weak<dyn Exporter>,
    stamp: Instant,
}

/// 缓存的最终值（弱存放的已放句柄原料）
#[derive(Clone)]
pub(crate) struct CachedFinal {
    pub weak: Weak<dyn Any + Send + Sync>,
    pub value: NonNull<()>,
    pub type_id: TypeId,
    pub mutexes: Vec<Arc<MutexDescriptor>>,
    stamp: Instant,
}

// 指针仅在弱引用升格成功且互斥量加锁之后解引用
unsafe impl Send for CachedFinal {}

/// 路径缓存
pub struct PathCache {
    /// 根到解析前沿的条目，时间戳单调不减
    entries: Vec<CacheEntry>,

    /// 最终值
    final_entry: Option<CachedFinal>,

    config: CacheConfig,
    stats: CacheStats,
    clock: Arc<dyn Clock>,
}

impl PathCache {
    /// 用真实墙钟创建
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// 注入时钟创建
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Vec::new(),
            final_entry: None,
            config,
            stats: CacheStats::default(),
            clock,
        }
    }

    /// 是否启用
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// 统计快照
    pub fn stats(&self) -> CacheStats {
        self.stats.clone()
    }

    /// 配置
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// 整体失效
    pub fn invalidate(&mut self) {
        if !self.entries.is_empty() || self.final_entry.is_some() {
            self.stats.invalidations += 1;
        }
        self.entries.clear();
        self.final_entry = None;
    }

    /// 过期界限
    fn bound(&self) -> Duration {
        self.config.layer_duration * self.config.max_layers as u32
    }

    /// 按层修剪过期条目
    pub fn prune(&mut self) {
        let now = self.clock.now();
        let bound = self.bound();

        // 每步丢掉最老一层的条目
        while let Some(oldest) = self.entries.first() {
            if now.duration_since(oldest.stamp) <= bound {
                break;
            }
            let layer_end = oldest.stamp + self.config.layer_duration;
            let before = self.entries.len();
            self.entries.retain(|e| e.stamp >= layer_end);
            let dropped = before - self.entries.len();
            self.stats.pruned_entries += dropped;
            tracing::trace!(dropped, "pruned oldest cache layer");
        }

        if let Some(final_entry) = &self.final_entry {
            if now.duration_since(final_entry.stamp) > bound {
                self.final_entry = None;
            }
        }
    }

    /// 记录新的解析前沿
    pub(crate) fn record(&mut self, tokens_left: usize, node: &Arc<dyn Exporter>) {
        if !self.config.enabled {
            return;
        }
        self.entries.push(CacheEntry {
            tokens_left,
            node: Arc::downgrade(node),
            stamp: self.clock.now(),
        });
    }

    /// 记录最终值
    pub(crate) fn record_final(
        &mut self,
        weak: Weak<dyn Any + Send + Sync>,
        value: NonNull<()>,
        type_id: TypeId,
        mutexes: Vec<Arc<MutexDescriptor>>,
    ) {
        if !self.config.enabled {
            return;
        }
        self.final_entry = Some(CachedFinal {
            weak,
            value,
            type_id,
            mutexes,
            stamp: self.clock.now(),
        });
    }

    /// 未过期且对象仍存活的最终值
    pub(crate) fn fresh_final(&self) -> Option<CachedFinal> {
        let entry = self.final_entry.as_ref()?;
        if self.clock.now().duration_since(entry.stamp) > self.bound() {
            return None;
        }
        if entry.weak.strong_count() == 0 {
            return None;
        }
        Some(entry.clone())
    }

    /// 找到最深的仍存活缓存帧作为恢复点
    ///
    /// 返回 `(已消耗标记数, 节点)`；更深的死帧被截掉；
    /// 整条链都死了则清空并返回None（从根重走）。
    pub(crate) fn resume_point(
        &mut self,
        total_tokens: usize,
    ) -> Option<(usize, Arc<dyn Exporter>)> {
        while let Some(entry) = self.entries.last() {
            if entry.tokens_left > total_tokens {
                // 路径变短了，链不再适用
                self.entries.clear();
                return None;
            }
            match entry.node.upgrade() {
                Some(node) => {
                    let consumed = total_tokens - entry.tokens_left;
                    return Some((consumed, node));
                }
                None => {
                    self.entries.pop();
                }
            }
        }
        None
    }

    pub(crate) fn note_hit(&mut self) {
        self.stats.hits += 1;
    }

    pub(crate) fn note_miss(&mut self) {
        self.stats.misses += 1;
    }

    /// 链上条目数（测试用）
    pub fn chain_len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::Capability;
    use crate::exporter::{ExporterNode, Payload};
    use crate::policy::LockError;
    use parking_lot::Mutex;

    struct Stub;

    impl Payload for Stub {
        fn exports() -> Vec<Box<dyn Capability<Self>>> {
            Vec::new()
        }

        fn deep_clone(&self) -> Result<Self, LockError> {
            Ok(Stub)
        }
    }

    /// 手动推进的测试时钟
    struct TestClock(Mutex<Instant>);

    impl TestClock {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Instant::now())))
        }

        fn advance(&self, by: Duration) {
            *self.0.lock() += by;
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            *self.0.lock()
        }
    }

    fn node() -> Arc<dyn Exporter> {
        ExporterNode::new(Stub)
    }

    #[test]
    fn test_prune_drops_expired_layers() {
        let clock = TestClock::new();
        let config = CacheConfig {
            layer_duration: Duration::from_secs(10),
            max_layers: 2,
            enabled: true,
        };
        let mut cache = PathCache::with_clock(config, clock.clone());

        let a = node();
        let b = node();
        cache.record(2, &a);
        clock.advance(Duration::from_secs(15));
        cache.record(1, &b);
        assert_eq!(cache.chain_len(), 2);

        // 第一帧年龄25秒 > 20秒界限，被整层丢掉；第二帧才10秒
        clock.advance(Duration::from_secs(10));
        cache.prune();
        assert_eq!(cache.chain_len(), 1);

        // 再过界限，剩下的也过期
        clock.advance(Duration::from_secs(25));
        cache.prune();
        assert_eq!(cache.chain_len(), 0);
    }

    #[test]
    fn test_resume_point_skips_dead_frames() {
        let mut cache = PathCache::new(CacheConfig::default());
        let a = node();
        let b = node();
        cache.record(2, &a);
        cache.record(1, &b);

        drop(b);
        let (consumed, resumed) = cache.resume_point(3).unwrap();
        assert_eq!(consumed, 1);
        assert_eq!(resumed.uuid(), a.uuid());
        assert_eq!(cache.chain_len(), 1);
    }

    #[test]
    fn test_resume_point_empty_when_all_dead() {
        let mut cache = PathCache::new(CacheConfig::default());
        let a = node();
        cache.record(1, &a);
        drop(a);
        assert!(cache.resume_point(2).is_none());
        assert_eq!(cache.chain_len(), 0);
    }

    #[test]
    fn test_final_entry_expires() {
        let clock = TestClock::new();
        let config = CacheConfig {
            layer_duration: Duration::from_secs(10),
            max_layers: 1,
            enabled: true,
        };
        let mut cache = PathCache::with_clock(config, clock.clone());

        let n = node();
        let anchor = n.clone().as_any_arc();
        cache.record_final(
            Arc::downgrade(&anchor),
            NonNull::<()>::dangling(),
            TypeId::of::<f64>(),
            vec![],
        );
        assert!(cache.fresh_final().is_some());

        clock.advance(Duration::from_secs(11));
        assert!(cache.fresh_final().is_none());
    }

    #[test]
    fn test_disabled_cache_records_nothing() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let mut cache = PathCache::new(config);
        let n = node();
        cache.record(1, &n);
        assert_eq!(cache.chain_len(), 0);
    }
}
