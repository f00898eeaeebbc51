//! 中间件链
//!
//! 调度与执行两侧各有一条独立的链。链中保存的是中间件的构造函数，
//! 每次调用都会构建新的实例；中间件不调用 `next` 即可短路后续处理。

use std::any::TypeId;
use std::sync::Arc;

use async_trait::async_trait;
use taskrelay_core::models::{ExecutionContext, ScheduleContext};
use taskrelay_core::RelayResult;
use tracing::debug;

#[async_trait]
pub trait Middleware<C: Send + 'static>: Send + Sync {
    async fn call(&self, ctx: &mut C, next: Next<'_, C>) -> RelayResult<()>;
}

/// 链末端
#[async_trait]
pub trait Endpoint<C: Send + 'static>: Send + Sync {
    async fn call(&self, ctx: &mut C) -> RelayResult<()>;
}

/// 剩余的中间件和末端
pub struct Next<'a, C: Send + 'static> {
    rest: &'a [Box<dyn Middleware<C>>],
    endpoint: &'a dyn Endpoint<C>,
}

impl<'a, C: Send + 'static> Next<'a, C> {
    pub async fn run(self, ctx: &mut C) -> RelayResult<()> {
        match self.rest.split_first() {
            Some((head, rest)) => {
                head.call(
                    ctx,
                    Next {
                        rest,
                        endpoint: self.endpoint,
                    },
                )
                .await
            }
            None => self.endpoint.call(ctx).await,
        }
    }
}

type Factory<C> = Arc<dyn Fn() -> Box<dyn Middleware<C>> + Send + Sync>;

struct Entry<C: Send + 'static> {
    type_id: TypeId,
    name: &'static str,
    factory: Factory<C>,
}

impl<C: Send + 'static> Clone for Entry<C> {
    fn clone(&self) -> Self {
        Self {
            type_id: self.type_id,
            name: self.name,
            factory: self.factory.clone(),
        }
    }
}

impl<C: Send + 'static> Entry<C> {
    fn new<M, F>(factory: F) -> Self
    where
        M: Middleware<C> + 'static,
        F: Fn() -> M + Send + Sync + 'static,
    {
        Self {
            type_id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
            factory: Arc::new(move || Box::new(factory()) as Box<dyn Middleware<C>>),
        }
    }
}

/// 有序的中间件列表，按中间件类型识别条目
pub struct MiddlewareChain<C: Send + 'static> {
    entries: Vec<Entry<C>>,
}

pub type ClientChain = MiddlewareChain<ScheduleContext>;
pub type ServerChain = MiddlewareChain<ExecutionContext>;

impl<C: Send + 'static> Default for MiddlewareChain<C> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<C: Send + 'static> Clone for MiddlewareChain<C> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<C: Send + 'static> MiddlewareChain<C> {
    pub fn new() -> Self {
        Self::default()
    }

    fn position_of(&self, type_id: TypeId) -> Option<usize> {
        self.entries.iter().position(|e| e.type_id == type_id)
    }

    fn take(&mut self, type_id: TypeId) -> Option<Entry<C>> {
        self.position_of(type_id).map(|idx| self.entries.remove(idx))
    }

    /// 追加到末尾；已存在同类型条目时原位替换
    pub fn add<M, F>(&mut self, factory: F) -> &mut Self
    where
        M: Middleware<C> + 'static,
        F: Fn() -> M + Send + Sync + 'static,
    {
        let entry = Entry::new(factory);
        match self.position_of(entry.type_id) {
            Some(idx) => self.entries[idx] = entry,
            None => self.entries.push(entry),
        }
        self
    }

    /// 插入到最前面，已存在时移动
    pub fn prepend<M, F>(&mut self, factory: F) -> &mut Self
    where
        M: Middleware<C> + 'static,
        F: Fn() -> M + Send + Sync + 'static,
    {
        let entry = Entry::new(factory);
        self.take(entry.type_id);
        self.entries.insert(0, entry);
        self
    }

    /// 插入到 `T` 之前；`T` 不存在时插入到最前面
    pub fn insert_before<T, M, F>(&mut self, factory: F) -> &mut Self
    where
        T: Middleware<C> + 'static,
        M: Middleware<C> + 'static,
        F: Fn() -> M + Send + Sync + 'static,
    {
        let entry = Entry::new(factory);
        self.take(entry.type_id);
        let idx = self.position_of(TypeId::of::<T>()).unwrap_or(0);
        self.entries.insert(idx, entry);
        self
    }

    /// 插入到 `T` 之后；`T` 不存在时追加到末尾
    pub fn insert_after<T, M, F>(&mut self, factory: F) -> &mut Self
    where
        T: Middleware<C> + 'static,
        M: Middleware<C> + 'static,
        F: Fn() -> M + Send + Sync + 'static,
    {
        let entry = Entry::new(factory);
        self.take(entry.type_id);
        let idx = self
            .position_of(TypeId::of::<T>())
            .map(|i| i + 1)
            .unwrap_or(self.entries.len());
        self.entries.insert(idx, entry);
        self
    }

    pub fn remove<M: Middleware<C> + 'static>(&mut self) -> bool {
        self.take(TypeId::of::<M>()).is_some()
    }

    pub fn exists<M: Middleware<C> + 'static>(&self) -> bool {
        self.position_of(TypeId::of::<M>()).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 中间件类型名，按执行顺序排列
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    /// 依次构建中间件实例并执行，最后调用末端
    pub async fn invoke(&self, ctx: &mut C, endpoint: &dyn Endpoint<C>) -> RelayResult<()> {
        let instances: Vec<Box<dyn Middleware<C>>> =
            self.entries.iter().map(|e| (e.factory)()).collect();
        debug!("Invoking middleware chain with {} entries", instances.len());
        Next {
            rest: &instances,
            endpoint,
        }
        .run(ctx)
        .await
    }
}
