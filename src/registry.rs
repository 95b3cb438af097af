//! Hook 注册表
//!
//! 方法标识到 `HandlerChain` 的映射。Hook 链在第一次注册或第一次调用时惰性创建，
//! 之后在注册表的整个生命周期内保持不变，只有其中的 Hook 列表会被增删。
//!
//! 注册表是显式持有的实例，由调用方注入 `RpcCaller`，不存在隐藏的进程级单例。

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::handler::{HandlerChain, ServiceHandler};
use crate::message::{Message, MethodDescriptor, MethodIdentity};

const REGISTRY_TARGET: &str = module_path!();

type ErasedChain = Arc<dyn Any + Send + Sync>;

/// 方法 -> Hook 链
#[derive(Default)]
pub struct HandlerRegistry {
    chains: DashMap<MethodIdentity, ErasedChain>,
}

impl HandlerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 获取方法对应的 Hook 链，不存在时原子地创建
    ///
    /// 并发地对同一方法调用时，所有调用方拿到的是同一个实例。
    pub fn resolve<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor<Req, Res>,
    ) -> Arc<HandlerChain<Req, Res>> {
        let identity = method.identity();
        if let Some(existing) = self.chains.get(&identity) {
            if let Some(chain) = downcast_chain::<Req, Res>(existing.value()) {
                return chain;
            }
        }

        let entry = self.chains.entry(identity).or_insert_with(|| {
            debug!(target: REGISTRY_TARGET, method = %method, "creating handler chain");
            Arc::new(HandlerChain::new(method.clone())) as ErasedChain
        });
        match downcast_chain::<Req, Res>(entry.value()) {
            Some(chain) => chain,
            // 键里带了请求/响应的 TypeId，存进去的一定是这个类型
            None => unreachable!("handler chain stored under a mismatched method identity"),
        }
    }

    /// 只查询，不创建
    pub fn chain<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor<Req, Res>,
    ) -> Option<Arc<HandlerChain<Req, Res>>> {
        self.chains
            .get(&method.identity())
            .and_then(|entry| downcast_chain::<Req, Res>(entry.value()))
    }

    /// 把 Hook 注册到它声明的方法上
    ///
    /// 返回 `false` 表示同一实例已经在链上。
    pub fn add_handler<Req, Res, H>(&self, handler: Arc<H>) -> bool
    where
        Req: Message,
        Res: Message,
        H: ServiceHandler<Req, Res>,
    {
        let chain = self.resolve(handler.match_method());
        let added = chain.add_handler(handler);
        info!(
            target: REGISTRY_TARGET,
            method = %chain.method(),
            added,
            handlers = chain.len(),
            "service handler registered"
        );
        added
    }

    /// 从 Hook 声明的方法上移除该实例
    pub fn remove_handler<Req, Res, H>(&self, handler: &Arc<H>) -> bool
    where
        Req: Message,
        Res: Message,
        H: ServiceHandler<Req, Res>,
    {
        let chain = self.resolve(handler.match_method());
        let as_dyn: Arc<dyn ServiceHandler<Req, Res>> = Arc::clone(handler) as _;
        let removed = chain.remove_handler(&as_dyn);
        info!(
            target: REGISTRY_TARGET,
            method = %chain.method(),
            removed,
            handlers = chain.len(),
            "service handler removed"
        );
        removed
    }

    /// 已创建的 Hook 链数量
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

fn downcast_chain<Req: Message, Res: Message>(
    erased: &ErasedChain,
) -> Option<Arc<HandlerChain<Req, Res>>> {
    Arc::clone(erased).downcast::<HandlerChain<Req, Res>>().ok()
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("chains", &self.chains.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{CallContext, HandlerResult};
    use crate::message::TraceId;
    use crate::options::CallOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Debug)]
    struct GetReq;
    #[derive(Debug)]
    struct GetRes;

    struct Counter {
        method: MethodDescriptor<GetReq, GetRes>,
        enters: AtomicUsize,
    }

    impl Counter {
        fn new(method: &str) -> Arc<Self> {
            Arc::new(Self {
                method: MethodDescriptor::unary("store.StoreService", method),
                enters: AtomicUsize::new(0),
            })
        }
    }

    impl ServiceHandler<GetReq, GetRes> for Counter {
        fn match_method(&self) -> &MethodDescriptor<GetReq, GetRes> {
            &self.method
        }

        fn enter(&self, _ctx: &CallContext<'_, GetReq>) -> HandlerResult {
            self.enters.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_resolve_is_memoized() {
        let registry = HandlerRegistry::new();
        let method = MethodDescriptor::<GetReq, GetRes>::unary("store.StoreService", "KvGet");
        assert!(registry.chain(&method).is_none());

        let first = registry.resolve(&method);
        let second = registry.resolve(&method.clone());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(registry.chain(&method).is_some());
    }

    #[test]
    fn test_concurrent_resolve_yields_one_chain() {
        let registry = HandlerRegistry::new();
        let method = MethodDescriptor::<GetReq, GetRes>::unary("store.StoreService", "KvGet");

        let chains: Vec<_> = thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| registry.resolve(&method)))
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().expect("resolver thread panicked"))
                .collect()
        });

        for chain in &chains[1..] {
            assert!(Arc::ptr_eq(&chains[0], chain));
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_handlers_are_scoped_to_their_method() {
        let registry = HandlerRegistry::new();
        let get_hook = Counter::new("KvGet");
        let put_hook = Counter::new("KvPut");
        assert!(registry.add_handler(get_hook.clone()));
        assert!(registry.add_handler(put_hook.clone()));
        assert!(!registry.add_handler(get_hook.clone()));

        let chain = registry.resolve(&MethodDescriptor::<GetReq, GetRes>::unary(
            "store.StoreService",
            "KvGet",
        ));
        let options = CallOptions::default();
        chain.enter(&CallContext::new(&GetReq, &options, None, TraceId::default()));

        assert_eq!(get_hook.enters.load(Ordering::SeqCst), 1);
        assert_eq!(put_hook.enters.load(Ordering::SeqCst), 0);

        assert!(registry.remove_handler(&get_hook));
        assert!(!registry.remove_handler(&get_hook));
        assert!(chain.is_empty());
    }
}
