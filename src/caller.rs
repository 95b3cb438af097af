//! RPC 调用分发
//!
//! 同步调用的完整流程：
//!
//! 1. 计算方法标识并取得（或惰性创建）对应的 Hook 链
//! 2. 无条件触发 `enter`
//! 3. 未配置通道时直接返回 `None`，不再触发任何事件
//! 4. 触发 `before`，通过通道执行阻塞调用
//! 5. 传输失败时触发 `on_non_response` 并返回 `None`；成功时触发 `after` 并原样返回响应
//!
//! 传输层未给出终止状态就拆除调用时按 `Cancelled` 处理；非 `Unary` 方法以 `Unimplemented`
//! 走同一条 `on_non_response` 路径，不会打开调用。
//!
//! ## 返回值约定
//!
//! 调用方只会看到 `Some(response)` 或 `None`。`None` 既可能表示“没有连接”，
//! 也可能表示“传输失败”，本层不做区分；需要区分的调用方应当注册 Hook 观察
//! `on_non_response` 事件。
//!
//! ## 追踪标识
//!
//! `call_traced*` 接收的外部追踪号只是建议值：事件里的 `TraceId` 总是由请求对象的地址重新计算。
//!
//! ## 异步调用
//!
//! `async_call` 不经过 Hook 链，只返回结果句柄；这一不对称是有意保留的。

use std::sync::Arc;

use tonic::Status;
use tracing::debug;

use crate::channel::{Channel, blocking_unary_call, start_unary_call};
use crate::config::CallerConfig;
use crate::error::Result;
use crate::future::RpcFuture;
use crate::handler::CallContext;
use crate::message::{Message, MethodDescriptor, TraceId};
use crate::options::CallOptions;
use crate::registry::HandlerRegistry;

/// Tracing target for dispatch steps.
pub(crate) const CALLER_TARGET: &str = module_path!();

/// 服务桩依赖的调用入口
pub trait Caller {
    /// 发起同步调用；无连接或传输失败时返回 `None`
    fn call<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        request: Req,
    ) -> Option<Res>;

    /// 先构造请求再调用，语义与 `call` 相同
    fn call_with<Req, Res, F>(&self, method: &MethodDescriptor<Req, Res>, supplier: F) -> Option<Res>
    where
        Req: Message,
        Res: Message,
        F: FnOnce() -> Req,
    {
        self.call(method, supplier())
    }

    /// `request_id` 只是建议值，事件中的追踪号仍由请求对象派生
    fn call_traced<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        _request_id: u64,
        request: Req,
    ) -> Option<Res> {
        self.call(method, request)
    }

    fn call_traced_with<Req, Res, F>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        request_id: u64,
        supplier: F,
    ) -> Option<Res>
    where
        Req: Message,
        Res: Message,
        F: FnOnce() -> Req,
    {
        self.call_traced(method, request_id, supplier())
    }

    /// 发起异步调用，不经过 Hook 链
    fn async_call<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        request: Req,
    ) -> RpcFuture<Res>;
}

impl<T: Caller + ?Sized> Caller for &T {
    fn call<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        request: Req,
    ) -> Option<Res> {
        (**self).call(method, request)
    }

    fn async_call<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        request: Req,
    ) -> RpcFuture<Res> {
        (**self).async_call(method, request)
    }
}

impl<T: Caller + ?Sized> Caller for Arc<T> {
    fn call<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        request: Req,
    ) -> Option<Res> {
        (**self).call(method, request)
    }

    fn async_call<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        request: Req,
    ) -> RpcFuture<Res> {
        (**self).async_call(method, request)
    }
}

/// 由调用入口直接构造的服务实现
///
/// 具体服务类型实现本 trait，把 `Caller` 作为依赖持有，
/// 每个服务方法内部就是一次 `caller.call(&METHOD, request)`。
pub trait Service<C: Caller>: Sized {
    fn with_caller(caller: C) -> Self;
}

/// 绑定了通道、默认调用选项与 Hook 注册表的调用器
pub struct RpcCaller<C> {
    channel: Option<Arc<C>>,
    options: CallOptions,
    registry: Arc<HandlerRegistry>,
}

impl<C> Clone for RpcCaller<C> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            options: self.options.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<C: Channel> RpcCaller<C> {
    pub fn new(channel: Arc<C>, options: CallOptions, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            channel: Some(channel),
            options,
            registry,
        }
    }

    /// 未连接的调用器：所有同步调用只触发 `enter` 并返回 `None`
    pub fn disconnected(options: CallOptions, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            channel: None,
            options,
            registry,
        }
    }

    /// 使用配置文件中的默认调用选项
    ///
    /// # Errors
    ///
    /// 配置校验失败时返回 `CallerError::Config`。
    pub fn from_config(
        channel: Option<Arc<C>>,
        config: &CallerConfig,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self> {
        Ok(Self {
            channel,
            options: config.call_options()?,
            registry,
        })
    }

    pub fn channel(&self) -> Option<&Arc<C>> {
        self.channel.as_ref()
    }

    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// 构造服务实现
    pub fn service<S: Service<Self>>(self) -> S {
        S::with_caller(self)
    }
}

impl<C: Channel> Caller for RpcCaller<C> {
    fn call<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        request: Req,
    ) -> Option<Res> {
        let trace = TraceId::of(&request);
        dispatch(
            &self.registry,
            method,
            &request,
            &self.options,
            self.channel.as_deref(),
            trace,
        )
    }

    fn async_call<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        request: Req,
    ) -> RpcFuture<Res> {
        async_call(method, &request, &self.options, self.channel.as_deref())
    }
}

/// 执行一次同步调用
///
/// 传输失败不会向上抛出：它被转换成 `on_non_response` 事件，调用方拿到 `None`。
pub fn dispatch<C, Req, Res>(
    registry: &HandlerRegistry,
    method: &MethodDescriptor<Req, Res>,
    request: &Req,
    options: &CallOptions,
    channel: Option<&C>,
    trace: TraceId,
) -> Option<Res>
where
    C: Channel,
    Req: Message,
    Res: Message,
{
    let chain = registry.resolve(method);
    let remote = channel.map(|channel| channel.authority());
    let ctx = CallContext::new(request, options, remote, trace);

    chain.enter(&ctx);
    let Some(channel) = channel else {
        debug!(
            target: CALLER_TARGET,
            method = %method,
            trace = %trace,
            "no channel configured, call skipped"
        );
        return None;
    };

    chain.before(&ctx);
    match blocking_unary_call(channel, method, options, request) {
        Ok(response) => {
            chain.after(&ctx, &response);
            Some(response)
        }
        Err(status) => {
            chain.on_non_response(&ctx, &status);
            None
        }
    }
}

/// 发起一次不经过 Hook 链的异步调用
///
/// 未配置通道时返回一个已经以 `Unavailable` 失败的句柄。
pub fn async_call<C, Req, Res>(
    method: &MethodDescriptor<Req, Res>,
    request: &Req,
    options: &CallOptions,
    channel: Option<&C>,
) -> RpcFuture<Res>
where
    C: Channel,
    Req: Message,
    Res: Message,
{
    match channel {
        Some(channel) => start_unary_call(channel, method, options, request),
        None => {
            debug!(
                target: CALLER_TARGET,
                method = %method,
                "no channel configured, async call failed"
            );
            RpcFuture::failed(Status::unavailable("no channel configured"))
        }
    }
}
