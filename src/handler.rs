//! 方法级 Hook 链
//!
//! - `ServiceHandler` 是挂在某个 RPC 方法上的观察者，所有事件默认空实现
//! - `HandlerChain` 按注册顺序把每个生命周期事件广播给该方法的全部 Hook
//! - 单个 Hook 返回错误或 panic 只会被记录，不影响其他 Hook，也不影响调用结果

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tonic::Status;
use tracing::{debug, warn};

use crate::error::ExhaustedRetryError;
use crate::message::{Message, MethodDescriptor, TraceId};
use crate::options::CallOptions;

/// Tracing target for chain events.
pub(crate) const HANDLER_TARGET: &str = module_path!();

/// Hook 回调的返回值
pub type HandlerResult = anyhow::Result<()>;

/// 生命周期事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Enter,
    Before,
    After,
    Exception,
    Retry,
    Failed,
    Ignore,
    Refresh,
    NonConnection,
    NonResponse,
    Throw,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::Enter => "enter",
            LifecycleEvent::Before => "before",
            LifecycleEvent::After => "after",
            LifecycleEvent::Exception => "exception",
            LifecycleEvent::Retry => "retry",
            LifecycleEvent::Failed => "failed",
            LifecycleEvent::Ignore => "ignore",
            LifecycleEvent::Refresh => "refresh",
            LifecycleEvent::NonConnection => "non_connection",
            LifecycleEvent::NonResponse => "non_response",
            LifecycleEvent::Throw => "throw",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单次调用的事件载荷
pub struct CallContext<'a, Req> {
    pub request: &'a Req,
    pub options: &'a CallOptions,
    /// 远端标识；未连接时为 `None`
    pub remote: Option<&'a str>,
    pub trace: TraceId,
}

impl<'a, Req> CallContext<'a, Req> {
    pub fn new(
        request: &'a Req,
        options: &'a CallOptions,
        remote: Option<&'a str>,
        trace: TraceId,
    ) -> Self {
        Self {
            request,
            options,
            remote,
            trace,
        }
    }

    fn remote_or_dash(&self) -> &str {
        self.remote.unwrap_or("-")
    }
}

impl<Req> Clone for CallContext<'_, Req> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Req> Copy for CallContext<'_, Req> {}

/// 挂在单个 RPC 方法上的观察者
///
/// 同一个实例会被该方法的所有并发调用共享，实现方需要自行保证内部状态的线程安全。
/// 重试、刷新、忽略、失败等分类事件由外部的重试策略触发，本层只负责广播。
pub trait ServiceHandler<Req, Res>: Send + Sync + 'static {
    /// 该 Hook 所属的方法
    fn match_method(&self) -> &MethodDescriptor<Req, Res>;

    fn enter(&self, _ctx: &CallContext<'_, Req>) -> HandlerResult {
        Ok(())
    }

    fn before(&self, _ctx: &CallContext<'_, Req>) -> HandlerResult {
        Ok(())
    }

    fn after(&self, _ctx: &CallContext<'_, Req>, _response: &Res) -> HandlerResult {
        Ok(())
    }

    fn on_exception(&self, _ctx: &CallContext<'_, Req>, _error: &anyhow::Error) -> HandlerResult {
        Ok(())
    }

    fn on_retry(&self, _ctx: &CallContext<'_, Req>, _response: &Res) -> HandlerResult {
        Ok(())
    }

    fn on_failed(&self, _ctx: &CallContext<'_, Req>, _response: &Res) -> HandlerResult {
        Ok(())
    }

    fn on_ignore(&self, _ctx: &CallContext<'_, Req>, _response: &Res) -> HandlerResult {
        Ok(())
    }

    fn on_refresh(&self, _ctx: &CallContext<'_, Req>, _response: &Res) -> HandlerResult {
        Ok(())
    }

    fn on_non_connection(&self, _ctx: &CallContext<'_, Req>) -> HandlerResult {
        Ok(())
    }

    /// 传输层返回失败状态，调用方将拿到 `None`
    fn on_non_response(&self, _ctx: &CallContext<'_, Req>, _status: &Status) -> HandlerResult {
        Ok(())
    }

    fn on_throw(
        &self,
        _ctx: &CallContext<'_, Req>,
        _error: &ExhaustedRetryError,
    ) -> HandlerResult {
        Ok(())
    }
}

type HandlerList<Req, Res> = Vec<Arc<dyn ServiceHandler<Req, Res>>>;

fn same_handler<Req, Res>(
    a: &Arc<dyn ServiceHandler<Req, Res>>,
    b: &Arc<dyn ServiceHandler<Req, Res>>,
) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// 单个方法的有序 Hook 广播组
///
/// Hook 列表以写时复制的方式保存：每次广播先取一份快照再遍历，
/// 并发的增删不会打断正在进行的广播，只影响之后开始的广播。
pub struct HandlerChain<Req, Res> {
    method: MethodDescriptor<Req, Res>,
    handlers: ArcSwap<HandlerList<Req, Res>>,
}

impl<Req: Message, Res: Message> HandlerChain<Req, Res> {
    pub fn new(method: MethodDescriptor<Req, Res>) -> Self {
        Self {
            method,
            handlers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn method(&self) -> &MethodDescriptor<Req, Res> {
        &self.method
    }

    pub fn len(&self) -> usize {
        self.handlers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.load().is_empty()
    }

    /// 追加一个 Hook
    ///
    /// 同一实例重复注册只保留一份，返回 `false`；Hook 声明的方法与本链不符时拒绝。
    pub fn add_handler(&self, handler: Arc<dyn ServiceHandler<Req, Res>>) -> bool {
        if handler.match_method() != &self.method {
            warn!(
                target: HANDLER_TARGET,
                method = %self.method,
                handler_method = %handler.match_method(),
                "handler declares a different method, not added"
            );
            return false;
        }

        let mut added = false;
        self.handlers.rcu(|current| {
            if current.iter().any(|existing| same_handler(existing, &handler)) {
                added = false;
                return Arc::clone(current);
            }
            added = true;
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&handler));
            Arc::new(next)
        });
        added
    }

    /// 按实例移除 Hook，返回是否确有移除
    pub fn remove_handler(&self, handler: &Arc<dyn ServiceHandler<Req, Res>>) -> bool {
        let mut removed = false;
        self.handlers.rcu(|current| {
            removed = current.iter().any(|existing| same_handler(existing, handler));
            if !removed {
                return Arc::clone(current);
            }
            Arc::new(
                current
                    .iter()
                    .filter(|existing| !same_handler(existing, handler))
                    .cloned()
                    .collect::<Vec<_>>(),
            )
        });
        removed
    }

    fn multicast<F>(&self, event: LifecycleEvent, ctx: &CallContext<'_, Req>, mut deliver: F)
    where
        F: FnMut(&dyn ServiceHandler<Req, Res>) -> HandlerResult,
    {
        let snapshot = self.handlers.load_full();
        for (index, handler) in snapshot.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| deliver(handler.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    target: HANDLER_TARGET,
                    method = %self.method,
                    event = event.as_str(),
                    trace = %ctx.trace,
                    handler = index,
                    error = %err,
                    "service handler failed"
                ),
                Err(payload) => warn!(
                    target: HANDLER_TARGET,
                    method = %self.method,
                    event = event.as_str(),
                    trace = %ctx.trace,
                    handler = index,
                    panic = panic_message(payload.as_ref()),
                    "service handler panicked"
                ),
            }
        }
    }

    pub fn enter(&self, ctx: &CallContext<'_, Req>) {
        self.multicast(LifecycleEvent::Enter, ctx, |h| h.enter(ctx));
        debug!(
            target: HANDLER_TARGET,
            method = %self.method,
            remote = ctx.remote_or_dash(),
            trace = %ctx.trace,
            at = chrono::Utc::now().timestamp_millis(),
            request = ?ctx.request,
            options = ?ctx.options,
            "service call enter"
        );
    }

    pub fn before(&self, ctx: &CallContext<'_, Req>) {
        self.multicast(LifecycleEvent::Before, ctx, |h| h.before(ctx));
        debug!(
            target: HANDLER_TARGET,
            method = %self.method,
            remote = ctx.remote_or_dash(),
            trace = %ctx.trace,
            at = chrono::Utc::now().timestamp_millis(),
            request = ?ctx.request,
            options = ?ctx.options,
            "service call before"
        );
    }

    pub fn after(&self, ctx: &CallContext<'_, Req>, response: &Res) {
        self.multicast(LifecycleEvent::After, ctx, |h| h.after(ctx, response));
        self.log_with_response("service call after", ctx, response);
    }

    pub fn on_exception(&self, ctx: &CallContext<'_, Req>, error: &anyhow::Error) {
        self.multicast(LifecycleEvent::Exception, ctx, |h| h.on_exception(ctx, error));
        debug!(
            target: HANDLER_TARGET,
            method = %self.method,
            remote = ctx.remote_or_dash(),
            trace = %ctx.trace,
            at = chrono::Utc::now().timestamp_millis(),
            request = ?ctx.request,
            error = %error,
            "service call exception"
        );
    }

    pub fn on_retry(&self, ctx: &CallContext<'_, Req>, response: &Res) {
        self.multicast(LifecycleEvent::Retry, ctx, |h| h.on_retry(ctx, response));
        self.log_with_response("service call need retry", ctx, response);
    }

    pub fn on_failed(&self, ctx: &CallContext<'_, Req>, response: &Res) {
        self.multicast(LifecycleEvent::Failed, ctx, |h| h.on_failed(ctx, response));
        self.log_with_response("service call failed", ctx, response);
    }

    pub fn on_ignore(&self, ctx: &CallContext<'_, Req>, response: &Res) {
        self.multicast(LifecycleEvent::Ignore, ctx, |h| h.on_ignore(ctx, response));
        self.log_with_response("service call ignore error", ctx, response);
    }

    pub fn on_refresh(&self, ctx: &CallContext<'_, Req>, response: &Res) {
        self.multicast(LifecycleEvent::Refresh, ctx, |h| h.on_refresh(ctx, response));
        self.log_with_response("service call need refresh", ctx, response);
    }

    pub fn on_non_connection(&self, ctx: &CallContext<'_, Req>) {
        self.multicast(LifecycleEvent::NonConnection, ctx, |h| {
            h.on_non_connection(ctx)
        });
        debug!(
            target: HANDLER_TARGET,
            method = %self.method,
            trace = %ctx.trace,
            at = chrono::Utc::now().timestamp_millis(),
            request = ?ctx.request,
            options = ?ctx.options,
            "service call non connection"
        );
    }

    pub fn on_non_response(&self, ctx: &CallContext<'_, Req>, status: &Status) {
        self.multicast(LifecycleEvent::NonResponse, ctx, |h| {
            h.on_non_response(ctx, status)
        });
        debug!(
            target: HANDLER_TARGET,
            method = %self.method,
            remote = ctx.remote_or_dash(),
            trace = %ctx.trace,
            at = chrono::Utc::now().timestamp_millis(),
            request = ?ctx.request,
            code = ?status.code(),
            message = status.message(),
            "service call non response"
        );
    }

    pub fn on_throw(&self, ctx: &CallContext<'_, Req>, error: &ExhaustedRetryError) {
        self.multicast(LifecycleEvent::Throw, ctx, |h| h.on_throw(ctx, error));
        debug!(
            target: HANDLER_TARGET,
            method = %self.method,
            trace = %ctx.trace,
            at = chrono::Utc::now().timestamp_millis(),
            request = ?ctx.request,
            options = ?ctx.options,
            message = %error,
            "service call throw"
        );
    }

    fn log_with_response(&self, what: &'static str, ctx: &CallContext<'_, Req>, response: &Res) {
        debug!(
            target: HANDLER_TARGET,
            method = %self.method,
            remote = ctx.remote_or_dash(),
            trace = %ctx.trace,
            at = chrono::Utc::now().timestamp_millis(),
            request = ?ctx.request,
            response = ?response,
            options = ?ctx.options,
            "{what}"
        );
    }
}

impl<Req: Message, Res: Message> fmt::Debug for HandlerChain<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChain")
            .field("method", &self.method)
            .field("handlers", &self.len())
            .finish()
    }
}

impl<Req: Message, Res: Message> ServiceHandler<Req, Res> for HandlerChain<Req, Res> {
    fn match_method(&self) -> &MethodDescriptor<Req, Res> {
        &self.method
    }

    fn enter(&self, ctx: &CallContext<'_, Req>) -> HandlerResult {
        HandlerChain::enter(self, ctx);
        Ok(())
    }

    fn before(&self, ctx: &CallContext<'_, Req>) -> HandlerResult {
        HandlerChain::before(self, ctx);
        Ok(())
    }

    fn after(&self, ctx: &CallContext<'_, Req>, response: &Res) -> HandlerResult {
        HandlerChain::after(self, ctx, response);
        Ok(())
    }

    fn on_exception(&self, ctx: &CallContext<'_, Req>, error: &anyhow::Error) -> HandlerResult {
        HandlerChain::on_exception(self, ctx, error);
        Ok(())
    }

    fn on_retry(&self, ctx: &CallContext<'_, Req>, response: &Res) -> HandlerResult {
        HandlerChain::on_retry(self, ctx, response);
        Ok(())
    }

    fn on_failed(&self, ctx: &CallContext<'_, Req>, response: &Res) -> HandlerResult {
        HandlerChain::on_failed(self, ctx, response);
        Ok(())
    }

    fn on_ignore(&self, ctx: &CallContext<'_, Req>, response: &Res) -> HandlerResult {
        HandlerChain::on_ignore(self, ctx, response);
        Ok(())
    }

    fn on_refresh(&self, ctx: &CallContext<'_, Req>, response: &Res) -> HandlerResult {
        HandlerChain::on_refresh(self, ctx, response);
        Ok(())
    }

    fn on_non_connection(&self, ctx: &CallContext<'_, Req>) -> HandlerResult {
        HandlerChain::on_non_connection(self, ctx);
        Ok(())
    }

    fn on_non_response(&self, ctx: &CallContext<'_, Req>, status: &Status) -> HandlerResult {
        HandlerChain::on_non_response(self, ctx, status);
        Ok(())
    }

    fn on_throw(&self, ctx: &CallContext<'_, Req>, error: &ExhaustedRetryError) -> HandlerResult {
        HandlerChain::on_throw(self, ctx, error);
        Ok(())
    }
}
