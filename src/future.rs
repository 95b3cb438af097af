//! 异步调用句柄
//!
//! `RpcFuture` 由传输层的回调线程完成，调用线程可以阻塞等待，也可以当作 `Future` 去 `.await`。
//! 完成动作只生效一次；失败结果可以被重复读取，成功结果只能取走一次。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tonic::Status;
use tonic::metadata::MetadataMap;
use tracing::debug;

use crate::channel::CallListener;
use crate::message::Message;

const FUTURE_TARGET: &str = module_path!();

enum Slot<Res> {
    Pending,
    Ready(Result<Res, Status>),
    Taken,
}

struct Shared<Res> {
    slot: Mutex<SlotState<Res>>,
    done: Condvar,
}

struct SlotState<Res> {
    slot: Slot<Res>,
    waker: Option<Waker>,
}

/// 单响应调用的结果句柄
pub struct RpcFuture<Res> {
    shared: Arc<Shared<Res>>,
}

impl<Res> Clone for RpcFuture<Res> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Res> RpcFuture<Res> {
    /// 写入结果，返回本次写入是否生效
    ///
    /// 可以从任意线程调用；唤醒动作在释放锁之后进行。
    pub fn complete(&self, result: Result<Res, Status>) -> bool {
        let waker = {
            let mut state = self.shared.slot.lock();
            if !matches!(state.slot, Slot::Pending) {
                debug!(target: FUTURE_TARGET, "rpc future already completed, dropping late result");
                return false;
            }
            state.slot = Slot::Ready(result);
            state.waker.take()
        };
        self.shared.done.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }
}

impl<Res: Message> RpcFuture<Res> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(SlotState {
                    slot: Slot::Pending,
                    waker: None,
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// 创建一个已经失败的句柄
    pub fn failed(status: Status) -> Self {
        let future = Self::new();
        future.complete(Err(status));
        future
    }

    /// 返回给传输层使用的监听器
    pub fn listener(&self) -> UnaryListener<Res> {
        UnaryListener {
            future: self.clone(),
            message: None,
            closed: false,
        }
    }

    pub fn is_done(&self) -> bool {
        !matches!(self.shared.slot.lock().slot, Slot::Pending)
    }

    /// 阻塞当前线程直到结果就绪
    pub fn wait(&self) -> Result<Res, Status> {
        let mut state = self.shared.slot.lock();
        while matches!(state.slot, Slot::Pending) {
            self.shared.done.wait(&mut state);
        }
        Self::take_ready(&mut state.slot)
    }

    /// 最多等待 `timeout`，超时返回 `DeadlineExceeded`，句柄仍可继续等待
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Res, Status> {
        let mut state = self.shared.slot.lock();
        if matches!(state.slot, Slot::Pending) {
            let _ = self.shared.done.wait_while_for(
                &mut state,
                |state| matches!(state.slot, Slot::Pending),
                timeout,
            );
        }
        if matches!(state.slot, Slot::Pending) {
            return Err(Status::deadline_exceeded(format!(
                "rpc not completed within {timeout:?}"
            )));
        }
        Self::take_ready(&mut state.slot)
    }

    /// 非阻塞读取，未完成时返回 `None`
    pub fn try_take(&self) -> Option<Result<Res, Status>> {
        let mut state = self.shared.slot.lock();
        if matches!(state.slot, Slot::Pending) {
            return None;
        }
        Some(Self::take_ready(&mut state.slot))
    }

    fn take_ready(slot: &mut Slot<Res>) -> Result<Res, Status> {
        match std::mem::replace(slot, Slot::Taken) {
            Slot::Ready(Ok(response)) => Ok(response),
            Slot::Ready(Err(status)) => {
                *slot = Slot::Ready(Err(status.clone()));
                Err(status)
            }
            Slot::Taken => Err(Status::failed_precondition("response already taken")),
            Slot::Pending => {
                *slot = Slot::Pending;
                Err(Status::internal("rpc future polled before completion"))
            }
        }
    }
}

impl<Res: Message> Default for RpcFuture<Res> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Res: Message> Future for RpcFuture<Res> {
    type Output = Result<Res, Status>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.slot.lock();
        if matches!(state.slot, Slot::Pending) {
            match state.waker {
                Some(ref waker) if waker.will_wake(cx.waker()) => {}
                _ => state.waker = Some(cx.waker().clone()),
            }
            return Poll::Pending;
        }
        Poll::Ready(Self::take_ready(&mut state.slot))
    }
}

/// 单响应监听器：缓存第一条消息，在 `on_close` 时完成句柄
///
/// 传输层没有调用 `on_close` 就丢弃监听器时（连接重置、调用被拆除），
/// 句柄以 `Cancelled` 结束，等待方不会永久阻塞。
pub struct UnaryListener<Res> {
    future: RpcFuture<Res>,
    message: Option<Res>,
    closed: bool,
}

impl<Res: Message> CallListener<Res> for UnaryListener<Res> {
    fn on_message(&mut self, message: Res) {
        if self.message.is_some() {
            self.future
                .complete(Err(Status::internal("too many responses for unary call")));
            return;
        }
        self.message = Some(message);
    }

    fn on_close(&mut self, status: Status, _trailers: MetadataMap) {
        self.closed = true;
        let result = if status.code() == tonic::Code::Ok {
            self.message
                .take()
                .ok_or_else(|| Status::internal("no value received for unary call"))
        } else {
            Err(status)
        };
        self.future.complete(result);
    }
}

impl<Res> Drop for UnaryListener<Res> {
    fn drop(&mut self) {
        if !self.closed {
            debug!(target: FUTURE_TARGET, "call listener dropped before close");
            self.future
                .complete(Err(Status::cancelled("call closed without status")));
        }
    }
}
