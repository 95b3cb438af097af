//! 传输层能力抽象
//!
//! 本核心不关心连接管理、负载均衡或序列化，只依赖下面这组最小接口：
//! 打开调用、发送一条请求、接收响应与终止状态。

use tonic::Status;
use tonic::metadata::MetadataMap;

use crate::future::RpcFuture;
use crate::message::{Message, MethodDescriptor, MethodType};
use crate::options::CallOptions;

/// 单次调用的响应监听器，由传输层在其回调线程上驱动
pub trait CallListener<Res>: Send {
    /// 收到响应头
    fn on_headers(&mut self, _headers: MetadataMap) {}

    /// 收到一条响应消息
    fn on_message(&mut self, message: Res);

    /// 调用结束；`status` 为 OK 表示正常结束
    fn on_close(&mut self, status: Status, trailers: MetadataMap);

    /// 发送端可以继续写入
    fn on_ready(&mut self) {}
}

/// 一次已打开的调用
pub trait ClientCall<Req, Res>: Send {
    fn start(&mut self, listener: Box<dyn CallListener<Res>>, headers: MetadataMap);

    /// 向传输层申请 `n` 条响应的额度
    fn request(&mut self, n: usize);

    fn send_message(&mut self, message: &Req);

    /// 关闭发送端
    fn half_close(&mut self);

    fn cancel(&mut self, message: &str);
}

/// 到远端节点的通道
pub trait Channel: Send + Sync + 'static {
    /// 远端标识，如 `host:port`
    fn authority(&self) -> &str;

    fn new_call<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        options: &CallOptions,
    ) -> Box<dyn ClientCall<Req, Res>>;
}

impl<C: Channel> Channel for std::sync::Arc<C> {
    fn authority(&self) -> &str {
        (**self).authority()
    }

    fn new_call<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        options: &CallOptions,
    ) -> Box<dyn ClientCall<Req, Res>> {
        (**self).new_call(method, options)
    }
}

/// 打开调用并发出唯一的一条请求，返回结果句柄
///
/// 额度申请为 2：一条响应加上尾部状态，不是流式契约。
/// 非 `Unary` 的方法不会打开调用，直接返回以 `Unimplemented` 失败的句柄。
pub fn start_unary_call<C, Req, Res>(
    channel: &C,
    method: &MethodDescriptor<Req, Res>,
    options: &CallOptions,
    request: &Req,
) -> RpcFuture<Res>
where
    C: Channel,
    Req: Message,
    Res: Message,
{
    if method.method_type() != MethodType::Unary {
        return RpcFuture::failed(Status::unimplemented(format!(
            "{method} is a {:?} method, only unary calls are dispatched",
            method.method_type()
        )));
    }

    let future = RpcFuture::new();
    let mut call = channel.new_call(method, options);
    call.start(Box::new(future.listener()), options.metadata.clone());
    call.request(2);
    call.send_message(request);
    call.half_close();
    future
}

/// 阻塞式单请求调用
///
/// 阻塞调用线程直至传输层给出结果；超时由 `options` 交给传输层处理。
pub fn blocking_unary_call<C, Req, Res>(
    channel: &C,
    method: &MethodDescriptor<Req, Res>,
    options: &CallOptions,
    request: &Req,
) -> Result<Res, Status>
where
    C: Channel,
    Req: Message,
    Res: Message,
{
    start_unary_call(channel, method, options, request).wait()
}
