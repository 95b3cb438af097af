//! 集成测试公共设施：脚本化的内存通道与记录型 Hook

#![allow(dead_code)]

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use flare_rpc_caller::{
    CallContext, CallListener, CallOptions, Channel, ClientCall, HandlerResult, Message,
    MethodDescriptor, ServiceHandler, TraceId,
};
use parking_lot::Mutex;
use tonic::Status;
use tonic::metadata::MetadataMap;

#[derive(Debug, Clone, PartialEq)]
pub struct KvGetRequest {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KvGetResponse {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KvPutRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KvPutResponse {
    pub applied: bool,
}

pub fn kv_get() -> MethodDescriptor<KvGetRequest, KvGetResponse> {
    MethodDescriptor::unary("dingodb.pb.store.StoreService", "KvGet")
}

pub fn kv_put() -> MethodDescriptor<KvPutRequest, KvPutResponse> {
    MethodDescriptor::unary("dingodb.pb.store.StoreService", "KvPut")
}

pub fn get(key: &str) -> KvGetRequest {
    KvGetRequest {
        key: key.to_string(),
    }
}

type Responder = Arc<dyn Fn(&dyn Any) -> Result<Box<dyn Any + Send>, Status> + Send + Sync>;

#[derive(Default)]
struct Script {
    responders: Mutex<Vec<(String, Responder)>>,
    failures: Mutex<VecDeque<Status>>,
    /// 待执行的“拆除调用”次数：监听器被直接丢弃，不回调 `on_close`
    teardowns: AtomicUsize,
}

impl Script {
    fn take_teardown(&self) -> bool {
        self.teardowns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn outcome(&self, method: &str, request: &dyn Any) -> Result<Box<dyn Any + Send>, Status> {
        if let Some(status) = self.failures.lock().pop_front() {
            return Err(status);
        }
        let responder = self
            .responders
            .lock()
            .iter()
            .find(|(name, _)| name == method)
            .map(|(_, responder)| Arc::clone(responder));
        match responder {
            Some(responder) => responder(request),
            None => Err(Status::unimplemented(format!("no responder for {method}"))),
        }
    }
}

/// 按方法全名应答的内存通道
pub struct ScriptedChannel {
    authority: String,
    script: Arc<Script>,
    /// 在独立线程上回调监听器，模拟传输层的回调线程
    threaded: bool,
    pub calls: AtomicUsize,
}

impl ScriptedChannel {
    pub fn new(authority: &str) -> Self {
        Self {
            authority: authority.to_string(),
            script: Arc::new(Script::default()),
            threaded: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn threaded(mut self) -> Self {
        self.threaded = true;
        self
    }

    pub fn respond<Req, Res, F>(self, method: &MethodDescriptor<Req, Res>, f: F) -> Self
    where
        Req: Message,
        Res: Message,
        F: Fn(&Req) -> Res + Send + Sync + 'static,
    {
        let responder: Responder = Arc::new(move |request: &dyn Any| {
            let request = request
                .downcast_ref::<Req>()
                .ok_or_else(|| Status::internal("unexpected request type"))?;
            Ok(Box::new(f(request)) as Box<dyn Any + Send>)
        });
        self.script
            .responders
            .lock()
            .push((method.full_method_name().to_string(), responder));
        self
    }

    /// 下一次调用以 `status` 失败
    pub fn fail_next(&self, status: Status) {
        self.script.failures.lock().push_back(status);
    }

    /// 下一次调用被传输层直接拆除，监听器收不到终止状态
    pub fn tear_down_next(&self) {
        self.script.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

impl Channel for ScriptedChannel {
    fn authority(&self) -> &str {
        &self.authority
    }

    fn new_call<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        _options: &CallOptions,
    ) -> Box<dyn ClientCall<Req, Res>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedCall::<Req, Res> {
            outcome: None,
            listener: None,
            requested: 0,
            threaded: self.threaded,
            method: method.full_method_name().to_string(),
            script: Arc::clone(&self.script),
            _req: std::marker::PhantomData,
        })
    }
}

struct ScriptedCall<Req, Res> {
    outcome: Option<Result<Box<dyn Any + Send>, Status>>,
    listener: Option<Box<dyn CallListener<Res>>>,
    requested: usize,
    threaded: bool,
    method: String,
    script: Arc<Script>,
    _req: std::marker::PhantomData<fn(Req)>,
}

impl<Req: Message, Res: Message> ClientCall<Req, Res> for ScriptedCall<Req, Res> {
    fn start(&mut self, listener: Box<dyn CallListener<Res>>, _headers: MetadataMap) {
        self.listener = Some(listener);
    }

    fn request(&mut self, n: usize) {
        self.requested += n;
    }

    fn send_message(&mut self, message: &Req) {
        self.outcome = Some(self.script.outcome(&self.method, message));
    }

    fn half_close(&mut self) {
        let Some(mut listener) = self.listener.take() else {
            return;
        };
        if self.script.take_teardown() {
            drop(listener);
            return;
        }
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| Err(Status::internal("no message sent")));
        let requested = self.requested;
        let deliver = move || {
            match outcome {
                Ok(boxed) => match boxed.downcast::<Res>() {
                    Ok(response) if requested > 0 => {
                        listener.on_message(*response);
                        listener.on_close(Status::ok(""), MetadataMap::new());
                    }
                    Ok(_) => listener.on_close(
                        Status::resource_exhausted("no response credit"),
                        MetadataMap::new(),
                    ),
                    Err(_) => listener.on_close(
                        Status::internal("unexpected response type"),
                        MetadataMap::new(),
                    ),
                },
                Err(status) => listener.on_close(status, MetadataMap::new()),
            }
        };
        if self.threaded {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                deliver();
            });
        } else {
            deliver();
        }
    }

    fn cancel(&mut self, message: &str) {
        if let Some(mut listener) = self.listener.take() {
            listener.on_close(Status::cancelled(message.to_string()), MetadataMap::new());
        }
    }
}

pub type Journal = Arc<Mutex<Vec<String>>>;

/// 把收到的事件按顺序写进日志的 Hook
pub struct Recorder<Req, Res> {
    pub name: &'static str,
    method: MethodDescriptor<Req, Res>,
    journal: Journal,
    pub traces: Mutex<Vec<TraceId>>,
}

impl<Req: Message, Res: Message> Recorder<Req, Res> {
    pub fn new(name: &'static str, method: MethodDescriptor<Req, Res>, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            name,
            method,
            journal: Arc::clone(journal),
            traces: Mutex::new(Vec::new()),
        })
    }

    fn note(&self, ctx: &CallContext<'_, Req>, event: String) {
        self.traces.lock().push(ctx.trace);
        self.journal.lock().push(format!("{}:{}", self.name, event));
    }
}

impl<Req: Message, Res: Message> ServiceHandler<Req, Res> for Recorder<Req, Res> {
    fn match_method(&self) -> &MethodDescriptor<Req, Res> {
        &self.method
    }

    fn enter(&self, ctx: &CallContext<'_, Req>) -> HandlerResult {
        self.note(ctx, "enter".to_string());
        Ok(())
    }

    fn before(&self, ctx: &CallContext<'_, Req>) -> HandlerResult {
        self.note(ctx, format!("before@{}", ctx.remote.unwrap_or("-")));
        Ok(())
    }

    fn after(&self, ctx: &CallContext<'_, Req>, response: &Res) -> HandlerResult {
        self.note(ctx, format!("after({:?} -> {:?})", ctx.request, response));
        Ok(())
    }

    fn on_non_response(&self, ctx: &CallContext<'_, Req>, status: &Status) -> HandlerResult {
        self.note(ctx, format!("non_response({})", status.message()));
        Ok(())
    }

    fn on_non_connection(&self, ctx: &CallContext<'_, Req>) -> HandlerResult {
        self.note(ctx, "non_connection".to_string());
        Ok(())
    }
}

/// 在 `after` 中失败的 Hook
pub struct FailingAfter<Req, Res> {
    pub method: MethodDescriptor<Req, Res>,
    pub panics: bool,
}

impl<Req: Message, Res: Message> ServiceHandler<Req, Res> for FailingAfter<Req, Res> {
    fn match_method(&self) -> &MethodDescriptor<Req, Res> {
        &self.method
    }

    fn after(&self, _ctx: &CallContext<'_, Req>, _response: &Res) -> HandlerResult {
        if self.panics {
            panic!("after hook panicked");
        }
        Err(anyhow::anyhow!("after hook failed"))
    }
}
