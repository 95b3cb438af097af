//! Flare RPC Caller 公共库
//!
//! 数据库客户端 SDK 的请求分发层：把类型化的 RPC 调用路由到按方法组织的 Hook 链上，
//! 在真正的网络调用前后广播生命周期事件（enter / before / after / non-response 等），
//! 让指标、重试策略、连接刷新之类的横切逻辑可以在运行时动态挂载与卸载。
//!
//! ```rust,ignore
//! let registry = HandlerRegistry::new();
//! registry.add_handler(MetricsHandler::new(KV_GET.clone(), metrics));
//!
//! let caller = RpcCaller::new(channel, CallOptions::default(), registry);
//! let response: Option<KvGetResponse> = caller.call(&KV_GET, request);
//! ```

pub mod caller;
pub mod channel;
pub mod config;
pub mod error;
pub mod future;
pub mod handler;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod options;
pub mod registry;

pub use caller::{Caller, RpcCaller, Service, async_call, dispatch};
pub use channel::{CallListener, Channel, ClientCall, blocking_unary_call, start_unary_call};
pub use config::{CallerConfig, LoggingConfig, load_config, load_config_from_env};
pub use error::{CallerError, ExhaustedRetryError, Result};
pub use future::{RpcFuture, UnaryListener};
pub use handler::{CallContext, HandlerChain, HandlerResult, LifecycleEvent, ServiceHandler};
pub use message::{Message, MethodDescriptor, MethodIdentity, MethodType, TraceId};
pub use metrics::{CallMetrics, MetricsHandler};
pub use options::CallOptions;
pub use registry::HandlerRegistry;
