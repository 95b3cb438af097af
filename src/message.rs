//! 方法描述与调用标识
//!
//! - `MethodDescriptor` 描述一个具体的 RPC 方法（全名 + 请求/响应类型）
//! - `MethodIdentity` 是 Hook 注册表的键
//! - `TraceId` 只用于把同一次调用的日志与 Hook 回调串起来

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// 可在调用链中流转的消息类型约束
///
/// 请求与响应本身的序列化由传输层负责，这里只要求能被打印进诊断日志并跨线程共享。
pub trait Message: fmt::Debug + Send + Sync + 'static {}

impl<T> Message for T where T: fmt::Debug + Send + Sync + 'static {}

/// 方法的调用形态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodType {
    /// 单请求单响应
    Unary,
    /// 客户端流
    ClientStreaming,
    /// 服务端流
    ServerStreaming,
    /// 双向流
    BidiStreaming,
}

/// RPC 方法描述
///
/// 克隆代价很低（内部为 `Arc<str>`），可以放在 `static` 之外按值传递。
pub struct MethodDescriptor<Req, Res> {
    full_method_name: Arc<str>,
    method_type: MethodType,
    _types: PhantomData<fn(Req) -> Res>,
}

impl<Req, Res> MethodDescriptor<Req, Res> {
    /// 使用 `service` 与 `method` 拼出 `service/method` 形式的全名
    pub fn unary(service: &str, method: &str) -> Self {
        Self::new(format!("{service}/{method}"), MethodType::Unary)
    }

    pub fn new<T: Into<Arc<str>>>(full_method_name: T, method_type: MethodType) -> Self {
        Self {
            full_method_name: full_method_name.into(),
            method_type,
            _types: PhantomData,
        }
    }

    pub fn full_method_name(&self) -> &str {
        &self.full_method_name
    }

    /// 去掉方法名后的服务全名
    pub fn service_name(&self) -> Option<&str> {
        self.full_method_name
            .rsplit_once('/')
            .map(|(service, _)| service)
    }

    /// 去掉服务名后的短方法名
    pub fn bare_method_name(&self) -> Option<&str> {
        self.full_method_name
            .rsplit_once('/')
            .map(|(_, method)| method)
    }

    pub fn method_type(&self) -> MethodType {
        self.method_type
    }
}

impl<Req: 'static, Res: 'static> MethodDescriptor<Req, Res> {
    /// 计算注册表键
    pub fn identity(&self) -> MethodIdentity {
        MethodIdentity {
            name: Arc::clone(&self.full_method_name),
            request: TypeId::of::<Req>(),
            response: TypeId::of::<Res>(),
        }
    }
}

impl<Req, Res> Clone for MethodDescriptor<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            full_method_name: Arc::clone(&self.full_method_name),
            method_type: self.method_type,
            _types: PhantomData,
        }
    }
}

impl<Req, Res> fmt::Debug for MethodDescriptor<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("full_method_name", &self.full_method_name)
            .field("method_type", &self.method_type)
            .finish()
    }
}

impl<Req, Res> fmt::Display for MethodDescriptor<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_method_name)
    }
}

impl<Req, Res> PartialEq for MethodDescriptor<Req, Res> {
    fn eq(&self, other: &Self) -> bool {
        self.full_method_name == other.full_method_name
    }
}

impl<Req, Res> Eq for MethodDescriptor<Req, Res> {}

impl<Req, Res> Hash for MethodDescriptor<Req, Res> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.full_method_name.hash(state);
    }
}

/// Hook 注册表键：方法全名 + 请求/响应类型
///
/// 同名但类型不同的描述符会得到不同的键，因此一个键永远只对应一种类型的 Hook 链。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodIdentity {
    name: Arc<str>,
    request: TypeId,
    response: TypeId,
}

impl MethodIdentity {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for MethodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// 单次调用的关联标识
///
/// 由请求对象的地址派生，不保证全局唯一，仅用于日志与 Hook 回调的关联。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TraceId(u64);

impl TraceId {
    pub fn of<T>(request: &T) -> Self {
        let addr = request as *const T as usize as u64;
        // 地址低位通常是对齐填充，混一下让日志里的值更分散
        Self(addr.rotate_right(3) ^ (addr >> 17))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
