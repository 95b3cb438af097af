//! # Prometheus 指标 Hook
//!
//! `MetricsHandler` 是一个普通的 `ServiceHandler`，注册到某个方法上即可统计该方法的调用情况，
//! 移除后立即停止统计，调用点无需任何改动。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use tonic::Status;
use tracing::debug;

use crate::error::ExhaustedRetryError;
use crate::handler::{CallContext, HandlerResult, LifecycleEvent, ServiceHandler};
use crate::message::{Message, MethodDescriptor, TraceId};

/// 调用指标集合，可被多个方法的 `MetricsHandler` 共享
#[derive(Clone)]
pub struct CallMetrics {
    /// 按阶段统计的调用次数
    pub calls_total: IntCounterVec,
    /// 传输失败次数（按状态码）
    pub non_response_total: IntCounterVec,
    /// 重试策略相关事件次数
    pub policy_events_total: IntCounterVec,
    /// 从 before 到 after/non_response 的耗时
    pub call_duration_seconds: HistogramVec,
}

impl CallMetrics {
    /// 创建指标并注册到 `registry`
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let calls_total = IntCounterVec::new(
            Opts::new(
                "rpc_client_calls_total",
                "Total number of rpc client lifecycle events by stage",
            ),
            &["method", "stage"],
        )?;

        let non_response_total = IntCounterVec::new(
            Opts::new(
                "rpc_client_non_response_total",
                "Total number of rpc calls that got no response from transport",
            ),
            &["method", "code"],
        )?;

        let policy_events_total = IntCounterVec::new(
            Opts::new(
                "rpc_client_policy_events_total",
                "Total number of retry policy decisions",
            ),
            &["method", "event"],
        )?;

        let call_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "rpc_client_call_duration_seconds",
                "Rpc client call duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["method", "outcome"],
        )?;

        registry.register(Box::new(calls_total.clone()))?;
        registry.register(Box::new(non_response_total.clone()))?;
        registry.register(Box::new(policy_events_total.clone()))?;
        registry.register(Box::new(call_duration_seconds.clone()))?;

        Ok(Self {
            calls_total,
            non_response_total,
            policy_events_total,
            call_duration_seconds,
        })
    }
}

/// 进行中调用的默认存活上限，超过后视为被放弃
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

/// 单个方法的指标 Hook
///
/// `before` 记录开始时间，`after` / `on_non_response` 结束计时。Hook 在两者之间被移除时
/// 收不到结束事件，这类记录会在下一次 `before` 或显式 `sweep_stale` 时按 `outcome="abandoned"` 清理。
pub struct MetricsHandler<Req, Res> {
    method: MethodDescriptor<Req, Res>,
    metrics: Arc<CallMetrics>,
    stale_after: Duration,
    // 追踪号可能重复（零大小请求、地址复用），同一键下按先进先出保存开始时间
    in_flight: DashMap<TraceId, VecDeque<Instant>>,
}

impl<Req: Message, Res: Message> MetricsHandler<Req, Res> {
    pub fn new(method: MethodDescriptor<Req, Res>, metrics: Arc<CallMetrics>) -> Arc<Self> {
        Self::with_stale_after(method, metrics, DEFAULT_STALE_AFTER)
    }

    pub fn with_stale_after(
        method: MethodDescriptor<Req, Res>,
        metrics: Arc<CallMetrics>,
        stale_after: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            method,
            metrics,
            stale_after,
            in_flight: DashMap::new(),
        })
    }

    fn stage(&self, event: LifecycleEvent) {
        self.metrics
            .calls_total
            .with_label_values(&[self.method.full_method_name(), event.as_str()])
            .inc();
    }

    fn policy(&self, event: LifecycleEvent) {
        self.metrics
            .policy_events_total
            .with_label_values(&[self.method.full_method_name(), event.as_str()])
            .inc();
    }

    fn observe(&self, outcome: &str, elapsed: Duration) {
        self.metrics
            .call_duration_seconds
            .with_label_values(&[self.method.full_method_name(), outcome])
            .observe(elapsed.as_secs_f64());
    }

    fn start(&self, trace: TraceId) {
        self.in_flight.entry(trace).or_default().push_back(Instant::now());
    }

    fn finish(&self, trace: TraceId, outcome: &str) {
        // 没有开始记录（例如在 before 之后才注册）时不计时
        let started = match self.in_flight.entry(trace) {
            Entry::Occupied(mut entry) => {
                let started = entry.get_mut().pop_front();
                if entry.get().is_empty() {
                    entry.remove();
                }
                started
            }
            Entry::Vacant(_) => None,
        };
        if let Some(started) = started {
            self.observe(outcome, started.elapsed());
        }
    }

    /// 清理超过存活上限仍未结束的调用，返回清理条数
    pub fn sweep_stale(&self) -> usize {
        let mut swept = 0;
        self.in_flight.retain(|_, starts| {
            starts.retain(|started| {
                let elapsed = started.elapsed();
                if elapsed < self.stale_after {
                    return true;
                }
                self.observe("abandoned", elapsed);
                swept += 1;
                false
            });
            !starts.is_empty()
        });
        if swept > 0 {
            debug!(
                target: module_path!(),
                method = %self.method,
                swept,
                "stale in-flight calls swept"
            );
        }
        swept
    }

    /// 尚未结束的调用数
    pub fn in_flight(&self) -> usize {
        self.in_flight.iter().map(|entry| entry.value().len()).sum()
    }
}

impl<Req: Message, Res: Message> ServiceHandler<Req, Res> for MetricsHandler<Req, Res> {
    fn match_method(&self) -> &MethodDescriptor<Req, Res> {
        &self.method
    }

    fn enter(&self, _ctx: &CallContext<'_, Req>) -> HandlerResult {
        self.stage(LifecycleEvent::Enter);
        Ok(())
    }

    fn before(&self, ctx: &CallContext<'_, Req>) -> HandlerResult {
        self.stage(LifecycleEvent::Before);
        self.sweep_stale();
        self.start(ctx.trace);
        Ok(())
    }

    fn after(&self, ctx: &CallContext<'_, Req>, _response: &Res) -> HandlerResult {
        self.stage(LifecycleEvent::After);
        self.finish(ctx.trace, "ok");
        Ok(())
    }

    fn on_non_response(&self, ctx: &CallContext<'_, Req>, status: &Status) -> HandlerResult {
        self.stage(LifecycleEvent::NonResponse);
        let code = format!("{:?}", status.code());
        self.metrics
            .non_response_total
            .with_label_values(&[self.method.full_method_name(), code.as_str()])
            .inc();
        self.finish(ctx.trace, "non_response");
        Ok(())
    }

    fn on_retry(&self, _ctx: &CallContext<'_, Req>, _response: &Res) -> HandlerResult {
        self.policy(LifecycleEvent::Retry);
        Ok(())
    }

    fn on_refresh(&self, _ctx: &CallContext<'_, Req>, _response: &Res) -> HandlerResult {
        self.policy(LifecycleEvent::Refresh);
        Ok(())
    }

    fn on_ignore(&self, _ctx: &CallContext<'_, Req>, _response: &Res) -> HandlerResult {
        self.policy(LifecycleEvent::Ignore);
        Ok(())
    }

    fn on_failed(&self, _ctx: &CallContext<'_, Req>, _response: &Res) -> HandlerResult {
        self.policy(LifecycleEvent::Failed);
        Ok(())
    }

    fn on_throw(&self, _ctx: &CallContext<'_, Req>, _error: &ExhaustedRetryError) -> HandlerResult {
        self.policy(LifecycleEvent::Throw);
        Ok(())
    }
}
