// 引入领域模型中的 `SettlementJobRecord`（已认领的结算任务）。
use visitproof_domain::model::SettlementJobRecord;
// 引入 `SettlementStore` trait，它定义了结算队列的持久化接口。
use visitproof_domain::storage::SettlementStore;
// 引入时间处理库 chrono。
use chrono::{DateTime, Duration, Utc};
// 引入 metrics 库的 `counter` 宏，用于记录交付结果指标。
use metrics::counter;
// 引入 tracing 日志宏。
use tracing::{info, warn};

// 引入奖励下游接口。
use crate::sink::RewardSink;
// 引入内部错误类型。
use crate::worker::SettlementError;

// 单个任务的交付结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered,
    Retried,
    DeadLettered,
}

// 定义核心处理函数 `process_job`。
// 这是一个异步泛型函数，用于交付单个已认领（in_flight）的结算任务。
// 泛型参数允许在测试时传入 Mock 对象，在生产时传入真实数据库和 HTTP 下游。
pub async fn process_job<S, K>(
    storage: &S,            // 存储层的引用
    sink: &K,               // 奖励下游的引用
    job: &SettlementJobRecord, // 要交付的结算任务
    max_retries: i32,       // 重试预算
    backoff_base_secs: i64, // 指数退避的基础秒数
    now: DateTime<Utc>,
) -> Result<JobOutcome, SettlementError>
where
    S: SettlementStore,
    K: RewardSink,
{
    // 步骤 1：尝试交付。
    // 下游以 `idempotency_key` 去重，重复交付同一个键是安全的。
    let delivery = sink.deliver(&job.idempotency_key, &job.payload).await;

    match delivery {
        Ok(()) => {
            // 步骤 2a：交付成功，任务置为 `done`。
            storage.mark_done(&job.idempotency_key).await?;
            counter!("settlement_deliveries_total", 1, "result" => "done");
            info!(
                key = job.idempotency_key,
                amount = job.payload.amount,
                "settlement delivered"
            );
            Ok(JobOutcome::Delivered)
        }
        Err(err) if job.retry_count >= max_retries => {
            // 步骤 2b：重试预算已耗尽，任务进入死信状态。
            // 载荷保留在行内，便于人工排查后重新入队。
            storage
                .mark_dead(&job.idempotency_key, &err.to_string())
                .await?;
            counter!("settlement_deliveries_total", 1, "result" => "dead_lettered");
            warn!(
                key = job.idempotency_key,
                retry_count = job.retry_count,
                %err,
                "settlement dead-lettered after exhausting retries"
            );
            Ok(JobOutcome::DeadLettered)
        }
        Err(err) => {
            // 步骤 2c：交付失败但仍有预算，按 `base * 2^retry` 指数退避后重新入队。
            let backoff_secs =
                backoff_base_secs.saturating_mul(1_i64 << job.retry_count.clamp(0, 20));
            let next_attempt_at = now + Duration::seconds(backoff_secs);
            storage
                .mark_retry(&job.idempotency_key, &err.to_string(), next_attempt_at)
                .await?;
            counter!("settlement_deliveries_total", 1, "result" => "retried");
            warn!(
                key = job.idempotency_key,
                retry_count = job.retry_count,
                backoff_secs,
                %err,
                "settlement delivery failed, scheduled retry"
            );
            Ok(JobOutcome::Retried)
        }
    }
}
