// 引入标准库：
// `Path`: 文件路径处理。
// `Arc`: 原子引用计数，用于共享状态。
use std::{path::Path, sync::Arc, time::Duration as StdDuration};

// 仅在 Unix 系统下引入文件系统模块，用于处理 Unix Domain Socket 文件。
#[cfg(unix)]
use std::fs;

use actix_web::{middleware::Logger, web, App, HttpServer};
use chrono::Duration;
use thiserror::Error;

use visitproof_domain::config::{ApiConfig, ConfigError, PolicyConfig};
use visitproof_domain::geo::GeofencePolicy;
use visitproof_domain::idempotency::IdempotencyGuard;
use visitproof_domain::ratelimit::RateLimiter;
use visitproof_domain::receipt::ReceiptPolicy;
use visitproof_domain::services::{
    cache::InMemoryReplayCache,
    telemetry::{init_telemetry, TelemetryConfig, TelemetryError},
};
use visitproof_storage::SeaOrmStorage;

use crate::{
    handlers::{
        issue_token_handler, metrics_handler, upsert_place_handler, verification_status_handler,
        verify_location_handler, verify_qr_handler, verify_receipt_handler,
    },
    ocr::HttpOcrClient,
    state::AppState,
};

// 应用程序启动入口函数。
pub async fn run() -> Result<(), BootstrapError> {
    // 1. 加载配置
    let config = ApiConfig::load_from_env()?;
    let policy = PolicyConfig::load_from_env()?;

    // 2. 初始化遥测 (Telemetry)
    let telemetry_config = TelemetryConfig::from_env("API");
    let telemetry = init_telemetry(&telemetry_config)?;

    // 3. 连接数据库
    let storage = SeaOrmStorage::connect(config.database_url()).await?;

    // 4. 组装校验组件：
    // 限流器、幂等守卫（内存缓存 + 持久层）、OCR 客户端。
    let rate_limiter = RateLimiter::new(
        Arc::new(storage.clone()),
        policy.rate_limit(),
        Duration::seconds(policy.rate_window_secs()),
    );
    let idempotency = IdempotencyGuard::new(
        Arc::new(storage.clone()),
        Arc::new(InMemoryReplayCache::default()),
        Duration::hours(policy.idempotency_ttl_hours()),
    );
    let ocr = Arc::new(HttpOcrClient::new(config.ocr_endpoint()));

    // 5. 构建应用状态
    let state = AppState::new(
        storage,
        telemetry,
        rate_limiter,
        idempotency,
        ocr,
        GeofencePolicy {
            max_accuracy_m: policy.geofence_max_accuracy_m(),
        },
        ReceiptPolicy {
            min_confidence: policy.receipt_min_confidence(),
            total_tolerance: policy.receipt_total_tolerance(),
            ocr_timeout: StdDuration::from_secs(policy.ocr_timeout_secs()),
        },
        policy.default_token_ttl_sec(),
    );

    // 判断是否在公共接口上暴露指标端点。
    // 如果配置了内部监听器，指标只在内部接口暴露。
    let include_metrics_on_public = !config.has_internal_listener();

    let public_state = state.clone();

    // 6. 配置并创建公共 HTTP 服务器 (Public Server)
    let mut public_server = HttpServer::new(move || {
        let mut app = App::new()
            .app_data(web::Data::new(public_state.clone()))
            .wrap(Logger::default())
            // POST /api/v1/verify/qr -> QR 令牌核销
            .route("/api/v1/verify/qr", web::post().to(verify_qr_handler))
            // POST /api/v1/verify/location -> 地理围栏校验
            .route(
                "/api/v1/verify/location",
                web::post().to(verify_location_handler),
            )
            // POST /api/v1/verify/receipt -> 小票 OCR 校验
            .route(
                "/api/v1/verify/receipt",
                web::post().to(verify_receipt_handler),
            )
            // GET /api/v1/verification/{place_id}/{user_id} -> 综合判定
            .route(
                "/api/v1/verification/{place_id}/{user_id}",
                web::get().to(verification_status_handler),
            );

        if include_metrics_on_public {
            app = app.route("/metrics", web::get().to(metrics_handler));
        }

        app
    });

    // 绑定公共服务器地址。Unix 系统下支持 Unix Domain Socket (UDS)。
    #[cfg(unix)]
    {
        if let Some(socket) = config.api_unix_socket() {
            cleanup_socket(socket)?;
            public_server = public_server.bind_uds(socket)?;
        } else {
            public_server = public_server.bind(config.api_bind_address())?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(socket) = config.api_unix_socket() {
            return Err(BootstrapError::Io(std::io::Error::other(format!(
                "unix socket '{socket}' requested but this platform does not support it"
            ))));
        }
        public_server = public_server.bind(config.api_bind_address())?;
    }

    let public_server = public_server.run();

    // 7. 配置并创建内部 HTTP 服务器 (Internal Server) - 可选
    // 内部服务器用于管理任务（注册场所、签发令牌）和监控指标，不向公网暴露。
    let internal_server = if config.has_internal_listener() {
        let internal_state = state.clone();
        let mut internal_server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(internal_state.clone()))
                .wrap(Logger::default())
                .route("/metrics", web::get().to(metrics_handler))
                // 内部管理接口：注册/更新场所
                .route("/api/v1/place", web::post().to(upsert_place_handler))
                // 内部管理接口：为场所签发一次性 QR 令牌
                .route(
                    "/api/v1/place/{place_id}/token",
                    web::post().to(issue_token_handler),
                )
        });

        #[cfg(unix)]
        {
            if let Some(socket) = config.internal_unix_socket() {
                cleanup_socket(socket)?;
                internal_server = internal_server.bind_uds(socket)?;
            } else if let Some(addr) = config.internal_bind_address() {
                internal_server = internal_server.bind(addr)?;
            } else {
                return Err(BootstrapError::Io(std::io::Error::other(
                    "internal listener configured but no bind target provided",
                )));
            }
        }

        #[cfg(not(unix))]
        {
            if let Some(socket) = config.internal_unix_socket() {
                return Err(BootstrapError::Io(std::io::Error::other(format!(
                    "internal unix socket '{socket}' requested but this platform does not support it"
                ))));
            }
            if let Some(addr) = config.internal_bind_address() {
                internal_server = internal_server.bind(addr)?;
            } else {
                return Err(BootstrapError::Io(std::io::Error::other(
                    "internal listener configured but no bind target provided",
                )));
            }
        }

        Some(internal_server.run())
    } else {
        None
    };

    // 8. 并发运行服务器
    if let Some(internal) = internal_server {
        tokio::try_join!(public_server, internal)?;
    } else {
        public_server.await?;
    }

    Ok(())
}

// 定义启动过程中的错误枚举。
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("storage error: {0}")]
    Storage(#[from] visitproof_domain::storage::StorageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// 辅助函数：清理 Unix Socket 文件。
// 如果 socket 文件已存在（例如上次非正常退出遗留），bind 会失败，所以需要先删除。
#[cfg(unix)]
fn cleanup_socket(path: &str) -> std::io::Result<()> {
    let socket_path = Path::new(path);
    if socket_path.exists() {
        fs::remove_file(socket_path)?;
    }
    Ok(())
}
