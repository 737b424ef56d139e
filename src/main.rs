use doh_frontend::{
    subsystem_names, AdminServer, AppError, Args, Config, DohFrontend, FrontendService,
};
use mimalloc::MiMalloc;
use std::process;
use std::sync::Arc;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
use tracing::{error, info};

// 使用 mimalloc 分配器提高内存效率
#[global_allocator]
static GLOBAL: MiMalloc = mimalloc::MiMalloc;

fn init_logging(args: &Args) {
    let builder = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_line_number(false);

    // 如果启用调试模式，输出调试信息，否则只输出 info 及以上级别
    if args.debug {
        builder.with_max_level(tracing::Level::DEBUG)
    } else {
        builder.with_max_level(tracing::Level::INFO)
    }
    .init();
}

// 程序入口
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 解析命令行参数
    let args = Args::parse_args();

    // 初始化日志
    init_logging(&args);

    // 验证参数
    if let Err(e) = args.validation() {
        error!("Invalid command line arguments: {}", e);
        process::exit(1);
    }

    info!("Starting DoH over HTTP/3 frontend");

    // 加载配置
    let config = match Config::from_file(&args.config) {
        Ok(config) => {
            info!("Successfully loaded configuration: {:?}", args.config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration file: {}", e);
            process::exit(1);
        }
    };

    // 创建应用组件，测试模式下同时校验证书文件
    let components = match create_components(&config) {
        Ok(components) => components,
        Err(e) => {
            error!("Failed to create application components: {}", e);
            process::exit(1);
        }
    };

    // 如果是测试模式，成功验证配置后退出
    if args.test_config {
        info!("Configuration file validation successful");
        return Ok(());
    }

    // 创建优雅关闭顶层管理器
    let toplevel = Toplevel::new(|s| async move {
        // 启动前端子系统
        let frontend_service = components.frontend_service;
        s.start(SubsystemBuilder::new(
            subsystem_names::DOH_FRONTEND,
            move |s| async move { frontend_service.run(s).await },
        ));
        // 启动管理服务器子系统
        let admin_server = components.admin_server;
        s.start(SubsystemBuilder::new(
            subsystem_names::ADMIN_SERVER,
            move |s| async move { admin_server.run(s).await },
        ));
    });

    // 等待关闭
    info!("All services started, waiting for requests...");
    match toplevel
        .catch_signals()
        .handle_shutdown_requests(tokio::time::Duration::from_secs(args.shutdown_timeout))
        .await
    {
        Ok(_) => {
            info!("Application gracefully shut down");
            Ok(())
        }
        Err(e) => {
            error!("Application shutdown error: {}", e);
            process::exit(1);
        }
    }
}

// 应用组件
struct AppComponents {
    // DoH 前端
    frontend_service: FrontendService,
    // 管理服务器
    admin_server: AdminServer,
}

// 创建应用组件
fn create_components(config: &Config) -> Result<AppComponents, AppError> {
    let runtime_config = config.to_runtime_config()?;
    let admin_listen_addr = config.admin_listen()?;

    info!(
        "DoH frontend configured: listen {}, backend {}, idle timeout {}ms, buffer {} bytes, {} streams",
        runtime_config.listen_addr,
        runtime_config.backend_addr,
        runtime_config.limits.max_idle_timeout,
        runtime_config.limits.max_buffer_size,
        runtime_config.limits.max_streams_bidi
    );

    let frontend = Arc::new(DohFrontend::with_config(runtime_config)?);
    let admin_server = AdminServer::new(admin_listen_addr, Arc::clone(&frontend));
    let frontend_service = FrontendService::new(frontend);

    Ok(AppComponents {
        frontend_service,
        admin_server,
    })
}
