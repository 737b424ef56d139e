// 声明子模块
mod relay;

// 重导出公共API
pub use relay::BackendRelay;
