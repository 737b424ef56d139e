use crate::doh::state::{RuntimeConfig, SessionLimits};
use crate::error::ConfigError;
use std::{fs, net::SocketAddr, path::Path, str::FromStr, time::Duration};
use tracing::debug;
use validator::{Validate, ValidationError, ValidationErrors};

pub mod core;

pub use core::*;

// 配置结果类型别名
pub type ConfigResult<T> = Result<T, ConfigError>;

// 自定义验证函数 - 验证Socket地址格式
pub fn validate_socket_addr(addr: &str) -> Result<(), ValidationError> {
    match SocketAddr::from_str(addr) {
        Ok(_) => Ok(()),
        Err(_) => Err(ValidationError::new("invalid_socket_addr")),
    }
}

// 应用配置
#[derive(Debug, serde::Deserialize, serde::Serialize, Clone, PartialEq, Eq, Validate)]
#[serde(rename_all = "lowercase")]
pub struct Config {
    // 前端服务配置
    #[validate(nested)]
    pub server: ServerConfig,
    // 管理服务器配置（可选）
    #[serde(default)]
    #[validate(nested)]
    pub admin: Option<AdminConfig>,
}

impl Config {
    // 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        debug!("Loading configuration file: {:?}", path.as_ref());
        let content = fs::read_to_string(path).map_err(ConfigError::LoadError)?;
        Self::from_yaml(&content)
    }

    // 从 YAML 文本解析并验证配置
    pub fn from_yaml(content: &str) -> ConfigResult<Self> {
        let config: Config = serde_yaml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    // 验证配置有效性
    pub fn validate(&self) -> ConfigResult<()> {
        // 使用 validator 库进行验证
        if let Err(errors) = Validate::validate(self) {
            return Err(ConfigError::ValidationError(format_validation_errors(
                &errors,
            )));
        }
        Ok(())
    }

    // 管理服务器监听地址，未配置时使用默认值
    pub fn admin_listen(&self) -> ConfigResult<SocketAddr> {
        let admin = self.admin.clone().unwrap_or_default();
        admin
            .listen
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddress(admin.listen.clone()))
    }

    // 读取证书与私钥文件，生成前端运行时配置
    pub fn to_runtime_config(&self) -> ConfigResult<RuntimeConfig> {
        let server = &self.server;

        let listen_addr: SocketAddr = server
            .listen
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddress(server.listen.clone()))?;
        let backend_addr: SocketAddr = server
            .backend
            .parse()
            .map_err(|_| ConfigError::InvalidBackendAddress(server.backend.clone()))?;

        let certificate = read_tls_file(&server.cert_file)?;
        let private_key = read_tls_file(&server.key_file)?;

        let mut runtime = RuntimeConfig::new(listen_addr, backend_addr);
        runtime.certificate = Some(certificate);
        runtime.private_key = Some(private_key);
        runtime.limits = SessionLimits {
            max_idle_timeout: server.max_idle_timeout,
            max_buffer_size: server.max_buffer_size,
            max_streams_bidi: server.max_streams_bidi,
        };
        runtime.backend_timeout = Duration::from_secs(server.backend_timeout);

        Ok(runtime)
    }
}

fn read_tls_file(path: &str) -> ConfigResult<String> {
    fs::read_to_string(path).map_err(|source| ConfigError::TlsFile {
        path: path.to_string(),
        source,
    })
}

// 将 ValidationErrors 转换为友好的错误信息
fn format_validation_errors(errors: &ValidationErrors) -> String {
    let mut messages = Vec::new();

    // 格式化字段错误
    for (field, error_kind) in errors.errors() {
        match error_kind {
            validator::ValidationErrorsKind::Field(field_errors) => {
                for error in field_errors {
                    let message = error
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| error.code.to_string());
                    messages.push(format!("Field '{}': {}", field, message));
                }
            }
            validator::ValidationErrorsKind::Struct(struct_errors) => {
                messages.push(format!(
                    "Struct '{}' validation failed: {}",
                    field,
                    format_validation_errors(struct_errors)
                ));
            }
            validator::ValidationErrorsKind::List(list_errors) => {
                for (index, err) in list_errors {
                    messages.push(format!(
                        "List '{}' at index {}: {}",
                        field,
                        index,
                        format_validation_errors(err)
                    ));
                }
            }
        }
    }

    if messages.is_empty() {
        "Unknown validation error".to_string()
    } else {
        messages.join("\n")
    }
}
