/// SDK 版本（来自 Cargo 包版本）
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 用于日志的版本信息
pub fn version_string() -> String {
    format!("campus-chat-sdk v{}", SDK_VERSION)
}
