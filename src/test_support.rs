use tokio::sync::Mutex as AsyncMutex;

/// Serializes tests that read or write `ADCHAT_*` environment variables.
/// Sync tests take it with `.blocking_lock()`, async tests with `.lock().await`.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Clears every variable `Config::load` reads so each test starts from defaults.
pub fn clear_config_env() {
    for key in crate::config::CONFIG_ENV_KEYS {
        std::env::remove_var(key);
    }
}
