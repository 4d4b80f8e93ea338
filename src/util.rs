use tracing::level_filters::LevelFilter;

const ORCHESTRATOR_TOKEN: &str = "ORCHESTRATOR_TOKEN";

/// Bearer token for the orchestrator, overriding the one from the config file
pub fn get_orchestrator_token() -> Option<String> {
    std::env::var(ORCHESTRATOR_TOKEN)
        .ok()
        .filter(|token| !token.is_empty())
}

const RELAY_API_TOKEN: &str = "RELAY_API_TOKEN";

pub fn get_api_token() -> Option<String> {
    std::env::var(RELAY_API_TOKEN)
        .ok()
        .filter(|token| !token.is_empty())
}

const RELAY_LOG_LEVEL: &str = "RELAY_LOG_LEVEL";

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::DEBUG;

pub fn get_log_level() -> LevelFilter {
    let level_from_env = std::env::var(RELAY_LOG_LEVEL);
    level_from_env.map_or(DEFAULT_LOG_LEVEL, |res| {
        res.parse().unwrap_or(DEFAULT_LOG_LEVEL)
    })
}
