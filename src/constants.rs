// Outbound requests present a desktop-browser identity; the community
// inventory endpoint rejects obvious bot user agents.
pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub const API_BASE_URL: &str = "https://api.steampowered.com";
pub const COMMUNITY_BASE_URL: &str = "https://steamcommunity.com";

pub const QUEUE_FILE: &str = "profiles_queue.json";
pub const POOL_CONFIG_FILE: &str = "config_proxies.json";
