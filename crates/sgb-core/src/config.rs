use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::{domain::Amount, errors::Error, Result};

/// Typed configuration for the bot.
///
/// Built once at startup and passed to every worker behind an `Arc`.
#[derive(Clone, Debug)]
pub struct Config {
    // Bot identity
    pub client_id: String,
    pub access_token: String,

    // Endpoints
    pub blaze_hosts: Vec<String>,
    pub api_roots: Vec<String>,
    pub http_resource_host: String,

    // Distribution
    pub shard_modifier: String,
    pub shard_size: u64,
    pub shard_batch_size: usize,

    // Subscription payments
    pub payment_asset_id: Option<String>,
    pub payment_amount: Option<Amount>,
    pub accept_payment_assets: Vec<(String, Amount)>,

    pub operators: Vec<String>,
    pub store_snapshot_path: Option<PathBuf>,

    // Member message policy; operators and the bot are exempt
    /// One message per member per interval; zero disables the limit.
    pub message_interval: Duration,
    /// Honour the group-wide mute property.
    pub prohibited_message_enabled: bool,
    /// Categories members may not post.
    pub blocked_categories: Vec<String>,

    // Timing
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub reply_timeout: Duration,
    pub reconnect_delay: Duration,
    pub worker_backoff: Duration,
    pub shard_idle: Duration,

    pub templates: Templates,
}

/// User-visible message templates. `{name}` and `{count}` are substituted.
#[derive(Clone, Debug)]
pub struct Templates {
    pub tips_guest: String,
    pub tips_help: String,
    pub tips_help_button: String,
    pub tips_unsubscribe: String,
    pub tips_too_many: String,
    pub tips_join: String,
    pub command_info: String,
    pub command_info_resp: String,
    pub message_too_large: String,
    pub red_packet: String,
    pub red_packet_desc: String,
    pub red_packet_short_desc: String,
    pub red_packet_opened: String,
    /// `{payer}`, `{recipient}` and `{amount}` are substituted.
    pub reward_label: String,
}

impl Default for Templates {
    fn default() -> Self {
        Self {
            tips_guest: "Please open the group page to join.".to_string(),
            tips_help: "Please pay the subscription fee to join the group.".to_string(),
            tips_help_button: "Join".to_string(),
            tips_unsubscribe: "You have unsubscribed, subscribe again to receive messages."
                .to_string(),
            tips_too_many: "Too many messages, please slow down.".to_string(),
            tips_join: "{name} joined the group.".to_string(),
            command_info: "INFO".to_string(),
            command_info_resp: "Subscribers: {count}".to_string(),
            message_too_large: "{name} sent a message that is too large to distribute."
                .to_string(),
            red_packet: "Red Packet".to_string(),
            red_packet_desc: "Red packet from {name}".to_string(),
            red_packet_short_desc: "Open to claim a red packet".to_string(),
            red_packet_opened: "{name} opened your red packet".to_string(),
            reward_label: "{payer} rewarded {recipient} {amount}".to_string(),
        }
    }
}

impl Config {
    /// A config with every optional knob at its default.
    pub fn new(client_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            access_token: access_token.into(),
            blaze_hosts: vec!["wss://blaze.mixin.one/".to_string()],
            api_roots: vec!["https://api.mixin.one".to_string()],
            http_resource_host: String::new(),
            shard_modifier: "supergroup".to_string(),
            shard_size: 8,
            shard_batch_size: 20,
            payment_asset_id: None,
            payment_amount: None,
            accept_payment_assets: Vec::new(),
            operators: Vec::new(),
            store_snapshot_path: None,
            message_interval: Duration::ZERO,
            prohibited_message_enabled: false,
            blocked_categories: Vec::new(),
            pong_wait: Duration::from_millis(10_000),
            write_wait: Duration::from_millis(15_000),
            reply_timeout: Duration::from_millis(2_000),
            reconnect_delay: Duration::from_millis(300),
            worker_backoff: Duration::from_millis(300),
            shard_idle: Duration::from_millis(2_000),
            templates: Templates::default(),
        }
    }

    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        // Required env vars
        let client_id = env_str("MIXIN_CLIENT_ID").and_then(non_empty).ok_or_else(|| {
            Error::Config("MIXIN_CLIENT_ID environment variable is required".to_string())
        })?;
        let access_token = env_str("MIXIN_ACCESS_TOKEN")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("MIXIN_ACCESS_TOKEN environment variable is required".to_string())
            })?;

        let mut cfg = Self::new(client_id.trim(), access_token.trim());

        if let Some(hosts) = parse_csv(env_str("BLAZE_HOSTS")) {
            cfg.blaze_hosts = hosts;
        }
        if let Some(roots) = parse_csv(env_str("API_ROOTS")) {
            cfg.api_roots = roots;
        }
        if let Some(host) = env_str("HTTP_RESOURCE_HOST").and_then(non_empty) {
            cfg.http_resource_host = host.trim_end_matches('/').to_string();
        }

        if let Some(modifier) = env_str("MESSAGE_SHARD_MODIFIER").and_then(non_empty) {
            cfg.shard_modifier = modifier;
        }
        if let Some(size) = env_u64("MESSAGE_SHARD_SIZE") {
            if size == 0 {
                return Err(Error::Config(
                    "MESSAGE_SHARD_SIZE must be at least 1".to_string(),
                ));
            }
            cfg.shard_size = size;
        }
        if let Some(batch) = env_u64("SHARD_BATCH_SIZE") {
            cfg.shard_batch_size = batch.max(1) as usize;
        }

        cfg.payment_asset_id = env_str("PAYMENT_ASSET_ID").and_then(non_empty);
        cfg.payment_amount = match env_str("PAYMENT_AMOUNT").and_then(non_empty) {
            Some(raw) => Some(raw.trim().parse::<Amount>()?),
            None => None,
        };
        cfg.accept_payment_assets = parse_payment_assets(env_str("ACCEPT_PAYMENT_ASSETS"))?;

        cfg.operators = parse_csv(env_str("OPERATORS")).unwrap_or_default();
        cfg.store_snapshot_path = env_str("STORE_SNAPSHOT_PATH")
            .and_then(non_empty)
            .map(PathBuf::from);

        if let Some(secs) = env_u64("LIMIT_MESSAGE_DURATION_SECS") {
            cfg.message_interval = Duration::from_secs(secs);
        }
        cfg.prohibited_message_enabled = env_bool("PROHIBITED_MESSAGE_ENABLED");
        cfg.blocked_categories = parse_csv(env_str("BLOCKED_MESSAGE_CATEGORIES"))
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.to_uppercase())
            .collect();

        // Timeouts and backoff
        if let Some(ms) = env_u64("BLAZE_PONG_WAIT_MS") {
            cfg.pong_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("BLAZE_WRITE_WAIT_MS") {
            cfg.write_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("BLAZE_REPLY_TIMEOUT_MS") {
            cfg.reply_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("BLAZE_RECONNECT_DELAY_MS") {
            cfg.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("WORKER_BACKOFF_MS") {
            cfg.worker_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("SHARD_IDLE_MS") {
            cfg.shard_idle = Duration::from_millis(ms);
        }

        let t = &mut cfg.templates;
        override_template(&mut t.tips_guest, "TEMPLATE_TIPS_GUEST");
        override_template(&mut t.tips_help, "TEMPLATE_TIPS_HELP");
        override_template(&mut t.tips_help_button, "TEMPLATE_TIPS_HELP_BUTTON");
        override_template(&mut t.tips_unsubscribe, "TEMPLATE_TIPS_UNSUBSCRIBE");
        override_template(&mut t.tips_too_many, "TEMPLATE_TIPS_TOO_MANY");
        override_template(&mut t.tips_join, "TEMPLATE_TIPS_JOIN");
        override_template(&mut t.command_info, "TEMPLATE_COMMAND_INFO");
        override_template(&mut t.command_info_resp, "TEMPLATE_COMMAND_INFO_RESP");
        override_template(&mut t.message_too_large, "TEMPLATE_MESSAGE_TOO_LARGE");
        override_template(&mut t.red_packet, "TEMPLATE_RED_PACKET");
        override_template(&mut t.red_packet_desc, "TEMPLATE_RED_PACKET_DESC");
        override_template(&mut t.red_packet_short_desc, "TEMPLATE_RED_PACKET_SHORT_DESC");
        override_template(&mut t.red_packet_opened, "TEMPLATE_RED_PACKET_OPENED");
        override_template(&mut t.reward_label, "TEMPLATE_REWARD_LABEL");

        Ok(cfg)
    }

    /// Keepalive ping period, 9/10 of the pong deadline.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }

    pub fn is_operator(&self, user_id: &str) -> bool {
        self.operators.iter().any(|op| op == user_id)
    }

    /// Operators and the bot itself bypass the member message policy.
    pub fn is_privileged(&self, user_id: &str) -> bool {
        user_id == self.client_id || self.is_operator(user_id)
    }

    pub fn allows_category(&self, category: &str) -> bool {
        !self.blocked_categories.iter().any(|c| c == category)
    }

    /// Whether a transfer of `amount` of `asset_id` settles a subscription.
    pub fn accepts_subscription(&self, asset_id: &str, amount: Amount) -> bool {
        let configured = matches!(
            (&self.payment_asset_id, self.payment_amount),
            (Some(asset), Some(expected)) if asset == asset_id && expected == amount
        );
        configured
            || self
                .accept_payment_assets
                .iter()
                .any(|(asset, expected)| asset == asset_id && *expected == amount)
    }
}

fn override_template(slot: &mut String, key: &str) {
    if let Some(v) = env_str(key).and_then(non_empty) {
        *slot = v;
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_bool(key: &str) -> bool {
    env_str(key).is_some_and(|s| matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, strip_quotes(v.trim()));
    }
}

fn strip_quotes(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        &val[1..val.len() - 1]
    } else {
        val
    }
}

fn parse_csv(v: Option<String>) -> Option<Vec<String>> {
    let out = v?
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect::<Vec<_>>();
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// `asset:amount,asset:amount`
fn parse_payment_assets(v: Option<String>) -> Result<Vec<(String, Amount)>> {
    let mut out = Vec::new();
    for item in parse_csv(v).unwrap_or_default() {
        let Some((asset, amount)) = item.split_once(':') else {
            return Err(Error::Config(format!(
                "ACCEPT_PAYMENT_ASSETS entry {item:?} must be asset:amount"
            )));
        };
        out.push((asset.trim().to_string(), amount.trim().parse::<Amount>()?));
    }
    Ok(out)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_period_is_nine_tenths_of_pong_wait() {
        let cfg = Config::new("bot", "token");
        assert_eq!(cfg.ping_period(), Duration::from_millis(9_000));
    }

    #[test]
    fn payment_assets_parse_pairs() {
        let parsed =
            parse_payment_assets(Some("asset-a:1.5, asset-b:0.01".to_string())).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, "asset-a");
        assert_eq!(parsed[0].1, "1.5".parse::<Amount>().unwrap());
        assert_eq!(parsed[1].1, "0.01".parse::<Amount>().unwrap());

        assert!(parse_payment_assets(Some("broken".to_string())).is_err());
        assert!(parse_payment_assets(None).unwrap().is_empty());
    }

    #[test]
    fn subscription_accepts_configured_or_listed_assets() {
        let mut cfg = Config::new("bot", "token");
        cfg.payment_asset_id = Some("cnb".to_string());
        cfg.payment_amount = Some("10".parse().unwrap());
        cfg.accept_payment_assets = vec![("xin".to_string(), "0.01".parse().unwrap())];

        assert!(cfg.accepts_subscription("cnb", "10".parse().unwrap()));
        assert!(cfg.accepts_subscription("xin", "0.01".parse().unwrap()));
        assert!(!cfg.accepts_subscription("cnb", "9.99".parse().unwrap()));
        assert!(!cfg.accepts_subscription("btc", "10".parse().unwrap()));
    }

    #[test]
    fn operators_and_the_bot_are_privileged() {
        let mut cfg = Config::new("bot", "token");
        cfg.operators = vec!["op".to_string()];
        cfg.blocked_categories = vec!["PLAIN_VIDEO".to_string()];

        assert!(cfg.is_privileged("bot"));
        assert!(cfg.is_privileged("op"));
        assert!(!cfg.is_privileged("member"));
        assert!(!cfg.allows_category("PLAIN_VIDEO"));
        assert!(cfg.allows_category("PLAIN_TEXT"));
    }

    #[test]
    fn quotes_are_stripped_from_dotenv_values() {
        assert_eq!(strip_quotes("\"wss://a\""), "wss://a");
        assert_eq!(strip_quotes("'x'"), "x");
        assert_eq!(strip_quotes("plain"), "plain");
    }
}
