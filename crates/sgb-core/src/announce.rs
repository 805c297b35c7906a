//! Bot-authored messages fanned out to every member.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use rand::seq::SliceRandom;
use serde_json::json;
use uuid::Uuid;

use crate::{
    config::Config,
    domain::{category, genesis, Amount, Message, MessageState, User},
    Result,
};

/// Longest reward label shown as is.
const REWARD_LABEL_LIMIT: usize = 36;
/// Names are cut to this many characters when the label runs long.
const REWARD_NAME_CHARS: usize = 5;
/// Hard cut for a label that is still too long.
const REWARD_LABEL_CHARS: usize = 30;

const BUTTON_COLORS: &[&str] = &[
    "#AA4848", "#B0665E", "#EF8A44", "#A09555", "#727234", "#9CAD23", "#AA9100", "#C49B4B",
    "#A47758", "#DF694C", "#D65859", "#C2405A", "#A75C96", "#BD637C", "#8F7AC5", "#7983C2",
    "#728DB8", "#5977C2", "#5E6DA2", "#3D98D0", "#5E97A1",
];
const FALLBACK_COLOR: &str = "#46B8DA";

/// A pending message authored by the bot, distributed from the start.
pub fn system_message(cfg: &Config, message_id: String, category: &str, data: String) -> Message {
    let now = Utc::now();
    Message {
        message_id,
        user_id: cfg.client_id.clone(),
        category: category.to_string(),
        quote_message_id: String::new(),
        data,
        state: MessageState::Pending,
        last_distribute_at: genesis(),
        last_distribute_user: String::new(),
        created_at: now,
        updated_at: now,
    }
}

/// Tells the group that `member` joined.
pub fn join_message(cfg: &Config, member: &User) -> Message {
    let text = cfg.templates.tips_join.replace("{name}", &member.full_name);
    system_message(
        cfg,
        Uuid::new_v4().to_string(),
        category::PLAIN_TEXT,
        STANDARD.encode(text.as_bytes()),
    )
}

/// Button announcing that `payer` rewarded `recipient`.
pub fn reward_message(cfg: &Config, payer: &User, recipient: &User, amount: Amount) -> Result<Message> {
    let label = reward_label(
        &cfg.templates.reward_label,
        &payer.full_name,
        &recipient.full_name,
        amount,
    );
    let color = BUTTON_COLORS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(FALLBACK_COLOR);
    let buttons = json!([{
        "label": label,
        "action": format!("{}/broadcasters", cfg.http_resource_host),
        "color": color,
    }]);
    Ok(system_message(
        cfg,
        Uuid::new_v4().to_string(),
        category::APP_BUTTON_GROUP,
        STANDARD.encode(serde_json::to_vec(&buttons)?),
    ))
}

/// Fill the reward template, shortening names and then the whole label until
/// it fits the button.
pub fn reward_label(template: &str, payer: &str, recipient: &str, amount: Amount) -> String {
    let fill = |payer: &str, recipient: &str| {
        template
            .replace("{payer}", payer)
            .replace("{recipient}", recipient)
            .replace("{amount}", &amount.to_string())
    };
    let label = fill(payer, recipient);
    if label.chars().count() <= REWARD_LABEL_LIMIT {
        return label;
    }
    let label = fill(
        &first_chars(payer, REWARD_NAME_CHARS),
        &first_chars(recipient, REWARD_NAME_CHARS),
    );
    if label.chars().count() <= REWARD_LABEL_LIMIT {
        return label;
    }
    first_chars(&label, REWARD_LABEL_CHARS)
}

fn first_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}
